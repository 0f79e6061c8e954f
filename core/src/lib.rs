//! # Work-distribution accelerator resource manager
//!
//! This crate manages the fixed hardware tables of a PCI work-distribution
//! accelerator: scheduling domains, load-balanced (LDB) queues and ports,
//! directed (DIR) port/queue pairs, credits, history-list storage, and
//! sequence-number groups. It partitions those tables between the physical
//! function and up to [`MAX_VDEVS`] virtual devices, carves per-domain
//! allocations out of each owner's pool, and runs the queue→port mapping
//! state machine, including the asynchronous map/unmap procedures that are
//! required once a domain is scheduling traffic.
//!
//! The hardware itself is reached through the [`regs::Mmio`] trait; tests and
//! the bench binaries run against [`regs::ShadowRegs`], a software register
//! file.

pub mod bitmap;
pub mod device;
pub mod domain;
pub mod ids;
pub mod map;
pub mod pool;
pub mod port;
pub mod queue;
pub mod regs;
pub mod sn;
pub mod util;
pub mod worker;

pub use device::Hw;
pub use ids::{DirId, DomainId, LdbPortId, LdbQueueId, Owner, VdevId};
pub use regs::{Mmio, ShadowRegs};
pub use worker::Device;

/// Number of virtual devices the physical function can host.
pub const MAX_VDEVS: usize = 16;
/// Number of scheduling domains.
pub const MAX_DOMAINS: usize = 32;
/// Number of load-balanced queues.
pub const MAX_LDB_QUEUES: usize = 32;
/// Number of load-balanced consumer-queue ports.
pub const MAX_LDB_PORTS: usize = 64;
/// Number of directed port/queue pairs.
pub const MAX_DIR_PAIRS: usize = 64;
/// Number of classes of service the LDB ports are partitioned into.
pub const NUM_COS: usize = 4;
/// LDB ports per class of service.
pub const PORTS_PER_COS: usize = MAX_LDB_PORTS / NUM_COS;
/// Device-wide LDB credit pool size.
pub const MAX_LDB_CREDITS: u32 = 8192;
/// Device-wide DIR credit pool size.
pub const MAX_DIR_CREDITS: u32 = 2048;
/// Device-wide history-list storage size.
pub const MAX_HIST_LIST_ENTRIES: usize = 2048;
/// Device-wide atomic-inflight storage size.
pub const MAX_ATM_INFLIGHTS: u32 = 2048;
/// Mapping slots per LDB port.
pub const MAX_QID_SLOTS: usize = 8;
/// Valid queue-servicing priorities are `0..QID_PRIORITIES`.
pub const QID_PRIORITIES: u8 = 8;
/// Number of sequence-number slot groups.
pub const NUM_SN_GROUPS: usize = 2;
/// Upper bound on a queue's scheduler inflight limit.
pub const MAX_QID_INFLIGHTS: u32 = 4096;

/// Failure classes of the management call surface.
///
/// Verification never mutates state, so any of these (except [`Internal`])
/// leaves the device exactly as it was before the call.
///
/// [`Internal`]: Error::Internal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Not enough of a resource class to satisfy the request.
    Unavailable,
    /// Unknown or foreign-owned domain, queue, or port id.
    InvalidId,
    /// The target is in the wrong lifecycle state for this operation.
    InvalidState,
    /// An argument is out of range or malformed.
    InvalidParam,
    /// Every mapping slot of the port is occupied and none is reclaimable.
    NoSlots,
    /// The owner's resource assignment is locked against transfers.
    Locked,
    /// The resource manager violated one of its own invariants.
    Internal,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Outcome of a map or unmap request that verified successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The hardware tables were updated before returning.
    Immediate,
    /// The procedure is pending and will be finished by the drain worker.
    Deferred,
}

/// Resources requested for a new scheduling domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateDomainArgs {
    pub num_ldb_queues: u32,
    /// LDB ports drawn from any class of service.
    pub num_ldb_ports: u32,
    /// LDB ports requested per class of service.
    pub num_cos_ldb_ports: [u32; NUM_COS],
    /// If set, the per-CoS requests must be satisfied from exactly that
    /// class; otherwise the allocator falls back round-robin to the others.
    pub cos_strict: bool,
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
}

/// Configuration of a new load-balanced queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateLdbQueueArgs {
    /// Nonzero makes the queue order-preserving with this sequence-number
    /// width (one of 64, 128, 256, 512, 1024).
    pub num_sequence_numbers: u32,
    /// Scheduler inflight limit, at most [`MAX_QID_INFLIGHTS`] (and at most
    /// `num_sequence_numbers` for ordered queues).
    pub num_qid_inflights: u32,
    pub num_atomic_inflights: u32,
    /// Lock-id compression level: 0, 64..=4096 (powers of two), or 65536.
    pub lock_id_comp_level: u32,
    pub depth_threshold: u32,
}

/// Configuration of a new directed queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateDirQueueArgs {
    /// Id of an already-configured port half of the pair, if any.
    pub port_id: Option<u32>,
    pub depth_threshold: u32,
}

/// Configuration of a new load-balanced port.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateLdbPortArgs {
    /// Consumer-queue depth, a power of two in 1..=1024.
    pub cq_depth: u32,
    /// History-list entries to carve out of the domain's range, >= 1.
    pub cq_history_list_size: u32,
    pub cos_id: u32,
    pub cos_strict: bool,
}

/// Configuration of a new directed port.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateDirPortArgs {
    /// Id of an already-configured queue half of the pair, if any.
    pub queue_id: Option<u32>,
    /// Consumer-queue depth, a power of two in 1..=1024.
    pub cq_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MapQidArgs {
    pub port_id: u32,
    pub qid: u32,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct UnmapQidArgs {
    pub port_id: u32,
    pub qid: u32,
}

/// Snapshot of an owner's available (unattached) resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NumResources {
    pub num_sched_domains: u32,
    pub num_ldb_queues: u32,
    pub num_ldb_ports: u32,
    pub num_cos_ldb_ports: [u32; NUM_COS],
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub max_contiguous_hist_list_entries: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
}
