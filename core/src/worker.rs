//! Per-device handle: configuration lock, management call surface, and the
//! drain/retry worker.
//!
//! All management operations serialize on one mutex around [`Hw`]. The
//! worker is a background thread launched the first time a dynamic map or
//! unmap cannot complete immediately; it runs until a pass finds zero
//! pending procedures device-wide. Each pass reacquires the lock and
//! releases it before sleeping, so foreground configuration requests are
//! never starved, and the short sleep between passes cycles through a small
//! set of durations to stay off the CPU without stalling progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::device::Hw;
use crate::ids::{Owner, VdevId};
use crate::regs::Mmio;
use crate::{
    Completion, CreateDirPortArgs, CreateDirQueueArgs, CreateDomainArgs, CreateLdbPortArgs,
    CreateLdbQueueArgs, MapQidArgs, NumResources, Result, UnmapQidArgs,
};

struct Shared<M> {
    hw: Mutex<Hw<M>>,
    worker_active: AtomicBool,
}

/// A managed device. Cheap to clone; all clones share the same state.
pub struct Device<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Device<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Mmio + Send + 'static> Device<M> {
    /// Take ownership of the device's register interface and initialize the
    /// resource tracking, giving every resource to the PF.
    pub fn new(regs: M) -> Self {
        Self {
            shared: Arc::new(Shared {
                hw: Mutex::new(Hw::new(regs)),
                worker_active: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn hw(&self) -> MutexGuard<'_, Hw<M>> {
        self.shared.hw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the drain/retry worker is currently running.
    pub fn worker_active(&self) -> bool {
        self.shared.worker_active.load(Ordering::SeqCst)
    }

    /// Launch the worker unless it is already running.
    fn schedule_work(&self) {
        if self.shared.worker_active.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("launching map/unmap worker");
        let shared = self.shared.clone();
        thread::spawn(move || complete_queue_map_unmap(&shared));
    }

    // Domain lifecycle.

    pub fn create_sched_domain(&self, owner: Owner, args: &CreateDomainArgs) -> Result<u32> {
        self.hw().create_sched_domain(owner, args)
    }

    pub fn create_ldb_queue(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &CreateLdbQueueArgs,
    ) -> Result<u32> {
        self.hw().create_ldb_queue(owner, domain_id, args)
    }

    pub fn create_dir_queue(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &CreateDirQueueArgs,
    ) -> Result<u32> {
        self.hw().create_dir_queue(owner, domain_id, args)
    }

    pub fn create_ldb_port(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &CreateLdbPortArgs,
        cq_base: u64,
    ) -> Result<u32> {
        self.hw().create_ldb_port(owner, domain_id, args, cq_base)
    }

    pub fn create_dir_port(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &CreateDirPortArgs,
        cq_base: u64,
    ) -> Result<u32> {
        self.hw().create_dir_port(owner, domain_id, args, cq_base)
    }

    pub fn start_domain(&self, owner: Owner, domain_id: u32) -> Result<()> {
        self.hw().start_domain(owner, domain_id)
    }

    pub fn reset_domain(&self, owner: Owner, domain_id: u32) -> Result<()> {
        self.hw().reset_domain(owner, domain_id)
    }

    // Queue mapping.

    pub fn map_qid(&self, owner: Owner, domain_id: u32, args: &MapQidArgs) -> Result<Completion> {
        let ret = self.hw().map_qid(owner, domain_id, args);
        if ret == Ok(Completion::Deferred) {
            self.schedule_work();
        }
        ret
    }

    pub fn unmap_qid(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &UnmapQidArgs,
    ) -> Result<Completion> {
        let ret = self.hw().unmap_qid(owner, domain_id, args);
        if ret == Ok(Completion::Deferred) {
            self.schedule_work();
        }
        ret
    }

    pub fn pending_port_unmaps(&self, owner: Owner, domain_id: u32, port_id: u32) -> Result<u32> {
        self.hw().pending_port_unmaps(owner, domain_id, port_id)
    }

    // Port control and queries.

    pub fn enable_ldb_port(&self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        self.hw().enable_ldb_port(owner, domain_id, port_id)
    }

    pub fn disable_ldb_port(&self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        self.hw().disable_ldb_port(owner, domain_id, port_id)
    }

    pub fn enable_dir_port(&self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        self.hw().enable_dir_port(owner, domain_id, port_id)
    }

    pub fn disable_dir_port(&self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        self.hw().disable_dir_port(owner, domain_id, port_id)
    }

    pub fn get_ldb_queue_depth(&self, owner: Owner, domain_id: u32, queue_id: u32) -> Result<u32> {
        self.hw().get_ldb_queue_depth(owner, domain_id, queue_id)
    }

    pub fn get_dir_queue_depth(&self, owner: Owner, domain_id: u32, queue_id: u32) -> Result<u32> {
        self.hw().get_dir_queue_depth(owner, domain_id, queue_id)
    }

    pub fn num_resources(&self, owner: Owner) -> Result<NumResources> {
        self.hw().num_resources(owner)
    }

    // Vdev partitioning.

    pub fn update_vdev_sched_domains(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_sched_domains(v, num)
    }

    pub fn update_vdev_ldb_queues(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_ldb_queues(v, num)
    }

    pub fn update_vdev_ldb_ports(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_ldb_ports(v, num)
    }

    pub fn update_vdev_ldb_cos_ports(&self, v: VdevId, cos: usize, num: u32) -> Result<()> {
        self.hw().update_vdev_ldb_cos_ports(v, cos, num)
    }

    pub fn update_vdev_dir_ports(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_dir_ports(v, num)
    }

    pub fn update_vdev_ldb_credits(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_ldb_credits(v, num)
    }

    pub fn update_vdev_dir_credits(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_dir_credits(v, num)
    }

    pub fn update_vdev_hist_list_entries(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_hist_list_entries(v, num)
    }

    pub fn update_vdev_atomic_inflights(&self, v: VdevId, num: u32) -> Result<()> {
        self.hw().update_vdev_atomic_inflights(v, num)
    }

    pub fn lock_vdev(&self, v: VdevId) -> Result<()> {
        self.hw().lock_vdev(v)
    }

    pub fn unlock_vdev(&self, v: VdevId) -> Result<()> {
        self.hw().unlock_vdev(v)
    }

    pub fn vdev_is_locked(&self, v: VdevId) -> bool {
        self.hw().vdev_is_locked(v)
    }

    pub fn vdev_in_use(&self, v: VdevId) -> Result<bool> {
        self.hw().vdev_in_use(v)
    }

    pub fn reset_vdev(&self, v: VdevId) -> Result<()> {
        self.hw().reset_vdev(v)
    }

    pub fn reset_vdev_resources(&self, v: VdevId) -> Result<()> {
        self.hw().reset_vdev_resources(v)
    }

    // Sequence-number groups.

    pub fn group_sequence_numbers(&self, group: usize) -> Result<u32> {
        self.hw().group_sequence_numbers(group)
    }

    pub fn group_sequence_number_occupancy(&self, group: usize) -> Result<u32> {
        self.hw().group_sequence_number_occupancy(group)
    }

    pub fn set_group_sequence_numbers(&self, group: usize, val: u32) -> Result<()> {
        self.hw().set_group_sequence_numbers(group, val)
    }
}

/// Worker loop: runs until all outstanding map and unmap requests are
/// complete. The lock is dropped between passes so other threads can
/// configure hardware in the meantime.
fn complete_queue_map_unmap<M: Mmio>(shared: &Shared<M>) {
    let mut delay = 1u64;

    loop {
        let mut hw = shared
            .hw
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let remaining = hw.finish_unmap_qid_procedures() + hw.finish_map_qid_procedures();

        if remaining == 0 {
            debug!("map/unmap worker done");
            shared.worker_active.store(false, Ordering::SeqCst);
            return;
        }

        drop(hw);

        // Let the application process its CQs; vary the delay 10-100 us.
        thread::sleep(Duration::from_micros(10 * delay));
        delay = delay % 10 + 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::{LdbPortId, LdbQueueId};
    use crate::port::SlotState;
    use crate::regs::{self, ShadowRegs};
    use crate::util::logging;
    use crate::Error;

    fn device() -> (Device<ShadowRegs>, u32, Vec<u32>, Vec<u32>) {
        logging();
        let dev = Device::new(ShadowRegs::new());

        let args = CreateDomainArgs {
            num_ldb_queues: 2,
            num_ldb_ports: 2,
            num_hist_list_entries: 2,
            num_ldb_credits: 64,
            ..Default::default()
        };
        let domain = dev.create_sched_domain(Owner::Pf, &args).unwrap();

        let queues = (0..2)
            .map(|_| {
                dev.create_ldb_queue(Owner::Pf, domain, &CreateLdbQueueArgs::default())
                    .unwrap()
            })
            .collect();
        let ports = (0..2)
            .map(|_| {
                let args = CreateLdbPortArgs {
                    cq_depth: 8,
                    cq_history_list_size: 1,
                    ..Default::default()
                };
                dev.create_ldb_port(Owner::Pf, domain, &args, 0x40).unwrap()
            })
            .collect();

        (dev, domain, queues, ports)
    }

    fn slot_state(dev: &Device<ShadowRegs>, port: u32, slot: usize) -> SlotState {
        dev.hw().ldb_ports[port as usize].qid_map[slot].state
    }

    /// Poll with a 2 s budget.
    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..2000 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn worker_finishes_deferred_map() {
        let (dev, domain, queues, ports) = device();

        dev.map_qid(
            Owner::Pf,
            domain,
            &MapQidArgs {
                port_id: ports[0],
                qid: queues[0],
                priority: 0,
            },
        )
        .unwrap();
        dev.start_domain(Owner::Pf, domain).unwrap();

        // The queue owes a completion, so the second mapping must wait.
        let q = LdbQueueId(queues[0] as usize);
        dev.hw().regs.write(regs::lsp_qid_ldb_infl_cnt(q), 3);

        let c = dev
            .map_qid(
                Owner::Pf,
                domain,
                &MapQidArgs {
                    port_id: ports[1],
                    qid: queues[0],
                    priority: 1,
                },
            )
            .unwrap();
        assert_eq!(c, Completion::Deferred);
        assert!(dev.worker_active());
        assert_eq!(slot_state(&dev, ports[1], 0), SlotState::MapInProgress);

        // Simulate the completions landing; the worker finishes the map.
        dev.hw().regs.write(regs::lsp_qid_ldb_infl_cnt(q), 0);

        assert!(wait_for(|| slot_state(&dev, ports[1], 0) == SlotState::Mapped));
        assert!(wait_for(|| !dev.worker_active()));
        assert_eq!(dev.hw().ldb_queues[q.0].num_mappings, 2);
    }

    #[test]
    fn worker_finishes_deferred_unmap() {
        let (dev, domain, queues, ports) = device();

        dev.map_qid(
            Owner::Pf,
            domain,
            &MapQidArgs {
                port_id: ports[0],
                qid: queues[0],
                priority: 0,
            },
        )
        .unwrap();
        dev.start_domain(Owner::Pf, domain).unwrap();

        let p = LdbPortId(ports[0] as usize);
        dev.hw().regs.write(regs::lsp_cq_ldb_infl_cnt(p), 1);

        let c = dev
            .unmap_qid(
                Owner::Pf,
                domain,
                &UnmapQidArgs {
                    port_id: ports[0],
                    qid: queues[0],
                },
            )
            .unwrap();
        assert_eq!(c, Completion::Deferred);
        assert!(dev.worker_active());
        assert_eq!(dev.pending_port_unmaps(Owner::Pf, domain, ports[0]), Ok(1));

        dev.hw().regs.write(regs::lsp_cq_ldb_infl_cnt(p), 0);

        assert!(wait_for(|| slot_state(&dev, ports[0], 0) == SlotState::Unmapped));
        assert!(wait_for(|| !dev.worker_active()));
        assert_eq!(dev.pending_port_unmaps(Owner::Pf, domain, ports[0]), Ok(0));
    }

    #[test]
    fn reset_returns_all_resources() {
        let (dev, domain, queues, ports) = device();

        dev.map_qid(
            Owner::Pf,
            domain,
            &MapQidArgs {
                port_id: ports[0],
                qid: queues[0],
                priority: 0,
            },
        )
        .unwrap();
        dev.start_domain(Owner::Pf, domain).unwrap();

        dev.reset_domain(Owner::Pf, domain).unwrap();

        let n = dev.num_resources(Owner::Pf).unwrap();
        assert_eq!(n, Device::new(ShadowRegs::new()).num_resources(Owner::Pf).unwrap());

        // The domain is unconfigured again; its id no longer resolves.
        assert_eq!(
            dev.start_domain(Owner::Pf, domain),
            Err(Error::InvalidId)
        );
    }

    #[test]
    fn reset_fails_on_nonempty_queue() {
        let (dev, domain, queues, ports) = device();

        dev.map_qid(
            Owner::Pf,
            domain,
            &MapQidArgs {
                port_id: ports[0],
                qid: queues[0],
                priority: 0,
            },
        )
        .unwrap();
        dev.start_domain(Owner::Pf, domain).unwrap();

        // The queue still reports occupancy that never drains.
        let q = LdbQueueId(queues[0] as usize);
        dev.hw().regs.write(regs::lsp_qid_ldb_enqueue_cnt(q), 5);

        assert_eq!(dev.reset_domain(Owner::Pf, domain), Err(Error::Internal));

        // No partial reclamation: the domain is still configured/started
        // and its resources were not returned.
        let hw = dev.hw();
        assert!(hw.domains[domain as usize].configured);
        assert!(hw.domains[domain as usize].started);
        assert_eq!(hw.ldb_queues[q.0].domain.map(|d| d.0), Some(domain as usize));
        drop(hw);
        assert_eq!(dev.num_resources(Owner::Pf).unwrap().num_ldb_queues, 30);
    }

    #[test]
    fn port_enable_disable() {
        let (dev, domain, _queues, ports) = device();

        dev.disable_ldb_port(Owner::Pf, domain, ports[0]).unwrap();
        assert!(!dev.hw().ldb_ports[ports[0] as usize].enabled);
        let p = LdbPortId(ports[0] as usize);
        assert_eq!(dev.hw().regs.read(regs::lsp_cq_ldb_dsbl(p)), 1);

        dev.enable_ldb_port(Owner::Pf, domain, ports[0]).unwrap();
        assert!(dev.hw().ldb_ports[ports[0] as usize].enabled);
        assert_eq!(dev.hw().regs.read(regs::lsp_cq_ldb_dsbl(p)), 0);
    }
}
