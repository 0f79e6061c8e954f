//! Typed resource indices and ownership.
//!
//! Every queue, port, and domain carries a stable physical index assigned at
//! device init. Resources handed to a virtual device additionally carry a
//! virtual index, renumbered from 0 within that vdev when its assignment is
//! locked. The arenas in [`crate::device::Hw`] are indexed by physical id;
//! these newtypes keep the different tables from being mixed up.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct DomainId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct LdbQueueId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct LdbPortId(pub usize);

/// A directed port and its dedicated queue share one identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct DirId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct VdevId(pub usize);

/// The physical function or one of its virtualized instances.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Owner {
    Pf,
    Vdev(VdevId),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Pf => write!(f, "pf"),
            Owner::Vdev(v) => write!(f, "vdev{}", v.0),
        }
    }
}

/// Physical identity of a resource plus its per-vdev translation.
#[derive(Clone, Copy, Debug)]
pub struct ResourceId {
    pub phys: usize,
    /// Valid only while `owner` is a vdev.
    pub virt: usize,
    pub owner: Owner,
}

impl ResourceId {
    pub fn new(phys: usize) -> Self {
        Self {
            phys,
            virt: 0,
            owner: Owner::Pf,
        }
    }

    /// Whether `id`, as seen by `owner`, names this resource.
    pub fn matches(&self, owner: Owner, id: usize) -> bool {
        match owner {
            Owner::Pf => self.phys == id,
            Owner::Vdev(_) => self.owner == owner && self.virt == id,
        }
    }

    /// The id to report back to `owner` for this resource.
    pub fn api_id(&self, owner: Owner) -> u32 {
        match owner {
            Owner::Pf => self.phys as u32,
            Owner::Vdev(_) => self.virt as u32,
        }
    }
}
