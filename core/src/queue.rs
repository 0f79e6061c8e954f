//! Load-balanced queues and directed port/queue pairs.

use log::{debug, error};

use crate::device::Hw;
use crate::ids::{DirId, DomainId, LdbQueueId, Owner, ResourceId};
use crate::regs::{self, Mmio, QidCfgV, SnMap};
use crate::{
    CreateDirQueueArgs, CreateLdbQueueArgs, Error, Result, MAX_ATM_INFLIGHTS, MAX_QID_INFLIGHTS,
    NUM_SN_GROUPS,
};

/// One load-balanced queue of the device-wide table.
pub struct LdbQueue {
    pub id: ResourceId,
    /// The domain this queue is attached to, if any.
    pub domain: Option<DomainId>,
    pub configured: bool,
    /// Scheduler inflight limit while no map addition is pending.
    pub num_qid_inflights: u32,
    /// Atomic-inflight storage reserved for this queue.
    pub aqed_limit: u32,
    pub sn_cfg_valid: bool,
    pub sn_group: usize,
    pub sn_slot: usize,
    pub num_mappings: u32,
    pub num_pending_additions: u32,
}

impl LdbQueue {
    pub fn new(phys: usize) -> Self {
        Self {
            id: ResourceId::new(phys),
            domain: None,
            configured: false,
            num_qid_inflights: 0,
            aqed_limit: 0,
            sn_cfg_valid: false,
            sn_group: 0,
            sn_slot: 0,
            num_mappings: 0,
            num_pending_additions: 0,
        }
    }
}

/// A directed port and its dedicated queue. The two halves share one id but
/// are configured independently.
pub struct DirPq {
    pub id: ResourceId,
    pub domain: Option<DomainId>,
    pub queue_configured: bool,
    pub port_configured: bool,
    pub enabled: bool,
}

impl DirPq {
    pub fn new(phys: usize) -> Self {
        Self {
            id: ResourceId::new(phys),
            domain: None,
            queue_configured: false,
            port_configured: false,
            enabled: false,
        }
    }

    /// Whether either half has been configured (the pair counts as in use).
    pub fn in_use(&self) -> bool {
        self.queue_configured || self.port_configured
    }
}

const VALID_LOCK_ID_COMP_LEVELS: [u32; 9] = [0, 64, 128, 256, 512, 1024, 2048, 4096, 65536];

impl<M: Mmio> Hw<M> {
    fn verify_create_ldb_queue_args(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &CreateLdbQueueArgs,
    ) -> Result<DomainId> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let domain = &self.domains[d.0];

        if domain.started {
            return Err(Error::InvalidState);
        }

        if self.domain_avail_ldb_queue(d).is_none() {
            return Err(Error::Unavailable);
        }

        if args.num_sequence_numbers != 0 {
            let found = self.sn_groups.iter().any(|g| {
                g.sequence_numbers_per_queue == args.num_sequence_numbers && !g.full()
            });
            if !found {
                return Err(Error::Unavailable);
            }
        }

        if args.num_qid_inflights > MAX_QID_INFLIGHTS {
            return Err(Error::InvalidParam);
        }

        // Ordered queues cannot have more inflights than sequence numbers.
        if args.num_sequence_numbers != 0 && args.num_qid_inflights > args.num_sequence_numbers {
            return Err(Error::InvalidParam);
        }

        if domain.num_avail_aqed_entries < args.num_atomic_inflights {
            return Err(Error::Unavailable);
        }

        if args.num_atomic_inflights > 0
            && !VALID_LOCK_ID_COMP_LEVELS.contains(&args.lock_id_comp_level)
        {
            return Err(Error::InvalidParam);
        }

        Ok(d)
    }

    fn ldb_queue_attach_to_sn_group(&mut self, q: LdbQueueId, num_sequence_numbers: u32) -> Result<()> {
        self.ldb_queues[q.0].sn_cfg_valid = false;

        if num_sequence_numbers == 0 {
            return Ok(());
        }

        for i in 0..NUM_SN_GROUPS {
            let group = &mut self.sn_groups[i];
            if group.sequence_numbers_per_queue == num_sequence_numbers && !group.full() {
                if let Some(slot) = group.alloc_slot() {
                    let queue = &mut self.ldb_queues[q.0];
                    queue.sn_cfg_valid = true;
                    queue.sn_group = i;
                    queue.sn_slot = slot;
                    return Ok(());
                }
            }
        }

        error!("no sequence number slots available for queue {}", q.0);
        Err(Error::Internal)
    }

    fn ldb_queue_attach_resources(
        &mut self,
        d: DomainId,
        q: LdbQueueId,
        args: &CreateLdbQueueArgs,
    ) -> Result<()> {
        self.ldb_queue_attach_to_sn_group(q, args.num_sequence_numbers)?;

        let queue = &mut self.ldb_queues[q.0];
        queue.num_qid_inflights = args.num_qid_inflights;
        queue.aqed_limit = args.num_atomic_inflights;

        let domain = &mut self.domains[d.0];
        domain.num_avail_aqed_entries -= args.num_atomic_inflights;
        domain.num_used_aqed_entries += args.num_atomic_inflights;
        Ok(())
    }

    fn configure_ldb_queue(
        &mut self,
        owner: Owner,
        d: DomainId,
        q: LdbQueueId,
        args: &CreateLdbQueueArgs,
    ) {
        // Write permission stays off until the domain is started.
        self.regs.write(regs::sys_ldb_vasqid_v(d, q), 0);

        let queue = &self.ldb_queues[q.0];
        let infl = queue.num_qid_inflights;
        let aqed = queue.aqed_limit.min(MAX_ATM_INFLIGHTS);
        let (sn_group, sn_slot) = (queue.sn_group, queue.sn_slot);

        self.regs.write(regs::lsp_qid_ldb_infl_lim(q), infl);
        self.regs.write(regs::lsp_qid_aqed_active_lim(q), aqed);

        let compress_code = match args.lock_id_comp_level {
            64 => 1,
            128 => 2,
            256 => 3,
            512 => 4,
            1024 => 5,
            2048 => 6,
            4096 => 7,
            _ => 0,
        };
        self.regs.write(regs::aqed_qid_hid_width(q), compress_code);

        self.regs
            .write(regs::lsp_qid_atm_depth_thrsh(q), args.depth_threshold);
        self.regs
            .write(regs::lsp_qid_naldb_depth_thrsh(q), args.depth_threshold);

        // Caps the inflight flows of a single queue so it cannot claim the
        // entire atomic storage.
        self.regs.write(regs::aqed_qid_fid_lim(q), 512);

        let group = &self.sn_groups[sn_group];
        let map = SnMap::new()
            .with_mode(group.mode as u8)
            .with_slot(sn_slot as u8)
            .with_grp(group.id as u8);
        self.regs.write(regs::chp_ord_qid_sn_map(q), map.into_bits());

        let cfg = QidCfgV::new()
            .with_sn_cfg_v(args.num_sequence_numbers != 0)
            .with_fid_cfg_v(args.num_atomic_inflights != 0);
        self.regs.write(regs::sys_ldb_qid_cfg_v(q), cfg.into_bits());

        if let Owner::Vdev(v) = owner {
            let virt = self.ldb_queues[q.0].id.virt;
            self.regs.write(regs::sys_vf_ldb_vqid_v(v, virt), 1);
            self.regs
                .write(regs::sys_vf_ldb_vqid2qid(v, virt), q.0 as u32);
            self.regs.write(regs::sys_ldb_qid2vqid(q), virt as u32);
        }

        self.regs.write(regs::sys_ldb_qid_v(q), 1);
    }

    /// Configure one of the domain's attached load-balanced queues,
    /// returning its caller-visible id.
    pub fn create_ldb_queue(
        &mut self,
        owner: Owner,
        domain_id: u32,
        args: &CreateLdbQueueArgs,
    ) -> Result<u32> {
        debug!("create ldb queue {owner} domain={domain_id} {args:?}");

        // Verify before mutating anything, so failures leave no state.
        let d = self.verify_create_ldb_queue_args(owner, domain_id, args)?;

        let q = self.domain_avail_ldb_queue(d).ok_or_else(|| {
            error!("no available ldb queues after verification");
            Error::Internal
        })?;

        self.ldb_queue_attach_resources(d, q, args)?;
        self.configure_ldb_queue(owner, d, q, args);

        let queue = &mut self.ldb_queues[q.0];
        queue.num_mappings = 0;
        queue.configured = true;

        Ok(queue.id.api_id(owner))
    }

    /// Configure the queue half of a directed pair, returning its id.
    pub fn create_dir_queue(
        &mut self,
        owner: Owner,
        domain_id: u32,
        args: &CreateDirQueueArgs,
    ) -> Result<u32> {
        debug!("create dir queue {owner} domain={domain_id} {args:?}");

        let d = self.domain_by_id(owner, domain_id as usize)?;
        if self.domains[d.0].started {
            return Err(Error::InvalidState);
        }

        let pair = match args.port_id {
            // The caller already configured the port half of this pair.
            Some(port_id) => {
                let pair = self
                    .domain_used_dir_pq(owner, d, port_id as usize)
                    .ok_or(Error::InvalidId)?;
                if !self.dir_pq[pair.0].port_configured {
                    return Err(Error::InvalidId);
                }
                pair
            }
            None => self.domain_avail_dir_pq(d).ok_or(Error::Unavailable)?,
        };

        self.configure_dir_queue(owner, d, pair, args);
        Ok(self.dir_pq[pair.0].id.api_id(owner))
    }

    fn configure_dir_queue(
        &mut self,
        owner: Owner,
        d: DomainId,
        q: DirId,
        args: &CreateDirQueueArgs,
    ) {
        // Write permission stays off until the domain is started.
        self.regs.write(regs::sys_dir_vasqid_v(d, q), 0);

        self.regs
            .write(regs::lsp_qid_dir_depth_thrsh(q), args.depth_threshold);

        if let Owner::Vdev(v) = owner {
            let virt = self.dir_pq[q.0].id.virt;
            self.regs.write(regs::sys_vf_dir_vqid_v(v, virt), 1);
            self.regs
                .write(regs::sys_vf_dir_vqid2qid(v, virt), q.0 as u32);
        }

        self.regs.write(regs::sys_dir_qid_v(q), 1);

        self.dir_pq[q.0].queue_configured = true;
    }

    /// Depth of an LDB queue: atomic-active + atomic-storage + enqueued.
    pub(crate) fn ldb_queue_depth(&self, q: LdbQueueId) -> u32 {
        self.regs.read(regs::lsp_qid_aqed_active_cnt(q))
            + self.regs.read(regs::lsp_qid_atm_active(q))
            + self.regs.read(regs::lsp_qid_ldb_enqueue_cnt(q))
    }

    pub(crate) fn ldb_queue_is_empty(&self, q: LdbQueueId) -> bool {
        self.ldb_queue_depth(q) == 0
    }

    pub(crate) fn dir_queue_depth(&self, q: DirId) -> u32 {
        self.regs.read(regs::lsp_qid_dir_enqueue_cnt(q))
    }

    pub(crate) fn dir_queue_is_empty(&self, q: DirId) -> bool {
        self.dir_queue_depth(q) == 0
    }

    /// Queue-depth query for user software.
    pub fn get_ldb_queue_depth(&self, owner: Owner, domain_id: u32, queue_id: u32) -> Result<u32> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let q = self
            .domain_ldb_queue(owner, d, queue_id as usize)
            .ok_or(Error::InvalidId)?;
        Ok(self.ldb_queue_depth(q))
    }

    pub fn get_dir_queue_depth(&self, owner: Owner, domain_id: u32, queue_id: u32) -> Result<u32> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let q = self
            .domain_used_dir_pq(owner, d, queue_id as usize)
            .ok_or(Error::InvalidId)?;
        Ok(self.dir_queue_depth(q))
    }

    /// Restore a queue's configured scheduler inflight limit.
    pub(crate) fn ldb_queue_set_inflight_limit(&mut self, q: LdbQueueId) {
        let limit = self.ldb_queues[q.0].num_qid_inflights;
        self.regs.write(regs::lsp_qid_ldb_infl_lim(q), limit);
    }

    /// Lift the limit entirely (used while map additions are pending).
    pub(crate) fn ldb_queue_clear_inflight_limit(&mut self, q: LdbQueueId) {
        self.regs
            .write(regs::lsp_qid_ldb_infl_lim(q), MAX_QID_INFLIGHTS);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::Hw;
    use crate::regs::ShadowRegs;
    use crate::util::logging;
    use crate::{CreateDomainArgs, MAX_QID_INFLIGHTS};

    fn domain(hw: &mut Hw<ShadowRegs>, num_ldb_queues: u32, num_dir_ports: u32) -> u32 {
        let args = CreateDomainArgs {
            num_ldb_queues,
            num_ldb_ports: num_ldb_queues.min(1),
            num_dir_ports,
            num_hist_list_entries: num_ldb_queues.min(1),
            num_atomic_inflights: 128,
            ..Default::default()
        };
        hw.create_sched_domain(Owner::Pf, &args).unwrap()
    }

    #[test]
    fn ldb_queue_arguments() {
        logging();
        let mut hw = Hw::new(ShadowRegs::new());
        let d = domain(&mut hw, 2, 0);

        // Inflight limit out of range.
        let args = CreateLdbQueueArgs {
            num_qid_inflights: MAX_QID_INFLIGHTS + 1,
            ..Default::default()
        };
        assert_eq!(
            hw.create_ldb_queue(Owner::Pf, d, &args),
            Err(Error::InvalidParam)
        );

        // Ordered queues are capped at their sequence-number width.
        let args = CreateLdbQueueArgs {
            num_sequence_numbers: 64,
            num_qid_inflights: 128,
            ..Default::default()
        };
        assert_eq!(
            hw.create_ldb_queue(Owner::Pf, d, &args),
            Err(Error::InvalidParam)
        );

        // No group is configured for this width.
        let args = CreateLdbQueueArgs {
            num_sequence_numbers: 512,
            num_qid_inflights: 256,
            ..Default::default()
        };
        assert_eq!(
            hw.create_ldb_queue(Owner::Pf, d, &args),
            Err(Error::Unavailable)
        );

        // Atomic budget exceeds what the domain reserved.
        let args = CreateLdbQueueArgs {
            num_atomic_inflights: 256,
            ..Default::default()
        };
        assert_eq!(
            hw.create_ldb_queue(Owner::Pf, d, &args),
            Err(Error::Unavailable)
        );

        let args = CreateLdbQueueArgs {
            num_atomic_inflights: 128,
            lock_id_comp_level: 100,
            ..Default::default()
        };
        assert_eq!(
            hw.create_ldb_queue(Owner::Pf, d, &args),
            Err(Error::InvalidParam)
        );
    }

    #[test]
    fn ordered_queue_takes_sn_slot() {
        logging();
        let mut hw = Hw::new(ShadowRegs::new());
        let d = domain(&mut hw, 2, 0);

        let args = CreateLdbQueueArgs {
            num_sequence_numbers: 64,
            num_qid_inflights: 64,
            ..Default::default()
        };
        let id = hw.create_ldb_queue(Owner::Pf, d, &args).unwrap();
        let queue = &hw.ldb_queues[id as usize];
        assert!(queue.sn_cfg_valid);
        assert_eq!(hw.group_sequence_number_occupancy(queue.sn_group), Ok(1));

        // The slot is released on domain reset.
        let group = queue.sn_group;
        hw.reset_domain(Owner::Pf, d).unwrap();
        assert_eq!(hw.group_sequence_number_occupancy(group), Ok(0));
    }

    #[test]
    fn attached_queue_pool_empties() {
        logging();
        let mut hw = Hw::new(ShadowRegs::new());
        let d = domain(&mut hw, 1, 0);

        hw.create_ldb_queue(Owner::Pf, d, &CreateLdbQueueArgs::default())
            .unwrap();
        // The domain only attached one queue.
        assert_eq!(
            hw.create_ldb_queue(Owner::Pf, d, &CreateLdbQueueArgs::default()),
            Err(Error::Unavailable)
        );
    }

    #[test]
    fn dir_pair_configured_in_either_order() {
        logging();
        let mut hw = Hw::new(ShadowRegs::new());
        let d = domain(&mut hw, 0, 2);

        // Queue first, then the port half against the same id.
        let qid = hw
            .create_dir_queue(Owner::Pf, d, &CreateDirQueueArgs::default())
            .unwrap();
        let pair = &hw.dir_pq[qid as usize];
        assert!(pair.queue_configured && !pair.port_configured);

        let args = crate::CreateDirPortArgs {
            queue_id: Some(qid),
            cq_depth: 8,
        };
        let pid = hw.create_dir_port(Owner::Pf, d, &args, 0x40).unwrap();
        assert_eq!(pid, qid);
        assert!(hw.dir_pq[qid as usize].port_configured);

        // Port first for the second pair.
        let args = crate::CreateDirPortArgs {
            queue_id: None,
            cq_depth: 8,
        };
        let pid = hw.create_dir_port(Owner::Pf, d, &args, 0x40).unwrap();
        let args = CreateDirQueueArgs {
            port_id: Some(pid),
            ..Default::default()
        };
        let qid = hw.create_dir_queue(Owner::Pf, d, &args).unwrap();
        assert_eq!(pid, qid);
    }

    #[test]
    fn depth_queries_read_occupancy() {
        logging();
        let mut hw = Hw::new(ShadowRegs::new());
        let d = domain(&mut hw, 1, 1);

        let q = hw
            .create_ldb_queue(Owner::Pf, d, &CreateLdbQueueArgs::default())
            .unwrap();
        assert_eq!(hw.get_ldb_queue_depth(Owner::Pf, d, q), Ok(0));

        hw.regs
            .write(regs::lsp_qid_ldb_enqueue_cnt(LdbQueueId(q as usize)), 3);
        hw.regs
            .write(regs::lsp_qid_atm_active(LdbQueueId(q as usize)), 2);
        assert_eq!(hw.get_ldb_queue_depth(Owner::Pf, d, q), Ok(5));

        let dq = hw
            .create_dir_queue(Owner::Pf, d, &CreateDirQueueArgs::default())
            .unwrap();
        hw.regs
            .write(regs::lsp_qid_dir_enqueue_cnt(DirId(dq as usize)), 7);
        assert_eq!(hw.get_dir_queue_depth(Owner::Pf, d, dq), Ok(7));

        assert_eq!(
            hw.get_ldb_queue_depth(Owner::Pf, d, 31),
            Err(Error::InvalidId)
        );
    }
}
