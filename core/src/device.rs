//! Device-wide state: resource arenas, per-owner pools, and the management
//! operations that span them.
//!
//! [`Hw`] is constructed once at device attach and owns everything: the CSR
//! access handle, the fixed arenas of queue/port/domain records (indexed by
//! physical id), the PF pool, and one pool per vdev. At init every resource
//! belongs to the PF. Callers are expected to serialize access; the
//! [`crate::worker::Device`] wrapper provides the per-device configuration
//! lock.

use log::{debug, error, info};

use crate::domain::Domain;
use crate::ids::{DirId, DomainId, LdbPortId, LdbQueueId, Owner, VdevId};
use crate::pool::{reassign_bitmap, reassign_credits, reassign_ids, FnResources};
use crate::port::LdbPort;
use crate::queue::{DirPq, LdbQueue};
use crate::regs::{self, GrpSnMode, Mmio};
use crate::sn::SnGroup;
use crate::{
    Error, NumResources, Result, MAX_ATM_INFLIGHTS, MAX_DIR_CREDITS, MAX_DIR_PAIRS, MAX_DOMAINS,
    MAX_LDB_CREDITS, MAX_LDB_PORTS, MAX_LDB_QUEUES, MAX_QID_SLOTS, MAX_VDEVS, NUM_COS,
    NUM_SN_GROUPS, PORTS_PER_COS,
};

/// Bounded poll budget for a consumer queue's completions to land.
const MAX_CQ_COMP_CHECK_LOOPS: usize = 4096;
/// Bounded poll budget for a queue's occupancy to drain.
const MAX_QID_EMPTY_CHECK_LOOPS: usize = 4096;

/// Initial per-CoS free-list order. Neighboring ids are kept numerically
/// distant so that ports which end up mapping common queues are unlikely to
/// be adjacent; see the allocation heuristic in `next_ldb_port`.
const INIT_LDB_PORT_ORDER: [usize; PORTS_PER_COS] =
    [0, 7, 14, 5, 12, 3, 10, 1, 8, 15, 6, 13, 4, 11, 2, 9];

pub struct Hw<M> {
    pub(crate) regs: M,
    pub(crate) pf: FnResources,
    pub(crate) vdevs: Vec<FnResources>,
    pub(crate) domains: Vec<Domain>,
    pub(crate) ldb_queues: Vec<LdbQueue>,
    pub(crate) ldb_ports: Vec<LdbPort>,
    pub(crate) dir_pq: Vec<DirPq>,
    pub(crate) sn_groups: Vec<SnGroup>,
}

impl<M: Mmio> Hw<M> {
    /// Build the resource-tracking state, giving everything to the PF.
    pub fn new(regs: M) -> Self {
        let mut hw = Self {
            regs,
            pf: FnResources::new(),
            vdevs: (0..MAX_VDEVS).map(|_| FnResources::new()).collect(),
            domains: (0..MAX_DOMAINS).map(Domain::new).collect(),
            ldb_queues: (0..MAX_LDB_QUEUES).map(LdbQueue::new).collect(),
            ldb_ports: (0..MAX_LDB_PORTS).map(|i| LdbPort::new(i, i / PORTS_PER_COS)).collect(),
            dir_pq: (0..MAX_DIR_PAIRS).map(DirPq::new).collect(),
            sn_groups: (0..NUM_SN_GROUPS).map(SnGroup::new).collect(),
        };

        hw.pf.avail_domains = (0..MAX_DOMAINS).map(DomainId).collect();
        hw.pf.avail_ldb_queues = (0..MAX_LDB_QUEUES).map(LdbQueueId).collect();
        for cos in 0..NUM_COS {
            hw.pf.avail_ldb_ports[cos] = INIT_LDB_PORT_ORDER
                .iter()
                .map(|&i| LdbPortId(cos * PORTS_PER_COS + i))
                .collect();
        }
        hw.pf.avail_dir_pq = (0..MAX_DIR_PAIRS).map(DirId).collect();
        hw.pf.avail_ldb_credits = MAX_LDB_CREDITS;
        hw.pf.avail_dir_credits = MAX_DIR_CREDITS;
        hw.pf.avail_atm_inflights = MAX_ATM_INFLIGHTS;
        hw.pf.avail_hist_list.fill();

        info!("initialized device resources");
        hw
    }

    pub(crate) fn pool(&self, owner: Owner) -> &FnResources {
        match owner {
            Owner::Pf => &self.pf,
            Owner::Vdev(v) => &self.vdevs[v.0],
        }
    }

    pub(crate) fn pool_mut(&mut self, owner: Owner) -> &mut FnResources {
        match owner {
            Owner::Pf => &mut self.pf,
            Owner::Vdev(v) => &mut self.vdevs[v.0],
        }
    }

    fn vdev_checked(&self, v: VdevId) -> Result<()> {
        if v.0 >= MAX_VDEVS {
            return Err(Error::InvalidId);
        }
        Ok(())
    }

    fn vdev_unlocked(&self, v: VdevId) -> Result<()> {
        self.vdev_checked(v)?;
        if self.vdevs[v.0].locked {
            return Err(Error::Locked);
        }
        Ok(())
    }

    // Id resolution. Domains are matched within the requesting owner's set,
    // queues and ports within their domain; vdev callers address everything
    // by virtual id.

    pub(crate) fn domain_by_id(&self, owner: Owner, id: usize) -> Result<DomainId> {
        if let Owner::Vdev(v) = owner {
            self.vdev_checked(v)?;
        }
        self.domains
            .iter()
            .position(|dom| dom.configured && dom.owner == owner && dom.id.matches(owner, id))
            .map(DomainId)
            .ok_or(Error::InvalidId)
    }

    pub(crate) fn domain_ldb_queue(
        &self,
        owner: Owner,
        d: DomainId,
        id: usize,
    ) -> Option<LdbQueueId> {
        self.ldb_queues
            .iter()
            .position(|q| q.domain == Some(d) && q.configured && q.id.matches(owner, id))
            .map(LdbQueueId)
    }

    pub(crate) fn domain_used_ldb_port(
        &self,
        owner: Owner,
        d: DomainId,
        id: usize,
    ) -> Option<LdbPortId> {
        self.ldb_ports
            .iter()
            .position(|p| p.domain == Some(d) && p.configured && p.id.matches(owner, id))
            .map(LdbPortId)
    }

    pub(crate) fn domain_used_dir_pq(&self, owner: Owner, d: DomainId, id: usize) -> Option<DirId> {
        self.dir_pq
            .iter()
            .position(|p| p.domain == Some(d) && p.in_use() && p.id.matches(owner, id))
            .map(DirId)
    }

    // Domain membership sweeps. "Used" means configured; the remaining
    // attached records are the domain's own available sub-pool.

    pub(crate) fn domain_avail_ldb_queue(&self, d: DomainId) -> Option<LdbQueueId> {
        self.ldb_queues
            .iter()
            .position(|q| q.domain == Some(d) && !q.configured)
            .map(LdbQueueId)
    }

    pub(crate) fn domain_avail_ldb_port(&self, d: DomainId, cos: usize) -> Option<LdbPortId> {
        self.ldb_ports
            .iter()
            .position(|p| p.domain == Some(d) && !p.configured && p.cos == cos)
            .map(LdbPortId)
    }

    pub(crate) fn domain_avail_dir_pq(&self, d: DomainId) -> Option<DirId> {
        self.dir_pq
            .iter()
            .position(|p| p.domain == Some(d) && !p.in_use())
            .map(DirId)
    }

    /// Attached queues, configured or not.
    pub(crate) fn domain_ldb_queue_ids(&self, d: DomainId) -> Vec<LdbQueueId> {
        (0..MAX_LDB_QUEUES)
            .filter(|&i| self.ldb_queues[i].domain == Some(d))
            .map(LdbQueueId)
            .collect()
    }

    pub(crate) fn domain_used_ldb_queue_ids(&self, d: DomainId) -> Vec<LdbQueueId> {
        (0..MAX_LDB_QUEUES)
            .filter(|&i| self.ldb_queues[i].domain == Some(d) && self.ldb_queues[i].configured)
            .map(LdbQueueId)
            .collect()
    }

    /// Attached ports, configured or not, class-of-service major.
    pub(crate) fn domain_ldb_port_ids_any(&self, d: DomainId) -> Vec<LdbPortId> {
        let mut ids: Vec<LdbPortId> = (0..MAX_LDB_PORTS)
            .filter(|&i| self.ldb_ports[i].domain == Some(d))
            .map(LdbPortId)
            .collect();
        ids.sort_by_key(|p| (self.ldb_ports[p.0].cos, p.0));
        ids
    }

    pub(crate) fn domain_used_ldb_port_ids(&self, d: DomainId) -> Vec<LdbPortId> {
        let mut ids: Vec<LdbPortId> = (0..MAX_LDB_PORTS)
            .filter(|&i| self.ldb_ports[i].domain == Some(d) && self.ldb_ports[i].configured)
            .map(LdbPortId)
            .collect();
        ids.sort_by_key(|p| (self.ldb_ports[p.0].cos, p.0));
        ids
    }

    pub(crate) fn domain_dir_ids_any(&self, d: DomainId) -> Vec<DirId> {
        (0..MAX_DIR_PAIRS)
            .filter(|&i| self.dir_pq[i].domain == Some(d))
            .map(DirId)
            .collect()
    }

    pub(crate) fn domain_used_dir_ids(&self, d: DomainId) -> Vec<DirId> {
        (0..MAX_DIR_PAIRS)
            .filter(|&i| self.dir_pq[i].domain == Some(d) && self.dir_pq[i].in_use())
            .map(DirId)
            .collect()
    }

    /// The owner's available resource counts.
    pub fn num_resources(&self, owner: Owner) -> Result<NumResources> {
        if let Owner::Vdev(v) = owner {
            self.vdev_checked(v)?;
        }
        let pool = self.pool(owner);

        let mut num = NumResources {
            num_sched_domains: pool.avail_domains.len() as u32,
            num_ldb_queues: pool.avail_ldb_queues.len() as u32,
            num_ldb_ports: pool.num_avail_ldb_ports() as u32,
            num_dir_ports: pool.avail_dir_pq.len() as u32,
            num_atomic_inflights: pool.avail_atm_inflights,
            num_hist_list_entries: pool.avail_hist_list.count() as u32,
            max_contiguous_hist_list_entries: pool.avail_hist_list.longest_set_range() as u32,
            num_ldb_credits: pool.avail_ldb_credits,
            num_dir_credits: pool.avail_dir_credits,
            ..Default::default()
        };
        for cos in 0..NUM_COS {
            num.num_cos_ldb_ports[cos] = pool.avail_ldb_ports[cos].len() as u32;
        }
        Ok(num)
    }

    // PF ↔ vdev transfers. All of them follow the return-then-reacquire
    // pattern of `pool.rs` and refuse to touch a locked assignment.

    pub fn update_vdev_sched_domains(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;

        for d in self.vdevs[v.0].avail_domains.clone() {
            self.domains[d.0].id.owner = Owner::Pf;
        }

        let ret = reassign_ids(
            &mut self.pf.avail_domains,
            &mut self.vdevs[v.0].avail_domains,
            num as usize,
        );

        for d in self.vdevs[v.0].avail_domains.clone() {
            self.domains[d.0].id.owner = Owner::Vdev(v);
        }
        ret
    }

    pub fn update_vdev_ldb_queues(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;

        for q in self.vdevs[v.0].avail_ldb_queues.clone() {
            self.ldb_queues[q.0].id.owner = Owner::Pf;
        }

        let ret = reassign_ids(
            &mut self.pf.avail_ldb_queues,
            &mut self.vdevs[v.0].avail_ldb_queues,
            num as usize,
        );

        for q in self.vdevs[v.0].avail_ldb_queues.clone() {
            self.ldb_queues[q.0].id.owner = Owner::Vdev(v);
        }
        ret
    }

    /// Transfer within one class of service.
    pub fn update_vdev_ldb_cos_ports(&mut self, v: VdevId, cos: usize, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;
        if cos >= NUM_COS {
            return Err(Error::InvalidParam);
        }

        for p in self.vdevs[v.0].avail_ldb_ports[cos].clone() {
            self.ldb_ports[p.0].id.owner = Owner::Pf;
        }

        let ret = reassign_ids(
            &mut self.pf.avail_ldb_ports[cos],
            &mut self.vdevs[v.0].avail_ldb_ports[cos],
            num as usize,
        );

        for p in self.vdevs[v.0].avail_ldb_ports[cos].clone() {
            self.ldb_ports[p.0].id.owner = Owner::Vdev(v);
        }
        ret
    }

    /// Transfer LDB ports of any class, decomposing into per-CoS
    /// sub-transfers with best-effort rollback.
    pub fn update_vdev_ldb_ports(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;

        let orig: u32 = self.vdevs[v.0].num_avail_ldb_ports() as u32;
        if orig == num {
            Ok(())
        } else if orig < num {
            self.add_vdev_ldb_ports(v, num - orig)
        } else {
            self.del_vdev_ldb_ports(v, orig - num)
        }
    }

    fn add_vdev_ldb_ports(&mut self, v: VdevId, mut num: u32) -> Result<()> {
        if (self.pf.num_avail_ldb_ports() as u32) < num {
            return Err(Error::Unavailable);
        }

        let mut orig = [0u32; NUM_COS];
        for cos in 0..NUM_COS {
            if num == 0 {
                break;
            }
            let curr = self.vdevs[v.0].avail_ldb_ports[cos].len() as u32;
            let avail = self.pf.avail_ldb_ports[cos].len() as u32;
            let add = num.min(avail);

            if let Err(e) = self.update_vdev_ldb_cos_ports(v, cos, curr + add) {
                error!("failed to add ldb ports to vdev {}", v.0);
                for c in (0..cos).rev() {
                    let _ = self.update_vdev_ldb_cos_ports(v, c, orig[c]);
                }
                return Err(e);
            }
            orig[cos] = curr;
            num -= add;
        }
        Ok(())
    }

    fn del_vdev_ldb_ports(&mut self, v: VdevId, mut num: u32) -> Result<()> {
        let mut orig = [0u32; NUM_COS];
        for cos in 0..NUM_COS {
            if num == 0 {
                break;
            }
            let curr = self.vdevs[v.0].avail_ldb_ports[cos].len() as u32;
            let del = num.min(curr);

            if let Err(e) = self.update_vdev_ldb_cos_ports(v, cos, curr - del) {
                error!("failed to remove ldb ports from vdev {}", v.0);
                for c in (0..cos).rev() {
                    let _ = self.update_vdev_ldb_cos_ports(v, c, orig[c]);
                }
                return Err(e);
            }
            orig[cos] = curr;
            num -= del;
        }
        Ok(())
    }

    pub fn update_vdev_dir_ports(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;

        for p in self.vdevs[v.0].avail_dir_pq.clone() {
            self.dir_pq[p.0].id.owner = Owner::Pf;
        }

        let ret = reassign_ids(
            &mut self.pf.avail_dir_pq,
            &mut self.vdevs[v.0].avail_dir_pq,
            num as usize,
        );

        for p in self.vdevs[v.0].avail_dir_pq.clone() {
            self.dir_pq[p.0].id.owner = Owner::Vdev(v);
        }
        ret
    }

    pub fn update_vdev_ldb_credits(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;
        let (pf, vd) = (&mut self.pf, &mut self.vdevs[v.0]);
        reassign_credits(&mut pf.avail_ldb_credits, &mut vd.avail_ldb_credits, num)
    }

    pub fn update_vdev_dir_credits(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;
        let (pf, vd) = (&mut self.pf, &mut self.vdevs[v.0]);
        reassign_credits(&mut pf.avail_dir_credits, &mut vd.avail_dir_credits, num)
    }

    pub fn update_vdev_atomic_inflights(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;
        let (pf, vd) = (&mut self.pf, &mut self.vdevs[v.0]);
        reassign_credits(&mut pf.avail_atm_inflights, &mut vd.avail_atm_inflights, num)
    }

    pub fn update_vdev_hist_list_entries(&mut self, v: VdevId, num: u32) -> Result<()> {
        self.vdev_unlocked(v)?;
        let (pf, vd) = (&mut self.pf, &mut self.vdevs[v.0]);
        reassign_bitmap(&mut pf.avail_hist_list, &mut vd.avail_hist_list, num as usize)
    }

    /// Freeze the vdev's assignment and number its resources from 0 in
    /// free-list order. The virtual ids are what the vdev's software sees.
    pub fn lock_vdev(&mut self, v: VdevId) -> Result<()> {
        self.vdev_checked(v)?;
        self.vdevs[v.0].locked = true;

        for (i, d) in self.vdevs[v.0].avail_domains.clone().into_iter().enumerate() {
            self.domains[d.0].id.virt = i;
            self.domains[d.0].id.owner = Owner::Vdev(v);
        }
        for (i, q) in self.vdevs[v.0].avail_ldb_queues.clone().into_iter().enumerate() {
            self.ldb_queues[q.0].id.virt = i;
            self.ldb_queues[q.0].id.owner = Owner::Vdev(v);
        }
        let mut i = 0;
        for cos in 0..NUM_COS {
            for p in self.vdevs[v.0].avail_ldb_ports[cos].clone() {
                self.ldb_ports[p.0].id.virt = i;
                self.ldb_ports[p.0].id.owner = Owner::Vdev(v);
                i += 1;
            }
        }
        for (i, p) in self.vdevs[v.0].avail_dir_pq.clone().into_iter().enumerate() {
            self.dir_pq[p.0].id.virt = i;
            self.dir_pq[p.0].id.owner = Owner::Vdev(v);
        }

        info!("locked vdev {} resource assignment", v.0);
        Ok(())
    }

    pub fn unlock_vdev(&mut self, v: VdevId) -> Result<()> {
        self.vdev_checked(v)?;
        self.vdevs[v.0].locked = false;
        Ok(())
    }

    pub fn vdev_is_locked(&self, v: VdevId) -> bool {
        v.0 < MAX_VDEVS && self.vdevs[v.0].locked
    }

    /// Whether the vdev has any configured domain.
    pub fn vdev_in_use(&self, v: VdevId) -> Result<bool> {
        self.vdev_checked(v)?;
        Ok(self
            .domains
            .iter()
            .any(|d| d.configured && d.owner == Owner::Vdev(v)))
    }

    /// Give all of the vdev's unattached resources back to the PF.
    pub fn reset_vdev_resources(&mut self, v: VdevId) -> Result<()> {
        self.vdev_unlocked(v)?;

        self.update_vdev_sched_domains(v, 0)?;
        self.update_vdev_ldb_queues(v, 0)?;
        self.update_vdev_ldb_ports(v, 0)?;
        self.update_vdev_dir_ports(v, 0)?;
        self.update_vdev_ldb_credits(v, 0)?;
        self.update_vdev_dir_credits(v, 0)?;
        self.update_vdev_hist_list_entries(v, 0)?;
        self.update_vdev_atomic_inflights(v, 0)?;
        Ok(())
    }

    /// Reset every domain the vdev has configured.
    pub fn reset_vdev(&mut self, v: VdevId) -> Result<()> {
        self.vdev_checked(v)?;

        let owned: Vec<DomainId> = self
            .domains
            .iter()
            .enumerate()
            .filter(|(_, d)| d.configured && d.owner == Owner::Vdev(v))
            .map(|(i, _)| DomainId(i))
            .collect();
        for d in owned {
            self.reset_domain_inner(d)?;
        }
        Ok(())
    }

    // Sequence-number group management.

    pub fn group_sequence_numbers(&self, group: usize) -> Result<u32> {
        if group >= NUM_SN_GROUPS {
            return Err(Error::InvalidParam);
        }
        Ok(self.sn_groups[group].sequence_numbers_per_queue)
    }

    pub fn group_sequence_number_occupancy(&self, group: usize) -> Result<u32> {
        if group >= NUM_SN_GROUPS {
            return Err(Error::InvalidParam);
        }
        Ok(self.sn_groups[group].used_slots())
    }

    pub fn set_group_sequence_numbers(&mut self, group: usize, val: u32) -> Result<()> {
        if group >= NUM_SN_GROUPS {
            return Err(Error::InvalidParam);
        }
        self.sn_groups[group].set_width(val)?;

        let mode = GrpSnMode::new()
            .with_mode0(self.sn_groups[0].mode as u8)
            .with_mode1(self.sn_groups[1].mode as u8);
        self.regs.write(regs::ro_grp_sn_mode(), mode.into_bits());

        debug!("set group {group} sequence numbers to {val}");
        Ok(())
    }

    /// Quiesce a domain, verify it drained, and return all of its resources
    /// to the owner's pool.
    ///
    /// A domain that fails the emptiness verification is left untouched and
    /// the error is surfaced; that situation means in-flight work survived
    /// the quiesce and retrying the reset is the only option.
    pub fn reset_domain(&mut self, owner: Owner, domain_id: u32) -> Result<()> {
        debug!("reset domain {owner} id={domain_id}");
        let d = self.domain_by_id(owner, domain_id as usize)?;
        self.reset_domain_inner(d)
    }

    pub(crate) fn reset_domain_inner(&mut self, d: DomainId) -> Result<()> {
        let owner = self.domains[d.0].owner;
        let ports = self.domain_used_ldb_port_ids(d);
        let dirs = self.domain_used_dir_ids(d);

        // Tear down the vdev-visible translations first so the vdev cannot
        // reach the domain while it drains.
        if let Owner::Vdev(v) = owner {
            for &p in &ports {
                let virt = self.ldb_ports[p.0].id.virt;
                self.regs.write(regs::sys_vf_ldb_vpp_v(v, virt), 0);
            }
            for &p in &dirs {
                let virt = self.dir_pq[p.0].id.virt;
                self.regs.write(regs::sys_vf_dir_vpp_v(v, virt), 0);
            }
        }

        self.domain_disable_ldb_queue_write_perms(d);
        self.domain_disable_dir_queue_write_perms(d);

        // Turn off completion tracking on all the domain's ports.
        for &p in &ports {
            self.regs.write(regs::chp_sn_chk_enbl(p), 0);
        }

        // The map and unmap procedures require zero CQ inflights and zero
        // queue inflights respectively, so stop the CQs and let the counts
        // settle before finishing them.
        self.domain_disable_ldb_cqs(d);

        self.domain_wait_for_ldb_cqs_to_empty(d)?;

        self.domain_finish_unmap_procedures(d);
        self.domain_finish_map_procedures(d);

        // Drain whatever the queues still hold.
        self.domain_enable_ldb_cqs(d);
        self.domain_drain_mapped_queues(d)?;
        self.domain_drain_unmapped_queues(d)?;
        self.domain_disable_ldb_cqs(d);

        self.domain_drain_dir_queues(d)?;
        self.domain_disable_dir_cqs(d);

        // Disable the producer ports.
        for &p in &ports {
            self.regs.write(regs::sys_ldb_pp_v(p), 0);
        }
        for &p in &dirs {
            self.regs.write(regs::sys_dir_pp_v(p), 0);
        }

        self.domain_verify_reset_success(d)?;

        self.domain_reset_registers(d);

        self.reset_domain_sw_state(d)?;
        info!("reset domain {}", d.0);
        Ok(())
    }

    fn domain_disable_ldb_queue_write_perms(&mut self, d: DomainId) {
        let owner = self.domains[d.0].owner;
        for q in self.domain_used_ldb_queue_ids(d) {
            self.regs.write(regs::sys_ldb_vasqid_v(d, q), 0);
            if let Owner::Vdev(v) = owner {
                let virt = self.ldb_queues[q.0].id.virt;
                self.regs.write(regs::sys_ldb_qid2vqid(q), 0);
                self.regs.write(regs::sys_vf_ldb_vqid_v(v, virt), 0);
                self.regs.write(regs::sys_vf_ldb_vqid2qid(v, virt), 0);
            }
        }
    }

    fn domain_disable_dir_queue_write_perms(&mut self, d: DomainId) {
        let owner = self.domains[d.0].owner;
        for q in self.domain_used_dir_ids(d) {
            self.regs.write(regs::sys_dir_vasqid_v(d, q), 0);
            if let Owner::Vdev(v) = owner {
                let virt = self.dir_pq[q.0].id.virt;
                self.regs.write(regs::sys_vf_dir_vqid_v(v, virt), 0);
                self.regs.write(regs::sys_vf_dir_vqid2qid(v, virt), 0);
            }
        }
    }

    pub(crate) fn domain_disable_ldb_cqs(&mut self, d: DomainId) {
        for p in self.domain_used_ldb_port_ids(d) {
            self.ldb_ports[p.0].enabled = false;
            self.ldb_port_cq_disable(p);
        }
    }

    pub(crate) fn domain_enable_ldb_cqs(&mut self, d: DomainId) {
        for p in self.domain_used_ldb_port_ids(d) {
            self.ldb_ports[p.0].enabled = true;
            self.ldb_port_cq_enable(p);
        }
    }

    fn domain_disable_dir_cqs(&mut self, d: DomainId) {
        for p in self.domain_used_dir_ids(d) {
            self.dir_pq[p.0].enabled = false;
            self.dir_port_cq_disable(p);
        }
    }

    pub(crate) fn ldb_cq_inflight_count(&self, p: LdbPortId) -> u32 {
        self.regs.read(regs::lsp_cq_ldb_infl_cnt(p))
    }

    pub(crate) fn ldb_cq_token_count(&self, p: LdbPortId) -> u32 {
        // Subtract the initial count used to emulate depths below 8.
        self.regs.read(regs::lsp_cq_ldb_tkn_cnt(p)) - self.ldb_ports[p.0].init_tkn_cnt
    }

    fn dir_cq_token_count(&self, p: DirId) -> u32 {
        self.regs.read(regs::lsp_cq_dir_tkn_cnt(p))
    }

    fn domain_wait_for_ldb_cqs_to_empty(&mut self, d: DomainId) -> Result<()> {
        for p in self.domain_used_ldb_port_ids(d) {
            let drained = (0..MAX_CQ_COMP_CHECK_LOOPS)
                .any(|_| self.ldb_cq_inflight_count(p) == 0);
            if !drained {
                error!("failed to flush ldb port {}'s completions", p.0);
                return Err(Error::Internal);
            }
        }
        Ok(())
    }

    fn domain_mapped_queues_empty(&self, d: DomainId) -> bool {
        self.domain_used_ldb_queue_ids(d)
            .into_iter()
            .filter(|q| self.ldb_queues[q.0].num_mappings > 0)
            .all(|q| self.ldb_queue_is_empty(q))
    }

    pub(crate) fn domain_drain_mapped_queues(&mut self, d: DomainId) -> Result<()> {
        // An unstarted domain never admitted traffic.
        if !self.domains[d.0].started {
            return Ok(());
        }

        if self.domains[d.0].num_pending_removals > 0 {
            error!("failed to unmap domain {}'s queues before drain", d.0);
            return Err(Error::Internal);
        }

        let drained =
            (0..MAX_QID_EMPTY_CHECK_LOOPS).any(|_| self.domain_mapped_queues_empty(d));
        if !drained {
            error!("failed to empty domain {}'s mapped queues", d.0);
            return Err(Error::Internal);
        }
        Ok(())
    }

    fn domain_drain_unmapped_queue(&mut self, d: DomainId, q: LdbQueueId) -> Result<()> {
        // A domain with LDB queues must have LDB ports.
        let port = self
            .domain_used_ldb_port_ids(d)
            .first()
            .copied()
            .ok_or_else(|| {
                error!("domain {} has no configured ldb ports", d.0);
                Error::Internal
            })?;

        // Free up a mapping slot if the port is full.
        if self.ldb_ports[port.0].num_mappings as usize == MAX_QID_SLOTS {
            let victim = LdbQueueId(self.ldb_ports[port.0].qid_map[0].qid);
            self.ldb_port_unmap_qid(port, victim)?;
        }

        self.ldb_port_map_qid_dynamic(port, q, 0)?;

        self.domain_drain_mapped_queues(d)
    }

    fn domain_drain_unmapped_queues(&mut self, d: DomainId) -> Result<()> {
        if !self.domains[d.0].started {
            return Ok(());
        }

        for q in self.domain_used_ldb_queue_ids(d) {
            if self.ldb_queues[q.0].num_mappings != 0 || self.ldb_queue_is_empty(q) {
                continue;
            }
            self.domain_drain_unmapped_queue(d, q)?;
        }
        Ok(())
    }

    fn domain_drain_dir_queues(&mut self, d: DomainId) -> Result<()> {
        if !self.domains[d.0].started {
            return Ok(());
        }

        let queues: Vec<DirId> = self
            .domain_used_dir_ids(d)
            .into_iter()
            .filter(|q| self.dir_pq[q.0].queue_configured)
            .collect();

        let drained = (0..MAX_QID_EMPTY_CHECK_LOOPS)
            .any(|_| queues.iter().all(|&q| self.dir_queue_is_empty(q)));
        if !drained {
            error!("failed to empty domain {}'s dir queues", d.0);
            return Err(Error::Internal);
        }
        Ok(())
    }

    fn domain_verify_reset_success(&self, d: DomainId) -> Result<()> {
        for q in self.domain_used_ldb_queue_ids(d) {
            if !self.ldb_queue_is_empty(q) {
                error!("failed to empty ldb queue {}", q.0);
                return Err(Error::Internal);
            }
        }
        for p in self.domain_used_ldb_port_ids(d) {
            if self.ldb_cq_inflight_count(p) != 0 || self.ldb_cq_token_count(p) != 0 {
                error!("failed to empty ldb port {}", p.0);
                return Err(Error::Internal);
            }
        }
        for q in self.domain_used_dir_ids(d) {
            if !self.dir_queue_is_empty(q) {
                error!("failed to empty dir queue {}", q.0);
                return Err(Error::Internal);
            }
            if self.dir_cq_token_count(q) != 0 {
                error!("failed to empty dir port {}", q.0);
                return Err(Error::Internal);
            }
        }
        Ok(())
    }

    /// Return the domain's CSRs to their reset values.
    fn domain_reset_registers(&mut self, d: DomainId) {
        for p in self.domain_used_ldb_port_ids(d) {
            self.regs.write(regs::sys_ldb_pp2vas(p), 0);
            self.regs.write(regs::sys_ldb_pp2vdev(p), 0);
            self.regs.write(regs::chp_ldb_cq2vas(p), 0);
            self.regs.write(regs::sys_ldb_cq_addr_l(p), 0);
            self.regs.write(regs::sys_ldb_cq_addr_u(p), 0);
            self.regs.write(regs::lsp_cq_ldb_dsbl(p), 1);
            self.regs.write(regs::lsp_cq_ldb_tkn_cnt(p), 0);
            self.regs.write(regs::lsp_cq_ldb_infl_lim(p), 0);
            self.regs.write(regs::lsp_cq_ldb_tkn_depth_sel(p), 0);
            self.regs.write(regs::chp_hist_list_base(p), 0);
            self.regs.write(regs::chp_hist_list_lim(p), 0);
            self.regs.write(regs::chp_hist_list_push_ptr(p), 0);
            self.regs.write(regs::chp_hist_list_pop_ptr(p), 0);
            self.regs.write(regs::lsp_cq2priov(p), 0);
            self.regs.write(regs::lsp_cq2qid(p, 0), 0);
            self.regs.write(regs::lsp_cq2qid(p, 1), 0);
            self.regs.write(regs::chp_sn_chk_enbl(p), 0);
        }

        for q in self.domain_used_ldb_queue_ids(d) {
            self.regs.write(regs::sys_ldb_qid_v(q), 0);
            self.regs.write(regs::sys_ldb_qid_cfg_v(q), 0);
            self.regs.write(regs::lsp_qid_ldb_infl_lim(q), 0);
            self.regs.write(regs::lsp_qid_aqed_active_lim(q), 0);
            self.regs.write(regs::lsp_qid_atm_depth_thrsh(q), 0);
            self.regs.write(regs::lsp_qid_naldb_depth_thrsh(q), 0);
            self.regs.write(regs::aqed_qid_hid_width(q), 0);
            self.regs.write(regs::aqed_qid_fid_lim(q), 0);
            self.regs.write(regs::chp_ord_qid_sn_map(q), 0);
            for group in 0..MAX_LDB_PORTS / 4 {
                self.regs.write(regs::lsp_qid2cqidix(q, group), 0);
                self.regs.write(regs::lsp_qid2cqidix2(q, group), 0);
                self.regs.write(regs::aqed_qid2cqidix(q, group), 0);
            }
        }

        for p in self.domain_used_dir_ids(d) {
            self.regs.write(regs::sys_dir_pp2vas(p), 0);
            self.regs.write(regs::sys_dir_pp2vdev(p), 0);
            self.regs.write(regs::chp_dir_cq2vas(p), 0);
            self.regs.write(regs::sys_dir_cq_addr_l(p), 0);
            self.regs.write(regs::sys_dir_cq_addr_u(p), 0);
            self.regs.write(regs::lsp_cq_dir_dsbl(p), 1);
            self.regs.write(regs::lsp_cq_dir_tkn_depth_sel(p), 0);
            self.regs.write(regs::sys_dir_qid_v(p), 0);
            self.regs.write(regs::lsp_qid_dir_depth_thrsh(p), 0);
        }

        self.regs.write(regs::chp_cfg_ldb_vas_crd(d), 0);
        self.regs.write(regs::chp_cfg_dir_vas_crd(d), 0);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::regs::ShadowRegs;
    use crate::util::logging;
    use crate::{CreateDomainArgs, MAX_HIST_LIST_ENTRIES};

    fn hw() -> Hw<ShadowRegs> {
        logging();
        Hw::new(ShadowRegs::new())
    }

    #[test]
    fn init_gives_everything_to_pf() {
        let hw = hw();
        let n = hw.num_resources(Owner::Pf).unwrap();
        assert_eq!(n.num_sched_domains, MAX_DOMAINS as u32);
        assert_eq!(n.num_ldb_queues, MAX_LDB_QUEUES as u32);
        assert_eq!(n.num_ldb_ports, MAX_LDB_PORTS as u32);
        assert_eq!(n.num_cos_ldb_ports, [16; 4]);
        assert_eq!(n.num_dir_ports, MAX_DIR_PAIRS as u32);
        assert_eq!(n.num_ldb_credits, MAX_LDB_CREDITS);
        assert_eq!(n.num_dir_credits, MAX_DIR_CREDITS);
        assert_eq!(n.num_hist_list_entries, MAX_HIST_LIST_ENTRIES as u32);
        assert_eq!(
            n.max_contiguous_hist_list_entries,
            MAX_HIST_LIST_ENTRIES as u32
        );

        let v = hw.num_resources(Owner::Vdev(VdevId(0))).unwrap();
        assert_eq!(v, NumResources::default());
    }

    #[test]
    fn transfer_conservation_and_round_trip() {
        let mut hw = hw();
        let v = VdevId(2);

        hw.update_vdev_ldb_queues(v, 12).unwrap();
        hw.update_vdev_ldb_ports(v, 10).unwrap();
        hw.update_vdev_ldb_credits(v, 1000).unwrap();
        hw.update_vdev_hist_list_entries(v, 512).unwrap();

        let pf = hw.num_resources(Owner::Pf).unwrap();
        let vd = hw.num_resources(Owner::Vdev(v)).unwrap();
        assert_eq!(pf.num_ldb_queues + vd.num_ldb_queues, MAX_LDB_QUEUES as u32);
        assert_eq!(pf.num_ldb_ports + vd.num_ldb_ports, MAX_LDB_PORTS as u32);
        assert_eq!(pf.num_ldb_credits + vd.num_ldb_credits, MAX_LDB_CREDITS);
        assert_eq!(
            pf.num_hist_list_entries + vd.num_hist_list_entries,
            MAX_HIST_LIST_ENTRIES as u32
        );
        assert_eq!(vd.num_ldb_queues, 12);
        assert_eq!(vd.num_ldb_ports, 10);

        // Round trip back to zero restores the PF exactly.
        hw.reset_vdev_resources(v).unwrap();
        let pf = hw.num_resources(Owner::Pf).unwrap();
        assert_eq!(pf, self::hw().num_resources(Owner::Pf).unwrap());
    }

    #[test]
    fn transfer_shortfall_keeps_state() {
        let mut hw = hw();
        let v = VdevId(0);

        hw.update_vdev_ldb_queues(v, 8).unwrap();
        assert_eq!(
            hw.update_vdev_ldb_queues(v, MAX_LDB_QUEUES as u32 + 1),
            Err(Error::Unavailable)
        );
        let vd = hw.num_resources(Owner::Vdev(v)).unwrap();
        assert_eq!(vd.num_ldb_queues, 8);
    }

    #[test]
    fn locked_vdev_rejects_transfers() {
        let mut hw = hw();
        let v = VdevId(1);

        hw.update_vdev_ldb_queues(v, 4).unwrap();
        hw.update_vdev_sched_domains(v, 1).unwrap();
        hw.lock_vdev(v).unwrap();

        assert_eq!(hw.update_vdev_ldb_queues(v, 8), Err(Error::Locked));
        assert_eq!(hw.reset_vdev_resources(v), Err(Error::Locked));

        // Virtual ids were renumbered from zero at lock time.
        let q = hw.vdevs[v.0].avail_ldb_queues[0];
        assert_eq!(hw.ldb_queues[q.0].id.virt, 0);
        assert_eq!(hw.ldb_queues[q.0].id.owner, Owner::Vdev(v));

        hw.unlock_vdev(v).unwrap();
        hw.update_vdev_ldb_queues(v, 8).unwrap();
    }

    #[test]
    fn cos_port_distribution() {
        let mut hw = hw();
        let v = VdevId(3);

        // 20 ports cannot come from one class (16 per CoS).
        hw.update_vdev_ldb_ports(v, 20).unwrap();
        let vd = hw.num_resources(Owner::Vdev(v)).unwrap();
        assert_eq!(vd.num_ldb_ports, 20);
        assert_eq!(vd.num_cos_ldb_ports[0], 16);
        assert_eq!(vd.num_cos_ldb_ports[1], 4);

        // Shrinking also works across classes.
        hw.update_vdev_ldb_ports(v, 2).unwrap();
        let vd = hw.num_resources(Owner::Vdev(v)).unwrap();
        assert_eq!(vd.num_ldb_ports, 2);
    }

    #[test]
    fn vdev_in_use_follows_domains() {
        let mut hw = hw();
        let v = VdevId(0);

        hw.update_vdev_sched_domains(v, 1).unwrap();
        hw.update_vdev_ldb_credits(v, 100).unwrap();
        hw.update_vdev_dir_credits(v, 100).unwrap();
        assert!(!hw.vdev_in_use(v).unwrap());

        let args = CreateDomainArgs::default();
        let id = hw.create_sched_domain(Owner::Vdev(v), &args).unwrap();
        assert!(hw.vdev_in_use(v).unwrap());

        hw.reset_domain(Owner::Vdev(v), id).unwrap();
        assert!(!hw.vdev_in_use(v).unwrap());
    }

    #[test]
    fn sn_group_api() {
        let mut hw = hw();
        assert_eq!(hw.group_sequence_numbers(0), Ok(64));
        hw.set_group_sequence_numbers(0, 256).unwrap();
        assert_eq!(hw.group_sequence_numbers(0), Ok(256));
        assert_eq!(hw.group_sequence_number_occupancy(0), Ok(0));
        assert_eq!(
            hw.set_group_sequence_numbers(0, 100),
            Err(Error::InvalidParam)
        );
        assert_eq!(hw.set_group_sequence_numbers(2, 64), Err(Error::InvalidParam));
    }

    #[test]
    fn port_allocation_avoids_neighbors() {
        let mut hw = hw();

        let args = CreateDomainArgs {
            num_ldb_ports: 2,
            num_ldb_credits: 64,
            num_dir_credits: 0,
            ..Default::default()
        };
        let a = hw.create_sched_domain(Owner::Pf, &args).unwrap();
        let b = hw.create_sched_domain(Owner::Pf, &args).unwrap();

        let pa = hw.domain_ldb_port_ids_any(DomainId(a as usize));
        let pb = hw.domain_ldb_port_ids_any(DomainId(b as usize));
        // The two domains' ports are never physically adjacent while the
        // table is mostly free.
        for x in &pa {
            for y in &pb {
                assert!(x.0.abs_diff(y.0) > 1, "{} adjacent to {}", x.0, y.0);
            }
        }
    }
}
