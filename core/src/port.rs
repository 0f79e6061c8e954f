//! Load-balanced ports and their QID mapping-slot tables.
//!
//! Each port has a fixed table of [`MAX_QID_SLOTS`] mapping slots. A slot
//! tracks the relationship between this port and one queue, including the
//! in-progress phases of the asynchronous map/unmap procedures and an
//! optional pending replacement mapping. All bookkeeping side effects of a
//! slot changing state are centralized in [`Hw::slot_state_transition`];
//! any transition not listed there is an internal error.

use log::{debug, error};

use crate::device::Hw;
use crate::ids::{DirId, DomainId, LdbPortId, LdbQueueId, Owner, ResourceId};
use crate::regs::{self, Cq2Priov, Mmio};
use crate::{CreateDirPortArgs, CreateLdbPortArgs, Error, Result, MAX_QID_SLOTS, NUM_COS};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SlotState {
    /// The slot doesn't contain a valid queue mapping.
    #[default]
    Unmapped,
    /// The slot contains a valid queue mapping.
    Mapped,
    /// A queue is being mapped into this slot.
    MapInProgress,
    /// A queue is being unmapped from this slot.
    UnmapInProgress,
    /// A queue is being unmapped from this slot, and once the unmap
    /// completes the recorded pending mapping replaces it.
    UnmapInProgressPendingMap,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QidSlot {
    pub state: SlotState,
    pub qid: usize,
    pub priority: u8,
    pub pending_qid: usize,
    pub pending_priority: u8,
}

/// One load-balanced consumer-queue port of the device-wide table.
pub struct LdbPort {
    pub id: ResourceId,
    pub domain: Option<DomainId>,
    /// Class of service this port belongs to, fixed at device init.
    pub cos: usize,
    pub configured: bool,
    pub enabled: bool,
    pub hist_list_base: u32,
    pub hist_list_limit: u32,
    pub init_tkn_cnt: u32,
    pub num_mappings: u32,
    pub num_pending_removals: u32,
    pub qid_map: [QidSlot; MAX_QID_SLOTS],
}

impl LdbPort {
    pub fn new(phys: usize, cos: usize) -> Self {
        Self {
            id: ResourceId::new(phys),
            domain: None,
            cos,
            configured: false,
            enabled: false,
            hist_list_base: 0,
            hist_list_limit: 0,
            init_tkn_cnt: 0,
            num_mappings: 0,
            num_pending_removals: 0,
            qid_map: [QidSlot::default(); MAX_QID_SLOTS],
        }
    }

    /// First slot in `state`.
    pub fn find_slot(&self, state: SlotState) -> Option<usize> {
        self.qid_map.iter().position(|s| s.state == state)
    }

    /// First slot in `state` referencing `qid`.
    pub fn find_slot_queue(&self, state: SlotState, qid: usize) -> Option<usize> {
        self.qid_map
            .iter()
            .position(|s| s.state == state && s.qid == qid)
    }

    /// First slot whose *pending* mapping references `qid`.
    pub fn find_slot_pending_queue(&self, qid: usize) -> Option<usize> {
        self.qid_map.iter().position(|s| {
            s.state == SlotState::UnmapInProgressPendingMap && s.pending_qid == qid
        })
    }
}

const VALID_CQ_DEPTHS: [u32; 11] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];

fn cq_token_depth_select(cq_depth: u32) -> u32 {
    match cq_depth {
        0..=8 => 1,
        16 => 2,
        32 => 3,
        64 => 4,
        128 => 5,
        256 => 6,
        512 => 7,
        _ => 8,
    }
}

impl<M: Mmio> Hw<M> {
    /// Apply a slot state change and its counter side effects.
    ///
    /// `q` is the queue the transition concerns: the slot's current occupant
    /// for unmap steps, the incoming queue for map steps.
    pub(crate) fn slot_state_transition(
        &mut self,
        p: LdbPortId,
        q: LdbQueueId,
        slot: usize,
        new: SlotState,
    ) -> Result<()> {
        use SlotState::*;

        let cur = self.ldb_ports[p.0].qid_map[slot].state;
        let d = self.ldb_ports[p.0].domain.ok_or(Error::Internal)?;

        match (cur, new) {
            (Unmapped, Mapped) => {
                self.ldb_queues[q.0].num_mappings += 1;
                self.ldb_ports[p.0].num_mappings += 1;
            }
            (Unmapped, MapInProgress) => {
                self.ldb_queues[q.0].num_pending_additions += 1;
                self.domains[d.0].num_pending_additions += 1;
            }
            (Mapped, Unmapped) => {
                self.ldb_queues[q.0].num_mappings -= 1;
                self.ldb_ports[p.0].num_mappings -= 1;
            }
            (Mapped, UnmapInProgress) => {
                self.ldb_ports[p.0].num_pending_removals += 1;
                self.domains[d.0].num_pending_removals += 1;
            }
            // Priority change, nothing to update.
            (Mapped, Mapped) => {}
            (MapInProgress, Unmapped) => {
                self.ldb_queues[q.0].num_pending_additions -= 1;
                self.domains[d.0].num_pending_additions -= 1;
            }
            (MapInProgress, Mapped) => {
                self.ldb_queues[q.0].num_mappings += 1;
                self.ldb_ports[p.0].num_mappings += 1;
                self.ldb_queues[q.0].num_pending_additions -= 1;
                self.domains[d.0].num_pending_additions -= 1;
            }
            (UnmapInProgress, Unmapped) => {
                self.ldb_ports[p.0].num_pending_removals -= 1;
                self.domains[d.0].num_pending_removals -= 1;
                self.ldb_queues[q.0].num_mappings -= 1;
                self.ldb_ports[p.0].num_mappings -= 1;
            }
            // Aborted removal.
            (UnmapInProgress, Mapped) => {
                self.ldb_ports[p.0].num_pending_removals -= 1;
                self.domains[d.0].num_pending_removals -= 1;
            }
            (UnmapInProgress, UnmapInProgressPendingMap) => {}
            (UnmapInProgressPendingMap, UnmapInProgress) => {}
            // A pending-map slot briefly becomes unmapped before it
            // transitions to map-in-progress for the pending queue.
            (UnmapInProgressPendingMap, Unmapped) => {
                self.ldb_queues[q.0].num_mappings -= 1;
                self.ldb_ports[p.0].num_mappings -= 1;
                self.ldb_ports[p.0].num_pending_removals -= 1;
                self.domains[d.0].num_pending_removals -= 1;
            }
            (cur, new) => {
                error!(
                    "invalid queue {} -> port {} slot transition ({cur:?} -> {new:?})",
                    q.0, p.0
                );
                return Err(Error::Internal);
            }
        }

        self.ldb_ports[p.0].qid_map[slot].state = new;
        debug!(
            "queue {} -> port {} slot {slot} transition ({cur:?} -> {new:?})",
            q.0, p.0
        );
        Ok(())
    }

    pub(crate) fn ldb_port_cq_enable(&mut self, p: LdbPortId) {
        // Stays off while a removal is pending; the slot-completion path
        // re-arms the CQ once the removal finishes.
        if self.ldb_ports[p.0].num_pending_removals > 0 {
            return;
        }
        self.regs.write(regs::lsp_cq_ldb_dsbl(p), 0);
    }

    pub(crate) fn ldb_port_cq_disable(&mut self, p: LdbPortId) {
        self.regs.write(regs::lsp_cq_ldb_dsbl(p), 1);
    }

    pub(crate) fn dir_port_cq_enable(&mut self, p: DirId) {
        self.regs.write(regs::lsp_cq_dir_dsbl(p), 0);
    }

    pub(crate) fn dir_port_cq_disable(&mut self, p: DirId) {
        self.regs.write(regs::lsp_cq_dir_dsbl(p), 1);
    }

    fn verify_create_ldb_port_args(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &CreateLdbPortArgs,
        cq_base: u64,
    ) -> Result<DomainId> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let domain = &self.domains[d.0];

        if domain.started {
            return Err(Error::InvalidState);
        }

        let cos = args.cos_id as usize;
        if cos >= NUM_COS {
            return Err(Error::InvalidParam);
        }

        if args.cos_strict {
            if self.domain_avail_ldb_port(d, cos).is_none() {
                return Err(Error::Unavailable);
            }
        } else if (0..NUM_COS).all(|c| self.domain_avail_ldb_port(d, c).is_none()) {
            return Err(Error::Unavailable);
        }

        // The consumer queue must be cache-line aligned.
        if cq_base & 0x3f != 0 {
            return Err(Error::InvalidParam);
        }

        if !VALID_CQ_DEPTHS.contains(&args.cq_depth) {
            return Err(Error::InvalidParam);
        }

        if args.cq_history_list_size == 0 {
            return Err(Error::InvalidParam);
        }

        if args.cq_history_list_size > domain.avail_hist_list_entries {
            return Err(Error::Unavailable);
        }

        Ok(d)
    }

    /// Configure one of the domain's attached load-balanced ports,
    /// returning its caller-visible id.
    pub fn create_ldb_port(
        &mut self,
        owner: Owner,
        domain_id: u32,
        args: &CreateLdbPortArgs,
        cq_base: u64,
    ) -> Result<u32> {
        debug!("create ldb port {owner} domain={domain_id} {args:?} cq={cq_base:#x}");

        let d = self.verify_create_ldb_port_args(owner, domain_id, args, cq_base)?;

        let p = if args.cos_strict {
            self.domain_avail_ldb_port(d, args.cos_id as usize)
        } else {
            (0..NUM_COS).find_map(|i| {
                self.domain_avail_ldb_port(d, (args.cos_id as usize + i) % NUM_COS)
            })
        };
        let p = p.ok_or_else(|| {
            error!("no available ldb ports after verification");
            Error::Internal
        })?;

        self.configure_ldb_port(owner, d, p, args, cq_base);

        Ok(self.ldb_ports[p.0].id.api_id(owner))
    }

    fn configure_ldb_port(
        &mut self,
        owner: Owner,
        d: DomainId,
        p: LdbPortId,
        args: &CreateLdbPortArgs,
        cq_base: u64,
    ) {
        // Carve this port's slice out of the domain's history-list range.
        let domain = &mut self.domains[d.0];
        let base = domain.hist_list_entry_base + domain.hist_list_entry_offset;
        let limit = base + args.cq_history_list_size;
        domain.hist_list_entry_offset += args.cq_history_list_size;
        domain.avail_hist_list_entries -= args.cq_history_list_size;

        let port = &mut self.ldb_ports[p.0];
        port.hist_list_base = base;
        port.hist_list_limit = limit;

        // CQ buffer address, bits [63:6].
        self.regs
            .write(regs::sys_ldb_cq_addr_l(p), (cq_base >> 6) as u32);
        self.regs
            .write(regs::sys_ldb_cq_addr_u(p), (cq_base >> 32) as u32);

        let sel = cq_token_depth_select(args.cq_depth);
        self.regs.write(regs::lsp_cq_ldb_tkn_depth_sel(p), sel);

        // Depths below the hardware minimum of 8 are emulated with a
        // non-zero initial token count, which quiescing must subtract.
        let init = if args.cq_depth < 8 { 8 - args.cq_depth } else { 0 };
        self.ldb_ports[p.0].init_tkn_cnt = init;
        self.regs.write(regs::lsp_cq_ldb_tkn_cnt(p), init);

        self.regs.write(regs::chp_hist_list_lim(p), limit - 1);
        self.regs.write(regs::chp_hist_list_base(p), base);
        self.regs.write(regs::chp_hist_list_push_ptr(p), base);
        self.regs.write(regs::chp_hist_list_pop_ptr(p), base);

        // A CQ can owe at most its history-list size in completions.
        self.regs
            .write(regs::lsp_cq_ldb_infl_lim(p), args.cq_history_list_size);

        self.regs.write(regs::chp_ldb_cq2vas(p), d.0 as u32);

        // No valid slot mappings yet.
        self.regs
            .write(regs::lsp_cq2priov(p), Cq2Priov::new().into_bits());

        // Producer-port side.
        self.regs.write(regs::sys_ldb_pp2vas(p), d.0 as u32);
        if let Owner::Vdev(v) = owner {
            let virt = self.ldb_ports[p.0].id.virt;
            self.regs.write(regs::sys_vf_ldb_vpp2pp(v, virt), p.0 as u32);
            self.regs.write(regs::sys_ldb_pp2vdev(p), v.0 as u32);
            self.regs.write(regs::sys_vf_ldb_vpp_v(v, virt), 1);
        }
        self.regs.write(regs::sys_ldb_pp_v(p), 1);

        self.ldb_port_cq_enable(p);

        let port = &mut self.ldb_ports[p.0];
        port.qid_map = Default::default();
        port.num_mappings = 0;
        port.enabled = true;
        port.configured = true;
    }

    fn verify_create_dir_port_args(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &CreateDirPortArgs,
        cq_base: u64,
    ) -> Result<DomainId> {
        let d = self.domain_by_id(owner, domain_id as usize)?;

        if self.domains[d.0].started {
            return Err(Error::InvalidState);
        }

        match args.queue_id {
            Some(queue_id) => {
                let pair = self
                    .domain_used_dir_pq(owner, d, queue_id as usize)
                    .ok_or(Error::InvalidId)?;
                if !self.dir_pq[pair.0].queue_configured {
                    return Err(Error::InvalidId);
                }
            }
            None => {
                if self.domain_avail_dir_pq(d).is_none() {
                    return Err(Error::Unavailable);
                }
            }
        }

        if cq_base & 0x3f != 0 {
            return Err(Error::InvalidParam);
        }

        if !VALID_CQ_DEPTHS.contains(&args.cq_depth) {
            return Err(Error::InvalidParam);
        }

        Ok(d)
    }

    /// Configure the port half of a directed pair, returning its id.
    pub fn create_dir_port(
        &mut self,
        owner: Owner,
        domain_id: u32,
        args: &CreateDirPortArgs,
        cq_base: u64,
    ) -> Result<u32> {
        debug!("create dir port {owner} domain={domain_id} {args:?} cq={cq_base:#x}");

        let d = self.verify_create_dir_port_args(owner, domain_id, args, cq_base)?;

        let pair = match args.queue_id {
            Some(queue_id) => self.domain_used_dir_pq(owner, d, queue_id as usize),
            None => self.domain_avail_dir_pq(d),
        };
        let pair = pair.ok_or_else(|| {
            error!("no available dir ports after verification");
            Error::Internal
        })?;

        self.configure_dir_port(owner, d, pair, args, cq_base);

        Ok(self.dir_pq[pair.0].id.api_id(owner))
    }

    fn configure_dir_port(
        &mut self,
        owner: Owner,
        d: DomainId,
        p: DirId,
        args: &CreateDirPortArgs,
        cq_base: u64,
    ) {
        self.regs
            .write(regs::sys_dir_cq_addr_l(p), (cq_base >> 6) as u32);
        self.regs
            .write(regs::sys_dir_cq_addr_u(p), (cq_base >> 32) as u32);

        let sel = cq_token_depth_select(args.cq_depth);
        self.regs.write(regs::lsp_cq_dir_tkn_depth_sel(p), sel);

        self.regs.write(regs::chp_dir_cq2vas(p), d.0 as u32);

        self.regs.write(regs::sys_dir_pp2vas(p), d.0 as u32);
        if let Owner::Vdev(v) = owner {
            let virt = self.dir_pq[p.0].id.virt;
            self.regs.write(regs::sys_vf_dir_vpp2pp(v, virt), p.0 as u32);
            self.regs.write(regs::sys_dir_pp2vdev(p), v.0 as u32);
            self.regs.write(regs::sys_vf_dir_vpp_v(v, virt), 1);
        }
        self.regs.write(regs::sys_dir_pp_v(p), 1);

        self.dir_port_cq_enable(p);

        let pair = &mut self.dir_pq[p.0];
        pair.enabled = true;
        pair.port_configured = true;
    }

    /// Allow the scheduler to deliver to the port's consumer queue again.
    pub fn enable_ldb_port(&mut self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let p = self
            .domain_used_ldb_port(owner, d, port_id as usize)
            .ok_or(Error::InvalidId)?;

        if !self.ldb_ports[p.0].enabled {
            self.ldb_ports[p.0].enabled = true;
            self.ldb_port_cq_enable(p);
        }
        Ok(())
    }

    pub fn disable_ldb_port(&mut self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let p = self
            .domain_used_ldb_port(owner, d, port_id as usize)
            .ok_or(Error::InvalidId)?;

        if self.ldb_ports[p.0].enabled {
            self.ldb_ports[p.0].enabled = false;
            self.ldb_port_cq_disable(p);
        }
        Ok(())
    }

    pub fn enable_dir_port(&mut self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let p = self
            .domain_used_dir_pq(owner, d, port_id as usize)
            .ok_or(Error::InvalidId)?;
        if !self.dir_pq[p.0].port_configured {
            return Err(Error::InvalidId);
        }

        if !self.dir_pq[p.0].enabled {
            self.dir_pq[p.0].enabled = true;
            self.dir_port_cq_enable(p);
        }
        Ok(())
    }

    pub fn disable_dir_port(&mut self, owner: Owner, domain_id: u32, port_id: u32) -> Result<()> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let p = self
            .domain_used_dir_pq(owner, d, port_id as usize)
            .ok_or(Error::InvalidId)?;
        if !self.dir_pq[p.0].port_configured {
            return Err(Error::InvalidId);
        }

        if self.dir_pq[p.0].enabled {
            self.dir_pq[p.0].enabled = false;
            self.dir_port_cq_disable(p);
        }
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::regs::ShadowRegs;
    use crate::util::logging;
    use crate::{CreateDomainArgs, CreateLdbQueueArgs};

    fn hw_with_domain() -> (Hw<ShadowRegs>, u32) {
        logging();
        let mut hw = Hw::new(ShadowRegs::new());
        let args = CreateDomainArgs {
            num_ldb_queues: 1,
            num_ldb_ports: 2,
            num_hist_list_entries: 16,
            ..Default::default()
        };
        let d = hw.create_sched_domain(Owner::Pf, &args).unwrap();
        (hw, d)
    }

    #[test]
    fn port_argument_validation() {
        let (mut hw, d) = hw_with_domain();

        let good = CreateLdbPortArgs {
            cq_depth: 8,
            cq_history_list_size: 4,
            ..Default::default()
        };

        // Misaligned CQ base.
        assert_eq!(
            hw.create_ldb_port(Owner::Pf, d, &good, 0x20),
            Err(Error::InvalidParam)
        );
        // Depth must be a power of two in range.
        let bad = CreateLdbPortArgs {
            cq_depth: 24,
            ..good
        };
        assert_eq!(
            hw.create_ldb_port(Owner::Pf, d, &bad, 0x40),
            Err(Error::InvalidParam)
        );
        // A port needs at least one history-list entry.
        let bad = CreateLdbPortArgs {
            cq_history_list_size: 0,
            ..good
        };
        assert_eq!(
            hw.create_ldb_port(Owner::Pf, d, &bad, 0x40),
            Err(Error::InvalidParam)
        );
        // More than the domain reserved.
        let bad = CreateLdbPortArgs {
            cq_history_list_size: 17,
            ..good
        };
        assert_eq!(
            hw.create_ldb_port(Owner::Pf, d, &bad, 0x40),
            Err(Error::Unavailable)
        );
        let bad = CreateLdbPortArgs {
            cos_id: 4,
            ..good
        };
        assert_eq!(
            hw.create_ldb_port(Owner::Pf, d, &bad, 0x40),
            Err(Error::InvalidParam)
        );

        let id = hw.create_ldb_port(Owner::Pf, d, &good, 0x40).unwrap();
        let port = &hw.ldb_ports[id as usize];
        assert!(port.configured && port.enabled);
        assert_eq!(port.hist_list_limit - port.hist_list_base, 4);
    }

    #[test]
    fn hist_list_carved_in_creation_order() {
        let (mut hw, d) = hw_with_domain();

        let args = CreateLdbPortArgs {
            cq_depth: 8,
            cq_history_list_size: 6,
            ..Default::default()
        };
        let a = hw.create_ldb_port(Owner::Pf, d, &args, 0x40).unwrap();
        let b = hw.create_ldb_port(Owner::Pf, d, &args, 0x40).unwrap();

        let pa = &hw.ldb_ports[a as usize];
        let pb = &hw.ldb_ports[b as usize];
        assert_eq!(pa.hist_list_limit, pa.hist_list_base + 6);
        assert_eq!(pb.hist_list_base, pa.hist_list_limit);
        assert_eq!(hw.domains[d as usize].avail_hist_list_entries, 4);
    }

    #[test]
    fn invalid_transition_is_internal() {
        let (mut hw, d) = hw_with_domain();

        let args = CreateLdbPortArgs {
            cq_depth: 8,
            cq_history_list_size: 1,
            ..Default::default()
        };
        let p = hw.create_ldb_port(Owner::Pf, d, &args, 0x40).unwrap();
        let q = hw
            .create_ldb_queue(Owner::Pf, d, &CreateLdbQueueArgs::default())
            .unwrap();
        let (p, q) = (LdbPortId(p as usize), LdbQueueId(q as usize));

        // Unmapped -> UnmapInProgress is not a legal step.
        assert_eq!(
            hw.slot_state_transition(p, q, 0, SlotState::UnmapInProgress),
            Err(Error::Internal)
        );
        assert_eq!(hw.ldb_ports[p.0].qid_map[0].state, SlotState::Unmapped);

        hw.slot_state_transition(p, q, 0, SlotState::Mapped).unwrap();
        assert_eq!(
            hw.slot_state_transition(p, q, 0, SlotState::MapInProgress),
            Err(Error::Internal)
        );
    }

    #[test]
    fn cq_enable_respects_pending_removals() {
        let (mut hw, d) = hw_with_domain();

        let args = CreateLdbPortArgs {
            cq_depth: 8,
            cq_history_list_size: 1,
            ..Default::default()
        };
        let id = hw.create_ldb_port(Owner::Pf, d, &args, 0x40).unwrap();
        let p = LdbPortId(id as usize);

        hw.ldb_port_cq_disable(p);
        assert_eq!(hw.regs.read(regs::lsp_cq_ldb_dsbl(p)), 1);

        // A pending removal keeps the CQ off.
        hw.ldb_ports[p.0].num_pending_removals = 1;
        hw.ldb_port_cq_enable(p);
        assert_eq!(hw.regs.read(regs::lsp_cq_ldb_dsbl(p)), 1);

        hw.ldb_ports[p.0].num_pending_removals = 0;
        hw.ldb_port_cq_enable(p);
        assert_eq!(hw.regs.read(regs::lsp_cq_ldb_dsbl(p)), 0);
    }
}
