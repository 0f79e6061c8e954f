//! Queue→port mapping procedures.
//!
//! Before a domain starts, attaching a queue to a port is a plain register
//! update ("static" mapping). Once traffic is flowing the tables cannot be
//! rewritten atomically, so the "dynamic" procedures first starve the queue
//! (inflight limit 0), wait for its outstanding completions to land, and
//! only then update the tables with the affected consumer queues disabled.
//! A procedure that cannot finish right away parks in the slot state
//! machine and is retried by the drain worker.
//!
//! The inflight-count reads are re-validated after disabling the dependent
//! consumer queues: a completion may land between the first read of zero and
//! the disable, and only the second read closes that window.

use log::{debug, error};

use crate::device::Hw;
use crate::ids::{DomainId, LdbPortId, LdbQueueId, Owner};
use crate::port::SlotState;
use crate::regs::{self, Cq2Priov, Cq2Qid, Mmio, Qid2CqIdx, SchedCtrl};
use crate::{
    Completion, Error, MapQidArgs, Result, UnmapQidArgs, MAX_QID_SLOTS, QID_PRIORITIES,
};

impl<M: Mmio> Hw<M> {
    // Scheduler-control helpers. The has-work bits tell the scheduler a
    // (CQ, slot) pair has backlog; the inflight-ok bit gates scheduling.

    fn ldb_port_set_has_work_bits(&mut self, p: LdbPortId, q: LdbQueueId, slot: usize) {
        let atm_active = self.regs.read(regs::lsp_qid_aqed_active_cnt(q));
        let ctrl = SchedCtrl::new()
            .with_cq(p.0 as u8)
            .with_qidix(slot as u8)
            .with_value(true)
            .with_rlist_haswork_v(atm_active > 0);
        self.regs.write(regs::lsp_ldb_sched_ctrl(), ctrl.into_bits());

        let enqueued = self.regs.read(regs::lsp_qid_ldb_enqueue_cnt(q));
        let ctrl = SchedCtrl::new()
            .with_cq(p.0 as u8)
            .with_qidix(slot as u8)
            .with_value(true)
            .with_nalb_haswork_v(enqueued > 0);
        self.regs.write(regs::lsp_ldb_sched_ctrl(), ctrl.into_bits());
    }

    fn ldb_port_clear_has_work_bits(&mut self, p: LdbPortId, slot: usize) {
        let ctrl = SchedCtrl::new()
            .with_cq(p.0 as u8)
            .with_qidix(slot as u8)
            .with_value(false)
            .with_rlist_haswork_v(true);
        self.regs.write(regs::lsp_ldb_sched_ctrl(), ctrl.into_bits());

        let ctrl = SchedCtrl::new()
            .with_cq(p.0 as u8)
            .with_qidix(slot as u8)
            .with_value(false)
            .with_nalb_haswork_v(true);
        self.regs.write(regs::lsp_ldb_sched_ctrl(), ctrl.into_bits());
    }

    fn ldb_port_set_queue_if_status(&mut self, p: LdbPortId, slot: usize) {
        let ctrl = SchedCtrl::new()
            .with_cq(p.0 as u8)
            .with_qidix(slot as u8)
            .with_value(true)
            .with_inflight_ok_v(true);
        self.regs.write(regs::lsp_ldb_sched_ctrl(), ctrl.into_bits());
    }

    fn ldb_port_clear_queue_if_status(&mut self, p: LdbPortId, slot: usize) {
        let ctrl = SchedCtrl::new()
            .with_cq(p.0 as u8)
            .with_qidix(slot as u8)
            .with_value(false)
            .with_inflight_ok_v(true);
        self.regs.write(regs::lsp_ldb_sched_ctrl(), ctrl.into_bits());
    }

    /// Disable every enabled CQ currently mapped to `q`. Only the dynamic
    /// mapping code may call this; the ports' `enabled` flags are not
    /// changed, so the matching enable below restores the status quo.
    fn ldb_queue_disable_mapped_cqs(&mut self, d: DomainId, q: LdbQueueId) {
        for p in self.domain_used_ldb_port_ids(d) {
            let port = &self.ldb_ports[p.0];
            if port.find_slot_queue(SlotState::Mapped, q.0).is_some() && port.enabled {
                self.ldb_port_cq_disable(p);
            }
        }
    }

    fn ldb_queue_enable_mapped_cqs(&mut self, d: DomainId, q: LdbQueueId) {
        for p in self.domain_used_ldb_port_ids(d) {
            let port = &self.ldb_ports[p.0];
            if port.find_slot_queue(SlotState::Mapped, q.0).is_some() && port.enabled {
                self.ldb_port_cq_enable(p);
            }
        }
    }

    /// Program the slot tables for a (port, queue, priority) mapping and
    /// mark the slot mapped. Safe only while no traffic can flow: before
    /// the domain starts, or from the dynamic path with the CQs quiesced.
    pub(crate) fn ldb_port_map_qid_static(
        &mut self,
        p: LdbPortId,
        q: LdbQueueId,
        priority: u8,
    ) -> Result<()> {
        let port = &self.ldb_ports[p.0];
        let slot = port
            .find_slot_queue(SlotState::MapInProgress, q.0)
            .or_else(|| port.find_slot_queue(SlotState::Mapped, q.0))
            .or_else(|| port.find_slot(SlotState::Unmapped))
            .ok_or_else(|| {
                error!("port {} has no available mapping slots", p.0);
                Error::Internal
            })?;

        // Priority and validity bits.
        let mut priov = Cq2Priov::from_bits(self.regs.read(regs::lsp_cq2priov(p)));
        priov.set_v(priov.v() | 1 << slot);
        priov.set_prio(priov.prio() | ((priority as u32 & 0x7) << (slot * 3)));
        self.regs.write(regs::lsp_cq2priov(p), priov.into_bits());

        // Slot → queue id.
        let half = slot / 4;
        let mut cq2qid = Cq2Qid::from_bits(self.regs.read(regs::lsp_cq2qid(p, half)));
        cq2qid.set_slot(slot % 4, q.0 as u8);
        self.regs.write(regs::lsp_cq2qid(p, half), cq2qid.into_bits());

        // Queue → (port, slot) inverse maps.
        let group = p.0 / 4;
        for addr in [
            regs::aqed_qid2cqidix(q, group),
            regs::lsp_qid2cqidix(q, group),
            regs::lsp_qid2cqidix2(q, group),
        ] {
            let mut ix = Qid2CqIdx::from_bits(self.regs.read(addr));
            let bits = ix.port_bits(p.0 % 4) | 1 << slot;
            ix.set_port_bits(p.0 % 4, bits);
            self.regs.write(addr, ix.into_bits());
        }

        let map = &mut self.ldb_ports[p.0].qid_map[slot];
        map.qid = q.0;
        map.priority = priority;

        self.slot_state_transition(p, q, slot, SlotState::Mapped)
    }

    /// Clear the slot tables for the mapping of `q` on `p` and mark the
    /// slot unmapped, completing whichever removal phase it was in.
    pub(crate) fn ldb_port_unmap_qid(&mut self, p: LdbPortId, q: LdbQueueId) -> Result<()> {
        let port = &self.ldb_ports[p.0];
        let slot = port
            .find_slot_queue(SlotState::Mapped, q.0)
            .or_else(|| port.find_slot_queue(SlotState::UnmapInProgress, q.0))
            .or_else(|| port.find_slot_queue(SlotState::UnmapInProgressPendingMap, q.0))
            .ok_or_else(|| {
                error!("queue {} is not mapped on port {}", q.0, p.0);
                Error::Internal
            })?;

        let mut priov = Cq2Priov::from_bits(self.regs.read(regs::lsp_cq2priov(p)));
        priov.set_v(priov.v() & !(1 << slot));
        self.regs.write(regs::lsp_cq2priov(p), priov.into_bits());

        let group = p.0 / 4;
        for addr in [
            regs::aqed_qid2cqidix(q, group),
            regs::lsp_qid2cqidix(q, group),
            regs::lsp_qid2cqidix2(q, group),
        ] {
            let mut ix = Qid2CqIdx::from_bits(self.regs.read(addr));
            let bits = ix.port_bits(p.0 % 4) & !(1 << slot);
            ix.set_port_bits(p.0 % 4, bits);
            self.regs.write(addr, ix.into_bits());
        }

        self.slot_state_transition(p, q, slot, SlotState::Unmapped)
    }

    /// Rewrite the priority field of an established slot.
    fn ldb_port_change_qid_priority(&mut self, p: LdbPortId, slot: usize, priority: u8) {
        let mut priov = Cq2Priov::from_bits(self.regs.read(regs::lsp_cq2priov(p)));
        priov.set_v(priov.v() | 1 << slot);
        priov.set_prio(priov.prio() | ((priority as u32 & 0x7) << (slot * 3)));
        self.regs.write(regs::lsp_cq2priov(p), priov.into_bits());

        self.ldb_ports[p.0].qid_map[slot].priority = priority;
    }

    /// Second half of a dynamic mapping, entered once the queue's inflight
    /// count has been observed at zero with the dependent CQs disabled.
    fn ldb_port_finish_map_qid_dynamic(
        &mut self,
        d: DomainId,
        p: LdbPortId,
        q: LdbQueueId,
    ) -> Result<()> {
        if self.regs.read(regs::lsp_qid_ldb_infl_cnt(q)) != 0 {
            error!("non-zero inflight count for queue {}", q.0);
            return Err(Error::Internal);
        }

        let slot = self.ldb_ports[p.0]
            .find_slot_queue(SlotState::MapInProgress, q.0)
            .ok_or_else(|| {
                error!("no in-progress mapping of queue {} on port {}", q.0, p.0);
                Error::Internal
            })?;

        let priority = self.ldb_ports[p.0].qid_map[slot].priority;

        self.ldb_port_map_qid_static(p, q, priority)?;

        self.ldb_port_set_has_work_bits(p, q, slot);

        // Keep IF_status clear until the port is re-enabled, so a spurious
        // schedule cannot bump the queue's inflight count.
        self.ldb_port_clear_queue_if_status(p, slot);

        for other in self.domain_used_ldb_port_ids(d) {
            if let Some(s) = self.ldb_ports[other.0].find_slot_queue(SlotState::Mapped, q.0) {
                self.ldb_port_set_queue_if_status(other, s);
            }
        }

        self.ldb_queue_set_inflight_limit(q);

        self.ldb_queue_enable_mapped_cqs(d, q);

        // More additions pending means the queue must stay unthrottled.
        if self.ldb_queues[q.0].num_pending_additions > 0 {
            self.ldb_queue_clear_inflight_limit(q);
        }

        Ok(())
    }

    /// Start a dynamic mapping. Returns [`Completion::Deferred`] if the
    /// queue still owes completions and the drain worker has to finish the
    /// procedure.
    pub(crate) fn ldb_port_map_qid_dynamic(
        &mut self,
        p: LdbPortId,
        q: LdbQueueId,
        priority: u8,
    ) -> Result<Completion> {
        let d = self.ldb_ports[p.0].domain.ok_or_else(|| {
            error!("port {} belongs to no domain", p.0);
            Error::Internal
        })?;

        // Stop new work from being scheduled to the queue.
        self.regs.write(regs::lsp_qid_ldb_infl_lim(q), 0);

        let slot = self.ldb_ports[p.0]
            .find_slot(SlotState::Unmapped)
            .ok_or_else(|| {
                error!("port {} has no unmapped slots", p.0);
                Error::Internal
            })?;

        let map = &mut self.ldb_ports[p.0].qid_map[slot];
        map.qid = q.0;
        map.priority = priority;

        self.slot_state_transition(p, q, slot, SlotState::MapInProgress)?;

        if self.regs.read(regs::lsp_qid_ldb_infl_cnt(q)) != 0 {
            // The queue is owed completions; the mapping cannot proceed
            // until software has drained them.
            return Ok(Completion::Deferred);
        }

        // Disable this CQ and every CQ already mapped to the queue, then
        // re-read the count to close the scheduling race.
        if self.ldb_ports[p.0].enabled {
            self.ldb_port_cq_disable(p);
        }
        self.ldb_queue_disable_mapped_cqs(d, q);

        if self.regs.read(regs::lsp_qid_ldb_infl_cnt(q)) != 0 {
            if self.ldb_ports[p.0].enabled {
                self.ldb_port_cq_enable(p);
            }
            self.ldb_queue_enable_mapped_cqs(d, q);
            return Ok(Completion::Deferred);
        }

        self.ldb_port_finish_map_qid_dynamic(d, p, q)?;
        Ok(Completion::Immediate)
    }

    fn ldb_port_map_qid(
        &mut self,
        d: DomainId,
        p: LdbPortId,
        q: LdbQueueId,
        priority: u8,
    ) -> Result<Completion> {
        if self.domains[d.0].started {
            self.ldb_port_map_qid_dynamic(p, q, priority)
        } else {
            self.ldb_port_map_qid_static(p, q, priority)?;
            Ok(Completion::Immediate)
        }
    }

    /// Finish the removal parked in `slot`, then start any mapping that was
    /// pending on it.
    fn domain_finish_unmap_port_slot(
        &mut self,
        d: DomainId,
        p: LdbPortId,
        slot: usize,
    ) -> Result<()> {
        let map = self.ldb_ports[p.0].qid_map[slot];
        let q = LdbQueueId(map.qid);
        let state = map.state;

        self.ldb_port_unmap_qid(p, q)?;

        // Make sure the queue is no longer serviced by this (CQ, slot).
        self.ldb_port_clear_has_work_bits(p, slot);

        self.ldb_port_set_queue_if_status(p, slot);

        if self.ldb_ports[p.0].enabled {
            self.ldb_port_cq_enable(p);
        }

        if state == SlotState::UnmapInProgressPendingMap {
            let map = &mut self.ldb_ports[p.0].qid_map[slot];
            map.qid = map.pending_qid;
            map.priority = map.pending_priority;

            let queue = LdbQueueId(map.qid);
            let priority = map.priority;
            self.ldb_port_map_qid(d, p, queue, priority)?;
        }

        Ok(())
    }

    /// Attempt to finish all of the port's pending removals. Returns whether
    /// any progress was possible (the CQ's inflight count must be zero).
    pub(crate) fn domain_finish_unmap_port(&mut self, d: DomainId, p: LdbPortId) -> Result<bool> {
        if self.ldb_ports[p.0].num_pending_removals == 0 {
            return Ok(false);
        }

        // The unmap requires all the CQ's outstanding inflights to be
        // completed.
        if self.ldb_cq_inflight_count(p) > 0 {
            return Ok(false);
        }

        for slot in 0..MAX_QID_SLOTS {
            let state = self.ldb_ports[p.0].qid_map[slot].state;
            if state != SlotState::UnmapInProgress
                && state != SlotState::UnmapInProgressPendingMap
            {
                continue;
            }
            self.domain_finish_unmap_port_slot(d, p, slot)?;
        }

        Ok(true)
    }

    /// One pass over the domain's pending removals; returns how many remain.
    pub(crate) fn domain_finish_unmap_procedures(&mut self, d: DomainId) -> u32 {
        if !self.domains[d.0].configured || self.domains[d.0].num_pending_removals == 0 {
            return 0;
        }

        for p in self.domain_used_ldb_port_ids(d) {
            if let Err(e) = self.domain_finish_unmap_port(d, p) {
                error!("finishing unmaps of port {} failed: {e:?}", p.0);
            }
        }

        self.domains[d.0].num_pending_removals
    }

    fn domain_finish_map_port(&mut self, d: DomainId, p: LdbPortId) {
        for slot in 0..MAX_QID_SLOTS {
            if self.ldb_ports[p.0].qid_map[slot].state != SlotState::MapInProgress {
                continue;
            }
            let q = LdbQueueId(self.ldb_ports[p.0].qid_map[slot].qid);

            if self.regs.read(regs::lsp_qid_ldb_infl_cnt(q)) != 0 {
                continue;
            }

            // Same double-read pattern as the initial dynamic attempt.
            if self.ldb_ports[p.0].enabled {
                self.ldb_port_cq_disable(p);
            }
            self.ldb_queue_disable_mapped_cqs(d, q);

            if self.regs.read(regs::lsp_qid_ldb_infl_cnt(q)) != 0 {
                if self.ldb_ports[p.0].enabled {
                    self.ldb_port_cq_enable(p);
                }
                self.ldb_queue_enable_mapped_cqs(d, q);
                continue;
            }

            if let Err(e) = self.ldb_port_finish_map_qid_dynamic(d, p, q) {
                error!("finishing map on port {} slot {slot} failed: {e:?}", p.0);
            }
        }
    }

    /// One pass over the domain's pending additions; returns how many remain.
    pub(crate) fn domain_finish_map_procedures(&mut self, d: DomainId) -> u32 {
        if !self.domains[d.0].configured || self.domains[d.0].num_pending_additions == 0 {
            return 0;
        }

        for p in self.domain_used_ldb_port_ids(d) {
            self.domain_finish_map_port(d, p);
        }

        self.domains[d.0].num_pending_additions
    }

    /// Device-wide unmap pass, domain by domain; returns the number of
    /// procedures still pending.
    pub(crate) fn finish_unmap_qid_procedures(&mut self) -> u32 {
        (0..self.domains.len())
            .map(|i| self.domain_finish_unmap_procedures(DomainId(i)))
            .sum()
    }

    pub(crate) fn finish_map_qid_procedures(&mut self) -> u32 {
        (0..self.domains.len())
            .map(|i| self.domain_finish_map_procedures(DomainId(i)))
            .sum()
    }

    fn verify_map_qid_args(
        &self,
        owner: Owner,
        domain_id: u32,
        args: &MapQidArgs,
    ) -> Result<(DomainId, LdbPortId, LdbQueueId)> {
        let d = self.domain_by_id(owner, domain_id as usize)?;

        let p = self
            .domain_used_ldb_port(owner, d, args.port_id as usize)
            .ok_or(Error::InvalidId)?;

        if args.priority >= QID_PRIORITIES {
            return Err(Error::InvalidParam);
        }

        let q = self
            .domain_ldb_queue(owner, d, args.qid as usize)
            .ok_or(Error::InvalidId)?;

        Ok((d, p, q))
    }

    /// A slot is available if one is unused, reclaimable, or the request is
    /// really an update of an existing relationship with this queue.
    fn verify_map_qid_slot_available(&self, p: LdbPortId, q: LdbQueueId) -> Result<()> {
        let port = &self.ldb_ports[p.0];

        if (port.num_mappings as usize) < MAX_QID_SLOTS {
            return Ok(());
        }

        if port.find_slot_queue(SlotState::Mapped, q.0).is_some()
            || port.find_slot_queue(SlotState::MapInProgress, q.0).is_some()
            || port.find_slot_pending_queue(q.0).is_some()
        {
            return Ok(());
        }

        // An in-progress unmap counts as reclaimable.
        if port.find_slot(SlotState::UnmapInProgress).is_some() {
            return Ok(());
        }

        if port.find_slot(SlotState::Unmapped).is_some() {
            return Ok(());
        }

        Err(Error::NoSlots)
    }

    /// Map a load-balanced queue to a port at the given priority.
    pub fn map_qid(&mut self, owner: Owner, domain_id: u32, args: &MapQidArgs) -> Result<Completion> {
        debug!("map qid {owner} domain={domain_id} {args:?}");

        let (d, p, q) = self.verify_map_qid_args(owner, domain_id, args)?;
        let priority = args.priority;

        // Outstanding detaches may be what frees up a slot for this request.
        if self.ldb_ports[p.0].num_pending_removals > 0 {
            self.domain_finish_unmap_port(d, p)?;
        }

        self.verify_map_qid_slot_available(p, q)?;

        // The hardware requires the CQ to be disabled around slot updates.
        if self.ldb_ports[p.0].enabled {
            self.ldb_port_cq_disable(p);
        }

        let ret = self.map_qid_update(d, p, q, priority);

        if self.ldb_ports[p.0].enabled {
            self.ldb_port_cq_enable(p);
        }

        ret
    }

    fn map_qid_update(
        &mut self,
        d: DomainId,
        p: LdbPortId,
        q: LdbQueueId,
        priority: u8,
    ) -> Result<Completion> {
        let port = &self.ldb_ports[p.0];

        // Already mapped: at most a priority change.
        if let Some(slot) = port.find_slot_queue(SlotState::Mapped, q.0) {
            if priority != self.ldb_ports[p.0].qid_map[slot].priority {
                self.ldb_port_change_qid_priority(p, slot, priority);
                debug!("map: priority change");
            }
            self.slot_state_transition(p, q, slot, SlotState::Mapped)?;
            return Ok(Completion::Immediate);
        }

        // Draining out: abort the removal and keep the mapping.
        if let Some(slot) = port.find_slot_queue(SlotState::UnmapInProgress, q.0) {
            if priority != self.ldb_ports[p.0].qid_map[slot].priority {
                self.ldb_port_change_qid_priority(p, slot, priority);
                debug!("map: priority change");
            }
            self.slot_state_transition(p, q, slot, SlotState::Mapped)?;
            return Ok(Completion::Immediate);
        }

        // Addition still in flight: the register write happens when it
        // completes.
        if let Some(slot) = port.find_slot_queue(SlotState::MapInProgress, q.0) {
            self.ldb_ports[p.0].qid_map[slot].priority = priority;
            debug!("map: priority change only");
            return Ok(Completion::Immediate);
        }

        if let Some(slot) = port.find_slot_pending_queue(q.0) {
            self.ldb_ports[p.0].qid_map[slot].pending_priority = priority;
            debug!("map: priority change only");
            return Ok(Completion::Immediate);
        }

        // All slots in use: park the request on a draining slot. It is
        // promoted as soon as the current occupant's removal completes.
        if self.ldb_ports[p.0].find_slot(SlotState::Unmapped).is_none() {
            if let Some(slot) = self.ldb_ports[p.0].find_slot(SlotState::UnmapInProgress) {
                let map = &mut self.ldb_ports[p.0].qid_map[slot];
                map.pending_qid = q.0;
                map.pending_priority = priority;

                self.slot_state_transition(
                    p,
                    q,
                    slot,
                    SlotState::UnmapInProgressPendingMap,
                )?;
                debug!("map: map pending removal");
                return Ok(Completion::Deferred);
            }
        }

        self.ldb_port_map_qid(d, p, q, priority)
    }

    /// Detach a queue from a port. Returns [`Completion::Deferred`] while
    /// the port still owes completions against the old mapping.
    pub fn unmap_qid(
        &mut self,
        owner: Owner,
        domain_id: u32,
        args: &UnmapQidArgs,
    ) -> Result<Completion> {
        debug!("unmap qid {owner} domain={domain_id} {args:?}");

        let d = self.domain_by_id(owner, domain_id as usize)?;
        let p = self
            .domain_used_ldb_port(owner, d, args.port_id as usize)
            .ok_or(Error::InvalidId)?;
        let q = self
            .domain_ldb_queue(owner, d, args.qid as usize)
            .ok_or(Error::InvalidId)?;

        // Not yet mapped: abort the in-flight addition.
        if let Some(slot) = self.ldb_ports[p.0].find_slot_queue(SlotState::MapInProgress, q.0) {
            if self.ldb_queues[q.0].num_pending_additions == 0 {
                self.ldb_queue_set_inflight_limit(q);
            }
            self.slot_state_transition(p, q, slot, SlotState::Unmapped)?;
            return Ok(Completion::Immediate);
        }

        // On hold behind an unmap: just drop the pending mapping.
        if let Some(slot) = self.ldb_ports[p.0].find_slot_pending_queue(q.0) {
            self.slot_state_transition(p, q, slot, SlotState::UnmapInProgress)?;
            return Ok(Completion::Immediate);
        }

        let slot = self.ldb_ports[p.0]
            .find_slot_queue(SlotState::Mapped, q.0)
            .ok_or(Error::InvalidId)?;

        // Removal is asynchronous: stop scheduling to the CQ, mark the slot,
        // and try to finish right away in case nothing is outstanding.
        self.ldb_port_cq_disable(p);

        self.slot_state_transition(p, q, slot, SlotState::UnmapInProgress)?;

        let complete = self.domain_finish_unmap_port(d, p)?;
        if complete {
            Ok(Completion::Immediate)
        } else {
            Ok(Completion::Deferred)
        }
    }

    /// Number of unmap procedures still in progress on the port.
    pub fn pending_port_unmaps(&self, owner: Owner, domain_id: u32, port_id: u32) -> Result<u32> {
        let d = self.domain_by_id(owner, domain_id as usize)?;
        let p = self
            .domain_used_ldb_port(owner, d, port_id as usize)
            .ok_or(Error::InvalidId)?;
        Ok(self.ldb_ports[p.0].num_pending_removals)
    }
}
