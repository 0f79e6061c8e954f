//! Scheduling domains: creation, start, and software-state reset.
//!
//! A domain checks a bundle of queues, ports, and budgets out of its owner's
//! pool. Creation verifies the whole request against the pool without
//! mutating anything, then attaches resource by resource; the domain's own
//! holdings are split into available (attached, unconfigured) and in-use
//! (configured) sub-pools via the arena records. Start flips the queues'
//! write-permission bits and freezes the structural configuration. Reset is
//! driven from [`Hw::reset_domain`]; the software half lives here.

use log::{debug, error, info};

use crate::device::Hw;
use crate::ids::{DomainId, LdbPortId, Owner, ResourceId};
use crate::pool::FnResources;
use crate::regs::{self, Mmio};
use crate::{CreateDomainArgs, Error, Result, MAX_LDB_PORTS, MAX_VDEVS, NUM_COS};

/// One scheduling domain of the device-wide table.
pub struct Domain {
    pub id: ResourceId,
    /// The pool this domain was created from and resets back into.
    pub owner: Owner,
    pub total_hist_list_entries: u32,
    pub avail_hist_list_entries: u32,
    pub hist_list_entry_base: u32,
    pub hist_list_entry_offset: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
    pub num_avail_aqed_entries: u32,
    pub num_used_aqed_entries: u32,
    pub num_pending_removals: u32,
    pub num_pending_additions: u32,
    pub configured: bool,
    pub started: bool,
}

impl Domain {
    pub fn new(phys: usize) -> Self {
        Self {
            id: ResourceId::new(phys),
            owner: Owner::Pf,
            total_hist_list_entries: 0,
            avail_hist_list_entries: 0,
            hist_list_entry_base: 0,
            hist_list_entry_offset: 0,
            num_ldb_credits: 0,
            num_dir_credits: 0,
            num_avail_aqed_entries: 0,
            num_used_aqed_entries: 0,
            num_pending_removals: 0,
            num_pending_additions: 0,
            configured: false,
            started: false,
        }
    }
}

impl<M: Mmio> Hw<M> {
    fn verify_create_sched_domain_args(
        &self,
        pool: &FnResources,
        args: &CreateDomainArgs,
    ) -> Result<()> {
        let req_ldb_ports: u32 =
            args.num_cos_ldb_ports.iter().sum::<u32>() + args.num_ldb_ports;

        if pool.avail_domains.is_empty() {
            return Err(Error::Unavailable);
        }
        if (pool.avail_ldb_queues.len() as u32) < args.num_ldb_queues {
            return Err(Error::Unavailable);
        }
        if req_ldb_ports as usize > pool.num_avail_ldb_ports() {
            return Err(Error::Unavailable);
        }
        if args.cos_strict {
            for cos in 0..NUM_COS {
                if args.num_cos_ldb_ports[cos] as usize > pool.avail_ldb_ports[cos].len() {
                    return Err(Error::Unavailable);
                }
            }
        }
        if args.num_ldb_queues > 0 && req_ldb_ports == 0 {
            // Load-balanced queues are unreachable without at least one port.
            return Err(Error::InvalidParam);
        }
        if (pool.avail_dir_pq.len() as u32) < args.num_dir_ports {
            return Err(Error::Unavailable);
        }
        if pool.avail_ldb_credits < args.num_ldb_credits {
            return Err(Error::Unavailable);
        }
        if pool.avail_dir_credits < args.num_dir_credits {
            return Err(Error::Unavailable);
        }
        if pool.avail_atm_inflights < args.num_atomic_inflights {
            return Err(Error::Unavailable);
        }
        if (pool.avail_hist_list.longest_set_range() as u32) < args.num_hist_list_entries {
            return Err(Error::Unavailable);
        }

        Ok(())
    }

    /// Create and configure a scheduling domain from the owner's pool,
    /// returning its caller-visible id.
    pub fn create_sched_domain(&mut self, owner: Owner, args: &CreateDomainArgs) -> Result<u32> {
        if let Owner::Vdev(v) = owner {
            if v.0 >= MAX_VDEVS {
                return Err(Error::InvalidParam);
            }
        }

        debug!("create sched domain {owner} {args:?}");

        // Verify the full request first so no unwinding is ever needed.
        self.verify_create_sched_domain_args(self.pool(owner), args)?;

        let d = *self.pool(owner).avail_domains.first().ok_or_else(|| {
            error!("no available domains after verification");
            Error::Internal
        })?;

        if self.domains[d.0].configured {
            error!("available domain {} is already configured", d.0);
            return Err(Error::Internal);
        }

        // The pool is detached while resources move into the domain, since
        // both sides are fields of this `Hw`.
        let mut pool = std::mem::take(self.pool_mut(owner));
        let ret = self.attach_domain_resources(&mut pool, d, args);
        if ret.is_ok() {
            pool.avail_domains.retain(|&x| x != d);
        }
        *self.pool_mut(owner) = pool;
        ret?;

        let domain = &mut self.domains[d.0];
        domain.owner = owner;
        info!("created domain {} for {owner}", d.0);
        Ok(domain.id.api_id(owner))
    }

    fn attach_domain_resources(
        &mut self,
        pool: &mut FnResources,
        d: DomainId,
        args: &CreateDomainArgs,
    ) -> Result<()> {
        self.attach_ldb_queues(pool, d, args.num_ldb_queues)?;
        self.attach_ldb_ports(pool, d, args)?;
        self.attach_dir_ports(pool, d, args.num_dir_ports)?;

        let domain = &mut self.domains[d.0];

        if pool.avail_ldb_credits < args.num_ldb_credits {
            return Err(Error::Unavailable);
        }
        pool.avail_ldb_credits -= args.num_ldb_credits;
        domain.num_ldb_credits += args.num_ldb_credits;

        if pool.avail_dir_credits < args.num_dir_credits {
            return Err(Error::Unavailable);
        }
        pool.avail_dir_credits -= args.num_dir_credits;
        domain.num_dir_credits += args.num_dir_credits;

        if args.num_hist_list_entries > 0 {
            let base = pool
                .avail_hist_list
                .find_set_bit_range(args.num_hist_list_entries as usize)
                .map_err(|_| Error::Unavailable)?;
            domain.total_hist_list_entries = args.num_hist_list_entries;
            domain.avail_hist_list_entries = args.num_hist_list_entries;
            domain.hist_list_entry_base = base as u32;
            domain.hist_list_entry_offset = 0;
            pool.avail_hist_list
                .clear_range(base, args.num_hist_list_entries as usize)?;
        }

        if pool.avail_atm_inflights < args.num_atomic_inflights {
            return Err(Error::Unavailable);
        }
        pool.avail_atm_inflights -= args.num_atomic_inflights;
        let domain = &mut self.domains[d.0];
        domain.num_avail_aqed_entries += args.num_atomic_inflights;

        self.regs
            .write(regs::chp_cfg_ldb_vas_crd(d), args.num_ldb_credits);
        self.regs
            .write(regs::chp_cfg_dir_vas_crd(d), args.num_dir_credits);

        let domain = &mut self.domains[d.0];
        domain.configured = true;
        domain.started = false;

        Ok(())
    }

    fn attach_ldb_queues(&mut self, pool: &mut FnResources, d: DomainId, num: u32) -> Result<()> {
        if (pool.avail_ldb_queues.len() as u32) < num {
            return Err(Error::Unavailable);
        }
        for q in pool.avail_ldb_queues.drain(..num as usize) {
            self.ldb_queues[q.0].domain = Some(d);
        }
        Ok(())
    }

    fn attach_dir_ports(&mut self, pool: &mut FnResources, d: DomainId, num: u32) -> Result<()> {
        if (pool.avail_dir_pq.len() as u32) < num {
            return Err(Error::Unavailable);
        }
        for p in pool.avail_dir_pq.drain(..num as usize) {
            self.dir_pq[p.0].domain = Some(d);
        }
        Ok(())
    }

    fn attach_ldb_ports_cos(
        &mut self,
        pool: &mut FnResources,
        d: DomainId,
        num: u32,
        cos: usize,
    ) -> Result<()> {
        if (pool.avail_ldb_ports[cos].len() as u32) < num {
            return Err(Error::Unavailable);
        }
        for _ in 0..num {
            let p = self.next_ldb_port(&pool.avail_ldb_ports[cos], d).ok_or_else(|| {
                error!("no available ldb ports after validation");
                Error::Internal
            })?;
            pool.avail_ldb_ports[cos].retain(|&x| x != p);
            self.ldb_ports[p.0].domain = Some(d);
        }
        Ok(())
    }

    fn attach_ldb_ports(
        &mut self,
        pool: &mut FnResources,
        d: DomainId,
        args: &CreateDomainArgs,
    ) -> Result<()> {
        if args.cos_strict {
            for cos in 0..NUM_COS {
                self.attach_ldb_ports_cos(pool, d, args.num_cos_ldb_ports[cos], cos)?;
            }
        } else {
            // Prefer the requested class but fall back round-robin.
            for cos in 0..NUM_COS {
                for _ in 0..args.num_cos_ldb_ports[cos] {
                    let mut ret = Err(Error::Unavailable);
                    for j in 0..NUM_COS {
                        ret = self.attach_ldb_ports_cos(pool, d, 1, (cos + j) % NUM_COS);
                        if ret.is_ok() {
                            break;
                        }
                    }
                    ret?;
                }
            }
        }

        // Ports requested from any class of service.
        for _ in 0..args.num_ldb_ports {
            let mut ret = Err(Error::Unavailable);
            for cos in 0..NUM_COS {
                ret = self.attach_ldb_ports_cos(pool, d, 1, cos);
                if ret.is_ok() {
                    break;
                }
            }
            ret?;
        }

        Ok(())
    }

    /// Pick the next port to hand to `d`, spreading the load: prefer a port
    /// whose physical neighbors both belong to other domains, then one with
    /// one foreign and one free neighbor, then one with two free neighbors,
    /// then whatever is first.
    fn next_ldb_port(&self, avail: &[LdbPortId], d: DomainId) -> Option<LdbPortId> {
        let neighbors = |p: LdbPortId| {
            let next = if p.0 == MAX_LDB_PORTS - 1 { 0 } else { p.0 + 1 };
            let prev = if p.0 == 0 { MAX_LDB_PORTS - 1 } else { p.0 - 1 };
            (&self.ldb_ports[prev], &self.ldb_ports[next])
        };
        let foreign = |n: &crate::port::LdbPort| matches!(n.domain, Some(nd) if nd != d);
        let free = |n: &crate::port::LdbPort| n.domain.is_none();

        for &p in avail {
            let (prev, next) = neighbors(p);
            if foreign(prev) && foreign(next) {
                return Some(p);
            }
        }
        for &p in avail {
            let (prev, next) = neighbors(p);
            if (free(prev) && foreign(next)) || (free(next) && foreign(prev)) {
                return Some(p);
            }
        }
        for &p in avail {
            let (prev, next) = neighbors(p);
            if free(prev) && free(next) {
                return Some(p);
            }
        }
        avail.first().copied()
    }

    /// Enable enqueue traffic to every queue the domain owns and freeze its
    /// structural configuration. Irreversible without a full reset.
    pub fn start_domain(&mut self, owner: Owner, domain_id: u32) -> Result<()> {
        debug!("start domain {owner} id={domain_id}");

        let d = self.domain_by_id(owner, domain_id as usize)?;
        if self.domains[d.0].started {
            return Err(Error::InvalidState);
        }

        // Without the write-permission bits the device drops all traffic
        // enqueued to the domain's queues.
        for q in self.domain_used_ldb_queue_ids(d) {
            self.regs.write(regs::sys_ldb_vasqid_v(d, q), 1);
        }
        for p in self.domain_used_dir_ids(d) {
            self.regs.write(regs::sys_dir_vasqid_v(d, p), 1);
        }

        self.domains[d.0].started = true;
        info!("started domain {}", d.0);
        Ok(())
    }

    /// Return every resource to the owner's pool and zero the domain's
    /// counters. The hardware must already be quiesced and verified empty.
    pub(crate) fn reset_domain_sw_state(&mut self, d: DomainId) -> Result<()> {
        let owner = self.domains[d.0].owner;
        let mut pool = std::mem::take(self.pool_mut(owner));
        let ret = self.reset_domain_sw_state_inner(&mut pool, d);
        *self.pool_mut(owner) = pool;
        ret
    }

    fn reset_domain_sw_state_inner(&mut self, pool: &mut FnResources, d: DomainId) -> Result<()> {
        // Queues, configured or not, go back to the pool's free list.
        for q in self.domain_ldb_queue_ids(d) {
            let queue = &mut self.ldb_queues[q.0];
            if queue.sn_cfg_valid {
                let (group, slot) = (queue.sn_group, queue.sn_slot);
                queue.sn_cfg_valid = false;
                self.sn_groups[group].free_slot(slot);
            }
            let queue = &mut self.ldb_queues[q.0];
            queue.domain = None;
            queue.configured = false;
            queue.num_mappings = 0;
            queue.num_pending_additions = 0;
            pool.avail_ldb_queues.push(q);
        }

        for p in self.domain_ldb_port_ids_any(d) {
            let port = &mut self.ldb_ports[p.0];
            port.domain = None;
            port.configured = false;
            port.num_mappings = 0;
            port.num_pending_removals = 0;
            port.qid_map = Default::default();
            pool.avail_ldb_ports[port.cos].push(p);
        }

        for p in self.domain_dir_ids_any(d) {
            let pair = &mut self.dir_pq[p.0];
            pair.domain = None;
            pair.port_configured = false;
            pair.queue_configured = false;
            pool.avail_dir_pq.push(p);
        }

        let domain = &mut self.domains[d.0];

        if domain.total_hist_list_entries > 0 {
            pool.avail_hist_list
                .set_range(
                    domain.hist_list_entry_base as usize,
                    domain.total_hist_list_entries as usize,
                )
                .map_err(|_| {
                    error!("domain hist list range does not match the pool bitmap");
                    Error::Internal
                })?;
        }
        domain.total_hist_list_entries = 0;
        domain.avail_hist_list_entries = 0;
        domain.hist_list_entry_base = 0;
        domain.hist_list_entry_offset = 0;

        pool.avail_ldb_credits += domain.num_ldb_credits;
        domain.num_ldb_credits = 0;

        pool.avail_dir_credits += domain.num_dir_credits;
        domain.num_dir_credits = 0;

        pool.avail_atm_inflights += domain.num_avail_aqed_entries;
        pool.avail_atm_inflights += domain.num_used_aqed_entries;
        domain.num_avail_aqed_entries = 0;
        domain.num_used_aqed_entries = 0;

        domain.num_pending_removals = 0;
        domain.num_pending_additions = 0;
        domain.configured = false;
        domain.started = false;

        pool.avail_domains.push(d);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::regs::ShadowRegs;
    use crate::util::logging;
    use crate::{CreateLdbPortArgs, CreateLdbQueueArgs, MAX_DOMAINS};

    fn hw() -> Hw<ShadowRegs> {
        logging();
        Hw::new(ShadowRegs::new())
    }

    #[test]
    fn create_verification_is_all_or_nothing() {
        let mut hw = hw();

        // Queues without a single port are rejected outright.
        let args = CreateDomainArgs {
            num_ldb_queues: 1,
            ..Default::default()
        };
        assert_eq!(
            hw.create_sched_domain(Owner::Pf, &args),
            Err(Error::InvalidParam)
        );

        // Asking for more than the table holds fails without any change.
        let args = CreateDomainArgs {
            num_ldb_queues: 33,
            num_ldb_ports: 1,
            ..Default::default()
        };
        assert_eq!(
            hw.create_sched_domain(Owner::Pf, &args),
            Err(Error::Unavailable)
        );

        let n = hw.num_resources(Owner::Pf).unwrap();
        assert_eq!(n.num_ldb_queues as usize, crate::MAX_LDB_QUEUES);
        assert_eq!(n.num_sched_domains as usize, MAX_DOMAINS);
    }

    #[test]
    fn strict_cos_requires_exact_class() {
        let mut hw = hw();

        // Drain class 2 into a domain first.
        let args = CreateDomainArgs {
            num_cos_ldb_ports: [0, 0, 16, 0],
            cos_strict: true,
            ..Default::default()
        };
        hw.create_sched_domain(Owner::Pf, &args).unwrap();

        // Strict allocation from the empty class must fail ...
        let args = CreateDomainArgs {
            num_cos_ldb_ports: [0, 0, 1, 0],
            cos_strict: true,
            ..Default::default()
        };
        assert_eq!(
            hw.create_sched_domain(Owner::Pf, &args),
            Err(Error::Unavailable)
        );

        // ... while best-effort falls back to a neighboring class.
        let args = CreateDomainArgs {
            num_cos_ldb_ports: [0, 0, 1, 0],
            cos_strict: false,
            ..Default::default()
        };
        let id = hw.create_sched_domain(Owner::Pf, &args).unwrap();
        let d = DomainId(id as usize);
        assert_eq!(hw.domain_ldb_port_ids_any(d).len(), 1);
    }

    #[test]
    fn started_domain_is_frozen() {
        let mut hw = hw();

        let args = CreateDomainArgs {
            num_ldb_queues: 2,
            num_ldb_ports: 1,
            num_hist_list_entries: 2,
            ..Default::default()
        };
        let d = hw.create_sched_domain(Owner::Pf, &args).unwrap();

        hw.create_ldb_queue(Owner::Pf, d, &CreateLdbQueueArgs::default())
            .unwrap();
        let port_args = CreateLdbPortArgs {
            cq_depth: 8,
            cq_history_list_size: 1,
            ..Default::default()
        };
        hw.create_ldb_port(Owner::Pf, d, &port_args, 0x40).unwrap();

        hw.start_domain(Owner::Pf, d).unwrap();
        assert!(hw.domains[d as usize].configured);
        assert!(hw.domains[d as usize].started);

        // No structural changes once started.
        assert_eq!(hw.start_domain(Owner::Pf, d), Err(Error::InvalidState));
        assert_eq!(
            hw.create_ldb_queue(Owner::Pf, d, &CreateLdbQueueArgs::default()),
            Err(Error::InvalidState)
        );
        assert_eq!(
            hw.create_ldb_port(Owner::Pf, d, &port_args, 0x40),
            Err(Error::InvalidState)
        );

        // Write permissions were turned on for the attached queue.
        let q = crate::ids::LdbQueueId(0);
        assert_eq!(
            hw.regs.read(regs::sys_ldb_vasqid_v(DomainId(d as usize), q)),
            1
        );
    }

    #[test]
    fn hist_list_requires_contiguity() {
        let mut hw = hw();

        // Fragment the PF's history list: two domains carve ranges, the
        // first is reset, leaving a hole.
        let a = hw
            .create_sched_domain(
                Owner::Pf,
                &CreateDomainArgs {
                    num_hist_list_entries: 1000,
                    ..Default::default()
                },
            )
            .unwrap();
        hw.create_sched_domain(
            Owner::Pf,
            &CreateDomainArgs {
                num_hist_list_entries: 1000,
                ..Default::default()
            },
        )
        .unwrap();
        hw.reset_domain(Owner::Pf, a).unwrap();

        let n = hw.num_resources(Owner::Pf).unwrap();
        assert_eq!(n.num_hist_list_entries, 1048);
        assert_eq!(n.max_contiguous_hist_list_entries, 1000);

        // 1048 entries exist, but not contiguously.
        assert_eq!(
            hw.create_sched_domain(
                Owner::Pf,
                &CreateDomainArgs {
                    num_hist_list_entries: 1048,
                    ..Default::default()
                },
            ),
            Err(Error::Unavailable)
        );
    }
}
