//! Register-level interface to the device's configuration space.
//!
//! The management core only ever touches CSRs through [`Mmio`], an opaque
//! address/value interface. The address map below is organized by register
//! file (system, load-balanced scheduler, completion/history, atomic pipe,
//! reorder pipe), with one 16 KiB block per register and a 4-byte stride per
//! entry.
//!
//! [`ShadowRegs`] is a software register file: writes are remembered, reads
//! of untouched registers return zero. It is what the tests and bench
//! binaries run against, and it doubles as documentation of the registers'
//! reset values.

use std::collections::HashMap;

use bitfield_struct::bitfield;

use crate::ids::{DirId, DomainId, LdbPortId, LdbQueueId, VdevId};
use crate::{MAX_DIR_PAIRS, MAX_LDB_PORTS, MAX_LDB_QUEUES};

/// Read/write access to the device's configuration space.
pub trait Mmio {
    fn read(&self, addr: u32) -> u32;
    fn write(&mut self, addr: u32, val: u32);
}

/// In-memory register file with zero-default reads.
#[derive(Default)]
pub struct ShadowRegs {
    regs: HashMap<u32, u32>,
}

impl ShadowRegs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mmio for ShadowRegs {
    fn read(&self, addr: u32) -> u32 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }
    fn write(&mut self, addr: u32, val: u32) {
        self.regs.insert(addr, val);
    }
}

const SYS: u32 = 0x0100_0000;
const LSP: u32 = 0x0200_0000;
const CHP: u32 = 0x0300_0000;
const AQED: u32 = 0x0400_0000;
const RO: u32 = 0x0500_0000;

const fn reg(file: u32, block: u32, idx: usize) -> u32 {
    file + block * 0x4000 + (idx as u32) * 4
}

// System register file: identity validity, write permissions, address
// translation between physical and vdev-visible ids.

/// Queue write-permission bit of a (domain, LDB queue) pair.
pub const fn sys_ldb_vasqid_v(d: DomainId, q: LdbQueueId) -> u32 {
    reg(SYS, 0, d.0 * MAX_LDB_QUEUES + q.0)
}
/// Queue write-permission bit of a (domain, DIR queue) pair.
pub const fn sys_dir_vasqid_v(d: DomainId, q: DirId) -> u32 {
    reg(SYS, 1, d.0 * MAX_DIR_PAIRS + q.0)
}
pub const fn sys_ldb_qid_v(q: LdbQueueId) -> u32 {
    reg(SYS, 2, q.0)
}
pub const fn sys_ldb_qid_cfg_v(q: LdbQueueId) -> u32 {
    reg(SYS, 3, q.0)
}
pub const fn sys_dir_qid_v(q: DirId) -> u32 {
    reg(SYS, 4, q.0)
}
pub const fn sys_ldb_cq_addr_l(p: LdbPortId) -> u32 {
    reg(SYS, 5, p.0)
}
pub const fn sys_ldb_cq_addr_u(p: LdbPortId) -> u32 {
    reg(SYS, 6, p.0)
}
pub const fn sys_dir_cq_addr_l(p: DirId) -> u32 {
    reg(SYS, 7, p.0)
}
pub const fn sys_dir_cq_addr_u(p: DirId) -> u32 {
    reg(SYS, 8, p.0)
}
pub const fn sys_ldb_pp2vas(p: LdbPortId) -> u32 {
    reg(SYS, 9, p.0)
}
/// Producer-port validity of an LDB port.
pub const fn sys_ldb_pp_v(p: LdbPortId) -> u32 {
    reg(SYS, 10, p.0)
}
pub const fn sys_dir_pp2vas(p: DirId) -> u32 {
    reg(SYS, 11, p.0)
}
pub const fn sys_dir_pp_v(p: DirId) -> u32 {
    reg(SYS, 12, p.0)
}
pub const fn sys_ldb_pp2vdev(p: LdbPortId) -> u32 {
    reg(SYS, 13, p.0)
}
pub const fn sys_dir_pp2vdev(p: DirId) -> u32 {
    reg(SYS, 14, p.0)
}
pub const fn sys_ldb_qid2vqid(q: LdbQueueId) -> u32 {
    reg(SYS, 15, q.0)
}
pub const fn sys_vf_ldb_vqid_v(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 16, v.0 * MAX_LDB_QUEUES + virt)
}
pub const fn sys_vf_ldb_vqid2qid(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 17, v.0 * MAX_LDB_QUEUES + virt)
}
pub const fn sys_vf_ldb_vpp_v(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 18, v.0 * MAX_LDB_PORTS + virt)
}
pub const fn sys_vf_ldb_vpp2pp(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 19, v.0 * MAX_LDB_PORTS + virt)
}
pub const fn sys_vf_dir_vqid_v(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 20, v.0 * MAX_DIR_PAIRS + virt)
}
pub const fn sys_vf_dir_vqid2qid(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 21, v.0 * MAX_DIR_PAIRS + virt)
}
pub const fn sys_vf_dir_vpp_v(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 22, v.0 * MAX_DIR_PAIRS + virt)
}
pub const fn sys_vf_dir_vpp2pp(v: VdevId, virt: usize) -> u32 {
    reg(SYS, 23, v.0 * MAX_DIR_PAIRS + virt)
}

// Load-balanced scheduler register file: occupancy counters, inflight
// limits, CQ disable bits, and the QID↔CQ mapping tables.

/// Outstanding scheduled-but-uncompleted entries of an LDB queue.
pub const fn lsp_qid_ldb_infl_cnt(q: LdbQueueId) -> u32 {
    reg(LSP, 0, q.0)
}
pub const fn lsp_qid_ldb_infl_lim(q: LdbQueueId) -> u32 {
    reg(LSP, 1, q.0)
}
pub const fn lsp_qid_aqed_active_cnt(q: LdbQueueId) -> u32 {
    reg(LSP, 2, q.0)
}
pub const fn lsp_qid_aqed_active_lim(q: LdbQueueId) -> u32 {
    reg(LSP, 3, q.0)
}
pub const fn lsp_qid_atm_active(q: LdbQueueId) -> u32 {
    reg(LSP, 4, q.0)
}
pub const fn lsp_qid_ldb_enqueue_cnt(q: LdbQueueId) -> u32 {
    reg(LSP, 5, q.0)
}
pub const fn lsp_qid_atm_depth_thrsh(q: LdbQueueId) -> u32 {
    reg(LSP, 6, q.0)
}
pub const fn lsp_qid_naldb_depth_thrsh(q: LdbQueueId) -> u32 {
    reg(LSP, 7, q.0)
}
pub const fn lsp_qid_dir_enqueue_cnt(q: DirId) -> u32 {
    reg(LSP, 8, q.0)
}
pub const fn lsp_qid_dir_depth_thrsh(q: DirId) -> u32 {
    reg(LSP, 9, q.0)
}
/// CQ disable bit; 1 stops the scheduler from delivering to the port.
pub const fn lsp_cq_ldb_dsbl(p: LdbPortId) -> u32 {
    reg(LSP, 10, p.0)
}
pub const fn lsp_cq_dir_dsbl(p: DirId) -> u32 {
    reg(LSP, 11, p.0)
}
/// Completions this LDB CQ still owes the device.
pub const fn lsp_cq_ldb_infl_cnt(p: LdbPortId) -> u32 {
    reg(LSP, 12, p.0)
}
pub const fn lsp_cq_ldb_infl_lim(p: LdbPortId) -> u32 {
    reg(LSP, 13, p.0)
}
pub const fn lsp_cq_ldb_tkn_cnt(p: LdbPortId) -> u32 {
    reg(LSP, 14, p.0)
}
pub const fn lsp_cq_dir_tkn_cnt(p: DirId) -> u32 {
    reg(LSP, 15, p.0)
}
pub const fn lsp_cq_ldb_tkn_depth_sel(p: LdbPortId) -> u32 {
    reg(LSP, 16, p.0)
}
pub const fn lsp_cq_dir_tkn_depth_sel(p: DirId) -> u32 {
    reg(LSP, 17, p.0)
}
/// Per-slot priority and validity vector of an LDB port.
pub const fn lsp_cq2priov(p: LdbPortId) -> u32 {
    reg(LSP, 18, p.0)
}
/// Queue ids of slots `half*4..half*4+4` of an LDB port.
pub const fn lsp_cq2qid(p: LdbPortId, half: usize) -> u32 {
    reg(LSP, 19, p.0 * 2 + half)
}
/// Inverse map: which slots of ports `group*4..group*4+4` serve this queue.
pub const fn lsp_qid2cqidix(q: LdbQueueId, group: usize) -> u32 {
    reg(LSP, 20, q.0 * (MAX_LDB_PORTS / 4) + group)
}
pub const fn lsp_qid2cqidix2(q: LdbQueueId, group: usize) -> u32 {
    reg(LSP, 21, q.0 * (MAX_LDB_PORTS / 4) + group)
}
/// Scheduler control word (has-work / inflight-ok bit updates).
pub const fn lsp_ldb_sched_ctrl() -> u32 {
    reg(LSP, 22, 0)
}

// Completion/history register file.

pub const fn chp_cfg_ldb_vas_crd(d: DomainId) -> u32 {
    reg(CHP, 0, d.0)
}
pub const fn chp_cfg_dir_vas_crd(d: DomainId) -> u32 {
    reg(CHP, 1, d.0)
}
pub const fn chp_hist_list_base(p: LdbPortId) -> u32 {
    reg(CHP, 2, p.0)
}
pub const fn chp_hist_list_lim(p: LdbPortId) -> u32 {
    reg(CHP, 3, p.0)
}
pub const fn chp_hist_list_push_ptr(p: LdbPortId) -> u32 {
    reg(CHP, 4, p.0)
}
pub const fn chp_hist_list_pop_ptr(p: LdbPortId) -> u32 {
    reg(CHP, 5, p.0)
}
pub const fn chp_ldb_cq2vas(p: LdbPortId) -> u32 {
    reg(CHP, 6, p.0)
}
pub const fn chp_dir_cq2vas(p: DirId) -> u32 {
    reg(CHP, 7, p.0)
}
pub const fn chp_ord_qid_sn_map(q: LdbQueueId) -> u32 {
    reg(CHP, 8, q.0)
}
pub const fn chp_sn_chk_enbl(p: LdbPortId) -> u32 {
    reg(CHP, 9, p.0)
}

// Atomic pipe register file.

pub const fn aqed_qid_hid_width(q: LdbQueueId) -> u32 {
    reg(AQED, 0, q.0)
}
pub const fn aqed_qid_fid_lim(q: LdbQueueId) -> u32 {
    reg(AQED, 1, q.0)
}
pub const fn aqed_qid2cqidix(q: LdbQueueId, group: usize) -> u32 {
    reg(AQED, 2, q.0 * (MAX_LDB_PORTS / 4) + group)
}

// Reorder pipe register file.

pub const fn ro_grp_sn_mode() -> u32 {
    reg(RO, 0, 0)
}

/// Per-slot validity bits and 3-bit priorities of one LDB port.
#[bitfield(u32)]
pub struct Cq2Priov {
    #[bits(24)]
    pub prio: u32,
    #[bits(8)]
    pub v: u32,
}

/// Four 8-bit queue ids, one per slot of a CQ2QID half.
#[bitfield(u32)]
pub struct Cq2Qid {
    pub q0: u8,
    pub q1: u8,
    pub q2: u8,
    pub q3: u8,
}

impl Cq2Qid {
    /// Set the queue id of slot `idx` (0..4 within this half).
    pub fn set_slot(&mut self, idx: usize, qid: u8) {
        match idx {
            0 => self.set_q0(qid),
            1 => self.set_q1(qid),
            2 => self.set_q2(qid),
            _ => self.set_q3(qid),
        }
    }
}

/// Per-slot bit vectors for the four ports of a QID2CQIDIX group.
#[bitfield(u32)]
pub struct Qid2CqIdx {
    pub p0: u8,
    pub p1: u8,
    pub p2: u8,
    pub p3: u8,
}

impl Qid2CqIdx {
    pub fn port_bits(&self, idx: usize) -> u8 {
        match idx {
            0 => self.p0(),
            1 => self.p1(),
            2 => self.p2(),
            _ => self.p3(),
        }
    }
    pub fn set_port_bits(&mut self, idx: usize, bits: u8) {
        match idx {
            0 => self.set_p0(bits),
            1 => self.set_p1(bits),
            2 => self.set_p2(bits),
            _ => self.set_p3(bits),
        }
    }
}

/// Scheduler control word addressing one (CQ, slot) pair.
#[bitfield(u32)]
pub struct SchedCtrl {
    pub cq: u8,
    #[bits(3)]
    pub qidix: u8,
    pub value: bool,
    pub nalb_haswork_v: bool,
    pub rlist_haswork_v: bool,
    pub inflight_ok_v: bool,
    #[bits(17)]
    __: (),
}

/// Sequence-number group/slot assignment of an ordered queue.
#[bitfield(u32)]
pub struct SnMap {
    #[bits(3)]
    pub mode: u8,
    #[bits(5)]
    pub slot: u8,
    #[bits(2)]
    pub grp: u8,
    #[bits(22)]
    __: (),
}

/// Validity of a queue's optional sequence-number and atomic configuration.
#[bitfield(u32)]
pub struct QidCfgV {
    pub sn_cfg_v: bool,
    pub fid_cfg_v: bool,
    #[bits(30)]
    __: (),
}

/// Widths of the two sequence-number groups.
#[bitfield(u32)]
pub struct GrpSnMode {
    #[bits(3)]
    pub mode0: u8,
    #[bits(3)]
    pub mode1: u8,
    #[bits(26)]
    __: (),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shadow_defaults() {
        let mut regs = ShadowRegs::new();
        let addr = lsp_qid_ldb_infl_cnt(LdbQueueId(3));
        assert_eq!(regs.read(addr), 0);
        regs.write(addr, 17);
        assert_eq!(regs.read(addr), 17);
        assert_eq!(regs.read(lsp_qid_ldb_infl_cnt(LdbQueueId(4))), 0);
    }

    #[test]
    fn distinct_addresses() {
        // Strided tables must not collide across blocks.
        let mut seen = std::collections::HashSet::new();
        for d in 0..crate::MAX_DOMAINS {
            for q in 0..MAX_LDB_QUEUES {
                assert!(seen.insert(sys_ldb_vasqid_v(DomainId(d), LdbQueueId(q))));
            }
        }
        for q in 0..MAX_LDB_QUEUES {
            assert!(seen.insert(lsp_qid_ldb_infl_cnt(LdbQueueId(q))));
            assert!(seen.insert(lsp_qid_ldb_infl_lim(LdbQueueId(q))));
            for g in 0..MAX_LDB_PORTS / 4 {
                assert!(seen.insert(lsp_qid2cqidix(LdbQueueId(q), g)));
                assert!(seen.insert(lsp_qid2cqidix2(LdbQueueId(q), g)));
            }
        }
        for p in 0..MAX_LDB_PORTS {
            assert!(seen.insert(lsp_cq2priov(LdbPortId(p))));
            assert!(seen.insert(lsp_cq2qid(LdbPortId(p), 0)));
            assert!(seen.insert(lsp_cq2qid(LdbPortId(p), 1)));
        }
    }

    #[test]
    fn priov_fields() {
        let r = Cq2Priov::new().with_v(0b101).with_prio(0b011_000_111);
        assert_eq!(r.v(), 0b101);
        assert_eq!(r.prio(), 0b011_000_111);
        let r = Cq2Priov::from_bits(r.into_bits());
        assert_eq!(r.v(), 0b101);
    }
}
