//! Per-owner resource pools and the bulk transfer primitives.
//!
//! Each owner (the PF or one vdev) has one [`FnResources`]: the ids of every
//! unattached resource it holds per class, scalar credit counters, and the
//! history-list bitmap. Resources attached to a scheduling domain are not
//! listed here; they are found through the arena records' `domain` field.
//!
//! Transfers between pools use a return-then-reacquire scheme: the
//! destination's entire current allocation of a class is folded back into
//! the source before the availability check, so a partial decrease never has
//! to pick which entries to give up, and the check always sees the true
//! combined supply. On shortfall the destination's original count is
//! restored and the call fails without net effect.

use log::error;

use crate::bitmap::Bitmap;
use crate::ids::{DirId, DomainId, LdbPortId, LdbQueueId};
use crate::{Error, Result, MAX_HIST_LIST_ENTRIES, NUM_COS};

/// The available (unattached) resources of one owner.
pub struct FnResources {
    pub avail_domains: Vec<DomainId>,
    pub avail_ldb_queues: Vec<LdbQueueId>,
    pub avail_ldb_ports: [Vec<LdbPortId>; NUM_COS],
    pub avail_dir_pq: Vec<DirId>,
    pub avail_ldb_credits: u32,
    pub avail_dir_credits: u32,
    pub avail_atm_inflights: u32,
    pub avail_hist_list: Bitmap,
    /// Locked vdev assignments cannot be changed by transfers.
    pub locked: bool,
}

impl FnResources {
    pub fn new() -> Self {
        Self {
            avail_domains: Vec::new(),
            avail_ldb_queues: Vec::new(),
            avail_ldb_ports: Default::default(),
            avail_dir_pq: Vec::new(),
            avail_ldb_credits: 0,
            avail_dir_credits: 0,
            avail_atm_inflights: 0,
            avail_hist_list: Bitmap::new(MAX_HIST_LIST_ENTRIES),
            locked: false,
        }
    }

    pub fn num_avail_ldb_ports(&self) -> usize {
        self.avail_ldb_ports.iter().map(Vec::len).sum()
    }
}

impl Default for FnResources {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassign a list-based resource class so that `dst` ends up with `num`
/// entries, drawing from (or returning to) `src`.
pub(crate) fn reassign_ids<I: Copy>(src: &mut Vec<I>, dst: &mut Vec<I>, num: usize) -> Result<()> {
    let orig = dst.len();

    // Return the destination's entire allocation first, then check the
    // combined supply.
    src.extend(dst.drain(..));

    let (num, ret) = if num > src.len() {
        (orig, Err(Error::Unavailable))
    } else {
        (num, Ok(()))
    };

    dst.extend(src.drain(..num));
    ret
}

/// Same return-then-reacquire scheme on a plain counter.
pub(crate) fn reassign_credits(src: &mut u32, dst: &mut u32, num: u32) -> Result<()> {
    let orig = *dst;

    *src += orig;
    *dst = 0;

    if *src < num {
        *src -= orig;
        *dst = orig;
        return Err(Error::Unavailable);
    }

    *src -= num;
    *dst += num;
    Ok(())
}

/// Same scheme on bitmap-backed storage, where the destination's holding
/// must additionally be one *contiguous* range.
pub(crate) fn reassign_bitmap(src: &mut Bitmap, dst: &mut Bitmap, num: usize) -> Result<()> {
    let orig = dst.count();

    // Folding the destination back in may be exactly what makes a
    // sufficiently large contiguous chunk available.
    src.or_assign(dst);
    dst.zero();

    if num == 0 {
        return Ok(());
    }

    match src.find_set_bit_range(num) {
        Ok(base) => {
            dst.set_range(base, num)?;
            src.clear_range(base, num)?;
            Ok(())
        }
        Err(_) => {
            // Restore the original allocation. It was granted as one range,
            // so a matching run must exist in the merged bitmap.
            if orig > 0 {
                let base = src.find_set_bit_range(orig).map_err(|_| {
                    error!("lost track of {orig} returned bitmap entries");
                    Error::Internal
                })?;
                dst.set_range(base, orig)?;
                src.clear_range(base, orig)?;
            }
            Err(Error::Unavailable)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_round_trip() {
        let mut src: Vec<u32> = (0..10).collect();
        let mut dst: Vec<u32> = Vec::new();

        reassign_ids(&mut src, &mut dst, 6).unwrap();
        assert_eq!(dst, [0, 1, 2, 3, 4, 5]);
        assert_eq!(src, [6, 7, 8, 9]);

        // Partial decrease: full return, partial reacquire.
        reassign_ids(&mut src, &mut dst, 2).unwrap();
        assert_eq!(dst, [0, 1]);
        assert_eq!(src.len(), 8);

        reassign_ids(&mut src, &mut dst, 0).unwrap();
        assert_eq!(src.len(), 10);

        // Shortfall leaves both sides untouched.
        reassign_ids(&mut src, &mut dst, 4).unwrap();
        reassign_ids(&mut src, &mut dst, 11).unwrap_err();
        assert_eq!(dst.len(), 4);
        assert_eq!(src.len(), 6);
    }

    #[test]
    fn credits() {
        let mut src = 100;
        let mut dst = 0;

        reassign_credits(&mut src, &mut dst, 70).unwrap();
        assert_eq!((src, dst), (30, 70));

        // The destination's own credits count toward the new request.
        reassign_credits(&mut src, &mut dst, 90).unwrap();
        assert_eq!((src, dst), (10, 90));

        assert_eq!(
            reassign_credits(&mut src, &mut dst, 101),
            Err(Error::Unavailable)
        );
        assert_eq!((src, dst), (10, 90));
    }

    #[test]
    fn bitmap_contiguity() {
        let mut src = Bitmap::new(64);
        let mut dst = Bitmap::new(64);
        src.fill();

        reassign_bitmap(&mut src, &mut dst, 32).unwrap();
        assert_eq!(dst.count(), 32);
        assert_eq!(src.count(), 32);

        // Growing the destination works because its own range is folded
        // back before searching.
        reassign_bitmap(&mut src, &mut dst, 48).unwrap();
        assert_eq!(dst.count(), 48);
        assert_eq!(dst.find_set_bit_range(48).unwrap(), 0);

        assert_eq!(
            reassign_bitmap(&mut src, &mut dst, 65),
            Err(Error::Unavailable)
        );
        assert_eq!(dst.count(), 48);
        assert_eq!(src.count(), 16);

        // A zero-sized request is a full return.
        reassign_bitmap(&mut src, &mut dst, 0).unwrap();
        assert_eq!(dst.count(), 0);
        assert_eq!(src.count(), 64);
    }
}
