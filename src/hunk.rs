//! The double-ended, role-swapping Hunk stack allocator (spec §4.2).

use std::mem::size_of;
use std::ptr::NonNull;

use crate::error::{MemError, MemResult};
use crate::region::{Region, RegionSource};

const CACHELINE: usize = 64;
const HUNK_MAGIC: u32 = 0x89_54_02_02;
const HUNK_FREE_MAGIC: u32 = 0x89_54_02_03;

/// Which end of the hunk a permanent allocation prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Low,
    High,
    DontCare,
}

/// One end's bookkeeping (spec §3 "Hunk bank").
#[derive(Debug, Clone, Copy, Default)]
struct Bank {
    mark: usize,
    permanent: usize,
    temp: usize,
    temp_highwater: usize,
}

/// Header stamped in front of every temp allocation (spec §3 "Hunk
/// header").
#[repr(C)]
struct TempHeader {
    magic: u32,
    size: usize,
}

const TEMP_HEADER_SIZE: usize = size_of::<TempHeader>();

/// Which side (`Side::Low`/`Side::High`) a bank's cursor grows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Low,
    High,
}

/// The double-ended hunk: one contiguous region, two cursors growing
/// toward each other, with role references that can swap (spec §3/§4.2).
pub struct Hunk {
    region: Region,
    low: Bank,
    high: Bank,
    /// `true` if the low bank currently serves the permanent role.
    low_is_permanent: bool,
}

unsafe impl Send for Hunk {}

impl Hunk {
    pub fn init(total_bytes: usize, source: &mut dyn RegionSource) -> MemResult<Self> {
        let region = source
            .acquire(total_bytes)
            .map_err(|_| MemError::fatal("hunk", "failed to acquire initial hunk region"))?;
        Ok(Hunk { region, low: Bank::default(), high: Bank::default(), low_is_permanent: true })
    }

    fn total(&self) -> usize {
        self.region.len()
    }

    /// Total capacity of the hunk's backing region.
    pub fn total_bytes(&self) -> usize {
        self.total()
    }

    fn permanent_bank(&self) -> &Bank {
        if self.low_is_permanent { &self.low } else { &self.high }
    }

    fn temp_bank(&self) -> &Bank {
        if self.low_is_permanent { &self.high } else { &self.low }
    }

    fn permanent_side(&self) -> Side {
        if self.low_is_permanent { Side::Low } else { Side::High }
    }

    fn temp_side(&self) -> Side {
        if self.low_is_permanent { Side::High } else { Side::Low }
    }

    fn bank_mut(&mut self, side: Side) -> &mut Bank {
        match side {
            Side::Low => &mut self.low,
            Side::High => &mut self.high,
        }
    }

    fn bank(&self, side: Side) -> &Bank {
        match side {
            Side::Low => &self.low,
            Side::High => &self.high,
        }
    }

    fn base_offset(&self, side: Side, forward_offset: usize) -> usize {
        match side {
            Side::Low => forward_offset,
            Side::High => self.total() - forward_offset,
        }
    }

    /// spec §4.2 `swap_banks`: refuses to swap while any temp allocation is
    /// live on the current temp side; otherwise swaps when the temp side
    /// has strictly more touched-but-unused slack than the permanent side.
    fn swap_banks(&mut self) {
        let temp_side = self.temp_side();
        let temp = self.bank(temp_side);
        if temp.temp != temp.permanent {
            return;
        }
        let perm_side = self.permanent_side();
        let perm = self.bank(perm_side);
        let temp_slack = temp.temp_highwater.saturating_sub(temp.permanent);
        let perm_slack = perm.temp_highwater.saturating_sub(perm.permanent);
        if temp_slack > perm_slack {
            self.low_is_permanent = !self.low_is_permanent;
        }
    }

    /// spec §4.2 `hunk_alloc`: permanent allocation, zero-filled.
    pub fn alloc(&mut self, size: usize, preference: Preference) -> MemResult<NonNull<u8>> {
        match preference {
            Preference::DontCare => self.swap_banks(),
            Preference::Low => {
                if self.permanent_side() != Side::Low {
                    self.swap_banks();
                }
            }
            Preference::High => {
                if self.permanent_side() != Side::High {
                    self.swap_banks();
                }
            }
        }

        let size = super_align(size, CACHELINE);
        if self.low.temp + self.high.temp + size > self.total() {
            return Err(MemError::OutOfMemory { zone: "hunk", requested: size, available: self.memory_remaining() });
        }

        let side = self.permanent_side();
        let offset = {
            let bank = self.bank_mut(side);
            let start = bank.permanent;
            bank.permanent += size;
            bank.temp = bank.permanent;
            start
        };

        let addr = self.base_offset(side, offset) as isize
            - if side == Side::High { size as isize } else { 0 };
        let ptr = unsafe { self.region.as_ptr().offset(addr) };
        unsafe { std::ptr::write_bytes(ptr, 0, size) };
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// spec §4.2 `allocate_temp`. Zero-init is not guaranteed.
    pub fn allocate_temp(&mut self, size: usize) -> MemResult<NonNull<u8>> {
        self.swap_banks();
        let with_header = size
            .checked_add(TEMP_HEADER_SIZE)
            .ok_or(MemError::SizeOverflow { zone: "hunk", requested: size })?;
        let aligned = super_align(with_header, size_of::<usize>());

        if self.temp_bank().temp.checked_add(aligned).is_none()
            || self.temp_bank().temp + self.permanent_bank().permanent + aligned > self.total()
        {
            return Err(MemError::OutOfMemory { zone: "hunk", requested: aligned, available: self.memory_remaining() });
        }

        let side = self.temp_side();
        let offset = {
            let bank = self.bank_mut(side);
            let start = bank.temp;
            bank.temp += aligned;
            if bank.temp > bank.temp_highwater {
                bank.temp_highwater = bank.temp;
            }
            start
        };

        let header_addr = self.base_offset(side, offset) as isize
            - if side == Side::High { aligned as isize } else { 0 };
        let header_ptr = unsafe { self.region.as_ptr().offset(header_addr) as *mut TempHeader };
        unsafe {
            std::ptr::write(header_ptr, TempHeader { magic: HUNK_MAGIC, size: aligned });
        }
        let payload = unsafe { (header_ptr as *mut u8).add(TEMP_HEADER_SIZE) };
        Ok(unsafe { NonNull::new_unchecked(payload) })
    }

    /// spec §4.2 `free_temp`: LIFO-optimal; out-of-order frees are legal
    /// but only reclaim memory when they happen to be the top of the
    /// current temp side.
    ///
    /// # Safety
    /// `payload` must have been returned by `allocate_temp` on this hunk
    /// and not already freed.
    pub unsafe fn free_temp(&mut self, payload: NonNull<u8>) -> MemResult<()> {
        let header_ptr = (payload.as_ptr()).sub(TEMP_HEADER_SIZE) as *mut TempHeader;
        if (*header_ptr).magic != HUNK_MAGIC {
            return Err(MemError::fatal("hunk", "temp block has a corrupt or stale magic"));
        }
        let size = (*header_ptr).size;
        (*header_ptr).magic = HUNK_FREE_MAGIC;

        let side = self.temp_side();
        let block_offset = (header_ptr as *const u8).offset_from(self.region.as_ptr()) as usize;
        let is_top = match side {
            Side::Low => block_offset + size == self.low.temp,
            Side::High => self.total() - block_offset == self.high.temp,
        };
        if is_top {
            self.bank_mut(side).temp -= size;
        }
        Ok(())
    }

    /// spec §4.2 `set_mark`.
    pub fn set_mark(&mut self) {
        self.low.mark = self.low.permanent;
        self.high.mark = self.high.permanent;
    }

    /// spec §4.2 `clear_to_mark`.
    pub fn clear_to_mark(&mut self) {
        self.low.permanent = self.low.mark;
        self.low.temp = self.low.mark;
        self.high.permanent = self.high.mark;
        self.high.temp = self.high.mark;
    }

    /// spec §4.2 `check_mark`.
    pub fn check_mark(&self) -> bool {
        self.low.mark != 0 || self.high.mark != 0
    }

    /// spec §4.2 `clear_temp`.
    pub fn clear_temp(&mut self) {
        self.low.temp = self.low.permanent;
        self.high.temp = self.high.permanent;
    }

    /// spec §4.2 `clear`.
    pub fn clear(&mut self) {
        self.low = Bank::default();
        self.high = Bank::default();
        self.low_is_permanent = true;
    }

    /// spec §4.2 `memory_remaining`.
    pub fn memory_remaining(&self) -> usize {
        let low_used = self.low.permanent.max(self.low.temp);
        let high_used = self.high.permanent.max(self.high.temp);
        self.total().saturating_sub(low_used + high_used)
    }

    #[cfg(test)]
    pub(crate) fn permanent_bytes(&self, side_is_low: bool) -> usize {
        if side_is_low { self.low.permanent } else { self.high.permanent }
    }

    #[cfg(test)]
    pub(crate) fn temp_highwater(&self, side_is_low: bool) -> usize {
        if side_is_low { self.low.temp_highwater } else { self.high.temp_highwater }
    }

    #[cfg(test)]
    pub(crate) fn low_is_permanent(&self) -> bool {
        self.low_is_permanent
    }
}

fn super_align(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegionSource;

    fn hunk(total: usize) -> Hunk {
        let mut src = HeapRegionSource;
        Hunk::init(total, &mut src).unwrap()
    }

    #[test]
    fn permanent_alloc_is_zeroed_and_word_aligned() {
        let mut h = hunk(1 << 20);
        let p = h.alloc(37, Preference::Low).unwrap();
        unsafe {
            for i in 0..37 {
                assert_eq!(*p.as_ptr().add(i), 0);
            }
        }
        assert_eq!(p.as_ptr() as usize % std::mem::align_of::<usize>(), 0);
    }

    #[test]
    fn permanent_rounds_up_to_cacheline() {
        let mut h = hunk(1 << 20);
        h.alloc(1, Preference::Low).unwrap();
        assert_eq!(h.permanent_bytes(true), CACHELINE);
    }

    #[test]
    fn temp_lifo_reclaims_only_from_the_top() {
        let mut h = hunk(1 << 20);
        let t1 = h.allocate_temp(100).unwrap();
        let t2 = h.allocate_temp(200).unwrap();
        let t3 = h.allocate_temp(300).unwrap();
        let cursor_after_alloc = h.temp_bank().temp;

        unsafe { h.free_temp(t2).unwrap() };
        assert_eq!(h.temp_bank().temp, cursor_after_alloc, "out-of-order free must not retract the cursor");

        unsafe { h.free_temp(t3).unwrap() };
        assert!(h.temp_bank().temp < cursor_after_alloc, "freeing the top must retract the cursor");

        unsafe { h.free_temp(t1).unwrap() };
        // t1 is not at the top (t2's hole still sits between t1 and the
        // retracted cursor), so the cursor must not move from freeing it.
        let after_t1 = h.temp_bank().temp;
        h.clear_temp();
        assert_eq!(h.temp_bank().temp, h.permanent_bank().permanent);
        let _ = after_t1;
    }

    #[test]
    fn mark_round_trips_permanent_allocations() {
        let mut h = hunk(1 << 20);
        h.alloc(64, Preference::Low).unwrap();
        h.set_mark();
        let before = (h.low.permanent, h.high.permanent);
        h.alloc(128, Preference::Low).unwrap();
        h.alloc(256, Preference::High).unwrap();
        h.clear_to_mark();
        assert_eq!((h.low.permanent, h.high.permanent), before);
        assert!(h.check_mark());
    }

    #[test]
    fn side_swap_prefers_greater_slack() {
        let mut h = hunk(1 << 20);
        for _ in 0..5 {
            h.alloc(100, Preference::Low).unwrap();
        }
        h.set_mark();
        let t1 = h.allocate_temp(200).unwrap();
        let t2 = h.allocate_temp(200).unwrap();
        let t3 = h.allocate_temp(200).unwrap();
        unsafe {
            h.free_temp(t3).unwrap();
            h.free_temp(t2).unwrap();
            h.free_temp(t1).unwrap();
        }
        // temp touched the high side up to a highwater well past its
        // permanent cursor (which is 0); low's slack is tiny (permanent ==
        // highwater, no temp ever ran on low). dontcare must swap onto high.
        let was_low_permanent = h.low_is_permanent();
        h.alloc(64, Preference::DontCare).unwrap();
        assert_ne!(h.low_is_permanent(), was_low_permanent, "dontcare must have swapped to the side with more slack");
    }

    #[test]
    fn out_of_capacity_permanent_alloc_is_a_drop_error() {
        let mut h = hunk(CACHELINE * 2);
        h.alloc(CACHELINE, Preference::Low).unwrap();
        h.alloc(CACHELINE, Preference::High).unwrap();
        let err = h.alloc(1, Preference::DontCare).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn memory_remaining_accounts_for_both_sides() {
        let mut h = hunk(1 << 16);
        let total = h.total();
        assert_eq!(h.memory_remaining(), total);
        h.alloc(100, Preference::Low).unwrap();
        assert_eq!(h.memory_remaining(), total - 2 * CACHELINE);
    }
}
