//! The top-level facade tying the small zone, main zone, and hunk together
//! (spec §4.3/§6).

use std::ptr::NonNull;

use crate::config::{Config, SMALL_ZONE_BYTES};
use crate::error::MemResult;
use crate::hunk::{Hunk, Preference};
use crate::region::{OsRegionSource, RegionSource};
use crate::stats::Stats;
use crate::tag::Tag;
use crate::zone::Zone;

/// Owns the small zone, the main zone, and the hunk, and exposes the spec
/// §6 entry points as plain methods instead of free functions over a global
/// singleton (see `DESIGN.md`).
pub struct System {
    small_zone: Zone,
    main_zone: Zone,
    hunk: Hunk,
    source: Box<dyn RegionSource>,
}

impl System {
    /// Builds small zone, then main zone, then hunk, in that order (spec
    /// §4.3). Any region-acquisition failure is fatal.
    pub fn init(config: Config) -> MemResult<Self> {
        Self::init_with_source(config, Box::new(OsRegionSource))
    }

    /// Like [`System::init`] but with a caller-supplied [`RegionSource`],
    /// used by tests to avoid real `mmap`/`VirtualAlloc` calls.
    pub fn init_with_source(config: Config, mut source: Box<dyn RegionSource>) -> MemResult<Self> {
        let small_zone = Zone::init("small", SMALL_ZONE_BYTES, false, source.as_mut())?;
        let main_zone = Zone::init("main", config.zone_bytes(), true, source.as_mut())?;
        let hunk = Hunk::init(config.hunk_bytes(), source.as_mut())?;
        Ok(System { small_zone, main_zone, hunk, source })
    }

    /// Main-zone allocation tagged `Tag::General`, zero-filled (spec §6
    /// `z_malloc`, §8 "Zero-fill contract"). `tag_malloc` itself leaves a
    /// reused block's poison pattern in place, so the zeroing happens here,
    /// at the one call site the contract actually applies to.
    pub fn z_malloc(&mut self, size: usize) -> MemResult<NonNull<u8>> {
        let ptr = self.main_zone.tag_malloc(size, Tag::General, self.source.as_mut())?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Small-zone allocation tagged `Tag::Small`; the small zone never
    /// grows, so this fails with `OutOfMemory` rather than acquiring more
    /// OS memory.
    pub fn s_malloc(&mut self, size: usize) -> MemResult<NonNull<u8>> {
        self.small_zone.tag_malloc(size, Tag::Small, self.source.as_mut())
    }

    /// Tagged allocation, routed to the small zone or main zone by
    /// [`Tag::routes_to_small_zone`].
    pub fn z_tag_malloc(&mut self, size: usize, tag: Tag) -> MemResult<NonNull<u8>> {
        let source = self.source.as_mut();
        match tag.routes_to_small_zone() {
            true => self.small_zone.tag_malloc(size, tag, source),
            false => self.main_zone.tag_malloc(size, tag, source),
        }
    }

    /// Frees a pointer previously returned by `z_malloc`/`s_malloc`/
    /// `z_tag_malloc`.
    ///
    /// # Safety
    /// `payload` must be a live allocation from this exact `System`'s small
    /// or main zone, not already freed.
    pub unsafe fn z_free(&mut self, payload: Option<NonNull<u8>>) -> MemResult<()> {
        let payload = match payload {
            Some(p) => p,
            None => return self.main_zone.free(None),
        };
        // Either zone's `free` rejects a pointer with a corrupt id, but a
        // cross-zone free would silently corrupt the wrong zone's blocks;
        // route by which region actually contains the pointer.
        if self.small_zone.contains(payload) {
            self.small_zone.free(Some(payload))
        } else {
            self.main_zone.free(Some(payload))
        }
    }

    /// Sweeps every live block tagged `tag` out of the zone it routes to.
    ///
    /// # Safety
    /// Every block with this tag in the target zone must be a live,
    /// independently freeable allocation.
    pub unsafe fn z_free_tags(&mut self, tag: Tag) -> MemResult<usize> {
        if tag.routes_to_small_zone() { self.small_zone.free_tags(tag) } else { self.main_zone.free_tags(tag) }
    }

    /// Bytes free in the main zone.
    pub fn z_available_memory(&self) -> usize {
        self.main_zone.available()
    }

    pub fn hunk_alloc(&mut self, size: usize, preference: Preference) -> MemResult<NonNull<u8>> {
        self.hunk.alloc(size, preference)
    }

    pub fn hunk_allocate_temp(&mut self, size: usize) -> MemResult<NonNull<u8>> {
        self.hunk.allocate_temp(size)
    }

    /// # Safety
    /// `payload` must have been returned by `hunk_allocate_temp` on this
    /// exact `System`'s hunk, not already freed.
    pub unsafe fn hunk_free_temp(&mut self, payload: NonNull<u8>) -> MemResult<()> {
        self.hunk.free_temp(payload)
    }

    pub fn hunk_set_mark(&mut self) {
        self.hunk.set_mark()
    }

    pub fn hunk_clear_to_mark(&mut self) {
        self.hunk.clear_to_mark()
    }

    pub fn hunk_check_mark(&self) -> bool {
        self.hunk.check_mark()
    }

    pub fn hunk_clear(&mut self) {
        self.hunk.clear()
    }

    pub fn hunk_clear_temp(&mut self) {
        self.hunk.clear_temp()
    }

    pub fn hunk_memory_remaining(&self) -> usize {
        self.hunk.memory_remaining()
    }

    /// Returns a final usage snapshot and releases every underlying region.
    pub fn shutdown(self) -> Stats {
        Stats {
            small_zone_total: self.small_zone.total_size(),
            small_zone_used: self.small_zone.used(),
            main_zone_total: self.main_zone.total_size(),
            main_zone_used: self.main_zone.used(),
            hunk_total: self.hunk.total_bytes(),
            hunk_remaining: self.hunk.memory_remaining(),
        }
    }
}
