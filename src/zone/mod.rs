//! The tagged, coalescing, segment-growable Zone allocator (spec §4.1).

pub(crate) mod block;
pub(crate) mod freelist;
pub mod statics;

use std::mem::size_of;
use std::ptr::NonNull;

use block::{
    align_up, guard_is_intact, header_from_payload, payload_ptr, poison_payload, write_guard,
    BlockHeader, FreeNode, SentinelNode, GUARD_SIZE, HEADER_SIZE, SEPARATOR_ID, ZONEID,
};
use freelist::{bucket_for, FreeLists, BUCKET_COUNT};

use crate::error::{MemError, MemResult};
use crate::region::{Region, RegionSource};
use crate::tag::Tag;

/// Segments grow in 2 MiB increments (spec §4.1 `new_block`).
const SEGMENT_GRANULARITY: usize = 2 * 1024 * 1024;
const WORD: usize = size_of::<usize>();

/// A general-purpose, tagged, coalescing allocator over one or more
/// segments (spec §3 "Zone").
pub struct Zone {
    name: &'static str,
    growable: bool,
    segments: Vec<Region>,
    sentinel: *mut BlockHeader,
    free_lists: FreeLists,
    size: usize,
    used: usize,
    min_fragment: usize,
}

unsafe impl Send for Zone {}

impl Zone {
    /// Builds a zone over one freshly acquired region (spec §4.1
    /// `clear_zone`): the whole region becomes a single free block.
    pub fn init(
        name: &'static str,
        initial_bytes: usize,
        growable: bool,
        source: &mut dyn RegionSource,
    ) -> MemResult<Self> {
        let region = source.acquire(initial_bytes).map_err(|e| match e {
            MemError::RegionUnavailable { len, reason } => {
                log::error!("{name} zone: failed to acquire initial {len}-byte region: {reason}");
                MemError::fatal(name, "failed to acquire initial zone region")
            }
            other => other,
        })?;

        let min_fragment = align_up(64.max(HEADER_SIZE + size_of::<FreeNode>()), WORD);

        let sentinel = SentinelNode::new_self_looped();
        let mut zone = Zone {
            name,
            growable,
            segments: Vec::new(),
            sentinel,
            free_lists: FreeLists::new(),
            size: 0,
            used: 0,
            min_fragment,
        };
        zone.adopt_region(region, None);
        Ok(zone)
    }

    /// Wraps a freshly-acquired region as one whole free block, appended to
    /// the end of the block list. If `after` is `Some`, a zero-payload
    /// separator is written at the start of the region first and spliced in
    /// before the free block (spec §4.1 `new_block`); otherwise (only at
    /// `init` time) the region's first bytes are the free block directly.
    fn adopt_region(&mut self, region: Region, after: Option<*mut BlockHeader>) {
        let base = region.as_ptr();
        self.size += region.len();

        let (free_header, free_size, link_prev) = match after {
            Some(prev_tail) => unsafe {
                let sep = base as *mut BlockHeader;
                let free_header = base.add(HEADER_SIZE) as *mut BlockHeader;
                std::ptr::write(
                    sep,
                    BlockHeader {
                        prev: prev_tail,
                        next: free_header,
                        size: 0,
                        tag: Tag::General,
                        id: SEPARATOR_ID,
                    },
                );
                self.used += HEADER_SIZE;
                (free_header, region.len() - HEADER_SIZE, sep)
            },
            None => (base as *mut BlockHeader, region.len(), self.sentinel),
        };

        unsafe {
            std::ptr::write(
                free_header,
                BlockHeader {
                    prev: link_prev,
                    next: self.sentinel,
                    size: free_size,
                    tag: Tag::Free,
                    id: ZONEID,
                },
            );
            (*link_prev).next = free_header;
            (*self.sentinel).prev = free_header;
            self.free_lists.insert(free_header, free_size.saturating_sub(HEADER_SIZE));
        }

        self.segments.push(region);
    }

    fn zone_for_error(&self) -> &'static str {
        self.name
    }

    /// spec §4.1 `tag_malloc`.
    pub fn tag_malloc(
        &mut self,
        requested: usize,
        tag: Tag,
        source: &mut dyn RegionSource,
    ) -> MemResult<NonNull<u8>> {
        if matches!(tag, Tag::Free) {
            return Err(MemError::fatal(self.name, "tag_malloc called with tag FREE"));
        }

        let min_payload = requested.max(size_of::<FreeNode>());
        let with_header = min_payload
            .checked_add(HEADER_SIZE)
            .and_then(|v| v.checked_add(GUARD_SIZE))
            .ok_or(MemError::SizeOverflow { zone: self.name, requested })?;
        let final_size = align_up(with_header, WORD);

        let block = match self.find_fit(final_size) {
            Some(b) => b,
            None => {
                self.grow(final_size, source)?;
                self.find_fit(final_size)
                    .expect("freshly grown segment must satisfy the request that triggered it")
            }
        };

        unsafe {
            self.free_lists.remove(block);
            self.split_if_fragment_remains(block, final_size);
            (*block).tag = tag;
            (*block).id = ZONEID;
            write_guard(block);
            self.used += (*block).size;
            Ok(NonNull::new_unchecked(payload_ptr(block)))
        }
    }

    fn find_fit(&self, final_size: usize) -> Option<*mut BlockHeader> {
        let start_bucket = bucket_for(final_size.saturating_sub(HEADER_SIZE));
        for bucket in start_bucket..BUCKET_COUNT {
            if let Some(b) = unsafe { self.free_lists.first_fit(bucket, final_size) } {
                return Some(b);
            }
        }
        None
    }

    /// Splits `block` if the leftover after carving out `final_size` bytes
    /// is at least `min_fragment` (spec §4.1 step 5).
    unsafe fn split_if_fragment_remains(&mut self, block: *mut BlockHeader, final_size: usize) {
        let leftover = (*block).size - final_size;
        if leftover < self.min_fragment {
            return;
        }
        (*block).size = final_size;
        let frag = (block as *mut u8).add(final_size) as *mut BlockHeader;
        let old_next = (*block).next;
        std::ptr::write(
            frag,
            BlockHeader { prev: block, next: old_next, size: leftover, tag: Tag::Free, id: ZONEID },
        );
        (*old_next).prev = frag;
        (*block).next = frag;
        self.free_lists.insert(frag, leftover - HEADER_SIZE);
    }

    /// spec §4.1 `new_block`: round up to 2 MiB, acquire a fresh region,
    /// splice a separator + free block onto the end of the list.
    fn grow(&mut self, required: usize, source: &mut dyn RegionSource) -> MemResult<()> {
        if !self.growable {
            return Err(MemError::fatal_with(
                self.name,
                "zone exhausted and growth is not permitted",
                required,
                Tag::General,
            ));
        }
        let grown = align_up(required, SEGMENT_GRANULARITY);
        let region = source
            .acquire(grown + HEADER_SIZE)
            .map_err(|_| MemError::OutOfMemory { zone: self.name, requested: required, available: self.available() })?;

        let old_tail = unsafe { (*self.sentinel).prev };
        log::trace!("{} zone: growing by {} bytes (segment #{})", self.name, region.len(), self.segments.len() + 1);
        self.adopt_region(region, Some(old_tail));
        Ok(())
    }

    /// spec §4.1 `free`.
    ///
    /// # Safety
    /// `payload` must be a pointer previously returned by `tag_malloc` on
    /// this exact zone, not already freed.
    pub unsafe fn free(&mut self, payload: Option<NonNull<u8>>) -> MemResult<()> {
        let payload = match payload {
            Some(p) => p,
            None => return Err(MemError::NullFree),
        };
        let header = header_from_payload(payload.as_ptr());

        if (*header).id != ZONEID {
            return Err(MemError::fatal(self.name, "freed pointer without a valid id"));
        }
        if matches!((*header).tag, Tag::Free) {
            return Err(MemError::fatal(self.name, "double free"));
        }
        if matches!((*header).tag, Tag::Static) {
            return Ok(());
        }
        if !guard_is_intact(header) {
            return Err(MemError::fatal(self.name, "wrote past end of block"));
        }

        self.used -= (*header).size;
        poison_payload(header);
        (*header).tag = Tag::Free;

        let merged = self.coalesce(header);
        let payload_len = (*merged).size - HEADER_SIZE;
        self.free_lists.insert(merged, payload_len);
        Ok(())
    }

    /// Merges `block` with a `FREE` predecessor and/or successor, returning
    /// the surviving block's address (spec §4.1 step 5; §9 notes this
    /// survivor identity is also what `free_tags` must anchor on).
    unsafe fn coalesce(&mut self, block: *mut BlockHeader) -> *mut BlockHeader {
        let mut survivor = block;

        let prev = (*survivor).prev;
        if prev != self.sentinel && matches!((*prev).tag, Tag::Free) {
            self.free_lists.remove(prev);
            (*prev).size += (*survivor).size;
            let next = (*survivor).next;
            (*prev).next = next;
            (*next).prev = prev;
            survivor = prev;
        }

        let next = (*survivor).next;
        if next != self.sentinel && matches!((*next).tag, Tag::Free) {
            self.free_lists.remove(next);
            (*survivor).size += (*next).size;
            let next_next = (*next).next;
            (*survivor).next = next_next;
            (*next_next).prev = survivor;
        }

        survivor
    }

    /// spec §4.1 `free_tags`. `Tag::Static` may never be swept.
    ///
    /// # Safety
    /// Every non-`FREE` block with this zone's tag must be a live
    /// allocation from this zone.
    pub unsafe fn free_tags(&mut self, tag: Tag) -> MemResult<usize> {
        if matches!(tag, Tag::Static) {
            return Err(MemError::fatal(self.name, "free_tags called with tag STATIC"));
        }

        let mut count = 0usize;
        let mut cursor = (*self.sentinel).next;
        while cursor != self.sentinel {
            if (*cursor).tag != tag {
                cursor = (*cursor).next;
                continue;
            }
            if (*cursor).id != ZONEID {
                return Err(MemError::fatal(self.name, "corrupt block encountered during free_tags"));
            }

            // Anchor on whichever block will still be a valid, independently
            // addressable list node once `free` finishes coalescing: the
            // predecessor if it will absorb `cursor` (it was already FREE),
            // otherwise `cursor` itself (it survives, possibly extended
            // forward). See DESIGN.md for why this differs from a naive
            // "save `cursor.next` first" approach.
            let predecessor = (*cursor).prev;
            let anchor = if predecessor != self.sentinel && matches!((*predecessor).tag, Tag::Free) {
                predecessor
            } else {
                cursor
            };

            let payload = NonNull::new(payload_ptr(cursor));
            self.free(payload)?;
            count += 1;

            cursor = (*anchor).next;
        }
        Ok(count)
    }

    /// spec §4.1 `check_heap`.
    pub fn check_heap(&self) -> MemResult<()> {
        unsafe {
            let mut cur = (*self.sentinel).next;
            let mut prev_was_free = false;
            while cur != self.sentinel {
                let next = (*cur).next;

                if (*next).prev != cur {
                    return Err(MemError::fatal(self.name, "block list back-link is inconsistent"));
                }

                // A separator's `size` field is 0 (spec §4.1 `new_block`); its
                // physical footprint is always exactly `HEADER_SIZE`, so that
                // constant — not the field — is the right adjacency advance
                // when `cur` is itself a separator. A separator's successor
                // starts a brand-new backing region, so adjacency from `cur`
                // to a separator `next` is never checked: segments need not
                // be contiguous with each other.
                if next != self.sentinel && (*next).id != SEPARATOR_ID {
                    let advance = if (*cur).id == SEPARATOR_ID { HEADER_SIZE } else { (*cur).size };
                    let expected_next = (cur as *mut u8).add(advance);
                    if expected_next != next as *mut u8 {
                        return Err(MemError::fatal(self.name, "block is not physically adjacent to its successor"));
                    }
                }

                let is_free = matches!((*cur).tag, Tag::Free);
                if is_free && prev_was_free {
                    return Err(MemError::fatal(self.name, "two consecutive free blocks"));
                }
                prev_was_free = is_free;

                cur = next;
            }
        }
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.size.saturating_sub(self.used)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn total_size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &'static str {
        self.zone_for_error()
    }

    /// Whether `payload` falls inside one of this zone's segments.
    pub fn contains(&self, payload: NonNull<u8>) -> bool {
        let addr = payload.as_ptr() as usize;
        self.segments.iter().any(|region| {
            let base = region.as_ptr() as usize;
            addr >= base && addr < base + region.len()
        })
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        unsafe {
            SentinelNode::reclaim(self.sentinel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegionSource;

    fn zone(bytes: usize, growable: bool) -> Zone {
        let mut src = HeapRegionSource;
        Zone::init("test", bytes, growable, &mut src).unwrap()
    }

    #[test]
    fn alloc_writes_a_guarded_block_and_tracks_used() {
        let mut src = HeapRegionSource;
        let mut z = zone(4096, false);
        let used_before = z.used();
        let p = z.tag_malloc(32, Tag::General, &mut src).unwrap();
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0x42, 32);
        }
        assert!(z.used() > used_before);
        z.check_heap().unwrap();
    }

    #[test]
    fn free_then_realloc_reuses_the_block() {
        let mut src = HeapRegionSource;
        let mut z = zone(4096, false);
        let p = z.tag_malloc(64, Tag::General, &mut src).unwrap();
        let available_after_alloc = z.available();
        unsafe { z.free(Some(p)).unwrap() };
        assert!(z.available() > available_after_alloc);
        z.check_heap().unwrap();
    }

    #[test]
    fn coalesces_adjacent_free_blocks_both_directions() {
        let mut src = HeapRegionSource;
        let mut z = zone(4096, false);
        let a = z.tag_malloc(64, Tag::General, &mut src).unwrap();
        let b = z.tag_malloc(64, Tag::General, &mut src).unwrap();
        let c = z.tag_malloc(64, Tag::General, &mut src).unwrap();
        unsafe {
            z.free(Some(a)).unwrap();
            z.free(Some(c)).unwrap();
            let available_before_middle_free = z.available();
            z.free(Some(b)).unwrap();
            assert!(z.available() > available_before_middle_free);
        }
        z.check_heap().unwrap();
    }

    #[test]
    fn double_free_is_fatal() {
        let mut src = HeapRegionSource;
        let mut z = zone(4096, false);
        let p = z.tag_malloc(16, Tag::General, &mut src).unwrap();
        unsafe {
            z.free(Some(p)).unwrap();
            let err = z.free(Some(p)).unwrap_err();
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn tag_malloc_rejects_free_tag() {
        let mut src = HeapRegionSource;
        let mut z = zone(4096, false);
        let err = z.tag_malloc(16, Tag::Free, &mut src).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn growable_zone_acquires_a_fresh_segment_on_demand() {
        let mut src = HeapRegionSource;
        let mut z = zone(256, true);
        // Bigger than the initial segment; only succeeds because the zone
        // is growable and `grow` adds a fresh 2 MiB-rounded segment.
        let p = z.tag_malloc(8192, Tag::General, &mut src).unwrap();
        unsafe {
            *p.as_ptr() = 1;
        }
        assert_eq!(z.total_size() > 256, true);
        z.check_heap().unwrap();
    }

    #[test]
    fn segment_separator_has_a_zero_size_field_and_check_heap_still_passes() {
        let mut src = HeapRegionSource;
        let mut z = zone(256, true);
        let first = z.tag_malloc(8192, Tag::General, &mut src).unwrap();
        let second = z.tag_malloc(4 * 1024 * 1024, Tag::General, &mut src).unwrap();

        let separator = unsafe { (*header_from_payload(first.as_ptr())).prev };
        unsafe {
            assert_eq!((*separator).id, SEPARATOR_ID);
            assert_eq!((*separator).size, 0, "spec §4.1 new_block: separator size is literally 0");
        }
        z.check_heap().unwrap();

        unsafe {
            z.free(Some(first)).unwrap();
            z.free(Some(second)).unwrap();
        }
        z.check_heap().unwrap();
    }

    #[test]
    fn non_growable_zone_reports_out_of_memory_as_fatal() {
        let mut src = HeapRegionSource;
        let mut z = zone(256, false);
        let err = z.tag_malloc(8192, Tag::General, &mut src).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn free_tags_sweeps_only_matching_blocks_including_the_first_block_after_sentinel() {
        let mut src = HeapRegionSource;
        let mut z = zone(4096, false);
        // `a` is the first real block after the sentinel — the edge case
        // spec §9 calls out for the free_tags walk-cursor.
        let a = z.tag_malloc(32, Tag::Pack, &mut src).unwrap();
        let _b = z.tag_malloc(32, Tag::General, &mut src).unwrap();
        let c = z.tag_malloc(32, Tag::Pack, &mut src).unwrap();
        let _d = z.tag_malloc(32, Tag::General, &mut src).unwrap();

        let freed = unsafe { z.free_tags(Tag::Pack).unwrap() };
        assert_eq!(freed, 2);
        z.check_heap().unwrap();

        // both freed pointers' headers must now read Free, not dangling.
        unsafe {
            assert!(matches!((*header_from_payload(a.as_ptr())).tag, Tag::Free));
            assert!(matches!((*header_from_payload(c.as_ptr())).tag, Tag::Free));
        }
    }

    #[test]
    fn free_tags_sweeping_a_run_of_adjacent_matching_blocks_coalesces_without_losing_the_walk() {
        let mut src = HeapRegionSource;
        let mut z = zone(4096, false);
        let _a = z.tag_malloc(32, Tag::Pack, &mut src).unwrap();
        let _b = z.tag_malloc(32, Tag::Pack, &mut src).unwrap();
        let _c = z.tag_malloc(32, Tag::Pack, &mut src).unwrap();
        let _d = z.tag_malloc(32, Tag::General, &mut src).unwrap();

        let freed = unsafe { z.free_tags(Tag::Pack).unwrap() };
        assert_eq!(freed, 3);
        z.check_heap().unwrap();
    }

    #[test]
    fn free_tags_rejects_static() {
        let mut z = zone(4096, false);
        let err = unsafe { z.free_tags(Tag::Static).unwrap_err() };
        assert!(err.is_fatal());
    }

    #[test]
    fn static_blocks_are_never_actually_freed() {
        let mut z = zone(4096, false);
        let p = crate::zone::statics::empty();
        unsafe {
            // Frees must no-op rather than corrupt the shared singleton.
            z.free(Some(p)).unwrap();
            z.free(Some(p)).unwrap();
        }
        assert_eq!(crate::zone::statics::empty(), p);
    }
}
