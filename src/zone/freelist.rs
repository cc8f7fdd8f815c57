//! Segregated free-list buckets (spec §3/§4.1).
//!
//! The *tiny* bucket is the spec's documented open question; this
//! implementation omits it (see `DESIGN.md`) and folds its payload range
//! into `Small`. Each bucket is a circular, sentinel-terminated intrusive
//! list threaded through [`super::block::FreeNode`] links.

use super::block::{free_node_ptr, BlockHeader, SentinelNode};

pub(crate) const SMALL_MAX_PAYLOAD: usize = 64;
pub(crate) const MEDIUM_MAX_PAYLOAD: usize = 128;

pub(crate) const BUCKET_COUNT: usize = 3;
pub(crate) const BUCKET_SMALL: usize = 0;
pub(crate) const BUCKET_MEDIUM: usize = 1;
pub(crate) const BUCKET_LARGE: usize = 2;

/// Picks the starting bucket for a free block of `payload_len` bytes.
pub(crate) fn bucket_for(payload_len: usize) -> usize {
    if payload_len <= SMALL_MAX_PAYLOAD {
        BUCKET_SMALL
    } else if payload_len <= MEDIUM_MAX_PAYLOAD {
        BUCKET_MEDIUM
    } else {
        BUCKET_LARGE
    }
}

/// Owns the `BUCKET_COUNT` sentinel nodes backing a zone's segregated free
/// lists.
pub(crate) struct FreeLists {
    sentinels: [*mut BlockHeader; BUCKET_COUNT],
}

impl FreeLists {
    pub fn new() -> Self {
        FreeLists {
            sentinels: [
                SentinelNode::new_self_looped(),
                SentinelNode::new_self_looped(),
                SentinelNode::new_self_looped(),
            ],
        }
    }

    pub fn sentinel(&self, bucket: usize) -> *mut BlockHeader {
        self.sentinels[bucket]
    }

    /// Inserts `block` (its `tag` must already be `Free`) at the head of
    /// the bucket matching its payload size.
    ///
    /// # Safety
    /// `block` must be a live, exclusively-owned free block not already on
    /// any free list.
    pub unsafe fn insert(&mut self, block: *mut BlockHeader, payload_len: usize) {
        let bucket = bucket_for(payload_len);
        let sentinel = self.sentinels[bucket];
        let node = free_node_ptr(block);
        let head = (*free_node_ptr(sentinel)).fl_next;

        (*node).fl_prev = sentinel;
        (*node).fl_next = head;
        (*free_node_ptr(sentinel)).fl_next = block;
        (*free_node_ptr(head)).fl_prev = block;
    }

    /// Removes `block` from whichever bucket currently holds it.
    ///
    /// # Safety
    /// `block` must currently be linked into one of this `FreeLists`'
    /// buckets.
    pub unsafe fn remove(&mut self, block: *mut BlockHeader) {
        let node = free_node_ptr(block);
        let prev = (*node).fl_prev;
        let next = (*node).fl_next;
        (*free_node_ptr(prev)).fl_next = next;
        (*free_node_ptr(next)).fl_prev = prev;
        (*node).fl_prev = std::ptr::null_mut();
        (*node).fl_next = std::ptr::null_mut();
    }

    /// Finds the first block in `bucket` whose `size` is `>= needed`,
    /// walking from the sentinel forward (spec §9: forward traversal is the
    /// default).
    ///
    /// # Safety
    /// Every node reachable from `bucket`'s sentinel must be a live free
    /// block.
    pub unsafe fn first_fit(&self, bucket: usize, needed: usize) -> Option<*mut BlockHeader> {
        let sentinel = self.sentinels[bucket];
        let mut cur = (*free_node_ptr(sentinel)).fl_next;
        while cur != sentinel {
            if (*cur).size >= needed {
                return Some(cur);
            }
            cur = (*free_node_ptr(cur)).fl_next;
        }
        None
    }

    /// # Safety
    /// Must be called at most once; reclaims all sentinel allocations.
    pub unsafe fn drop_sentinels(&mut self) {
        for &s in &self.sentinels {
            SentinelNode::reclaim(s);
        }
    }
}

impl Drop for FreeLists {
    fn drop(&mut self) {
        unsafe { self.drop_sentinels() }
    }
}
