//! Compile-time-initialized singleton blocks for `""` and `"0"`..`"9"`
//! (spec §3 "Static-string table", §9 "Static singletons").
//!
//! `tag_malloc` is never involved in producing these — callers fetch them
//! directly through [`empty`]/[`digit`]/[`lookup`]. [`super::Zone::free`]
//! recognizes `Tag::Static` and no-ops, so a caller that cannot tell a
//! static string from a heap one may still free it unconditionally.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::OnceLock;

use super::block::{BlockHeader, HEADER_SIZE, ZONEID};
use crate::tag::Tag;

const DIGIT_COUNT: usize = 10;

struct StaticStrings {
    empty: *mut BlockHeader,
    digits: [*mut BlockHeader; DIGIT_COUNT],
}

// Safety: these blocks are immutable after construction and never freed
// back to any allocator; sharing the raw pointers across threads is sound
// because nothing ever mutates through them.
unsafe impl Send for StaticStrings {}
unsafe impl Sync for StaticStrings {}

fn make_block(bytes: &[u8]) -> *mut BlockHeader {
    // header + bytes + NUL terminator, leaked for the process lifetime.
    let payload_len = bytes.len() + 1;
    let total = HEADER_SIZE + payload_len;
    let mut buf: Vec<u8> = Vec::with_capacity(total);
    buf.resize(total, 0);
    let raw = Box::into_raw(buf.into_boxed_slice()) as *mut u8;
    unsafe {
        let header = raw as *mut BlockHeader;
        std::ptr::write(
            header,
            BlockHeader { prev: header, next: header, size: total, tag: Tag::Static, id: ZONEID },
        );
        let payload = raw.add(HEADER_SIZE);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), payload, bytes.len());
        *payload.add(bytes.len()) = 0;
        header
    }
}

fn table() -> &'static StaticStrings {
    static TABLE: OnceLock<StaticStrings> = OnceLock::new();
    TABLE.get_or_init(|| {
        let digits = std::array::from_fn(|i| make_block(&[b'0' + i as u8]));
        StaticStrings { empty: make_block(b""), digits }
    })
}

fn payload_of(header: *mut BlockHeader) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked((header as *mut u8).add(HEADER_SIZE)) }
}

/// The singleton empty string (`""`).
pub fn empty() -> NonNull<u8> {
    payload_of(table().empty)
}

/// The singleton for a single ASCII digit `'0'..='9'`. Returns `None`
/// outside that range.
pub fn digit(d: u8) -> Option<NonNull<u8>> {
    if d.is_ascii_digit() {
        Some(payload_of(table().digits[(d - b'0') as usize]))
    } else {
        None
    }
}

/// Looks up the singleton for `s` if it is `""` or a single ASCII digit.
pub fn lookup(s: &str) -> Option<NonNull<u8>> {
    if s.is_empty() {
        return Some(empty());
    }
    let bytes = s.as_bytes();
    if bytes.len() == 1 {
        return digit(bytes[0]);
    }
    None
}

#[allow(dead_code)]
const _ASSERT_BLOCK_HEADER_SIZE: () = assert!(size_of::<BlockHeader>() == HEADER_SIZE);
