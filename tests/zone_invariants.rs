//! Randomized alloc/free/free-tag sequences checked against spec §8's
//! coalescing-closure and used-accounting properties.

use proptest::collection::vec;
use proptest::prelude::*;
use zonehunk::region::HeapRegionSource;
use zonehunk::tag::Tag;
use zonehunk::zone::Zone;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    FreeOldest,
    SweepPack,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..256).prop_map(Op::Alloc),
        Just(Op::FreeOldest),
        Just(Op::SweepPack),
    ]
}

proptest! {
    #[test]
    fn heap_stays_well_formed_under_random_alloc_free_sequences(ops in vec(op_strategy(), 0..200)) {
        let mut src = HeapRegionSource;
        let mut zone = Zone::init("prop", 1 << 16, true, &mut src).unwrap();
        let mut live: Vec<(std::ptr::NonNull<u8>, Tag)> = Vec::new();

        for (i, op) in ops.into_iter().enumerate() {
            match op {
                Op::Alloc(size) => {
                    let tag = if i % 3 == 0 { Tag::Pack } else { Tag::General };
                    if let Ok(p) = zone.tag_malloc(size, tag, &mut src) {
                        live.push((p, tag));
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        let (p, _) = live.remove(0);
                        unsafe { zone.free(Some(p)).unwrap() };
                    }
                }
                Op::SweepPack => {
                    unsafe { zone.free_tags(Tag::Pack).unwrap() };
                    live.retain(|(_, tag)| !matches!(tag, Tag::Pack));
                }
            }
            zone.check_heap().unwrap();
            prop_assert!(zone.used() <= zone.total_size());
        }

        for (p, _) in live {
            unsafe { zone.free(Some(p)).unwrap(); }
        }
        zone.check_heap().unwrap();
        prop_assert_eq!(zone.used(), 0);
    }
}
