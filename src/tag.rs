//! Caller-supplied owner tags used for routing and bulk free.

/// An allocation's owner label.
///
/// `Free` is allocator-internal bookkeeping and is rejected from every
/// caller-facing allocation entry point. `Static` is reserved for
/// compile-time singletons (see [`crate::zone::statics`]) and cannot be
/// used in a live `free_tags` sweep. `Small` routes allocations to the
/// small zone; every other tag routes to the main zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Free = 0,
    General,
    Pack,
    SearchPath,
    SearchPack,
    SearchDir,
    Botlib,
    Renderer,
    Clients,
    Small,
    Static,
}

impl Tag {
    /// Whether allocations with this tag live in the small zone rather than
    /// the main zone.
    pub fn routes_to_small_zone(self) -> bool {
        matches!(self, Tag::Small)
    }
}
