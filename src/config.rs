//! Engine-tunable sizes recognized at init (`com_hunkMegs`, `com_zoneMegs`).
//!
//! There is no on-disk configuration format (spec §6): these are plain,
//! validated in-process values a host plugs in before calling
//! [`crate::system::System::init`].

pub const SMALL_ZONE_BYTES: usize = 512 * 1024;
pub const DEFAULT_ZONE_MEGS: usize = 12;
pub const DEFAULT_HUNK_MEGS: usize = 56;
pub const MIN_HUNK_MEGS: usize = 48;

/// Sizes for the main zone and the hunk region. The small zone is always a
/// fixed 512 KiB and is not configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub zone_megs: usize,
    pub hunk_megs: usize,
}

impl Config {
    /// Builds a config, clamping `hunk_megs` up to [`MIN_HUNK_MEGS`] and
    /// substituting [`DEFAULT_ZONE_MEGS`] for a zero `zone_megs`.
    pub fn new(zone_megs: usize, hunk_megs: usize) -> Self {
        Config {
            zone_megs: if zone_megs == 0 { DEFAULT_ZONE_MEGS } else { zone_megs },
            hunk_megs: hunk_megs.max(MIN_HUNK_MEGS),
        }
    }

    pub fn zone_bytes(&self) -> usize {
        self.zone_megs * 1024 * 1024
    }

    pub fn hunk_bytes(&self) -> usize {
        self.hunk_megs * 1024 * 1024
    }
}

impl Default for Config {
    fn default() -> Self {
        Config { zone_megs: DEFAULT_ZONE_MEGS, hunk_megs: DEFAULT_HUNK_MEGS }
    }
}
