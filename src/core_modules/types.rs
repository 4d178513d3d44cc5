// THEORY:
// This module is the data model for the whole pipeline: the arena-of-indices
// design spec.md §9 calls for instead of a graph of pointers/reference-counted
// cells. Every cross-structure reference (blob -> barcode, barcode -> blob,
// trajectory -> barcode) is a plain integer or a small `BarcodeIndex` pair,
// scoped to a single frame. This keeps the whole per-video state `Clone`-free
// and `Send`, which is what lets `parallel_pipeline` fan frames out across
// worker tasks without any synchronization inside a single frame's data.
//
// Mirrors `trajognize.init`'s `Barcode`, `Trajectory`, `Conflict`, `MFix`,
// `TrajState` and `BarcodeIndex` definitions (see DESIGN.md).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::f64::consts::PI;

/// The colorid index into the global identity table. Always the canonical
/// key for an individual throughout the pipeline (spec.md §3).
pub type ColoridIndex = usize;

/// A frame-local reference to a barcode: which colorid's list, and which
/// position within that list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BarcodeIndex {
    pub k: ColoridIndex,
    pub i: usize,
}

impl BarcodeIndex {
    pub fn new(k: ColoridIndex, i: usize) -> Self {
        Self { k, i }
    }
}

/// A point in image-pixel coordinates.
pub type Point = (f64, f64);

/// mFix bitmask values. Independent bits, any subset may be set simultaneously
/// except where noted (spec.md §3). Kept as a thin newtype over `u32` rather
/// than pulling in the `bitflags` crate: ten fixed, never-extended bits with
/// no external serialization need don't earn a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MFix(pub u32);

impl MFix {
    pub const FULLFOUND: MFix = MFix(1);
    pub const SHARESID: MFix = MFix(2);
    pub const SHARESBLOB: MFix = MFix(4);
    pub const PARTLYFOUND_FROM_TDIST: MFix = MFix(8);
    pub const DELETED: MFix = MFix(16);
    pub const CHOSEN: MFix = MFix(32);
    pub const FULLNOCLUSTER: MFix = MFix(64);
    pub const CHANGEDID: MFix = MFix(128);
    pub const VIRTUAL: MFix = MFix(256);
    pub const DEBUG: MFix = MFix(512);

    pub const ZERO: MFix = MFix(0);

    pub fn contains(self, bit: MFix) -> bool {
        self.0 & bit.0 != 0
    }

    pub fn set(&mut self, bit: MFix) {
        self.0 |= bit.0;
    }

    pub fn clear(&mut self, bit: MFix) {
        self.0 &= !bit.0;
    }

    /// True once every bit has been cleared: permanent deletion (spec.md §3).
    pub fn is_permanently_deleted(self) -> bool {
        self.0 == 0
    }

    pub fn legend() -> &'static [(&'static str, u32)] {
        &[
            ("FULLFOUND", 1),
            ("SHARESID", 2),
            ("SHARESBLOB", 4),
            ("PARTLYFOUND_FROM_TDIST", 8),
            ("DELETED", 16),
            ("CHOSEN", 32),
            ("FULLNOCLUSTER", 64),
            ("CHANGEDID", 128),
            ("VIRTUAL", 256),
            ("DEBUG", 512),
        ]
    }
}

impl std::ops::BitOr for MFix {
    type Output = MFix;
    fn bitor(self, rhs: MFix) -> MFix {
        MFix(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MFix {
    fn bitor_assign(&mut self, rhs: MFix) {
        self.0 |= rhs.0;
    }
}

/// A single frame's color-blob detection: immutable position/color, mutable
/// back-reference list to every barcode currently using it (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorBlob {
    pub color: u32,
    pub center: Point,
    pub radius: f64,
    pub barcodeindices: Vec<BarcodeIndex>,
}

impl ColorBlob {
    pub fn new(color: u32, center: Point, radius: f64) -> Self {
        Self {
            color,
            center,
            radius,
            barcodeindices: Vec::new(),
        }
    }
}

/// An ellipse marking a region of detected motion (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotionBlob {
    pub center: Point,
    pub axis_a: f64,
    pub axis_b: f64,
    pub orientation: f64,
}

/// A single frame's realization of one identity (spec.md §3). Blob indices
/// name a position in the same frame's `ColorBlob` list, or `None` for a
/// missing/sentinel position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barcode {
    pub center: Point,
    /// Radians, folded to (-pi, pi].
    pub orientation: f64,
    pub mfix: MFix,
    pub blobindices: Vec<Option<usize>>,
}

impl Barcode {
    pub fn new(mchips: usize) -> Self {
        Self {
            center: (0.0, 0.0),
            orientation: 0.0,
            mfix: MFix::ZERO,
            blobindices: vec![None; mchips],
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.mfix.contains(MFix::DELETED)
    }

    pub fn is_permanently_deleted(&self) -> bool {
        self.mfix.is_permanently_deleted()
    }

    pub fn found_count(&self) -> usize {
        self.blobindices.iter().filter(|b| b.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.blobindices.iter().all(|b| b.is_some())
    }

    /// Fold an arbitrary angle (radians) into (-pi, pi].
    pub fn fold_angle(theta: f64) -> f64 {
        let folded = theta.sin().atan2(theta.cos());
        if folded <= -PI { folded + 2.0 * PI } else { folded }
    }
}

/// Possible behavioral states of a trajectory or a conflict (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrajState {
    Deleted,
    Initialized,
    ForcedEnd,
    Chosen,
    ChangedId,
}

/// An ordered run of per-frame barcodes for one identity (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    /// Current colorid index (may differ from the identity under which the
    /// trajectory was originally built; see `change_colorid`).
    pub k: ColoridIndex,
    pub firstframe: u64,
    /// barcodeindices[offset] is the BarcodeIndex at frame firstframe+offset,
    /// or None if that frame has no barcode for this trajectory (should not
    /// happen for a chosen trajectory after finalization; spec.md "Gap
    /// closure" law).
    pub barcodeindices: Vec<Option<BarcodeIndex>>,
    pub colorblob_count: Vec<usize>,
    pub fullfound_count: usize,
    pub fullnocluster_count: usize,
    pub sharesblob_count: usize,
    pub offset_count: i64,
    pub state: TrajState,
}

impl Trajectory {
    pub fn new(firstframe: u64, k: ColoridIndex, mchips: usize) -> Self {
        Self {
            k,
            firstframe,
            barcodeindices: Vec::new(),
            colorblob_count: vec![0; mchips],
            fullfound_count: 0,
            fullnocluster_count: 0,
            sharesblob_count: 0,
            offset_count: 0,
            state: TrajState::Initialized,
        }
    }

    pub fn lastframe(&self) -> u64 {
        self.firstframe + self.barcodeindices.len() as u64 - 1
    }

    pub fn len(&self) -> usize {
        self.barcodeindices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barcodeindices.is_empty()
    }

    pub fn covers_frame(&self, frame: u64) -> bool {
        frame >= self.firstframe && frame <= self.lastframe()
    }
}

/// Conflict type tags (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    Gap,
    Overlap,
    Nub,
}

/// A contiguous span of chosen barcodes exhibiting a problem (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub ctype: ConflictType,
    pub firstframe: u64,
    pub barcodeindices: Vec<BarcodeIndex>,
    pub cwith: Option<HashSet<ColoridIndex>>,
    pub state: TrajState,
}

impl Conflict {
    pub fn new(ctype: ConflictType, firstframe: u64, cwith: Option<HashSet<ColoridIndex>>) -> Self {
        Self {
            ctype,
            firstframe,
            barcodeindices: Vec::new(),
            cwith,
            state: TrajState::Initialized,
        }
    }
}

/// The ordered list of C identities and their fixed-length colorid strings,
/// plus the reverse color-symbol -> integer map (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColoridTable {
    pub strids: Vec<Vec<u32>>,
    pub mchips: usize,
    color_to_int_map: std::collections::HashMap<char, u32>,
    int_to_color_map: std::collections::HashMap<u32, char>,
}

impl ColoridTable {
    /// Build and validate a colorid table. Rejects palindromic colorids and
    /// colorid/reverse collisions (spec.md §3: "the design assumes every
    /// colorid and its reverse are distinct from every other colorid").
    pub fn new(
        strids: Vec<Vec<u32>>,
        color_to_int_map: std::collections::HashMap<char, u32>,
        int_to_color_map: std::collections::HashMap<u32, char>,
    ) -> Result<Self, String> {
        let mchips = strids.first().map(|s| s.len()).unwrap_or(0);
        for s in &strids {
            if s.len() != mchips {
                return Err("all colorids must share the same length (MCHIPS)".to_string());
            }
            let reversed: Vec<u32> = s.iter().rev().copied().collect();
            if *s == reversed {
                return Err(format!("palindromic colorid unsupported: {s:?}"));
            }
        }
        for i in 0..strids.len() {
            let reversed_i: Vec<u32> = strids[i].iter().rev().copied().collect();
            for j in 0..strids.len() {
                if i == j {
                    continue;
                }
                if strids[j] == reversed_i {
                    return Err(format!(
                        "colorid {i} and colorid {j} are reverses of each other"
                    ));
                }
            }
        }
        Ok(Self {
            strids,
            mchips,
            color_to_int_map,
            int_to_color_map,
        })
    }

    pub fn len(&self) -> usize {
        self.strids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strids.is_empty()
    }

    pub fn color_to_int(&self, c: char) -> Option<u32> {
        self.color_to_int_map.get(&c).copied()
    }

    pub fn int_to_color(&self, i: u32) -> Option<char> {
        self.int_to_color_map.get(&i).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mfix_bits_are_independent() {
        let mut m = MFix::ZERO;
        m.set(MFix::FULLFOUND);
        m.set(MFix::CHOSEN);
        assert!(m.contains(MFix::FULLFOUND));
        assert!(m.contains(MFix::CHOSEN));
        assert!(!m.contains(MFix::DELETED));
        m.clear(MFix::FULLFOUND);
        assert!(!m.contains(MFix::FULLFOUND));
        assert!(m.contains(MFix::CHOSEN));
    }

    #[test]
    fn permanent_deletion_is_zero() {
        let mut m = MFix::ZERO;
        m.set(MFix::DELETED);
        assert!(!m.is_permanently_deleted());
        m.clear(MFix::DELETED);
        assert!(m.is_permanently_deleted());
    }

    #[test]
    fn fold_angle_stays_in_range() {
        for i in -10..10 {
            let theta = i as f64 * 1.3;
            let folded = Barcode::fold_angle(theta);
            assert!(folded > -PI - 1e-9 && folded <= PI + 1e-9);
        }
    }

    #[test]
    fn rejects_palindromic_colorid() {
        let r = 0u32;
        let g = 1u32;
        let strids = vec![vec![r, g, r]];
        let result = ColoridTable::new(strids, Default::default(), Default::default());
        assert!(result.is_err());
    }

    #[test]
    fn rejects_reverse_collision() {
        let r = 0u32;
        let g = 1u32;
        let b = 2u32;
        let strids = vec![vec![r, g, b], vec![b, g, r]];
        let result = ColoridTable::new(strids, Default::default(), Default::default());
        assert!(result.is_err());
    }

    #[test]
    fn accepts_distinct_non_palindromic_colorids() {
        let r = 0u32;
        let g = 1u32;
        let b = 2u32;
        let o = 3u32;
        let strids = vec![vec![r, g, b], vec![o, g, b]];
        let result = ColoridTable::new(strids, Default::default(), Default::default());
        assert!(result.is_ok());
    }
}
