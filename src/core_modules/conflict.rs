// THEORY:
// Phase 10 item 5: scans the finalized chosen-barcode database for residual
// problems and attempts the one kind of automatic repair spec.md describes
// (swapping a shared blob for a nearby free one). Grounded on
// `algo_conflict.py` and spec.md §3 (Conflict) / §4.8 item 5 / §8 scenario 6.

use crate::core_modules::barcode_detector::recompute_geometry;
use crate::core_modules::geometry::{distance, is_blob_chain_appropriate_as_barcode};
use crate::core_modules::settings::ProjectSettings;
use crate::core_modules::types::{
    Barcode, BarcodeIndex, ColorBlob, Conflict, ConflictType, ColoridTable, MFix, Trajectory, TrajState,
};
use std::collections::HashSet;

/// Owns the state the conflict scan/resolve pass reads and mutates.
pub struct ConflictScanner<'a> {
    pub frames: &'a mut Vec<Vec<Vec<Barcode>>>,
    pub blobs: &'a mut Vec<Vec<ColorBlob>>,
    pub trajs: &'a Vec<Vec<Trajectory>>,
    pub colorids: &'a ColoridTable,
    pub settings: &'a ProjectSettings,
}

impl<'a> ConflictScanner<'a> {
    fn num_frames(&self) -> u64 {
        self.frames.len() as u64
    }

    /// Builds the full conflict database (spec.md §4.8 item 5), attempting
    /// to resolve overlap conflicts in place as they're found.
    pub fn create_conflict_database_and_try_resolve(&mut self) -> Vec<(usize, Conflict)> {
        let mut conflicts = Vec::new();
        for k in 0..self.colorids.len() {
            conflicts.extend(self.find_gap_conflicts(k).into_iter().map(|c| (k, c)));
            conflicts.extend(self.find_overlap_conflicts(k).into_iter().map(|c| (k, c)));
            conflicts.extend(self.find_not_used_barcode_conflicts(k).into_iter().map(|c| (k, c)));
        }
        conflicts
    }

    /// Contiguous runs of DEBUG-flagged chosen barcodes for colorid `k`.
    fn find_gap_conflicts(&self, k: usize) -> Vec<Conflict> {
        let mut out = Vec::new();
        let mut run: Vec<BarcodeIndex> = Vec::new();
        let mut run_start = 0u64;
        for f in 0..self.num_frames() {
            let flagged = self.chosen_barcode(k, f).map(|(bi, b)| (bi, b.mfix.contains(MFix::DEBUG)));
            match flagged {
                Some((bi, true)) => {
                    if run.is_empty() {
                        run_start = f;
                    }
                    run.push(bi);
                }
                _ => {
                    if !run.is_empty() {
                        out.push(self.make_conflict(ConflictType::Gap, run_start, std::mem::take(&mut run), None));
                    }
                }
            }
        }
        if !run.is_empty() {
            out.push(self.make_conflict(ConflictType::Gap, run_start, run, None));
        }
        out
    }

    /// Contiguous runs of SHARESBLOB-flagged chosen barcodes for colorid `k`,
    /// attempting the blob-swap resolution at each frame of the run.
    fn find_overlap_conflicts(&mut self, k: usize) -> Vec<Conflict> {
        let mut out = Vec::new();
        let mut run: Vec<BarcodeIndex> = Vec::new();
        let mut run_start = 0u64;
        let mut cwith: HashSet<usize> = HashSet::new();

        for f in 0..self.num_frames() {
            let shares = self.chosen_barcode(k, f).map(|(bi, b)| (bi, b.mfix.contains(MFix::SHARESBLOB)));
            match shares {
                Some((bi, true)) => {
                    if run.is_empty() {
                        run_start = f;
                    }
                    cwith.extend(self.other_colorids_sharing(k, bi, f));
                    let resolved = self.try_resolve_overlap(k, f, bi);
                    if !resolved {
                        run.push(bi);
                    } else if run.is_empty() {
                        run_start = f + 1;
                    }
                }
                _ => {
                    if !run.is_empty() {
                        let mut c = self.make_conflict(ConflictType::Overlap, run_start, std::mem::take(&mut run), Some(cwith.clone()));
                        c.state = TrajState::ChangedId; // "resolved" marker reusing TrajState.
                        out.push(c);
                        cwith.clear();
                    }
                }
            }
        }
        if !run.is_empty() {
            out.push(self.make_conflict(ConflictType::Overlap, run_start, run, Some(cwith)));
        }
        out
    }

    /// Soft-deleted trajectories lying over blobs that no chosen barcode
    /// (of any identity) claims on those frames.
    fn find_not_used_barcode_conflicts(&self, k: usize) -> Vec<Conflict> {
        let mut out = Vec::new();
        for t in &self.trajs[k] {
            if t.state != TrajState::Deleted {
                continue;
            }
            let mut unused_run: Vec<BarcodeIndex> = Vec::new();
            let mut run_start = t.firstframe;
            for (offset, maybe_bi) in t.barcodeindices.iter().enumerate() {
                let frame = t.firstframe + offset as u64;
                let Some(bi) = maybe_bi else { continue };
                let b = &self.frames[frame as usize][bi.k][bi.i];
                let claimed = b.blobindices.iter().flatten().any(|&j| {
                    self.blobs[frame as usize][j]
                        .barcodeindices
                        .iter()
                        .any(|obi| self.is_chosen(*obi, frame))
                });
                let overlaps_chosen_identity = self.chosen_barcode(k, frame).is_some();
                if !claimed && !overlaps_chosen_identity {
                    if unused_run.is_empty() {
                        run_start = frame;
                    }
                    unused_run.push(*bi);
                } else if !unused_run.is_empty() {
                    out.push(self.make_conflict(ConflictType::Nub, run_start, std::mem::take(&mut unused_run), None));
                }
            }
            if !unused_run.is_empty() {
                out.push(self.make_conflict(ConflictType::Nub, run_start, unused_run, None));
            }
        }
        out
    }

    fn is_chosen(&self, bi: BarcodeIndex, frame: u64) -> bool {
        self.frames[frame as usize][bi.k][bi.i].mfix.contains(MFix::CHOSEN)
    }

    fn chosen_barcode(&self, k: usize, frame: u64) -> Option<(BarcodeIndex, &Barcode)> {
        self.frames[frame as usize][k]
            .iter()
            .enumerate()
            .find(|(_, b)| b.mfix.contains(MFix::CHOSEN))
            .map(|(i, b)| (BarcodeIndex::new(k, i), b))
    }

    fn other_colorids_sharing(&self, k: usize, bi: BarcodeIndex, frame: u64) -> Vec<usize> {
        let b = &self.frames[frame as usize][bi.k][bi.i];
        let mut others = HashSet::new();
        for slot in b.blobindices.iter().flatten() {
            for obi in &self.blobs[frame as usize][*slot].barcodeindices {
                if obi.k != k && self.is_chosen(*obi, frame) {
                    others.insert(obi.k);
                }
            }
        }
        others.into_iter().collect()
    }

    /// Attempts to swap a blob shared with another chosen barcode for a
    /// nearby unused blob of the same color lying under where the previous
    /// frame's barcode predicted it, per spec.md §4.8 item 5 / §8 scenario 6.
    fn try_resolve_overlap(&mut self, k: usize, frame: u64, bi: BarcodeIndex) -> bool {
        if frame == 0 {
            return false;
        }
        let prev_frame = frame - 1;
        let Some((_, prev_barcode)) = self.chosen_barcode(k, prev_frame) else { return false };
        let prev_blobindices = prev_barcode.blobindices.clone();
        let mchips = self.colorids.mchips;

        let shared_positions: Vec<usize> = {
            let b = &self.frames[frame as usize][bi.k][bi.i];
            b.blobindices
                .iter()
                .enumerate()
                .filter_map(|(p, slot)| {
                    let j = (*slot)?;
                    let shared = self.blobs[frame as usize][j]
                        .barcodeindices
                        .iter()
                        .any(|obi| *obi != bi && self.is_chosen(*obi, frame));
                    shared.then_some(p)
                })
                .collect()
        };

        for pos in shared_positions {
            let Some(prev_j) = prev_blobindices.get(pos).copied().flatten() else { continue };
            let predicted = self.blobs[prev_frame as usize][prev_j].center;
            let target_color = self.colorids.strids[k][pos];

            let current_j = self.frames[frame as usize][bi.k][bi.i].blobindices[pos];
            let swap_candidate = self.blobs[frame as usize]
                .iter()
                .enumerate()
                .filter(|(j, blob)| {
                    Some(*j) != current_j
                        && blob.color == target_color
                        && blob.barcodeindices.iter().all(|obi| !self.is_chosen(*obi, frame))
                })
                .map(|(j, blob)| (j, distance(blob.center, predicted)))
                .filter(|&(_, d)| d <= self.settings.max_inrat_dist)
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

            let Some((new_j, _)) = swap_candidate else { continue };

            let mut trial = self.frames[frame as usize][bi.k][bi.i].blobindices.clone();
            trial[pos] = Some(new_j);
            if trial.iter().all(|s| s.is_some()) {
                let chain: Vec<_> = trial.iter().map(|s| self.blobs[frame as usize][s.unwrap()].center).collect();
                if !is_blob_chain_appropriate_as_barcode(&chain, Some(self.settings.max_inrat_dist)) {
                    continue;
                }
            }

            if let Some(old_j) = current_j {
                self.blobs[frame as usize][old_j].barcodeindices.retain(|&x| x != bi);
            }
            self.frames[frame as usize][bi.k][bi.i].blobindices[pos] = Some(new_j);
            self.blobs[frame as usize][new_j].barcodeindices.push(bi);

            let (center, orientation) = {
                let b = &self.frames[frame as usize][bi.k][bi.i];
                recompute_geometry(b, &self.blobs[frame as usize], mchips, self.settings.avg_inrat_dist, b.orientation)
            };
            let b = &mut self.frames[frame as usize][bi.k][bi.i];
            b.center = center;
            b.orientation = orientation;
            b.mfix.clear(MFix::SHARESBLOB);
            return true;
        }

        false
    }

    fn make_conflict(&self, ctype: ConflictType, firstframe: u64, indices: Vec<BarcodeIndex>, cwith: Option<HashSet<usize>>) -> Conflict {
        let mut c = Conflict::new(ctype, firstframe, cwith);
        c.barcodeindices = indices;
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::MFix;
    use std::collections::HashMap;

    fn rg_table() -> ColoridTable {
        let mut c2i = HashMap::new();
        c2i.insert('R', 0u32);
        c2i.insert('G', 1u32);
        c2i.insert('O', 2u32);
        let i2c = HashMap::new();
        ColoridTable::new(vec![vec![0, 1], vec![2, 1]], c2i, i2c).unwrap()
    }

    #[test]
    fn overlap_conflict_resolved_by_blob_swap() {
        let colorids = rg_table();
        let settings = ProjectSettings { mchips: 2, ..ProjectSettings::default() };

        // frame 0: both identities fully separate and chosen.
        let mut blobs0 = vec![
            ColorBlob::new(0, (0.0, 0.0), 5.0),
            ColorBlob::new(1, (10.0, 0.0), 5.0),
            ColorBlob::new(2, (100.0, 0.0), 5.0),
            ColorBlob::new(1, (110.0, 0.0), 5.0),
        ];
        let mut b0_rg = Barcode::new(2);
        b0_rg.blobindices = vec![Some(0), Some(1)];
        b0_rg.mfix.set(MFix::FULLFOUND);
        b0_rg.mfix.set(MFix::CHOSEN);
        let mut b0_og = Barcode::new(2);
        b0_og.blobindices = vec![Some(2), Some(3)];
        b0_og.mfix.set(MFix::FULLFOUND);
        b0_og.mfix.set(MFix::CHOSEN);
        blobs0[0].barcodeindices.push(BarcodeIndex::new(0, 0));
        blobs0[1].barcodeindices.push(BarcodeIndex::new(0, 0));
        blobs0[2].barcodeindices.push(BarcodeIndex::new(1, 0));
        blobs0[3].barcodeindices.push(BarcodeIndex::new(1, 0));

        // frame 1: both identities' G blob coincide at the same spot (shared)
        // plus a free extra G blob nearby under the frame-0 prediction.
        let mut blobs1 = vec![
            ColorBlob::new(0, (0.0, 0.0), 5.0),
            ColorBlob::new(1, (10.0, 0.0), 5.0),
            ColorBlob::new(2, (100.0, 0.0), 5.0),
            ColorBlob::new(1, (108.0, 0.0), 5.0), // nearer the frame-0 "110" prediction
        ];
        let mut b1_rg = Barcode::new(2);
        b1_rg.blobindices = vec![Some(0), Some(1)];
        b1_rg.mfix.set(MFix::FULLFOUND);
        b1_rg.mfix.set(MFix::CHOSEN);
        b1_rg.mfix.set(MFix::SHARESBLOB);
        let mut b1_og = Barcode::new(2);
        b1_og.blobindices = vec![Some(2), Some(1)];
        b1_og.mfix.set(MFix::FULLFOUND);
        b1_og.mfix.set(MFix::CHOSEN);
        b1_og.mfix.set(MFix::SHARESBLOB);
        blobs1[0].barcodeindices.push(BarcodeIndex::new(0, 0));
        blobs1[1].barcodeindices.push(BarcodeIndex::new(0, 0));
        blobs1[1].barcodeindices.push(BarcodeIndex::new(1, 0));
        blobs1[2].barcodeindices.push(BarcodeIndex::new(1, 0));

        let mut frames = vec![vec![vec![b0_rg], vec![b0_og]], vec![vec![b1_rg], vec![b1_og]]];
        let mut blobs = vec![blobs0, blobs1];
        let trajs: Vec<Vec<Trajectory>> = vec![Vec::new(), Vec::new()];

        let mut scanner = ConflictScanner {
            frames: &mut frames,
            blobs: &mut blobs,
            trajs: &trajs,
            colorids: &colorids,
            settings: &settings,
        };
        let conflicts = scanner.create_conflict_database_and_try_resolve();

        // The overlap should have been resolved by swapping identity 1's
        // shared G blob for the free one at (108,0); no unresolved overlap
        // conflict should remain.
        assert!(conflicts.iter().all(|(_, c)| c.ctype != ConflictType::Overlap || c.state == TrajState::ChangedId));
        assert!(!frames[1][1][0].mfix.contains(MFix::SHARESBLOB));
        assert_eq!(frames[1][1][0].blobindices[1], Some(3));
    }
}
