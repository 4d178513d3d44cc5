// THEORY:
// Phase 10: the last pass over the chosen-trajectory database before
// output. Extends every chosen trajectory outward once more (with a
// doubled search window), fills every remaining per-identity gap --
// including before the first and after the last chosen barcode -- with
// linearly-interpolated virtual barcodes, enhances those (and any
// still-partial chosen barcodes) from free real blobs one more time,
// refreshes the shares flags, and builds the conflict database (spec.md
// §4.8). Grounded on `algo_trajectory.py`'s tail section (`fill_gaps`,
// `add_virtual_barcodes_to_gaps`) and `algo_conflict.py`.

use crate::core_modules::conflict::ConflictScanner;
use crate::core_modules::geometry::distance;
use crate::core_modules::overlap_filter::{refresh_shares_flags, FrameBarcodes};
use crate::core_modules::settings::ProjectSettings;
use crate::core_modules::trajectory_selector::{fold_delta, max_allowed_dist_between_trajs, Selector};
use crate::core_modules::types::{Barcode, BarcodeIndex, ColorBlob, Conflict, ColoridTable, MFix, TrajState, Trajectory};

const DEBUG_GAP_FRAMES: u64 = 25;
const DEBUG_GAP_DIST: f64 = 250.0;

pub struct Finalizer<'a> {
    pub frames: &'a mut Vec<Vec<Vec<Barcode>>>,
    pub blobs: &'a mut Vec<Vec<ColorBlob>>,
    pub trajs: &'a mut Vec<Vec<Trajectory>>,
    pub colorids: &'a ColoridTable,
    pub settings: &'a ProjectSettings,
}

impl<'a> Finalizer<'a> {
    fn selector(&mut self) -> Selector<'_> {
        Selector {
            frames: self.frames,
            blobs: self.blobs,
            trajs: self.trajs,
            colorids: self.colorids,
            settings: self.settings,
        }
    }

    /// Runs phase 10 to completion; returns the conflict database.
    pub fn run(&mut self) -> Vec<(usize, Conflict)> {
        self.selector().extend_chosen_trajs();
        self.selector().extend_chosen_trajs();

        self.add_virtual_barcodes_to_gaps();

        self.selector().enhance_virtual_barcodes();

        for frame in self.frames.iter_mut() {
            let mut fb = FrameBarcodes { by_colorid: frame };
            refresh_shares_flags(&mut fb);
        }

        let mut scanner = ConflictScanner {
            frames: self.frames,
            blobs: self.blobs,
            trajs: self.trajs,
            colorids: self.colorids,
            settings: self.settings,
        };
        scanner.create_conflict_database_and_try_resolve()
    }

    /// spec.md §4.8 item 2: for each colorid, interpolates a VIRTUAL|CHOSEN
    /// barcode into every gap frame between consecutive chosen trajectories,
    /// before the first, and after the last.
    fn add_virtual_barcodes_to_gaps(&mut self) {
        let num_frames = self.frames.len() as u64;
        let mchips = self.colorids.mchips;

        for k in 0..self.trajs.len() {
            let mut chosen: Vec<usize> = (0..self.trajs[k].len())
                .filter(|&idx| self.trajs[k][idx].state == TrajState::Chosen)
                .collect();
            chosen.sort_by_key(|&idx| self.trajs[k][idx].firstframe);
            if chosen.is_empty() {
                continue;
            }

            let first_idx = chosen[0];
            let (first_center, first_orientation) = self.first_chosen_geometry(k, first_idx);
            for f in 0..self.trajs[k][first_idx].firstframe.min(num_frames) {
                self.prepend_virtual(k, first_idx, f, first_center, first_orientation, mchips);
            }

            for w in chosen.windows(2) {
                let (a_idx, b_idx) = (w[0], w[1]);
                self.fill_gap_with_virtual(k, a_idx, b_idx, mchips);
            }

            let last_idx = *chosen.last().unwrap();
            let (last_center, last_orientation) = self.last_chosen_geometry(k, last_idx);
            let last_frame = self.trajs[k][last_idx].lastframe();
            for f in (last_frame + 1)..num_frames {
                self.append_virtual(k, last_idx, f, last_center, last_orientation, mchips);
            }
        }
    }

    fn first_chosen_geometry(&self, k: usize, idx: usize) -> ((f64, f64), f64) {
        let t = &self.trajs[k][idx];
        let bi = t.barcodeindices[0].unwrap();
        let b = &self.frames[t.firstframe as usize][bi.k][bi.i];
        (b.center, b.orientation)
    }

    fn last_chosen_geometry(&self, k: usize, idx: usize) -> ((f64, f64), f64) {
        let t = &self.trajs[k][idx];
        let offset = t.barcodeindices.len() - 1;
        let bi = t.barcodeindices[offset].unwrap();
        let frame = t.firstframe + offset as u64;
        let b = &self.frames[frame as usize][bi.k][bi.i];
        (b.center, b.orientation)
    }

    fn new_virtual(&self, mchips: usize, center: (f64, f64), orientation: f64, debug: bool) -> Barcode {
        let mut v = Barcode::new(mchips);
        v.center = center;
        v.orientation = Barcode::fold_angle(orientation);
        v.mfix.set(MFix::VIRTUAL);
        v.mfix.set(MFix::CHOSEN);
        if debug {
            v.mfix.set(MFix::DEBUG);
        }
        v
    }

    fn prepend_virtual(&mut self, k: usize, traj_idx: usize, frame: u64, center: (f64, f64), orientation: f64, mchips: usize) {
        let debug = self.trajs[k][traj_idx].firstframe > DEBUG_GAP_FRAMES;
        let v = self.new_virtual(mchips, center, orientation, debug);
        let new_i = self.frames[frame as usize][k].len();
        self.frames[frame as usize][k].push(v);
        let t = &mut self.trajs[k][traj_idx];
        t.firstframe = frame.min(t.firstframe);
        t.barcodeindices.insert(0, Some(BarcodeIndex::new(k, new_i)));
    }

    fn append_virtual(&mut self, k: usize, traj_idx: usize, frame: u64, center: (f64, f64), orientation: f64, mchips: usize) {
        let last_frame = self.trajs[k][traj_idx].lastframe();
        let debug = frame - last_frame > DEBUG_GAP_FRAMES;
        let v = self.new_virtual(mchips, center, orientation, debug);
        let new_i = self.frames[frame as usize][k].len();
        self.frames[frame as usize][k].push(v);
        self.trajs[k][traj_idx].barcodeindices.push(Some(BarcodeIndex::new(k, new_i)));
    }

    fn fill_gap_with_virtual(&mut self, k: usize, a_idx: usize, b_idx: usize, mchips: usize) {
        let (a_center, a_orientation) = self.last_chosen_geometry(k, a_idx);
        let a_end_frame = self.trajs[k][a_idx].lastframe();
        let (b_start_center, b_orientation) = self.first_chosen_geometry(k, b_idx);
        let b_start_frame = self.trajs[k][b_idx].firstframe;

        if b_start_frame <= a_end_frame + 1 {
            return;
        }

        let gap = b_start_frame - a_end_frame;
        let gap_dist = distance(a_center, b_start_center);
        let exceeds_allowed = gap_dist > max_allowed_dist_between_trajs(gap, true);
        let exceeds_long_gap = gap > DEBUG_GAP_FRAMES && gap_dist > DEBUG_GAP_DIST;
        let debug = exceeds_allowed || exceeds_long_gap;

        for f in (a_end_frame + 1)..b_start_frame {
            let t_param = (f - a_end_frame) as f64 / gap as f64;
            let center = (
                a_center.0 + (b_start_center.0 - a_center.0) * t_param,
                a_center.1 + (b_start_center.1 - a_center.1) * t_param,
            );
            let orientation = a_orientation + fold_delta(a_orientation, b_orientation) * t_param;
            let v = self.new_virtual(mchips, center, orientation, debug);
            let new_i = self.frames[f as usize][k].len();
            self.frames[f as usize][k].push(v);
            self.trajs[k][a_idx].barcodeindices.push(Some(BarcodeIndex::new(k, new_i)));
        }

        // Splice trajectory b onto a: a now covers through b's lastframe.
        let b_indices = std::mem::take(&mut self.trajs[k][b_idx].barcodeindices);
        self.trajs[k][a_idx].barcodeindices.extend(b_indices);
        self.trajs[k][b_idx].state = TrajState::Deleted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::MFix;
    use std::collections::HashMap;

    fn rgb_table() -> ColoridTable {
        let mut c2i = HashMap::new();
        c2i.insert('R', 0u32);
        c2i.insert('G', 1u32);
        c2i.insert('B', 2u32);
        let i2c = HashMap::new();
        ColoridTable::new(vec![vec![0, 1, 2]], c2i, i2c).unwrap()
    }

    fn full_chosen_barcode(center: (f64, f64)) -> Barcode {
        let mut b = Barcode::new(3);
        b.blobindices = vec![Some(0), Some(1), Some(2)];
        b.center = center;
        b.mfix.set(MFix::FULLFOUND);
        b.mfix.set(MFix::CHOSEN);
        b
    }

    #[test]
    fn gap_closure_fills_every_frame_with_one_chosen_barcode() {
        let colorids = rgb_table();
        let settings = ProjectSettings::default();
        let n = 20usize;
        let mut frames: Vec<Vec<Vec<Barcode>>> = (0..n).map(|_| vec![Vec::new()]).collect();
        let mut blobs: Vec<Vec<ColorBlob>> = (0..n).map(|_| Vec::new()).collect();

        // present on 0..=4 and 15..=19 only, stationary.
        let mut traj_a = Trajectory::new(0, 0, 3);
        for f in 0..5 {
            frames[f][0].push(full_chosen_barcode((130.0, 100.0)));
            traj_a.barcodeindices.push(Some(BarcodeIndex::new(0, 0)));
        }
        traj_a.state = TrajState::Chosen;

        let mut traj_b = Trajectory::new(15, 0, 3);
        for f in 15..20 {
            frames[f][0].push(full_chosen_barcode((130.0, 100.0)));
            traj_b.barcodeindices.push(Some(BarcodeIndex::new(0, 0)));
        }
        traj_b.state = TrajState::Chosen;

        let mut trajs = vec![vec![traj_a, traj_b]];

        let mut finalizer = Finalizer {
            frames: &mut frames,
            blobs: &mut blobs,
            trajs: &mut trajs,
            colorids: &colorids,
            settings: &settings,
        };
        finalizer.run();

        for f in 0..n {
            let chosen_count = frames[f][0].iter().filter(|b| b.mfix.contains(MFix::CHOSEN)).count();
            assert_eq!(chosen_count, 1, "frame {f} should have exactly one chosen barcode");
        }
        for f in 5..15 {
            assert!(frames[f][0].iter().any(|b| b.mfix.contains(MFix::VIRTUAL) && b.mfix.contains(MFix::CHOSEN)));
        }
    }
}
