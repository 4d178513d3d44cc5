// THEORY:
// Phase 9, the largest single stage of the pipeline: globally ranks
// trajectories, commits the best ones as `CHOSEN`, searches for chains of
// lesser trajectories (possibly under other colorids) that connect two
// chosen trajectories, fills the frames in between, and re-labels
// color-mistaken trajectories onto their true identity (spec.md §4.7).
// Grounded on `algo_trajectory.py`'s `find_best_trajectories`,
// `connect_chosen_trajs`, `fill_connection_with_nub`,
// `enhance_virtual_barcodes` and `change_colorid`.

use crate::core_modules::barcode_detector::recompute_geometry;
use crate::core_modules::geometry::distance;
use crate::core_modules::settings::ProjectSettings;
use crate::core_modules::trajectory_builder::score;
use crate::core_modules::types::{Barcode, BarcodeIndex, ColorBlob, ColoridTable, MFix, Trajectory, TrajState};
use std::collections::HashMap;

const CONNECT_DEPTH_LIMIT: u32 = 200;
const NUB_SEARCH_RADIUS: f64 = 10.0;

pub(crate) fn max_allowed_dist_between_trajs(frame_gap: u64, same_color: bool) -> f64 {
    if same_color {
        (50.0 + 5.0 * frame_gap as f64).min(100.0)
    } else {
        50.0
    }
}

/// spec.md §4.7.1's `could_be_another_colorid`: is `x` (of colorid `xk`) a
/// plausible color-mislabeled trajectory of identity `target_k`? Returns the
/// mismatching position and whether the colorid overlap was reversed.
fn could_be_another_colorid(x: &Trajectory, xk: usize, target_k: usize, colorids: &ColoridTable) -> Option<(usize, bool)> {
    if x.k != xk || x.state != TrajState::Deleted {
        return None;
    }
    let mchips = colorids.mchips;
    if mchips < 2 {
        return None;
    }
    let a = &colorids.strids[xk];
    let b = &colorids.strids[target_k];
    let overlap = |other: &[u32]| -> Option<usize> {
        let diffs: Vec<usize> = (0..mchips).filter(|&p| a[p] != other[p]).collect();
        if diffs.len() == 1 { Some(diffs[0]) } else { None }
    };
    let reversed_b: Vec<u32> = b.iter().rev().copied().collect();
    let (mismatch_pos, reversed) = if let Some(p) = overlap(b) {
        (p, false)
    } else if let Some(p) = overlap(&reversed_b) {
        (p, true)
    } else {
        return None;
    };

    let min_count = *x.colorblob_count.iter().min().unwrap_or(&0);
    let least_positions: Vec<usize> = x
        .colorblob_count
        .iter()
        .enumerate()
        .filter(|(_, &c)| c == min_count)
        .map(|(p, _)| p)
        .collect();
    if least_positions.len() == 1 && least_positions[0] == mismatch_pos {
        Some((mismatch_pos, reversed))
    } else {
        None
    }
}

/// Owns the mutable per-video state phase 9 operates over.
pub struct Selector<'a> {
    pub frames: &'a mut Vec<Vec<Vec<Barcode>>>, // [frame][k] -> barcodes
    pub blobs: &'a mut Vec<Vec<ColorBlob>>,     // [frame] -> blobs
    pub trajs: &'a mut Vec<Vec<Trajectory>>,    // [k] -> trajectories
    pub colorids: &'a ColoridTable,
    pub settings: &'a ProjectSettings,
}

impl<'a> Selector<'a> {
    fn mchips(&self) -> usize {
        self.colorids.mchips
    }

    fn barcode_at(&self, bi: BarcodeIndex, frame: u64) -> &Barcode {
        &self.frames[frame as usize][bi.k][bi.i]
    }

    fn last_barcode(&self, k: usize, traj_idx: usize) -> Option<(u64, &Barcode)> {
        let t = &self.trajs[k][traj_idx];
        let offset = t.barcodeindices.iter().rposition(|b| b.is_some())?;
        let bi = t.barcodeindices[offset].unwrap();
        let frame = t.firstframe + offset as u64;
        Some((frame, self.barcode_at(bi, frame)))
    }

    fn first_barcode(&self, k: usize, traj_idx: usize) -> Option<(u64, &Barcode)> {
        let t = &self.trajs[k][traj_idx];
        let offset = t.barcodeindices.iter().position(|b| b.is_some())?;
        let bi = t.barcodeindices[offset].unwrap();
        let frame = t.firstframe + offset as u64;
        Some((frame, self.barcode_at(bi, frame)))
    }

    /// spec.md §4.7 top-level: soft-delete every trajectory of a colorid
    /// whose best score and good-score sum both fall short.
    pub fn soft_delete_bad_colorids(&mut self) {
        let settings = self.settings.find_best_trajectories_settings.clone();
        let mchips = self.mchips();
        let method = self.settings.traj_score_method;
        for k in 0..self.trajs.len() {
            let scores: Vec<f64> = self.trajs[k].iter().map(|t| score(t, mchips, method, false)).collect();
            let best = scores.iter().cloned().fold(f64::MIN, f64::max);
            let good_sum: f64 = scores.iter().filter(|&&s| s > settings.good_score_threshold).sum();
            if best < settings.might_be_bad_score_threshold && good_sum < settings.might_be_bad_sum_good_score_threshold {
                for t in &mut self.trajs[k] {
                    t.state = TrajState::Deleted;
                }
            }
        }
    }

    /// spec.md §4.7 `mark_traj_chosen`.
    fn mark_traj_chosen(&mut self, k: usize, idx: usize) {
        self.trajs[k][idx].state = TrajState::Chosen;
        let (first, last) = (self.trajs[k][idx].firstframe, self.trajs[k][idx].lastframe());
        let chosen_blobs: Vec<(u64, Vec<usize>)> = (first..=last)
            .filter_map(|f| {
                let offset = (f - first) as usize;
                self.trajs[k][idx].barcodeindices[offset].map(|bi| {
                    let b = self.barcode_at(bi, f);
                    (f, b.blobindices.iter().filter_map(|s| *s).collect())
                })
            })
            .collect();

        for other in 0..self.trajs[k].len() {
            if other == idx {
                continue;
            }
            if self.trajs[k][other].state == TrajState::Chosen || self.trajs[k][other].state == TrajState::ChangedId {
                continue;
            }
            let ofirst = self.trajs[k][other].firstframe;
            let olast = self.trajs[k][other].lastframe();
            if olast < first || ofirst > last {
                continue;
            }
            let mut overlaps = false;
            for &(f, ref blobs) in &chosen_blobs {
                if f < ofirst || f > olast {
                    continue;
                }
                let ooffset = (f - ofirst) as usize;
                if let Some(Some(obi)) = self.trajs[k][other].barcodeindices.get(ooffset) {
                    let ob = self.barcode_at(*obi, f);
                    if ob.blobindices.iter().any(|s| s.map(|j| blobs.contains(&j)).unwrap_or(false)) {
                        overlaps = true;
                    }
                }
            }
            if overlaps {
                self.trajs[k][other].state = TrajState::Deleted;
                self.trajs[k][other].offset_count -= 1;
            }
        }
    }

    /// spec.md §4.7.1. Returns the chain of (colorid, trajectory index)
    /// linking `(k, start_idx)` toward `target`, or `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_chosen_trajs(
        &self,
        k: usize,
        start_idx: usize,
        target: Option<(usize, usize)>,
        framelimit: u64,
        extend_mode: bool,
    ) -> Option<Vec<(usize, usize)>> {
        let (start_frame, _) = self.last_barcode(k, start_idx)?;

        let boundary_frame = target
            .and_then(|(tk, ti)| self.first_barcode(tk, ti).map(|(f, _)| f))
            .unwrap_or(start_frame.saturating_add(framelimit));

        let by_start_frame = self.index_trajs_by_start_frame();

        let mut depth = 0u32;
        let mut best_so_far: Option<(Vec<(usize, usize)>, f64)> = None;
        let (mut cur_k, mut cur_idx, mut cur_frame, mut cur_score) = (k, start_idx, start_frame, 0.0f64);

        loop {
            let result = self.search_chain_recursive(
                k,
                cur_k,
                cur_idx,
                cur_frame,
                cur_score,
                boundary_frame,
                &by_start_frame,
                extend_mode,
                &mut depth,
            );
            match result {
                ChainSearchOutcome::Reached(chain, chain_score) => {
                    best_so_far = Some(combine_best(best_so_far, chain, chain_score));
                    break;
                }
                ChainSearchOutcome::DepthLimitHit(partial_chain, partial_score, tail_k, tail_idx, tail_frame, _tail_center) => {
                    best_so_far = Some(combine_best(best_so_far, partial_chain, partial_score));
                    cur_k = tail_k;
                    cur_idx = tail_idx;
                    cur_frame = tail_frame;
                    cur_score = partial_score;
                    depth = 0;
                }
                ChainSearchOutcome::Exhausted => break,
            }
        }

        let (chain, _) = best_so_far?;

        if !extend_mode {
            if let Some((tk, ti)) = target {
                let (tail_k, tail_idx) = chain.last().copied().unwrap_or((k, start_idx));
                let (tail_frame, tail_barcode) = self.last_barcode(tail_k, tail_idx)?;
                let (target_frame, target_first) = self.first_barcode(tk, ti)?;
                let same_color = tail_k == tk;
                let dist = distance(tail_barcode.center, target_first.center);
                let frame_gap = target_frame.saturating_sub(tail_frame);
                if dist > max_allowed_dist_between_trajs(frame_gap, same_color) {
                    return None;
                }
            }
        }

        Some(chain)
    }

    fn index_trajs_by_start_frame(&self) -> HashMap<u64, Vec<(usize, usize)>> {
        let mut map: HashMap<u64, Vec<(usize, usize)>> = HashMap::new();
        for k in 0..self.trajs.len() {
            for (idx, t) in self.trajs[k].iter().enumerate() {
                map.entry(t.firstframe).or_default().push((k, idx));
            }
        }
        map
    }

    #[allow(clippy::too_many_arguments)]
    fn search_chain_recursive(
        &self,
        source_k: usize,
        cur_k: usize,
        cur_idx: usize,
        cur_frame: u64,
        cur_score: f64,
        boundary_frame: u64,
        by_start_frame: &HashMap<u64, Vec<(usize, usize)>>,
        extend_mode: bool,
        depth: &mut u32,
    ) -> ChainSearchOutcome {
        if cur_frame >= boundary_frame {
            return ChainSearchOutcome::Reached(Vec::new(), cur_score);
        }
        if *depth >= CONNECT_DEPTH_LIMIT {
            let (_, cur_barcode) = match self.last_barcode(cur_k, cur_idx) {
                Some(v) => v,
                None => return ChainSearchOutcome::Exhausted,
            };
            return ChainSearchOutcome::DepthLimitHit(Vec::new(), cur_score, cur_k, cur_idx, cur_frame, cur_barcode.center);
        }

        let mut best: Option<(Vec<(usize, usize)>, f64)> = None;
        for f in (cur_frame + 1)..=boundary_frame {
            let Some(candidates) = by_start_frame.get(&f) else { continue };
            for &(xk, xidx) in candidates {
                let x = &self.trajs[xk][xidx];
                let same_color = xk == source_k;
                if same_color {
                    if x.state == TrajState::Chosen || x.state == TrajState::ChangedId {
                        continue;
                    }
                    if !extend_mode && x.state == TrajState::Deleted {
                        continue;
                    }
                } else if could_be_another_colorid(x, xk, source_k, self.colorids).is_none() {
                    continue;
                }

                let Some((_, x_first)) = self.first_barcode(xk, xidx) else { continue };
                let Some((_, cur_barcode)) = self.last_barcode(cur_k, cur_idx) else { continue };
                let dist = distance(cur_barcode.center, x_first.center);
                let limit = max_allowed_dist_between_trajs(f - cur_frame, same_color);
                if dist > limit {
                    continue;
                }

                let link_score = score(x, self.mchips(), self.settings.traj_score_method, !same_color);
                let mut depth_inner = *depth + 1;
                let sub = self.search_chain_recursive(
                    source_k,
                    xk,
                    xidx,
                    f,
                    cur_score + link_score,
                    boundary_frame,
                    by_start_frame,
                    extend_mode,
                    &mut depth_inner,
                );
                match sub {
                    ChainSearchOutcome::Reached(mut tail, total) => {
                        let mut chain = vec![(xk, xidx)];
                        chain.append(&mut tail);
                        best = Some(combine_best(best, chain, total));
                    }
                    ChainSearchOutcome::DepthLimitHit(mut tail, total, tk, ti, tf, tc) => {
                        let mut chain = vec![(xk, xidx)];
                        chain.append(&mut tail);
                        return ChainSearchOutcome::DepthLimitHit(chain, total, tk, ti, tf, tc);
                    }
                    ChainSearchOutcome::Exhausted => continue,
                }
            }
        }

        match best {
            Some((chain, total)) => ChainSearchOutcome::Reached(chain, total),
            // No bridging trajectory exists anywhere in the window; the
            // boundary is still reachable directly (the distance check in
            // the caller gates whether that direct jump is acceptable).
            None => ChainSearchOutcome::Reached(Vec::new(), cur_score),
        }
    }

    /// spec.md §4.7.2: walks `chain`, filling frames between consecutive
    /// elements (and between the chain and its surrounding chosen
    /// trajectories) with an adopted free barcode or a synthesized virtual
    /// one.
    pub fn fill_connection_with_nub(&mut self, k: usize, before_idx: usize, chain: &[(usize, usize)], after_idx: Option<usize>) {
        let mut prev_anchor = before_idx;
        let mut prev_k = k;
        for &(xk, xidx) in chain {
            self.fill_gap(prev_k, prev_anchor, xk, xidx);
            self.trajs[xk][xidx].state = TrajState::Chosen;
            prev_anchor = xidx;
            prev_k = xk;
        }
        if let Some(after) = after_idx {
            self.fill_gap(prev_k, prev_anchor, k, after);
        }
    }

    fn fill_gap(&mut self, ak: usize, a_idx: usize, bk: usize, b_idx: usize) {
        let Some((a_end, a_barcode)) = self.last_barcode(ak, a_idx) else { return };
        let Some((b_start, b_barcode)) = self.first_barcode(bk, b_idx) else { return };
        let (a_center, a_orientation) = (a_barcode.center, a_barcode.orientation);
        let (b_center, b_orientation) = (b_barcode.center, b_barcode.orientation);
        if b_start <= a_end + 1 {
            return;
        }
        let mchips = self.mchips();
        for f in (a_end + 1)..b_start {
            let t_param = (f - a_end) as f64 / (b_start - a_end) as f64;
            let predicted_center = (
                a_center.0 + (b_center.0 - a_center.0) * t_param,
                a_center.1 + (b_center.1 - a_center.1) * t_param,
            );

            // Find a same-colorid barcode whose blobs are entirely free
            // (not claimed by any not-deleted barcode) and close enough to
            // both anchors.
            let candidate = self.frames[f as usize][ak]
                .iter()
                .enumerate()
                .find(|(_, cand)| {
                    !cand.is_permanently_deleted()
                        && !cand.mfix.contains(MFix::CHOSEN)
                        && cand
                            .blobindices
                            .iter()
                            .all(|s| s.map(|j| self.blobs[f as usize][j].barcodeindices.iter().all(|bi| !self.is_not_deleted(*bi, f))).unwrap_or(true))
                        && distance(cand.center, predicted_center) <= NUB_SEARCH_RADIUS.max(distance(a_center, b_center) / 2.0)
                })
                .map(|(i, _)| i);

            if let Some(i) = candidate {
                self.frames[f as usize][ak][i].mfix.clear(MFix::DELETED);
                self.frames[f as usize][ak][i].mfix.set(MFix::CHOSEN);
                let bi = BarcodeIndex::new(ak, i);
                self.trajs[ak][a_idx].barcodeindices.push(Some(bi));
            } else {
                let mut virt = Barcode::new(mchips);
                virt.center = predicted_center;
                virt.orientation = Barcode::fold_angle(a_orientation + fold_delta(a_orientation, b_orientation) * t_param);
                virt.mfix.set(MFix::VIRTUAL);
                virt.mfix.set(MFix::CHOSEN);
                let new_i = self.frames[f as usize][ak].len();
                self.frames[f as usize][ak].push(virt);
                let bi = BarcodeIndex::new(ak, new_i);
                self.trajs[ak][a_idx].barcodeindices.push(Some(bi));
            }
        }
    }

    fn is_not_deleted(&self, bi: BarcodeIndex, frame: u64) -> bool {
        let b = &self.frames[frame as usize][bi.k][bi.i];
        !b.is_permanently_deleted() && !b.is_deleted()
    }

    /// spec.md §4.7.3: fills remaining virtual/partial chosen barcodes from
    /// free barcodes and unused blobs.
    pub fn enhance_virtual_barcodes(&mut self) {
        let mchips = self.mchips();
        let avg_inrat_dist = self.settings.avg_inrat_dist;
        let max_inrat_dist = self.settings.max_inrat_dist;
        for k in 0..self.trajs.len() {
            for idx in 0..self.trajs[k].len() {
                if self.trajs[k][idx].state != TrajState::Chosen {
                    continue;
                }
                let first = self.trajs[k][idx].firstframe;
                let len = self.trajs[k][idx].len();
                for offset in 0..len {
                    let frame = first + offset as u64;
                    let Some(bi) = self.trajs[k][idx].barcodeindices[offset] else { continue };
                    let is_virtual_empty = {
                        let b = &self.frames[frame as usize][bi.k][bi.i];
                        b.mfix.contains(MFix::VIRTUAL) && b.found_count() == 0
                    };
                    if is_virtual_empty {
                        if let Some(donor_i) = self.find_free_same_colorid(frame as usize, k, bi.i) {
                            let donor = self.frames[frame as usize][k][donor_i].clone();
                            let slot = &mut self.frames[frame as usize][bi.k][bi.i];
                            slot.center = donor.center;
                            slot.orientation = donor.orientation;
                            slot.blobindices = donor.blobindices.clone();
                            slot.mfix = donor.mfix;
                            slot.mfix.clear(MFix::DELETED);
                            slot.mfix.set(MFix::CHOSEN);
                            self.frames[frame as usize][k][donor_i].mfix = crate::core_modules::types::MFix::ZERO;
                        }
                        continue;
                    }

                    let needs_fill = {
                        let b = &self.frames[frame as usize][bi.k][bi.i];
                        !b.is_full() && b.found_count() > 0
                    };
                    if needs_fill {
                        self.fill_partial_positions(frame, bi, mchips, avg_inrat_dist, max_inrat_dist);
                    }
                }
            }
        }
    }

    fn find_free_same_colorid(&self, frame: usize, k: usize, exclude: usize) -> Option<usize> {
        self.frames[frame][k].iter().enumerate().position(|(i, b)| {
            i != exclude
                && !b.is_permanently_deleted()
                && !b.mfix.contains(MFix::CHOSEN)
                && b.blobindices.iter().all(|s| s.map(|j| self.blobs[frame][j].barcodeindices.iter().all(|bi| !self.is_not_deleted(*bi, frame as u64))).unwrap_or(true))
        })
    }

    fn fill_partial_positions(&mut self, frame: u64, bi: BarcodeIndex, mchips: usize, avg_inrat_dist: f64, max_inrat_dist: f64) {
        let missing: Vec<usize> = self.frames[frame as usize][bi.k][bi.i]
            .blobindices
            .iter()
            .enumerate()
            .filter_map(|(p, s)| if s.is_none() { Some(p) } else { None })
            .collect();
        for p in missing {
            let target_color = self.colorids.strids[bi.k][p];
            let predicted = {
                let b = &self.frames[frame as usize][bi.k][bi.i];
                crate::core_modules::geometry::predicted_position_at(b.center, b.orientation, p, mchips, avg_inrat_dist)
            };
            let best = self.blobs[frame as usize]
                .iter()
                .enumerate()
                .filter(|(_, blob)| blob.color == target_color && blob.barcodeindices.iter().all(|obi| !self.is_not_deleted(*obi, frame)))
                .map(|(j, blob)| (j, distance(blob.center, predicted)))
                .filter(|&(_, d)| d <= max_inrat_dist)
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            if let Some((j, _)) = best {
                self.frames[frame as usize][bi.k][bi.i].blobindices[p] = Some(j);
                self.blobs[frame as usize][j].barcodeindices.push(bi);
            }
        }
        let (center, orientation) = {
            let b = &self.frames[frame as usize][bi.k][bi.i];
            recompute_geometry(b, &self.blobs[frame as usize], mchips, avg_inrat_dist, b.orientation)
        };
        let b = &mut self.frames[frame as usize][bi.k][bi.i];
        b.center = center;
        b.orientation = orientation;
        if b.is_full() {
            b.mfix.set(MFix::FULLFOUND);
        }
    }

    /// spec.md §4.7.4: re-labels a chain element accepted under a different
    /// colorid than its source onto the destination identity.
    pub fn change_colorid(&mut self, xk: usize, xidx: usize, target_k: usize) -> Option<usize> {
        let (mismatch_pos, reversed) = could_be_another_colorid(&self.trajs[xk][xidx], xk, target_k, self.colorids)?;
        let mchips = self.mchips();
        let first = self.trajs[xk][xidx].firstframe;
        let len = self.trajs[xk][xidx].len();

        let mut new_traj = Trajectory::new(first, target_k, mchips);
        for offset in 0..len {
            let frame = first + offset as u64;
            let Some(old_bi) = self.trajs[xk][xidx].barcodeindices[offset] else {
                new_traj.barcodeindices.push(None);
                continue;
            };
            let old = self.frames[frame as usize][old_bi.k][old_bi.i].clone();

            let mut new_blobindices = vec![None; mchips];
            let mut src_pos = 0usize;
            for dst_pos in 0..mchips {
                if dst_pos == mismatch_pos {
                    continue;
                }
                let read_pos = if reversed { mchips - 1 - src_pos } else { src_pos };
                new_blobindices[dst_pos] = old.blobindices.get(read_pos).copied().flatten();
                src_pos += 1;
            }

            for slot in old.blobindices.iter() {
                if let Some(j) = slot {
                    self.blobs[frame as usize][*j].barcodeindices.retain(|&bi| bi != BarcodeIndex::new(old_bi.k, old_bi.i));
                }
            }
            self.frames[frame as usize][old_bi.k][old_bi.i].mfix = crate::core_modules::types::MFix::ZERO;

            let mut new_barcode = Barcode::new(mchips);
            new_barcode.blobindices = new_blobindices;
            new_barcode.mfix.set(MFix::PARTLYFOUND_FROM_TDIST);
            let (center, orientation) = recompute_geometry(&new_barcode, &self.blobs[frame as usize], mchips, self.settings.avg_inrat_dist, old.orientation);
            new_barcode.center = center;
            new_barcode.orientation = orientation;
            if new_barcode.is_full() {
                new_barcode.mfix.set(MFix::FULLFOUND);
            }

            let new_i = self.frames[frame as usize][target_k].len();
            let new_bi = BarcodeIndex::new(target_k, new_i);
            for slot in new_barcode.blobindices.iter().flatten() {
                self.blobs[frame as usize][*slot].barcodeindices.push(new_bi);
            }
            self.frames[frame as usize][target_k].push(new_barcode);
            new_traj.barcodeindices.push(Some(new_bi));
        }

        self.trajs[xk][xidx].state = TrajState::ChangedId;
        self.trajs[target_k].push(new_traj);
        Some(self.trajs[target_k].len() - 1)
    }

    /// spec.md §4.7 per-color pass's `extend_chosen_trajs`: fixed-point
    /// forward/backward extension of chosen trajectories using same-colorid
    /// candidates until no frame changes.
    pub fn extend_chosen_trajs(&mut self) {
        loop {
            let mut changed = false;
            for k in 0..self.trajs.len() {
                for idx in 0..self.trajs[k].len() {
                    if self.trajs[k][idx].state != TrajState::Chosen {
                        continue;
                    }
                    if self.try_extend_forward(k, idx) {
                        changed = true;
                    }
                    if self.try_extend_backward(k, idx) {
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn try_extend_forward(&mut self, k: usize, idx: usize) -> bool {
        let Some((last_frame, last_barcode)) = self.last_barcode(k, idx) else { return false };
        let next_frame = last_frame + 1;
        if next_frame as usize >= self.frames.len() {
            return false;
        }
        let last_center = last_barcode.center;
        let candidate = self.frames[next_frame as usize][k].iter().enumerate().find(|(_, b)| {
            !b.mfix.contains(MFix::CHOSEN) && distance(b.center, last_center) <= self.settings.max_perframe_dist
        });
        if let Some((i, _)) = candidate {
            self.frames[next_frame as usize][k][i].mfix.clear(MFix::DELETED);
            self.frames[next_frame as usize][k][i].mfix.set(MFix::CHOSEN);
            self.trajs[k][idx].barcodeindices.push(Some(BarcodeIndex::new(k, i)));
            true
        } else {
            false
        }
    }

    fn try_extend_backward(&mut self, k: usize, idx: usize) -> bool {
        let first = self.trajs[k][idx].firstframe;
        if first == 0 {
            return false;
        }
        let prev_frame = first - 1;
        let Some((_, first_barcode)) = self.first_barcode(k, idx) else { return false };
        let first_center = first_barcode.center;
        let candidate = self.frames[prev_frame as usize][k].iter().enumerate().find(|(_, b)| {
            !b.mfix.contains(MFix::CHOSEN) && distance(b.center, first_center) <= self.settings.max_perframe_dist
        });
        if let Some((i, _)) = candidate {
            self.frames[prev_frame as usize][k][i].mfix.clear(MFix::DELETED);
            self.frames[prev_frame as usize][k][i].mfix.set(MFix::CHOSEN);
            self.trajs[k][idx].firstframe = prev_frame;
            self.trajs[k][idx].barcodeindices.insert(0, Some(BarcodeIndex::new(k, i)));
            true
        } else {
            false
        }
    }

    /// Diagnostic (spec.md §4.7 "finalization hook"): one line per chosen
    /// trajectory summarizing its span and score.
    pub fn list_meta_trajs(&self) -> Vec<String> {
        let mchips = self.mchips();
        let method = self.settings.traj_score_method;
        let mut out = Vec::new();
        for k in 0..self.trajs.len() {
            for (idx, t) in self.trajs[k].iter().enumerate() {
                if t.state == TrajState::Chosen {
                    out.push(format!(
                        "k={k} idx={idx} frames=[{},{}] score={:.2}",
                        t.firstframe,
                        t.lastframe(),
                        score(t, mchips, method, false)
                    ));
                }
            }
        }
        out
    }

    /// spec.md §4.7: runs phase 9 end to end -- bad-colorid deletion, the
    /// global pass, the per-color pass, and the virtual-barcode enhancement
    /// that follows it. Returns `list_meta_trajs`'s summary for logging.
    pub fn run(&mut self) -> Vec<String> {
        self.soft_delete_bad_colorids();

        let settings = self.settings.find_best_trajectories_settings.clone();
        self.global_pass(settings.good_for_sure_score_threshold, settings.framelimit);
        self.per_color_pass(settings.good_score_threshold, settings.framelimit);

        let summary = self.list_meta_trajs();
        self.enhance_virtual_barcodes();
        summary
    }

    /// spec.md §4.7 step 1: visits every trajectory across every colorid in
    /// descending score order, choosing those above `threshold` and
    /// connecting each newly-chosen trajectory to any already-chosen
    /// same-colorid neighbor within `framelimit` frames, forward and
    /// backward.
    fn global_pass(&mut self, threshold: f64, framelimit: u64) {
        let mchips = self.mchips();
        let method = self.settings.traj_score_method;

        let mut order: Vec<(usize, usize)> = Vec::new();
        for k in 0..self.trajs.len() {
            for idx in 0..self.trajs[k].len() {
                order.push((k, idx));
            }
        }
        order.sort_by(|&(ak, ai), &(bk, bi)| {
            let sa = score(&self.trajs[ak][ai], mchips, method, false);
            let sb = score(&self.trajs[bk][bi], mchips, method, false);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        for (k, idx) in order {
            self.choose_and_connect(k, idx, threshold, framelimit, mchips, method);
        }
    }

    /// spec.md §4.7 step 2: repeats the choose-and-connect cycle one colorid
    /// at a time (colorids visited in descending total-score order),
    /// recomputing each trajectory's `sharesblob_count` first, then extends
    /// every chosen trajectory outward once more.
    fn per_color_pass(&mut self, threshold: f64, framelimit: u64) {
        let mchips = self.mchips();
        let method = self.settings.traj_score_method;

        let mut colorid_order: Vec<usize> = (0..self.trajs.len()).collect();
        colorid_order.sort_by(|&a, &b| {
            let sum_a: f64 = self.trajs[a].iter().map(|t| score(t, mchips, method, false)).sum();
            let sum_b: f64 = self.trajs[b].iter().map(|t| score(t, mchips, method, false)).sum();
            sum_b.partial_cmp(&sum_a).unwrap_or(std::cmp::Ordering::Equal)
        });

        for k in colorid_order {
            self.recompute_sharesblob_counts(k);

            let mut order: Vec<usize> = (0..self.trajs[k].len()).collect();
            order.sort_by(|&ai, &bi| {
                let sa = score(&self.trajs[k][ai], mchips, method, false);
                let sb = score(&self.trajs[k][bi], mchips, method, false);
                sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
            });

            for idx in order {
                self.choose_and_connect(k, idx, threshold, framelimit, mchips, method);
            }
        }

        self.extend_chosen_trajs();
    }

    fn choose_and_connect(&mut self, k: usize, idx: usize, threshold: f64, framelimit: u64, mchips: usize, method: crate::core_modules::settings::TrajScoreMethod) {
        if self.trajs[k][idx].state != TrajState::Initialized {
            return;
        }
        let s = score(&self.trajs[k][idx], mchips, method, false);
        if s <= threshold + self.trajs[k][idx].offset_count as f64 {
            return;
        }
        self.mark_traj_chosen(k, idx);
        self.connect_to_chosen_neighbor(k, idx, framelimit, true);
        self.connect_to_chosen_neighbor(k, idx, framelimit, false);
    }

    /// Finds the nearest already-chosen same-colorid trajectory within
    /// `framelimit` frames in the given direction, bridges the gap to it via
    /// `connect_chosen_trajs`, translates any different-colorid chain links
    /// onto `k` via `change_colorid`, and fills the bridge with
    /// `fill_connection_with_nub`.
    fn connect_to_chosen_neighbor(&mut self, k: usize, idx: usize, framelimit: u64, forward: bool) {
        let Some(neighbor) = self.find_chosen_neighbor(k, idx, forward, framelimit) else {
            return;
        };

        let (before_k, before_idx, after_idx, chain) = if forward {
            let chain = self.connect_chosen_trajs(k, idx, Some((k, neighbor)), framelimit, false);
            (k, idx, neighbor, chain)
        } else {
            let chain = self.connect_chosen_trajs(k, neighbor, Some((k, idx)), framelimit, false);
            (k, neighbor, idx, chain)
        };

        let Some(chain) = chain else { return };
        let translated = self.translate_chain(before_k, chain);
        self.fill_connection_with_nub(before_k, before_idx, &translated, Some(after_idx));
    }

    fn translate_chain(&mut self, target_k: usize, chain: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
        chain
            .into_iter()
            .map(|(xk, xidx)| {
                if xk == target_k {
                    (xk, xidx)
                } else {
                    match self.change_colorid(xk, xidx, target_k) {
                        Some(new_idx) => (target_k, new_idx),
                        None => (xk, xidx),
                    }
                }
            })
            .collect()
    }

    fn find_chosen_neighbor(&self, k: usize, idx: usize, forward: bool, framelimit: u64) -> Option<usize> {
        let t = &self.trajs[k][idx];
        if forward {
            let start = t.lastframe().saturating_add(1);
            let end = t.lastframe().saturating_add(framelimit);
            (0..self.trajs[k].len())
                .filter(|&oi| oi != idx && self.trajs[k][oi].state == TrajState::Chosen)
                .filter(|&oi| self.trajs[k][oi].firstframe >= start && self.trajs[k][oi].firstframe <= end)
                .min_by_key(|&oi| self.trajs[k][oi].firstframe)
        } else {
            if t.firstframe == 0 {
                return None;
            }
            let end = t.firstframe - 1;
            let start = t.firstframe.saturating_sub(framelimit);
            (0..self.trajs[k].len())
                .filter(|&oi| oi != idx && self.trajs[k][oi].state == TrajState::Chosen)
                .filter(|&oi| self.trajs[k][oi].lastframe() <= end && self.trajs[k][oi].lastframe() >= start)
                .max_by_key(|&oi| self.trajs[k][oi].lastframe())
        }
    }

    /// spec.md §4.7 step 2: re-enumerates pairwise blob shares on every
    /// frame a colorid's trajectories cover.
    fn recompute_sharesblob_counts(&mut self, k: usize) {
        for idx in 0..self.trajs[k].len() {
            let mut count = 0usize;
            let first = self.trajs[k][idx].firstframe;
            for (offset, slot) in self.trajs[k][idx].barcodeindices.clone().iter().enumerate() {
                let Some(bi) = slot else { continue };
                let frame = (first + offset as u64) as usize;
                if self.frames[frame][bi.k][bi.i].mfix.contains(MFix::SHARESBLOB) {
                    count += 1;
                }
            }
            self.trajs[k][idx].sharesblob_count = count;
        }
    }
}

enum ChainSearchOutcome {
    Reached(Vec<(usize, usize)>, f64),
    DepthLimitHit(Vec<(usize, usize)>, f64, usize, usize, u64, crate::core_modules::types::Point),
    Exhausted,
}

fn combine_best(best: Option<(Vec<(usize, usize)>, f64)>, chain: Vec<(usize, usize)>, score: f64) -> (Vec<(usize, usize)>, f64) {
    match best {
        Some((bchain, bscore)) if bscore >= score => (bchain, bscore),
        _ => (chain, score),
    }
}

pub(crate) fn fold_delta(a: f64, b: f64) -> f64 {
    use crate::core_modules::geometry::TWO_PI;
    let mut d = b - a;
    while d > std::f64::consts::PI {
        d -= TWO_PI;
    }
    while d < -std::f64::consts::PI {
        d += TWO_PI;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn could_be_another_colorid_identifies_single_mismatch() {
        let mut c2i = std::collections::HashMap::new();
        c2i.insert('R', 0u32);
        c2i.insert('G', 1u32);
        c2i.insert('P', 2u32);
        c2i.insert('B', 3u32);
        let i2c = std::collections::HashMap::new();
        let colorids = ColoridTable::new(vec![vec![0, 1, 3], vec![0, 1, 2]], c2i, i2c).unwrap();

        let mut x = Trajectory::new(0, 0, 3);
        x.state = TrajState::Deleted;
        x.colorblob_count = vec![10, 10, 2]; // position 2 (B) is least-occurring
        let result = could_be_another_colorid(&x, 0, 1, &colorids);
        assert_eq!(result, Some((2, false)));
    }
}
