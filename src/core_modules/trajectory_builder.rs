// THEORY:
// Phase 8: walks the video forward one frame at a time, appending compatible
// barcodes onto trajectories-in-progress, branching a new trajectory
// whenever a frame's barcode doesn't cleanly extend exactly one open
// trajectory (spec.md §4.6). Grounded on `algo_trajectory.py`'s
// frame-by-frame trajectory growth and scoring formulas.

use crate::core_modules::geometry::distance;
use crate::core_modules::settings::TrajScoreMethod;
use crate::core_modules::types::{Barcode, BarcodeIndex, MFix, MotionBlob, Trajectory};
use std::collections::HashMap;

/// Per-barcode motion-ellipse association, used only for the motion-
/// augmented branch of `barcode_fits_to_trajlast`. `None` means the barcode
/// has no blob lying under any motion region.
pub type BarcodeMotion = Option<MotionBlob>;

/// spec.md §4.6's frame-to-frame compatibility test.
pub fn barcode_fits_to_trajlast(
    last: &Barcode,
    last_motion: &BarcodeMotion,
    b: &Barcode,
    b_motion: &BarcodeMotion,
    max_perframe_dist: f64,
    max_perframe_dist_md: f64,
) -> bool {
    let d = distance(last.center, b.center);
    if d <= max_perframe_dist {
        return true;
    }
    if d > max_perframe_dist_md {
        return false;
    }
    if last_motion.is_some() && b_motion.is_some() {
        return true;
    }
    if let Some(ellipse) = last_motion {
        if crate::core_modules::geometry::is_point_inside_ellipse(b.center, ellipse, 1.2) {
            return true;
        }
    }
    if let Some(ellipse) = b_motion {
        if crate::core_modules::geometry::is_point_inside_ellipse(last.center, ellipse, 1.2) {
            return true;
        }
    }
    false
}

struct OpenTraj {
    result_index: usize,
    last_frame: u64,
}

/// Builds every per-colorid trajectory over the whole video (spec.md §4.6).
/// `frames[f][k]` is frame `f`'s not-deleted barcode list for colorid `k`;
/// `motion[f][k][i]` is the matching motion-ellipse association.
pub fn build_trajectories(
    frames: &[Vec<Vec<Barcode>>],
    motion: &[Vec<Vec<BarcodeMotion>>],
    num_colorids: usize,
    mchips: usize,
    max_perframe_dist: f64,
    max_perframe_dist_md: f64,
) -> Vec<Vec<Trajectory>> {
    let mut result: Vec<Vec<Trajectory>> = vec![Vec::new(); num_colorids];
    let mut open: Vec<Vec<OpenTraj>> = (0..num_colorids).map(|_| Vec::new()).collect();

    for (f, frame) in frames.iter().enumerate() {
        let fr = f as u64;
        for k in 0..num_colorids {
            let mut extended_this_frame: HashMap<usize, ()> = HashMap::new();
            let mut still_open: Vec<OpenTraj> = Vec::new();

            for (i, b) in frame[k].iter().enumerate() {
                if b.is_permanently_deleted() || b.is_deleted() {
                    continue;
                }

                if f == 0 {
                    let mut t = Trajectory::new(fr, k, mchips);
                    append_barcode(&mut t, BarcodeIndex::new(k, i), b);
                    result[k].push(t);
                    still_open.push(OpenTraj { result_index: result[k].len() - 1, last_frame: fr });
                    continue;
                }

                let b_motion = &motion[f][k][i];
                let fits: Vec<usize> = open[k]
                    .iter()
                    .enumerate()
                    .filter(|(_, ot)| {
                        if ot.last_frame != fr - 1 {
                            return false;
                        }
                        let last_traj = &result[k][ot.result_index];
                        let Some(last_bi) = last_traj.barcodeindices.last().copied().flatten() else {
                            return false;
                        };
                        let last_barcode = &frames[f - 1][last_bi.k][last_bi.i];
                        let last_motion = &motion[f - 1][last_bi.k][last_bi.i];
                        barcode_fits_to_trajlast(last_barcode, last_motion, b, b_motion, max_perframe_dist, max_perframe_dist_md)
                    })
                    .map(|(idx, _)| idx)
                    .collect();

                let unclaimed_fits: Vec<usize> = fits
                    .into_iter()
                    .filter(|idx| !extended_this_frame.contains_key(idx))
                    .collect();

                if unclaimed_fits.len() == 1 {
                    let open_idx = unclaimed_fits[0];
                    let result_index = open[k][open_idx].result_index;
                    append_barcode(&mut result[k][result_index], BarcodeIndex::new(k, i), b);
                    extended_this_frame.insert(open_idx, ());
                } else {
                    let mut t = Trajectory::new(fr, k, mchips);
                    append_barcode(&mut t, BarcodeIndex::new(k, i), b);
                    result[k].push(t);
                    still_open.push(OpenTraj { result_index: result[k].len() - 1, last_frame: fr });
                }
            }

            for (idx, ot) in open[k].drain(..).enumerate() {
                if extended_this_frame.contains_key(&idx) {
                    still_open.push(OpenTraj { result_index: ot.result_index, last_frame: fr });
                }
            }
            open[k] = still_open;
        }
    }

    result
}

fn append_barcode(t: &mut Trajectory, bi: BarcodeIndex, b: &Barcode) {
    t.barcodeindices.push(Some(bi));
    for (p, slot) in b.blobindices.iter().enumerate() {
        if slot.is_some() {
            t.colorblob_count[p] += 1;
        }
    }
    if b.mfix.contains(MFix::FULLFOUND) {
        t.fullfound_count += 1;
    }
    if b.mfix.contains(MFix::FULLNOCLUSTER) {
        t.fullnocluster_count += 1;
    }
    if b.mfix.contains(MFix::SHARESBLOB) {
        t.sharesblob_count += 1;
    }
}

/// spec.md §4.6's score formula. `cross_identity` selects the variant used
/// when scoring a trajectory built under a different colorid than the one
/// it is being evaluated against (used by the chain search in phase 9).
pub fn score(t: &Trajectory, mchips: usize, method: TrajScoreMethod, cross_identity: bool) -> f64 {
    let colorblob_term = if cross_identity && mchips > 1 {
        let min_count = *t.colorblob_count.iter().min().unwrap_or(&0) as f64;
        let sum: f64 = t.colorblob_count.iter().sum::<usize>() as f64;
        (sum - mchips as f64 * min_count) / (mchips as f64 - 1.0)
    } else {
        t.colorblob_count.iter().sum::<usize>() as f64
    };

    let quality_term = (t.fullfound_count as f64 - t.sharesblob_count as f64 + 2.0 * t.fullnocluster_count as f64) / 3.0;

    match method {
        TrajScoreMethod::Method1 => t.len() as f64 + colorblob_term + quality_term + t.offset_count as f64,
        TrajScoreMethod::Method2 => (quality_term + t.offset_count as f64).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::Barcode;

    fn full_barcode(center: (f64, f64)) -> Barcode {
        let mut b = Barcode::new(3);
        b.blobindices = vec![Some(0), Some(1), Some(2)];
        b.center = center;
        b.mfix.set(MFix::FULLFOUND);
        b
    }

    #[test]
    fn single_stationary_chain_forms_one_trajectory() {
        let frames: Vec<Vec<Vec<Barcode>>> = (0..5).map(|_| vec![vec![full_barcode((130.0, 100.0))]]).collect();
        let motion: Vec<Vec<Vec<BarcodeMotion>>> = (0..5).map(|_| vec![vec![None]]).collect();
        let trajs = build_trajectories(&frames, &motion, 1, 3, 20.0, 60.0);
        assert_eq!(trajs[0].len(), 1);
        assert_eq!(trajs[0][0].len(), 5);
        assert_eq!(trajs[0][0].firstframe, 0);
        assert_eq!(trajs[0][0].lastframe(), 4);
    }

    #[test]
    fn far_jump_breaks_into_two_trajectories() {
        let mut frames: Vec<Vec<Vec<Barcode>>> = Vec::new();
        frames.push(vec![vec![full_barcode((0.0, 0.0))]]);
        frames.push(vec![vec![full_barcode((5000.0, 5000.0))]]);
        let motion: Vec<Vec<Vec<BarcodeMotion>>> = (0..2).map(|_| vec![vec![None]]).collect();
        let trajs = build_trajectories(&frames, &motion, 1, 3, 20.0, 60.0);
        assert_eq!(trajs[0].len(), 2);
    }

    #[test]
    fn score_method1_includes_length_and_colorblob_sum() {
        let mut t = Trajectory::new(0, 0, 3);
        t.barcodeindices.push(Some(BarcodeIndex::new(0, 0)));
        t.colorblob_count = vec![1, 1, 1];
        t.fullfound_count = 1;
        let s = score(&t, 3, TrajScoreMethod::Method1, false);
        assert!((s - (1.0 + 3.0 + 1.0 / 3.0)).abs() < 1e-9);
    }
}
