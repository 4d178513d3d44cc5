// THEORY:
// Per-frame-pair temporal index: for each current-frame blob, the set of
// previous-frame blobs of the same color that are close enough (spatially or
// via motion-blob overlap) to plausibly be the same physical dot one frame
// later (spec.md §4.2). Grounded on `algo_blob.py::create_temporal_distlists`.

use crate::core_modules::geometry::{distance, is_point_inside_ellipse};
use crate::core_modules::types::{ColorBlob, MotionBlob};

pub fn create_temporal_distlist(
    prev_blobs: &[ColorBlob],
    blobs: &[ColorBlob],
    prev_md_blobs: &[MotionBlob],
    md_blobs: &[MotionBlob],
    prev_mdindices: &[i64],
    mdindices: &[i64],
    max_perframe_dist: f64,
    max_perframe_dist_md: f64,
) -> Vec<Vec<usize>> {
    let n = blobs.len();
    let m = prev_blobs.len();
    let mut tdistlists = vec![Vec::new(); n];

    for i in 0..n {
        for j in 0..m {
            if blobs[i].color != prev_blobs[j].color {
                continue;
            }
            let d = distance(blobs[i].center, prev_blobs[j].center);
            if d <= max_perframe_dist {
                tdistlists[i].push(j);
                continue;
            }
            if d > max_perframe_dist_md {
                continue;
            }
            let cur_md = mdindices[i];
            let prev_md = prev_mdindices[j];
            if cur_md > -1 && prev_md > -1 {
                tdistlists[i].push(j);
            } else if cur_md > -1
                && prev_md == -1
                && is_point_inside_ellipse(prev_blobs[j].center, &md_blobs[cur_md as usize], 1.2)
            {
                tdistlists[i].push(j);
            } else if cur_md == -1
                && prev_md > -1
                && is_point_inside_ellipse(blobs[i].center, &prev_md_blobs[prev_md as usize], 1.2)
            {
                tdistlists[i].push(j);
            }
        }
    }

    tdistlists
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_same_color_close_blobs() {
        let prev = vec![ColorBlob::new(0, (100.0, 100.0), 5.0)];
        let cur = vec![ColorBlob::new(0, (105.0, 100.0), 5.0), ColorBlob::new(1, (105.0, 100.0), 5.0)];
        let result = create_temporal_distlist(&prev, &cur, &[], &[], &[-1], &[-1, -1], 20.0, 60.0);
        assert_eq!(result[0], vec![0]);
        assert!(result[1].is_empty());
    }

    #[test]
    fn motion_augmented_match_requires_md_overlap() {
        let prev = vec![ColorBlob::new(0, (0.0, 0.0), 5.0)];
        let cur = vec![ColorBlob::new(0, (40.0, 0.0), 5.0)];
        // too far for static threshold, no motion blobs at all => no match
        let result = create_temporal_distlist(&prev, &cur, &[], &[], &[-1], &[-1], 20.0, 60.0);
        assert!(result[0].is_empty());

        let md = vec![MotionBlob { center: (20.0, 0.0), axis_a: 30.0, axis_b: 30.0, orientation: 0.0 }];
        let result2 = create_temporal_distlist(&prev, &cur, &[], &md, &[-1], &[0], 20.0, 60.0);
        assert_eq!(result2[0], vec![0]);
    }
}
