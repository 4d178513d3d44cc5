// THEORY:
// Associates each color blob with the motion region (if any) that contains
// it: `mdindices[i]` is the index of the first motion blob whose ellipse
// contains blob `i`, or `-1` (spec.md §4.2). Grounded on
// `algo.py::find_md_under_blobs`.

use crate::core_modules::geometry::is_point_inside_ellipse;
use crate::core_modules::types::{ColorBlob, MotionBlob};

pub fn find_motion_blob_under(color_blobs: &[ColorBlob], motion_blobs: &[MotionBlob]) -> Vec<i64> {
    let mut mdindices = vec![-1i64; color_blobs.len()];
    for (i, blob) in color_blobs.iter().enumerate() {
        for (j, md) in motion_blobs.iter().enumerate() {
            if is_point_inside_ellipse(blob.center, md, 1.2) {
                mdindices[i] = j as i64;
                break;
            }
        }
    }
    mdindices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_inside_motion_ellipse_is_associated() {
        let blobs = vec![ColorBlob::new(0, (10.0, 10.0), 5.0), ColorBlob::new(0, (1000.0, 1000.0), 5.0)];
        let md = vec![MotionBlob {
            center: (10.0, 10.0),
            axis_a: 20.0,
            axis_b: 20.0,
            orientation: 0.0,
        }];
        let result = find_motion_blob_under(&blobs, &md);
        assert_eq!(result[0], 0);
        assert_eq!(result[1], -1);
    }
}
