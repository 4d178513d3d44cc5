// THEORY:
// Small, pure geometry and statistics helpers shared by every later phase:
// distance, angle, ellipse containment, and the "is this chain of blobs
// straight and correctly ordered enough to be a barcode" check (spec.md
// §4.1). Grounded on `trajognize/algo.py` (`get_distance`, `get_angle_deg`,
// `is_point_inside_ellipse`) and `algo_blob.py`
// (`is_blob_chain_appropriate_as_barcode`). Organized as one small module of
// free functions over plain `Point` tuples, the same shape as the teacher's
// `smart_pixel` comparison toolkit (`core_modules/smart_pixel.rs`).

use crate::core_modules::types::{MotionBlob, Point};
use std::f64::consts::PI;

pub fn distance(a: Point, b: Point) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

/// Angle between two orientations (radians), folded to [0, 180] degrees.
pub fn angle_between_deg(a_orientation: f64, b_orientation: f64) -> f64 {
    let mut angle = a_orientation.to_degrees() - b_orientation.to_degrees();
    while angle < 0.0 {
        angle += 360.0;
    }
    while angle >= 360.0 {
        angle -= 360.0;
    }
    if angle < 180.0 { angle } else { 360.0 - angle }
}

/// True if `point` lies inside `ellipse`, enlarged by `mul` (spec.md §4.1).
/// Does a cheap radial pre-check against the major/minor semi-axes before
/// falling back to the rotated-frame test (grounded on `algo.py`
/// `is_point_inside_ellipse`, which trivially accepts/rejects before the
/// general case).
pub fn is_point_inside_ellipse(point: Point, ellipse: &MotionBlob, mul: f64) -> bool {
    let dx = ellipse.center.0 - point.0;
    let dy = ellipse.center.1 - point.1;
    let d = dx.hypot(dy);
    if d > ellipse.axis_a {
        return false;
    }
    if d < ellipse.axis_b {
        return true;
    }
    let x = dx * ellipse.orientation.cos() - dy * ellipse.orientation.sin();
    let y = dx * ellipse.orientation.sin() + dy * ellipse.orientation.cos();
    x * x / (ellipse.axis_a * ellipse.axis_a) + y * y / (ellipse.axis_b * ellipse.axis_b)
        <= mul * mul
}

/// Validates a length-MCHIPS ordered chain of blob centers as a candidate
/// barcode (spec.md §4.1):
/// 1. (optional) every consecutive pair within `check_distance`.
/// 2. every non-consecutive pair strictly farther apart than either
///    bracketing consecutive pair (straight-line ordering).
/// 3. every interior-vertex angle exceeds 100 degrees (near-straight chain).
pub fn is_blob_chain_appropriate_as_barcode(chain: &[Point], check_distance: Option<f64>) -> bool {
    let n = chain.len();
    if n < 2 {
        return true;
    }

    if let Some(max_d) = check_distance {
        for j in 0..n - 1 {
            if distance(chain[j], chain[j + 1]) > max_d {
                return false;
            }
        }
    }

    if n >= 3 {
        for j in 0..n - 2 {
            for jj in j + 2..n {
                let d12 = distance(chain[j], chain[j + 1]);
                let d1x = distance(chain[j], chain[jj]);
                let d2x = distance(chain[j + 1], chain[jj]);
                if d1x <= d12 || d1x <= d2x {
                    return false;
                }
            }
        }

        for j in 1..n - 1 {
            let v1 = (chain[j - 1].0 - chain[j].0, chain[j - 1].1 - chain[j].1);
            let v2 = (chain[j + 1].0 - chain[j].0, chain[j + 1].1 - chain[j].1);
            let mag = (v1.0.hypot(v1.1)) * (v2.0.hypot(v2.1));
            if mag == 0.0 {
                return false;
            }
            let cos_angle = ((v1.0 * v2.0 + v1.1 * v2.1) / mag).clamp(-1.0, 1.0);
            let angle_deg = cos_angle.acos().to_degrees();
            if angle_deg < 100.0 {
                return false;
            }
        }
    }

    true
}

/// Predicted center of the blob at `position` in an MCHIPS-length barcode,
/// given the barcode's own center/orientation (spec.md §4.3 center-
/// correction formula, reused by `enhance_virtual_barcodes` per
/// SPEC_FULL.md §5; grounded on `algo.py::get_blob_center_on_barcode`).
pub fn predicted_position_at(center: Point, orientation: f64, position: usize, mchips: usize, avg_inrat_dist: f64) -> Point {
    let d = position as f64 - (mchips as f64 - 1.0) / 2.0;
    (
        center.0 + d * avg_inrat_dist * orientation.cos(),
        center.1 + d * avg_inrat_dist * orientation.sin(),
    )
}

/// Welford's online algorithm for numerically stable incremental mean/
/// variance, the Rust equivalent of `algo.py::calculate_running_avg` and the
/// incremental-statistics pattern the teacher's `SmartChunk`/`TrackedBlob`
/// use (see DESIGN.md).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 { 0.0 } else { self.m2 / self.count as f64 }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

pub const TWO_PI: f64 = 2.0 * PI;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::MotionBlob;

    #[test]
    fn distance_is_euclidean() {
        assert!((distance((0.0, 0.0), (3.0, 4.0)) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn angle_between_folds_to_0_180() {
        assert!((angle_between_deg(0.0, PI) - 180.0).abs() < 1e-6);
        assert!((angle_between_deg(0.0, 0.0)).abs() < 1e-6);
    }

    #[test]
    fn ellipse_containment_trivial_cases() {
        let e = MotionBlob {
            center: (0.0, 0.0),
            axis_a: 10.0,
            axis_b: 5.0,
            orientation: 0.0,
        };
        assert!(is_point_inside_ellipse((0.0, 0.0), &e, 1.0));
        assert!(!is_point_inside_ellipse((100.0, 100.0), &e, 1.0));
    }

    #[test]
    fn straight_chain_passes() {
        let chain = [(100.0, 100.0), (130.0, 100.0), (160.0, 100.0)];
        assert!(is_blob_chain_appropriate_as_barcode(&chain, Some(50.0)));
    }

    #[test]
    fn sharp_bend_fails() {
        let chain = [(100.0, 100.0), (130.0, 100.0), (130.0, 101.0)];
        assert!(!is_blob_chain_appropriate_as_barcode(&chain, None));
    }

    #[test]
    fn bad_order_fails() {
        // middle point farther from first than the last point is: violates ordering.
        let chain = [(0.0, 0.0), (200.0, 0.0), (100.0, 0.0)];
        assert!(!is_blob_chain_appropriate_as_barcode(&chain, None));
    }

    #[test]
    fn running_stats_matches_known_values() {
        let mut s = RunningStats::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.push(v);
        }
        assert!((s.mean() - 5.0).abs() < 1e-9);
        assert!((s.variance() - 4.0).abs() < 1e-9);
    }
}
