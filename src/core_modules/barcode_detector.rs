// THEORY:
// Phase 3: enumerates every straight, correctly-ordered chain of distinct
// blob indices on a frame whose colors match a colorid's sequence, and turns
// each surviving chain into a `FULLFOUND` barcode (spec.md §4.3). Grounded on
// `algo_blob.py` (`find_chains_in_sdistlists` and its recursive helper).
//
// Also hosts `compute_orientation`/`compute_center`, the barcode-geometry
// recomputation shared by every later phase that creates or mutates a
// barcode's blob list (phase 5-7 propagation/reconciliation, phase 9
// `change_colorid`, phase 10 enhancement).

use crate::core_modules::spatial_index::SpatialIndex;
use crate::core_modules::types::{Barcode, ColorBlob, ColoridTable, MFix, Point};
use std::f64::consts::{FRAC_PI_2, PI};

/// Enumerate all full barcodes for every colorid on one frame.
pub fn find_full_barcodes(
    blobs: &[ColorBlob],
    index: &SpatialIndex,
    colorids: &ColoridTable,
    avg_inrat_dist: f64,
) -> Vec<Vec<Barcode>> {
    let mut result: Vec<Vec<Barcode>> = Vec::with_capacity(colorids.len());
    for k in 0..colorids.len() {
        let strid = &colorids.strids[k];
        let mut chains: Vec<Vec<usize>> = Vec::new();
        for (fr, blob) in blobs.iter().enumerate() {
            if blob.color != strid[0] {
                continue;
            }
            let mut path = vec![fr];
            search_chain(blobs, index, strid, &mut path, &mut chains);
        }

        let mut barcodes = Vec::with_capacity(chains.len());
        for chain in chains {
            let positions: Vec<Point> = chain.iter().map(|&bi| blobs[bi].center).collect();
            if !crate::core_modules::geometry::is_blob_chain_appropriate_as_barcode(&positions, None) {
                continue;
            }
            let mut barcode = Barcode::new(strid.len());
            for (p, &bi) in chain.iter().enumerate() {
                barcode.blobindices[p] = Some(bi);
            }
            barcode.mfix.set(MFix::FULLFOUND);
            let (center, orientation) = recompute_geometry(&barcode, blobs, strid.len(), avg_inrat_dist, 0.0);
            barcode.center = center;
            barcode.orientation = orientation;
            barcodes.push(barcode);
        }
        result.push(barcodes);
    }
    result
}

/// Depth-first search over `near[0]` connectivity for a chain matching
/// `strid`. MCHIPS is small (typically 3) so explicit recursion is safe;
/// matches the original's own recursive helper
/// (`find_chains_in_sdistlists_recursively`).
fn search_chain(
    blobs: &[ColorBlob],
    index: &SpatialIndex,
    strid: &[u32],
    path: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    if path.len() == strid.len() {
        out.push(path.clone());
        return;
    }
    let last = *path.last().unwrap();
    let next_pos = path.len();
    for &cand in &index.neighbors[last].close {
        if path.contains(&cand) {
            continue;
        }
        if blobs[cand].color != strid[next_pos] {
            continue;
        }
        path.push(cand);
        search_chain(blobs, index, strid, path, out);
        path.pop();
    }
}

/// Recompute a barcode's (center, orientation) from its current
/// `blobindices`, following spec.md §4.3's orientation formula and
/// center-correction-for-partial-barcodes rule.
pub fn recompute_geometry(
    barcode: &Barcode,
    blobs: &[ColorBlob],
    mchips: usize,
    avg_inrat_dist: f64,
    prev_orientation: f64,
) -> (Point, f64) {
    let present: Vec<(usize, Point)> = barcode
        .blobindices
        .iter()
        .enumerate()
        .filter_map(|(p, bi)| bi.map(|bi| (p, blobs[bi].center)))
        .collect();

    if present.is_empty() {
        return (barcode.center, barcode.orientation);
    }

    let orientation = compute_orientation(&present, prev_orientation);

    let n = present.len();
    let mean_x: f64 = present.iter().map(|(_, p)| p.0).sum::<f64>() / n as f64;
    let mean_y: f64 = present.iter().map(|(_, p)| p.1).sum::<f64>() / n as f64;
    let mut center = (mean_x, mean_y);

    if n < mchips {
        let mid = (mchips as f64 - 1.0) / 2.0;
        let j_mean: f64 = present.iter().map(|(p, _)| *p as f64 - mid).sum::<f64>() / n as f64;
        center.0 += j_mean * avg_inrat_dist * orientation.cos();
        center.1 += j_mean * avg_inrat_dist * orientation.sin();
    }

    (center, orientation)
}

/// Orientation from the last-registered blob toward the first-registered
/// blob, per spec.md §4.3.
pub fn compute_orientation(present: &[(usize, Point)], prev_orientation: f64) -> f64 {
    let n = present.len();
    if n == 0 {
        return prev_orientation;
    }
    if n == 1 {
        // Undefined on a truly isolated first frame; caller seeds
        // prev_orientation with the previous frame's value where available
        // (spec.md §9 open question: frame-0 isolated blob).
        return prev_orientation;
    }

    let first = present[0].1;
    let last = present[n - 1].1;

    if n == 2 {
        let base = (first.1 - last.1).atan2(first.0 - last.0);
        return Barcode::fold_angle(base);
    }

    let mean_x: f64 = present.iter().map(|(_, p)| p.0).sum::<f64>() / n as f64;
    let mean_y: f64 = present.iter().map(|(_, p)| p.1).sum::<f64>() / n as f64;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (_, p) in present {
        let dx = p.0 - mean_x;
        let dy = p.1 - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    let (mut base, primary_is_x) = if sxx > syy {
        (sxy.atan2(sxx), true)
    } else {
        (FRAC_PI_2 - sxy.atan2(syy), false)
    };

    let flip = if primary_is_x { last.0 > first.0 } else { last.1 > first.1 };
    if flip {
        base += PI;
    }
    Barcode::fold_angle(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::ColoridTable;
    use std::collections::HashMap;

    fn rgb_table() -> ColoridTable {
        let r = 0u32;
        let g = 1u32;
        let b = 2u32;
        let mut c2i = HashMap::new();
        c2i.insert('R', r);
        c2i.insert('G', g);
        c2i.insert('B', b);
        let mut i2c = HashMap::new();
        i2c.insert(r, 'R');
        i2c.insert(g, 'G');
        i2c.insert(b, 'B');
        ColoridTable::new(vec![vec![r, g, b]], c2i, i2c).unwrap()
    }

    #[test]
    fn finds_single_straight_barcode() {
        let blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(1, (130.0, 100.0), 5.0),
            ColorBlob::new(2, (160.0, 100.0), 5.0),
        ];
        let idx = SpatialIndex::build(&blobs, 50.0);
        let colorids = rgb_table();
        let result = find_full_barcodes(&blobs, &idx, &colorids, 30.0);
        assert_eq!(result[0].len(), 1);
        let bc = &result[0][0];
        assert!(bc.mfix.contains(MFix::FULLFOUND));
        assert_eq!(bc.blobindices, vec![Some(0), Some(1), Some(2)]);
        assert!((bc.center.0 - 130.0).abs() < 1e-6);
        assert!((bc.center.1 - 100.0).abs() < 1e-6);
        // last blob (B at x=160) is further along +x than first (R at x=100):
        // orientation points from last back to first -> pi (180 deg).
        assert!((bc.orientation - PI).abs() < 1e-6);
    }

    #[test]
    fn no_chain_when_colors_dont_match() {
        let blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(0, (130.0, 100.0), 5.0),
            ColorBlob::new(2, (160.0, 100.0), 5.0),
        ];
        let idx = SpatialIndex::build(&blobs, 50.0);
        let colorids = rgb_table();
        let result = find_full_barcodes(&blobs, &idx, &colorids, 30.0);
        assert!(result[0].is_empty());
    }

    #[test]
    fn rejects_bent_chain() {
        let blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(1, (130.0, 100.0), 5.0),
            ColorBlob::new(2, (130.0, 130.0), 5.0),
        ];
        let idx = SpatialIndex::build(&blobs, 50.0);
        let colorids = rgb_table();
        let result = find_full_barcodes(&blobs, &idx, &colorids, 30.0);
        assert!(result[0].is_empty());
    }
}
