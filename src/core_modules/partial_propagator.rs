// THEORY:
// Phases 5-6: extends identities into frames where the full-barcode detector
// found nothing, using temporal-index evidence from the previous frame
// (forward pass) or next frame (backward pass), then recovers leftover
// "stranded" blob clusters by searching neighboring frames for a plausible
// owner (spec.md §4.5). Grounded on `algo_blob.py`'s missing-blob recovery
// helpers (`find_missing_unused_blob`, `get_not_used_blob_indices`,
// `update_blob_barcodeindices`).

use crate::core_modules::barcode_detector::recompute_geometry;
use crate::core_modules::geometry::{distance, is_blob_chain_appropriate_as_barcode, is_point_inside_ellipse};
use crate::core_modules::spatial_index::SpatialIndex;
use crate::core_modules::types::{Barcode, BarcodeIndex, ColorBlob, ColoridTable, MFix, MotionBlob, Point};
use std::collections::HashSet;

const GROUPING_RADIUS: f64 = 10.0;
const DEDUP_RADIUS: f64 = 10.0;

struct Tentative {
    k: usize,
    center: Point,
    orientation: f64,
    blobindices: Vec<Option<usize>>,
}

/// Step 1: one tentative seed per (unused current blob, previous-frame
/// barcode containing a temporally-linked blob).
fn seed_tentatives(
    prev_by_colorid: &[Vec<Barcode>],
    cur_blobs: &[ColorBlob],
    tdist: &[Vec<usize>],
    used: &HashSet<usize>,
    mchips: usize,
) -> Vec<Tentative> {
    let mut out = Vec::new();
    for (i, _blob) in cur_blobs.iter().enumerate() {
        if used.contains(&i) {
            continue;
        }
        for &j in &tdist[i] {
            for (k, list) in prev_by_colorid.iter().enumerate() {
                for b in list {
                    if b.is_permanently_deleted() || b.is_deleted() {
                        continue;
                    }
                    if let Some(p) = b.blobindices.iter().position(|&s| s == Some(j)) {
                        let mut blobindices = vec![None; mchips];
                        blobindices[p] = Some(i);
                        out.push(Tentative {
                            k,
                            center: b.center,
                            orientation: b.orientation,
                            blobindices,
                        });
                    }
                }
            }
        }
    }
    out
}

/// Step 2: aggregate tentatives of the same colorid within `GROUPING_RADIUS`
/// of one another. On overlap, keep the blob closer to the group's anchor
/// center.
fn group_tentatives(tentatives: Vec<Tentative>, cur_blobs: &[ColorBlob]) -> Vec<Tentative> {
    let mut groups: Vec<Tentative> = Vec::new();
    for t in tentatives {
        let existing = groups
            .iter()
            .position(|g| g.k == t.k && distance(g.center, t.center) <= GROUPING_RADIUS);
        match existing {
            None => groups.push(t),
            Some(gi) => {
                let anchor = groups[gi].center;
                for (p, slot) in t.blobindices.iter().enumerate() {
                    if let Some(new_j) = slot {
                        match groups[gi].blobindices[p] {
                            None => groups[gi].blobindices[p] = Some(*new_j),
                            Some(old_j) => {
                                let d_old = distance(cur_blobs[old_j].center, anchor);
                                let d_new = distance(cur_blobs[*new_j].center, anchor);
                                if d_new < d_old {
                                    groups[gi].blobindices[p] = Some(*new_j);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    groups
}

/// Step 3: for each still-missing position, search `near[0]` of an adjacent
/// present position (or `near[1]` when the nearest present position is more
/// than one chip away), filtered by color and availability.
fn missing_blob_candidates(
    tentative: &Tentative,
    position: usize,
    cur_blobs: &[ColorBlob],
    index: &SpatialIndex,
    colorids: &ColoridTable,
    used: &HashSet<usize>,
) -> Vec<usize> {
    let target_color = colorids.strids[tentative.k][position];
    let mut candidates: HashSet<usize> = HashSet::new();
    for (q, slot) in tentative.blobindices.iter().enumerate() {
        let Some(bq) = slot else { continue };
        let gap = (position as i64 - q as i64).unsigned_abs() as usize;
        let neigh = if gap == 1 { &index.neighbors[*bq].close } else { &index.neighbors[*bq].second_close };
        for &cand in neigh {
            if used.contains(&cand) {
                continue;
            }
            if cur_blobs[cand].color != target_color {
                continue;
            }
            candidates.insert(cand);
        }
    }
    let mut v: Vec<usize> = candidates.into_iter().collect();
    v.sort_unstable();
    v
}

/// Ellipse fallback for a missing position with no `near` candidates
/// (spec.md §4.5 step 3, final sentence).
fn ellipse_fallback_candidate(
    tentative: &Tentative,
    position: usize,
    cur_blobs: &[ColorBlob],
    colorids: &ColoridTable,
    used: &HashSet<usize>,
    mchips: usize,
    max_inrat_dist: f64,
) -> Option<usize> {
    let target_color = colorids.strids[tentative.k][position];
    let ellipse = MotionBlob {
        center: tentative.center,
        axis_a: mchips as f64 * max_inrat_dist / 2.0,
        axis_b: max_inrat_dist / 2.0,
        orientation: tentative.orientation,
    };
    let mut best: Option<(usize, f64)> = None;
    for (j, blob) in cur_blobs.iter().enumerate() {
        if used.contains(&j) || blob.color != target_color {
            continue;
        }
        if !is_point_inside_ellipse(blob.center, &ellipse, 1.0) {
            continue;
        }
        let d = distance(blob.center, tentative.center);
        if best.map(|(_, bd)| d < bd).unwrap_or(true) {
            best = Some((j, d));
        }
    }
    best.map(|(j, _)| j)
}

fn recover_missing_blobs(
    tentative: &mut Tentative,
    cur_blobs: &[ColorBlob],
    index: &SpatialIndex,
    colorids: &ColoridTable,
    used: &HashSet<usize>,
    mchips: usize,
    max_inrat_dist: f64,
) {
    let missing: Vec<usize> = tentative
        .blobindices
        .iter()
        .enumerate()
        .filter_map(|(p, s)| if s.is_none() { Some(p) } else { None })
        .collect();
    if missing.is_empty() {
        return;
    }

    let per_position: Vec<Vec<usize>> = missing
        .iter()
        .map(|&p| missing_blob_candidates(tentative, p, cur_blobs, index, colorids, used))
        .collect();

    if per_position.iter().all(|c| !c.is_empty()) {
        let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
        for cands in &per_position {
            let mut next = Vec::new();
            for combo in &combos {
                for &c in cands {
                    let mut nc = combo.clone();
                    nc.push(c);
                    next.push(nc);
                }
            }
            combos = next;
        }

        let mut valid_combos: Vec<Vec<usize>> = Vec::new();
        for combo in combos {
            let mut trial = tentative.blobindices.clone();
            for (idx, &p) in missing.iter().enumerate() {
                trial[p] = Some(combo[idx]);
            }
            let chain: Vec<Point> = trial.iter().filter_map(|s| s.map(|j| cur_blobs[j].center)).collect();
            if is_blob_chain_appropriate_as_barcode(&chain, None) {
                valid_combos.push(combo);
            }
        }

        if !valid_combos.is_empty() {
            if valid_combos.len() > 1 {
                tracing::warn!(
                    count = valid_combos.len(),
                    "multiple equally-good missing-blob completions; choosing the first deterministically"
                );
            }
            for (idx, &p) in missing.iter().enumerate() {
                tentative.blobindices[p] = Some(valid_combos[0][idx]);
            }
        }
        return;
    }

    // Some position has no near-graph candidate at all: fall back to the
    // ellipse search, position by position.
    for &p in &missing {
        if tentative.blobindices[p].is_some() {
            continue;
        }
        if let Some(j) = ellipse_fallback_candidate(tentative, p, cur_blobs, colorids, used, mchips, max_inrat_dist) {
            tentative.blobindices[p] = Some(j);
        }
    }
}

/// Runs one direction (forward or backward) of partial-barcode propagation
/// for a single frame transition. `used` should initially contain every
/// blob already claimed by a not-deleted barcode on the current frame; it is
/// updated in place as tentatives are finalized.
pub fn propagate_one_frame(
    prev_by_colorid: &[Vec<Barcode>],
    cur_blobs: &mut [ColorBlob],
    cur_by_colorid: &mut [Vec<Barcode>],
    cur_index: &SpatialIndex,
    tdist: &[Vec<usize>],
    colorids: &ColoridTable,
    used: &mut HashSet<usize>,
    mchips: usize,
    max_inrat_dist: f64,
    avg_inrat_dist: f64,
) {
    let seeded = seed_tentatives(prev_by_colorid, cur_blobs, tdist, used, mchips);
    let mut grouped = group_tentatives(seeded, cur_blobs);

    for t in &mut grouped {
        recover_missing_blobs(t, cur_blobs, cur_index, colorids, used, mchips, max_inrat_dist);
    }

    for t in grouped {
        // Step 4: dedup against an existing (possibly soft-deleted) barcode
        // of the same colorid within DEDUP_RADIUS: undelete it instead of
        // inserting the tentative, trusting its existing blob assignment.
        let existing = cur_by_colorid[t.k]
            .iter()
            .position(|b| !b.is_permanently_deleted() && distance(b.center, t.center) <= DEDUP_RADIUS);

        if let Some(ei) = existing {
            cur_by_colorid[t.k][ei].mfix.clear(MFix::DELETED);
            for slot in cur_by_colorid[t.k][ei].blobindices.iter().flatten() {
                used.insert(*slot);
            }
            continue;
        }

        if t.blobindices.iter().all(|s| s.is_none()) {
            continue;
        }

        let mut barcode = Barcode::new(mchips);
        barcode.blobindices = t.blobindices.clone();
        barcode.mfix.set(MFix::PARTLYFOUND_FROM_TDIST);
        let (center, orientation) = recompute_geometry(&barcode, cur_blobs, mchips, avg_inrat_dist, t.orientation);
        barcode.center = center;
        barcode.orientation = orientation;
        if barcode.is_full() {
            barcode.mfix.set(MFix::FULLFOUND);
        }

        let new_index = cur_by_colorid[t.k].len();
        let bi = BarcodeIndex::new(t.k, new_index);
        for slot in barcode.blobindices.iter().flatten() {
            cur_blobs[*slot].barcodeindices.push(bi);
            used.insert(*slot);
        }
        cur_by_colorid[t.k].push(barcode);
    }
}

/// A single candidate barcode snapshot from a nearby already-processed
/// frame, used by `recover_stranded_cluster`'s search window.
#[derive(Debug, Clone, Copy)]
pub struct CandidateBarcode {
    pub k: usize,
    pub center: Point,
    pub found_count: usize,
    pub has_motion: bool,
}

/// Step 5: recovers a blob cluster that no colorid claimed. Walks outward
/// (searching both `+step` and `-step` from the stranded frame, the caller's
/// `frame_at` accepting either sign) up to `maxskip` frames looking for the
/// nearest plausible owner among `candidate_colorids` within
/// `max_perframe_dist_md` of `cluster_center`, preferring a match with at
/// least two blobs or a motion-blob association over a closer-but-thinner
/// one (spec.md §4.5 step 5).
pub fn recover_stranded_cluster(
    cluster_center: Point,
    candidate_colorids: &[usize],
    maxskip: i64,
    max_perframe_dist_md: f64,
    mut frame_at: impl FnMut(i64) -> Option<Vec<CandidateBarcode>>,
) -> Option<usize> {
    let mut best: Option<(usize, f64, bool)> = None; // (k, dist, preferred)
    for step in 1..=maxskip {
        for offset in [step, -step] {
            let Some(barcodes) = frame_at(offset) else { continue };
            for cb in barcodes {
                if !candidate_colorids.contains(&cb.k) {
                    continue;
                }
                let d = distance(cb.center, cluster_center);
                if d > max_perframe_dist_md {
                    continue;
                }
                let preferred = cb.found_count >= 2 || cb.has_motion;
                let better = match best {
                    None => true,
                    Some((_, bd, bp)) => match (preferred, bp) {
                        (true, false) => true,
                        (false, true) => false,
                        _ => d < bd,
                    },
                };
                if better {
                    best = Some((cb.k, d, preferred));
                }
            }
        }
        if best.is_some() {
            break;
        }
    }
    best.map(|(k, ..)| k)
}

/// A stranded blob cluster: left over after seeding/grouping/dedup because
/// no previous- or next-frame barcode matched any of its blobs, but it still
/// forms a plausible (distinct-colored, <= MCHIPS) partial barcode shape.
struct StrandedCluster {
    blob_indices: Vec<usize>,
    center: Point,
}

/// Connected components of the still-unused blobs, reusing the close-neighbor
/// relation already computed for the frame (spec.md §4.5 step 5: "re-clustered
/// via a local spatial index").
fn find_stranded_clusters(cur_blobs: &[ColorBlob], index: &SpatialIndex, used: &HashSet<usize>, mchips: usize) -> Vec<StrandedCluster> {
    let num_blobs = cur_blobs.len();
    let mut visited = vec![false; num_blobs];
    let mut out = Vec::new();
    for start in 0..num_blobs {
        if visited[start] || used.contains(&start) {
            continue;
        }
        let mut members = Vec::new();
        let mut queue = vec![start];
        visited[start] = true;
        while let Some(cur) = queue.pop() {
            members.push(cur);
            for &j in &index.neighbors[cur].close {
                if !visited[j] && !used.contains(&j) {
                    visited[j] = true;
                    queue.push(j);
                }
            }
        }
        if members.len() > mchips {
            continue;
        }
        let mut colors: HashSet<u32> = HashSet::new();
        if !members.iter().all(|&j| colors.insert(cur_blobs[j].color)) {
            continue;
        }
        let n = members.len() as f64;
        let cx = members.iter().map(|&j| cur_blobs[j].center.0).sum::<f64>() / n;
        let cy = members.iter().map(|&j| cur_blobs[j].center.1).sum::<f64>() / n;
        out.push(StrandedCluster { blob_indices: members, center: (cx, cy) });
    }
    out
}

/// Step 5's driver: finds every stranded cluster on the current frame and, for
/// each, picks candidate colorids (those whose strid is a superset of the
/// cluster's colors and with no existing non-deleted barcode already near the
/// cluster) before searching outward via `search_frame` for the adopted
/// identity. Assigns the cluster's blobs to that colorid's matching strid
/// positions and inserts a new `PARTLYFOUND_FROM_TDIST` barcode.
#[allow(clippy::too_many_arguments)]
pub fn recover_stranded_clusters(
    cur_blobs: &mut [ColorBlob],
    cur_by_colorid: &mut [Vec<Barcode>],
    cur_index: &SpatialIndex,
    used: &mut HashSet<usize>,
    colorids: &ColoridTable,
    mchips: usize,
    avg_inrat_dist: f64,
    maxskip: i64,
    max_perframe_dist_md: f64,
    mut search_frame: impl FnMut(i64) -> Option<Vec<CandidateBarcode>>,
) {
    const NEARBY_OWNER_RADIUS: f64 = 200.0;

    let clusters = find_stranded_clusters(cur_blobs, cur_index, used, mchips);
    for cluster in clusters {
        let color_set: HashSet<u32> = cluster.blob_indices.iter().map(|&j| cur_blobs[j].color).collect();

        let candidates: Vec<usize> = (0..colorids.len())
            .filter(|&k| {
                let strid_colors: HashSet<u32> = colorids.strids[k].iter().copied().collect();
                if !color_set.is_subset(&strid_colors) {
                    return false;
                }
                !cur_by_colorid[k]
                    .iter()
                    .any(|b| !b.is_permanently_deleted() && distance(b.center, cluster.center) <= NEARBY_OWNER_RADIUS)
            })
            .collect();
        if candidates.is_empty() {
            continue;
        }

        let Some(k) = recover_stranded_cluster(cluster.center, &candidates, maxskip, max_perframe_dist_md, &mut search_frame) else {
            continue;
        };

        let strid = &colorids.strids[k];
        let mut blobindices: Vec<Option<usize>> = vec![None; mchips];
        let mut filled = vec![false; mchips];
        for &j in &cluster.blob_indices {
            let color = cur_blobs[j].color;
            if let Some(pos) = strid.iter().enumerate().position(|(p, &c)| c == color && !filled[p]) {
                blobindices[pos] = Some(j);
                filled[pos] = true;
            }
        }

        let mut barcode = Barcode::new(mchips);
        barcode.blobindices = blobindices;
        barcode.mfix.set(MFix::PARTLYFOUND_FROM_TDIST);
        let (center, orientation) = recompute_geometry(&barcode, cur_blobs, mchips, avg_inrat_dist, 0.0);
        barcode.center = center;
        barcode.orientation = orientation;
        if barcode.is_full() {
            barcode.mfix.set(MFix::FULLFOUND);
        }

        let new_index = cur_by_colorid[k].len();
        let bi = BarcodeIndex::new(k, new_index);
        for slot in barcode.blobindices.iter().flatten() {
            cur_blobs[*slot].barcodeindices.push(bi);
            used.insert(*slot);
        }
        cur_by_colorid[k].push(barcode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::ColoridTable;
    use std::collections::HashMap;

    fn table() -> ColoridTable {
        let mut c2i = HashMap::new();
        c2i.insert('R', 0u32);
        c2i.insert('G', 1u32);
        c2i.insert('B', 2u32);
        let i2c = HashMap::new();
        ColoridTable::new(vec![vec![0, 1, 2]], c2i, i2c).unwrap()
    }

    #[test]
    fn seeds_missing_middle_position_from_previous_frame() {
        let prev_blobs_count = 3;
        let mut prev_by_colorid = vec![Vec::new()];
        let mut prev_bc = Barcode::new(3);
        prev_bc.blobindices = vec![Some(0), Some(1), Some(2)];
        prev_bc.center = (130.0, 100.0);
        prev_bc.mfix.set(MFix::FULLFOUND);
        prev_by_colorid[0].push(prev_bc);
        let _ = prev_blobs_count;

        // Current frame: G blob missing, only R and B present.
        let mut cur_blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(2, (160.0, 100.0), 5.0),
        ];
        let mut cur_by_colorid: Vec<Vec<Barcode>> = vec![Vec::new()];
        let cur_index = SpatialIndex::build(&cur_blobs, 50.0);
        // tdist[i] = previous-frame blob indices close to current blob i.
        let tdist = vec![vec![0usize], vec![2usize]];
        let mut used = HashSet::new();
        let colorids = table();

        propagate_one_frame(
            &prev_by_colorid,
            &mut cur_blobs,
            &mut cur_by_colorid,
            &cur_index,
            &tdist,
            &colorids,
            &mut used,
            3,
            50.0,
            30.0,
        );

        assert_eq!(cur_by_colorid[0].len(), 1);
        let b = &cur_by_colorid[0][0];
        assert!(b.mfix.contains(MFix::PARTLYFOUND_FROM_TDIST));
        assert_eq!(b.blobindices[0], Some(0));
        assert_eq!(b.blobindices[2], Some(1));
    }

    #[test]
    fn stranded_cluster_adopts_nearest_candidate_colorid() {
        let found = recover_stranded_cluster((0.0, 0.0), &[0, 1], 5, 60.0, |step| {
            if step == 2 {
                Some(vec![CandidateBarcode { k: 1, center: (0.0, 0.0), found_count: 3, has_motion: false }])
            } else {
                None
            }
        });
        assert_eq!(found, Some(1));
    }

    #[test]
    fn stranded_cluster_rejects_match_beyond_max_dist() {
        let found = recover_stranded_cluster((0.0, 0.0), &[0], 5, 10.0, |step| {
            if step == 1 {
                Some(vec![CandidateBarcode { k: 0, center: (50.0, 0.0), found_count: 3, has_motion: false }])
            } else {
                None
            }
        });
        assert_eq!(found, None);
    }

    #[test]
    fn stranded_cluster_prefers_richer_anchor_over_closer_thin_one() {
        let found = recover_stranded_cluster((0.0, 0.0), &[0, 1], 3, 100.0, |step| {
            if step == 1 {
                Some(vec![
                    CandidateBarcode { k: 0, center: (5.0, 0.0), found_count: 1, has_motion: false },
                    CandidateBarcode { k: 1, center: (20.0, 0.0), found_count: 3, has_motion: false },
                ])
            } else {
                None
            }
        });
        assert_eq!(found, Some(1));
    }

    #[test]
    fn recover_stranded_clusters_assigns_orphan_blobs_to_nearby_owner() {
        // Two blobs (R, B) show up with no seedable previous-frame anchor --
        // e.g. an occlusion just cleared -- one frame after a FULLFOUND
        // barcode of the same colorid existed a couple of frames back.
        let mut cur_blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(2, (140.0, 100.0), 5.0),
        ];
        let mut cur_by_colorid: Vec<Vec<Barcode>> = vec![Vec::new()];
        let cur_index = SpatialIndex::build(&cur_blobs, 50.0);
        let mut used = HashSet::new();
        let colorids = table();

        recover_stranded_clusters(
            &mut cur_blobs,
            &mut cur_by_colorid,
            &cur_index,
            &mut used,
            &colorids,
            3,
            30.0,
            5,
            60.0,
            |offset| {
                if offset == -2 {
                    Some(vec![CandidateBarcode { k: 0, center: (130.0, 100.0), found_count: 3, has_motion: false }])
                } else {
                    None
                }
            },
        );

        assert_eq!(cur_by_colorid[0].len(), 1);
        let b = &cur_by_colorid[0][0];
        assert!(b.mfix.contains(MFix::PARTLYFOUND_FROM_TDIST));
        assert_eq!(b.blobindices[0], Some(0));
        assert_eq!(b.blobindices[2], Some(1));
        assert!(used.contains(&0) && used.contains(&1));
    }

    #[test]
    fn recover_stranded_clusters_skips_when_no_nearby_owner_found() {
        let mut cur_blobs = vec![ColorBlob::new(0, (100.0, 100.0), 5.0), ColorBlob::new(2, (140.0, 100.0), 5.0)];
        let mut cur_by_colorid: Vec<Vec<Barcode>> = vec![Vec::new()];
        let cur_index = SpatialIndex::build(&cur_blobs, 50.0);
        let mut used = HashSet::new();
        let colorids = table();

        recover_stranded_clusters(&mut cur_blobs, &mut cur_by_colorid, &cur_index, &mut used, &colorids, 3, 30.0, 5, 60.0, |_| None);

        assert!(cur_by_colorid[0].is_empty());
        assert!(used.is_empty());
    }
}
