// THEORY:
// Phase 4: within each blob cluster, soft-deletes fully-overlapped full
// barcodes, flags isolated ones `FULLNOCLUSTER`, and prunes same-colorid
// near-duplicates on a frame (spec.md §4.4). Grounded on `algo_blob.py`'s
// post-`find_chains_in_sdistlists` filtering pass, reusing the cluster finder
// from `spatial_index` and the chain-geometry recompute from
// `barcode_detector`.

use crate::core_modules::barcode_detector::recompute_geometry;
use crate::core_modules::geometry::distance;
use crate::core_modules::spatial_index::SpatialIndex;
use crate::core_modules::types::{Barcode, BarcodeIndex, ColorBlob, MFix};
use std::collections::HashSet;

/// All not-permanently-deleted barcodes on a frame, across every colorid,
/// addressed by their `BarcodeIndex`.
pub struct FrameBarcodes<'a> {
    pub by_colorid: &'a mut Vec<Vec<Barcode>>,
}

impl<'a> FrameBarcodes<'a> {
    fn get(&self, idx: BarcodeIndex) -> &Barcode {
        &self.by_colorid[idx.k][idx.i]
    }

    fn get_mut(&mut self, idx: BarcodeIndex) -> &mut Barcode {
        &mut self.by_colorid[idx.k][idx.i]
    }

    fn all_not_deleted(&self) -> Vec<BarcodeIndex> {
        let mut out = Vec::new();
        for (k, list) in self.by_colorid.iter().enumerate() {
            for (i, b) in list.iter().enumerate() {
                if !b.is_permanently_deleted() && !b.is_deleted() {
                    out.push(BarcodeIndex::new(k, i));
                }
            }
        }
        out
    }
}

/// Does `blob_idx` appear in some not-deleted barcode other than `exclude`?
fn blob_shared_with_other(
    blob: &ColorBlob,
    exclude: BarcodeIndex,
    frame: &FrameBarcodes,
) -> bool {
    blob.barcodeindices.iter().any(|&bi| {
        bi != exclude
            && !frame.get(bi).is_permanently_deleted()
            && !frame.get(bi).is_deleted()
    })
}

/// Soft-delete fully-overlapped barcodes and flag isolated ones, per
/// spec.md §4.4, within one blob cluster.
pub fn filter_cluster(cluster: &[usize], blobs: &[ColorBlob], frame: &mut FrameBarcodes, mchips: usize) {
    // Barcodes entirely contained in this cluster's blob set.
    let cluster_set: HashSet<usize> = cluster.iter().copied().collect();
    let candidates: Vec<BarcodeIndex> = frame
        .all_not_deleted()
        .into_iter()
        .filter(|&bi| {
            let b = frame.get(bi);
            b.mfix.contains(MFix::FULLFOUND)
                && b.blobindices.iter().all(|slot| slot.map(|j| cluster_set.contains(&j)).unwrap_or(false))
        })
        .collect();

    for &bi in &candidates {
        let fully_overlapped = {
            let b = frame.get(bi);
            b.blobindices.iter().all(|slot| {
                slot.map(|j| blob_shared_with_other(&blobs[j], bi, frame)).unwrap_or(false)
            })
        };
        if fully_overlapped {
            frame.get_mut(bi).mfix.set(MFix::DELETED);
        }
    }

    if cluster.len() == mchips && candidates.len() == 1 {
        let bi = candidates[0];
        let b = frame.get(bi);
        if !b.is_deleted() {
            let all_here = b.blobindices.iter().all(|slot| slot.map(|j| cluster_set.contains(&j)).unwrap_or(false));
            if all_here {
                frame.get_mut(bi).mfix.set(MFix::FULLNOCLUSTER);
            }
        }
    }
}

/// Shares-id pruning among not-deleted barcodes of the same colorid on one
/// frame (spec.md §4.4, first bullet: geometric near-duplicate soft-delete).
pub fn prune_shares_id(k: usize, frame: &mut FrameBarcodes, blobs: &[ColorBlob], max_inrat_dist: f64) {
    let list_len = frame.by_colorid[k].len();
    let indices: Vec<usize> = (0..list_len)
        .filter(|&i| {
            let b = &frame.by_colorid[k][i];
            !b.is_permanently_deleted() && !b.is_deleted()
        })
        .collect();

    for a in 0..indices.len() {
        for bidx in a + 1..indices.len() {
            let ia = indices[a];
            let ib = indices[bidx];
            let ba = &frame.by_colorid[k][ia];
            let bb = &frame.by_colorid[k][ib];
            if ba.is_deleted() || bb.is_deleted() {
                continue;
            }
            let d = distance(ba.center, bb.center);
            if d > max_inrat_dist {
                continue;
            }
            let cos_diff = (ba.orientation - bb.orientation).cos();
            if cos_diff < 0.0 {
                continue;
            }
            let radii_a: f64 = ba.blobindices.iter().filter_map(|s| s.map(|j| blobs[j].radius)).sum();
            let radii_b: f64 = bb.blobindices.iter().filter_map(|s| s.map(|j| blobs[j].radius)).sum();
            // Smaller summed radius is soft-deleted; tie goes to the second
            // one in iteration order (i.e. delete `b`).
            if radii_a < radii_b {
                frame.by_colorid[k][ia].mfix.set(MFix::DELETED);
            } else {
                frame.by_colorid[k][ib].mfix.set(MFix::DELETED);
            }
        }
    }
}

/// Partial-propagation follow-up pass (spec.md §4.4 second bullet): merge
/// compatible `PARTLYFOUND_FROM_TDIST` pairs into one barcode, permanently
/// deleting the donor, then promote unions that now cover every position.
pub fn merge_partial_duplicates(
    k: usize,
    frame: &mut FrameBarcodes,
    blobs: &mut [ColorBlob],
    mchips: usize,
    max_inrat_dist: f64,
    avg_inrat_dist: f64,
) {
    loop {
        let list_len = frame.by_colorid[k].len();
        let partial_indices: Vec<usize> = (0..list_len)
            .filter(|&i| {
                let b = &frame.by_colorid[k][i];
                !b.is_permanently_deleted()
                    && !b.is_deleted()
                    && b.mfix.contains(MFix::PARTLYFOUND_FROM_TDIST)
                    && !b.is_full()
            })
            .collect();

        let mut merged_any = false;
        'outer: for a in 0..partial_indices.len() {
            for bidx in a + 1..partial_indices.len() {
                let ia = partial_indices[a];
                let ib = partial_indices[bidx];
                let (keep, drop) = {
                    let ba = &frame.by_colorid[k][ia];
                    let bb = &frame.by_colorid[k][ib];
                    if distance(ba.center, bb.center) > 2.0 * max_inrat_dist {
                        continue;
                    }
                    let mut colors_seen: HashSet<u32> = HashSet::new();
                    let mut conflicting = false;
                    for slot in ba.blobindices.iter().chain(bb.blobindices.iter()).flatten() {
                        if !colors_seen.insert(blobs[*slot].color) {
                            conflicting = true;
                            break;
                        }
                    }
                    if conflicting {
                        continue;
                    }
                    (ia, ib)
                };

                let donor_blobs: Vec<Option<usize>> = frame.by_colorid[k][drop].blobindices.clone();
                for (pos, slot) in donor_blobs.iter().enumerate() {
                    if let Some(j) = slot {
                        if frame.by_colorid[k][keep].blobindices[pos].is_none() {
                            frame.by_colorid[k][keep].blobindices[pos] = Some(*j);
                            blobs[*j].barcodeindices.retain(|&bi| bi != BarcodeIndex::new(k, drop));
                            blobs[*j].barcodeindices.push(BarcodeIndex::new(k, keep));
                        }
                    }
                }
                for slot in frame.by_colorid[k][drop].blobindices.iter().flatten() {
                    blobs[*slot].barcodeindices.retain(|&bi| bi != BarcodeIndex::new(k, drop));
                }
                frame.by_colorid[k][drop].mfix = MFix::ZERO;

                let (center, orientation) = {
                    let b = &frame.by_colorid[k][keep];
                    recompute_geometry(b, blobs, mchips, avg_inrat_dist, b.orientation)
                };
                let kept = &mut frame.by_colorid[k][keep];
                kept.center = center;
                kept.orientation = orientation;
                if kept.is_full() {
                    kept.mfix.set(MFix::FULLFOUND);
                }

                merged_any = true;
                break 'outer;
            }
        }

        if !merged_any {
            break;
        }
    }
}

/// Refreshes `SHARESID`/`SHARESBLOB` on every not-deleted barcode of one
/// frame (spec.md §3: "another not-deleted barcode on the same frame has
/// the same colorid" / "shares at least one blob with another not-deleted
/// barcode"). Called after partial propagation and again during
/// finalization, per spec.md §4.5 and §4.8 item 4.
pub fn refresh_shares_flags(frame: &mut FrameBarcodes) {
    let live = frame.all_not_deleted();

    for &bi in &live {
        frame.get_mut(bi).mfix.clear(MFix::SHARESID);
        frame.get_mut(bi).mfix.clear(MFix::SHARESBLOB);
    }

    for a in 0..live.len() {
        for b in a + 1..live.len() {
            let (bi_a, bi_b) = (live[a], live[b]);
            if bi_a.k == bi_b.k {
                frame.get_mut(bi_a).mfix.set(MFix::SHARESID);
                frame.get_mut(bi_b).mfix.set(MFix::SHARESID);
            }
            let shares_blob = {
                let ba = frame.get(bi_a);
                let bb = frame.get(bi_b);
                ba.blobindices.iter().flatten().any(|j| bb.blobindices.contains(&Some(*j)))
            };
            if shares_blob {
                frame.get_mut(bi_a).mfix.set(MFix::SHARESBLOB);
                frame.get_mut(bi_b).mfix.set(MFix::SHARESBLOB);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::ColorBlob;

    fn mk_frame(n_colorids: usize) -> Vec<Vec<Barcode>> {
        vec![Vec::new(); n_colorids]
    }

    #[test]
    fn fully_overlapped_barcode_is_soft_deleted() {
        let mut blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(1, (130.0, 100.0), 5.0),
            ColorBlob::new(2, (160.0, 100.0), 5.0),
        ];

        let mut by_colorid = mk_frame(1);
        let mut b1 = Barcode::new(3);
        b1.blobindices = vec![Some(0), Some(1), Some(2)];
        b1.mfix.set(MFix::FULLFOUND);
        by_colorid[0].push(b1);
        let mut b2 = Barcode::new(3);
        b2.blobindices = vec![Some(0), Some(1), Some(2)];
        b2.mfix.set(MFix::FULLFOUND);
        by_colorid[0].push(b2);

        blobs[0].barcodeindices = vec![BarcodeIndex::new(0, 0), BarcodeIndex::new(0, 1)];
        blobs[1].barcodeindices = vec![BarcodeIndex::new(0, 0), BarcodeIndex::new(0, 1)];
        blobs[2].barcodeindices = vec![BarcodeIndex::new(0, 0), BarcodeIndex::new(0, 1)];

        let mut frame = FrameBarcodes { by_colorid: &mut by_colorid };
        filter_cluster(&[0, 1, 2], &blobs, &mut frame, 3);

        let deleted = frame.by_colorid[0][0].is_deleted();
        let other_deleted = frame.by_colorid[0][1].is_deleted();
        assert!(deleted != other_deleted);
    }

    #[test]
    fn isolated_full_cluster_gets_fullnocluster() {
        let blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(1, (130.0, 100.0), 5.0),
            ColorBlob::new(2, (160.0, 100.0), 5.0),
        ];
        let mut by_colorid = mk_frame(1);
        let mut b1 = Barcode::new(3);
        b1.blobindices = vec![Some(0), Some(1), Some(2)];
        b1.mfix.set(MFix::FULLFOUND);
        by_colorid[0].push(b1);

        let mut frame = FrameBarcodes { by_colorid: &mut by_colorid };
        filter_cluster(&[0, 1, 2], &blobs, &mut frame, 3);
        assert!(frame.by_colorid[0][0].mfix.contains(MFix::FULLNOCLUSTER));
    }

    #[test]
    fn shares_id_prunes_smaller_radius_duplicate() {
        let blobs = vec![
            ColorBlob::new(0, (100.0, 100.0), 5.0),
            ColorBlob::new(0, (102.0, 100.0), 3.0),
        ];
        let mut by_colorid = mk_frame(1);
        let mut b1 = Barcode::new(1);
        b1.blobindices = vec![Some(0)];
        b1.center = (100.0, 100.0);
        b1.mfix.set(MFix::FULLFOUND);
        by_colorid[0].push(b1);
        let mut b2 = Barcode::new(1);
        b2.blobindices = vec![Some(1)];
        b2.center = (102.0, 100.0);
        b2.mfix.set(MFix::FULLFOUND);
        by_colorid[0].push(b2);

        let mut frame = FrameBarcodes { by_colorid: &mut by_colorid };
        prune_shares_id(0, &mut frame, &blobs, 50.0);
        assert!(frame.by_colorid[0][1].is_deleted());
        assert!(!frame.by_colorid[0][0].is_deleted());
    }

    #[test]
    fn refresh_shares_flags_marks_blob_and_id_overlap() {
        let mut by_colorid = mk_frame(2);
        let mut a = Barcode::new(1);
        a.blobindices = vec![Some(0)];
        by_colorid[0].push(a);
        let mut b = Barcode::new(1);
        b.blobindices = vec![Some(0)];
        by_colorid[0].push(b);
        let mut c = Barcode::new(1);
        c.blobindices = vec![Some(1)];
        by_colorid[1].push(c);

        let mut frame = FrameBarcodes { by_colorid: &mut by_colorid };
        refresh_shares_flags(&mut frame);
        assert!(frame.by_colorid[0][0].mfix.contains(MFix::SHARESBLOB));
        assert!(frame.by_colorid[0][1].mfix.contains(MFix::SHARESBLOB));
        assert!(frame.by_colorid[0][0].mfix.contains(MFix::SHARESID));
        assert!(!frame.by_colorid[1][0].mfix.contains(MFix::SHARESBLOB));
    }
}
