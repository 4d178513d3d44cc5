// THEORY:
// Runs after every phase: verifies the blob<->barcode back-reference graph
// is bidirectionally consistent (spec.md §4.9). Any mismatch is a fatal
// algorithmic bug, not a data problem, so it surfaces as
// `TrajognizeError::Consistency` rather than a warning. Grounded on
// `init.py`'s invariant comments and spec.md §3's numbered invariant list.

use crate::core_modules::types::{Barcode, BarcodeIndex, ColorBlob};
use crate::error::{Result, TrajognizeError};

/// Checks one frame's blob<->barcode graph (spec.md §8 invariants 1-2).
pub fn check_frame(frame: u64, blobs: &[ColorBlob], by_colorid: &[Vec<Barcode>]) -> Result<()> {
    for (k, list) in by_colorid.iter().enumerate() {
        for (i, b) in list.iter().enumerate() {
            if b.is_permanently_deleted() {
                continue;
            }
            let bi = BarcodeIndex::new(k, i);
            for slot in b.blobindices.iter().flatten() {
                let Some(blob) = blobs.get(*slot) else {
                    return Err(TrajognizeError::Consistency {
                        frame,
                        what: format!("barcode ({k},{i}) names out-of-range blob {slot}"),
                        side: "barcode",
                    });
                };
                if !blob.barcodeindices.contains(&bi) {
                    return Err(TrajognizeError::Consistency {
                        frame,
                        what: format!("blob {slot} missing back-reference to barcode ({k},{i})"),
                        side: "blob",
                    });
                }
            }
        }
    }

    for (j, blob) in blobs.iter().enumerate() {
        for &bi in &blob.barcodeindices {
            let Some(b) = by_colorid.get(bi.k).and_then(|list| list.get(bi.i)) else {
                return Err(TrajognizeError::Consistency {
                    frame,
                    what: format!("blob {j} references out-of-range barcode ({},{})", bi.k, bi.i),
                    side: "blob",
                });
            };
            if b.is_permanently_deleted() {
                continue;
            }
            if !b.blobindices.contains(&Some(j)) {
                return Err(TrajognizeError::Consistency {
                    frame,
                    what: format!("barcode ({},{}) missing blob {j} in its blobindices", bi.k, bi.i),
                    side: "barcode",
                });
            }
        }
    }

    Ok(())
}

/// Checks every frame; stops at the first violation (spec.md §7: "the
/// program halts with a message naming the frame, the blob or barcode, and
/// the mismatching side").
pub fn check_all_frames(blobs: &[Vec<ColorBlob>], by_colorid: &[Vec<Vec<Barcode>>]) -> Result<()> {
    for (f, (frame_blobs, frame_barcodes)) in blobs.iter().zip(by_colorid.iter()).enumerate() {
        check_frame(f as u64, frame_blobs, frame_barcodes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::MFix;

    #[test]
    fn consistent_frame_passes() {
        let mut blobs = vec![ColorBlob::new(0, (0.0, 0.0), 5.0)];
        let mut b = Barcode::new(1);
        b.blobindices = vec![Some(0)];
        b.mfix.set(MFix::FULLFOUND);
        blobs[0].barcodeindices.push(BarcodeIndex::new(0, 0));
        let by_colorid = vec![vec![b]];
        assert!(check_frame(0, &blobs, &by_colorid).is_ok());
    }

    #[test]
    fn missing_back_reference_is_fatal() {
        let blobs = vec![ColorBlob::new(0, (0.0, 0.0), 5.0)];
        let mut b = Barcode::new(1);
        b.blobindices = vec![Some(0)];
        b.mfix.set(MFix::FULLFOUND);
        let by_colorid = vec![vec![b]];
        let result = check_frame(0, &blobs, &by_colorid);
        assert!(result.is_err());
    }

    #[test]
    fn dangling_barcode_reference_is_fatal() {
        let mut blobs = vec![ColorBlob::new(0, (0.0, 0.0), 5.0)];
        blobs[0].barcodeindices.push(BarcodeIndex::new(0, 0));
        let by_colorid: Vec<Vec<Barcode>> = vec![Vec::new()];
        let result = check_frame(0, &blobs, &by_colorid);
        assert!(result.is_err());
    }
}
