//! Top-level phase orchestrator: one driving function that threads a
//! video's per-frame state through every phase in spec.md §2's dependency
//! order, re-checking the blob<->barcode consistency invariant after each
//! phase boundary (spec.md §4.9). Generalizes the teacher's `VisionPipeline`
//! (one struct owning every stage, one driving method) from "one frame in,
//! one report out" to "whole video in, whole trajectory set out" (see
//! DESIGN.md).

use crate::core_modules::barcode_detector;
use crate::core_modules::consistency;
use crate::core_modules::finalizer::Finalizer;
use crate::core_modules::motion;
use crate::core_modules::overlap_filter::{self, FrameBarcodes};
use crate::core_modules::partial_propagator;
use crate::core_modules::settings::ProjectSettings;
use crate::core_modules::spatial_index::{self, SpatialIndex};
use crate::core_modules::temporal_index;
use crate::core_modules::trajectory_builder;
use crate::core_modules::trajectory_selector::Selector;
use crate::core_modules::types::{Barcode, BarcodeIndex, ColorBlob, Conflict, ColoridTable, MotionBlob, Trajectory};
use crate::error::Result;
use crate::io::FrameBlobs;
use crate::parallel_pipeline;
use std::collections::HashSet;

/// Below this many frames, building phase-2 indices sequentially is cheaper
/// than paying a tokio runtime's startup cost.
const PARALLEL_INDEX_THRESHOLD: usize = 64;

/// Everything the ten-phase pipeline produces for one video.
pub struct PipelineOutput {
    /// `frames[f][k]` is frame `f`'s barcode list for colorid `k`, including
    /// soft- and permanently-deleted entries.
    pub frames: Vec<Vec<Vec<Barcode>>>,
    /// `blobs[f]` is frame `f`'s color-blob list, with `barcodeindices`
    /// back-references populated.
    pub blobs: Vec<Vec<ColorBlob>>,
    pub motion_blobs: Vec<Vec<MotionBlob>>,
    /// `trajectories[k]` is colorid `k`'s trajectory list, built by phase 8
    /// and mutated by phases 9-10. Empty for every colorid when
    /// `RunOptions::skip_trajectory_phases` is set.
    pub trajectories: Vec<Vec<Trajectory>>,
    pub conflicts: Vec<(usize, Conflict)>,
    /// `unused_blob_indices[f]` lists frame `f`'s blob indices claimed by no
    /// not-deleted barcode, for the `-o`-adjacent `.log` file (spec.md §6).
    pub unused_blob_indices: Vec<Vec<usize>>,
}

/// Run-time knobs that change which phases execute, mirroring the CLI's
/// `-nt`/`-de` flags (spec.md §6).
pub struct RunOptions {
    /// `-nt`: stop after phase 7 (partial-barcode reconciliation), leaving
    /// `trajectories` empty.
    pub skip_trajectory_phases: bool,
    /// `-de`: stop after the named phase (1-10) and return whatever state
    /// exists at that point. Checkpoint *serialization* of that state is an
    /// external collaborator (spec.md §1) and is not implemented here; this
    /// only short-circuits the in-process run.
    pub debug_end_phase: Option<u8>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { skip_trajectory_phases: false, debug_end_phase: None }
    }
}

/// Runs every phase spec.md §2 lists, in order, over `frames_in`.
pub fn run(
    colorids: &ColoridTable,
    settings: &ProjectSettings,
    frames_in: Vec<FrameBlobs>,
    options: &RunOptions,
) -> Result<PipelineOutput> {
    let num_frames = frames_in.len();
    let mchips = colorids.mchips;
    tracing::info!(num_frames, num_colorids = colorids.len(), "starting pipeline");

    // Phase 1's primitives (geometry::*) are plain functions with no state
    // of their own; every later phase calls them directly.

    let mut blobs: Vec<Vec<ColorBlob>> = Vec::with_capacity(num_frames);
    let mut motion_blobs: Vec<Vec<MotionBlob>> = Vec::with_capacity(num_frames);
    for fb in frames_in {
        motion_blobs.push(fb.motion_blobs);
        blobs.push(fb.color_blobs);
    }
    let mdindices: Vec<Vec<i64>> = (0..num_frames).map(|f| motion::find_motion_blob_under(&blobs[f], &motion_blobs[f])).collect();

    tracing::info!("phase 2: spatial and temporal indices");
    let spatial_indices = build_spatial_indices(&blobs, settings.max_inrat_dist);
    let tdist_forward = build_forward_tdist(&blobs, &motion_blobs, &mdindices, settings);
    let tdist_backward = build_backward_tdist(&blobs, &motion_blobs, &mdindices, settings);

    if options.debug_end_phase == Some(2) {
        let frames = vec![vec![Vec::new(); colorids.len()]; num_frames];
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(empty_output(frames, blobs, motion_blobs, colorids.len(), unused));
    }

    tracing::info!("phase 3: full-barcode detection");
    let mut frames: Vec<Vec<Vec<Barcode>>> = Vec::with_capacity(num_frames);
    for f in 0..num_frames {
        frames.push(barcode_detector::find_full_barcodes(&blobs[f], &spatial_indices[f], colorids, settings.avg_inrat_dist));
    }
    register_back_references(&mut frames, &mut blobs);
    consistency::check_all_frames(&blobs, &frames)?;

    if options.debug_end_phase == Some(3) {
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(empty_output(frames, blobs, motion_blobs, colorids.len(), unused));
    }

    tracing::info!("phase 4: overlap and shares-id filtering");
    run_overlap_filtering(&mut frames, &blobs, &spatial_indices, colorids, settings);
    consistency::check_all_frames(&blobs, &frames)?;

    if options.debug_end_phase == Some(4) {
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(empty_output(frames, blobs, motion_blobs, colorids.len(), unused));
    }

    tracing::info!("phase 5: forward partial-barcode propagation");
    run_partial_propagation(&mut frames, &mut blobs, &spatial_indices, &tdist_forward, &mdindices, colorids, settings, true);
    consistency::check_all_frames(&blobs, &frames)?;

    if options.debug_end_phase == Some(5) {
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(empty_output(frames, blobs, motion_blobs, colorids.len(), unused));
    }

    tracing::info!("phase 6: backward partial-barcode propagation");
    run_partial_propagation(&mut frames, &mut blobs, &spatial_indices, &tdist_backward, &mdindices, colorids, settings, false);
    consistency::check_all_frames(&blobs, &frames)?;

    if options.debug_end_phase == Some(6) {
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(empty_output(frames, blobs, motion_blobs, colorids.len(), unused));
    }

    tracing::info!("phase 7: partial-barcode reconciliation");
    for f in 0..num_frames {
        for k in 0..colorids.len() {
            let mut fb = FrameBarcodes { by_colorid: &mut frames[f] };
            overlap_filter::merge_partial_duplicates(k, &mut fb, &mut blobs[f], mchips, settings.max_inrat_dist, settings.avg_inrat_dist);
        }
        let mut fb = FrameBarcodes { by_colorid: &mut frames[f] };
        overlap_filter::refresh_shares_flags(&mut fb);
    }
    consistency::check_all_frames(&blobs, &frames)?;

    if options.skip_trajectory_phases || options.debug_end_phase == Some(7) {
        tracing::info!("stopping after phase 7 (trajectory phases skipped)");
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(empty_output(frames, blobs, motion_blobs, colorids.len(), unused));
    }

    tracing::info!("phase 8: trajectory construction");
    let barcode_motion = compute_barcode_motion(&frames, &motion_blobs, &mdindices);
    let mut trajectories = trajectory_builder::build_trajectories(
        &frames,
        &barcode_motion,
        colorids.len(),
        mchips,
        settings.max_perframe_dist,
        settings.max_perframe_dist_md,
    );

    if options.debug_end_phase == Some(8) {
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(PipelineOutput { frames, blobs, motion_blobs, trajectories, conflicts: Vec::new(), unused_blob_indices: unused });
    }

    tracing::info!("phase 9: trajectory selection");
    {
        let mut selector = Selector {
            frames: &mut frames,
            blobs: &mut blobs,
            trajs: &mut trajectories,
            colorids,
            settings,
        };
        for line in selector.run() {
            tracing::info!(traj = %line, "chosen trajectory");
        }
    }
    consistency::check_all_frames(&blobs, &frames)?;

    if options.debug_end_phase == Some(9) {
        let unused = compute_unused_blobs(&frames, &blobs);
        return Ok(PipelineOutput { frames, blobs, motion_blobs, trajectories, conflicts: Vec::new(), unused_blob_indices: unused });
    }

    tracing::info!("phase 10: finalization");
    let conflicts = {
        let mut finalizer = Finalizer {
            frames: &mut frames,
            blobs: &mut blobs,
            trajs: &mut trajectories,
            colorids,
            settings,
        };
        finalizer.run()
    };
    consistency::check_all_frames(&blobs, &frames)?;

    for (frame, conflict) in &conflicts {
        tracing::warn!(frame, ctype = ?conflict.ctype, "unresolved conflict after finalization");
    }

    let unused = compute_unused_blobs(&frames, &blobs);
    Ok(PipelineOutput { frames, blobs, motion_blobs, trajectories, conflicts, unused_blob_indices: unused })
}

fn empty_output(
    frames: Vec<Vec<Vec<Barcode>>>,
    blobs: Vec<Vec<ColorBlob>>,
    motion_blobs: Vec<Vec<MotionBlob>>,
    num_colorids: usize,
    unused: Vec<Vec<usize>>,
) -> PipelineOutput {
    PipelineOutput {
        frames,
        blobs,
        motion_blobs,
        trajectories: vec![Vec::new(); num_colorids],
        conflicts: Vec::new(),
        unused_blob_indices: unused,
    }
}

/// Phase 2's spatial index, built in parallel across frames once the batch
/// is large enough to amortize a tokio runtime's startup cost (spec.md §5:
/// phase 2 is "per-frame and embarrassingly parallel in principle").
fn build_spatial_indices(blobs: &[Vec<ColorBlob>], max_inrat_dist: f64) -> Vec<SpatialIndex> {
    if blobs.len() < PARALLEL_INDEX_THRESHOLD {
        return blobs.iter().map(|fb| SpatialIndex::build(fb, max_inrat_dist)).collect();
    }
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::warn!(%err, "failed to start tokio runtime, building spatial indices sequentially");
            return blobs.iter().map(|fb| SpatialIndex::build(fb, max_inrat_dist)).collect();
        }
    };
    rt.block_on(parallel_pipeline::build_spatial_indices_parallel(blobs, max_inrat_dist, None))
}

fn build_forward_tdist(
    blobs: &[Vec<ColorBlob>],
    motion_blobs: &[Vec<MotionBlob>],
    mdindices: &[Vec<i64>],
    settings: &ProjectSettings,
) -> Vec<Vec<Vec<usize>>> {
    let num_frames = blobs.len();
    let mut out = vec![Vec::new(); num_frames];
    for f in 1..num_frames {
        out[f] = temporal_index::create_temporal_distlist(
            &blobs[f - 1],
            &blobs[f],
            &motion_blobs[f - 1],
            &motion_blobs[f],
            &mdindices[f - 1],
            &mdindices[f],
            settings.max_perframe_dist,
            settings.max_perframe_dist_md,
        );
    }
    out
}

fn build_backward_tdist(
    blobs: &[Vec<ColorBlob>],
    motion_blobs: &[Vec<MotionBlob>],
    mdindices: &[Vec<i64>],
    settings: &ProjectSettings,
) -> Vec<Vec<Vec<usize>>> {
    let num_frames = blobs.len();
    let mut out = vec![Vec::new(); num_frames];
    for f in 0..num_frames.saturating_sub(1) {
        out[f] = temporal_index::create_temporal_distlist(
            &blobs[f + 1],
            &blobs[f],
            &motion_blobs[f + 1],
            &motion_blobs[f],
            &mdindices[f + 1],
            &mdindices[f],
            settings.max_perframe_dist,
            settings.max_perframe_dist_md,
        );
    }
    out
}

/// Phase 3's detector doesn't itself register blob back-references (it only
/// builds the barcode lists); the orchestrator completes the invariant
/// before the first consistency check.
fn register_back_references(frames: &mut [Vec<Vec<Barcode>>], blobs: &mut [Vec<ColorBlob>]) {
    for (f, frame) in frames.iter().enumerate() {
        for (k, list) in frame.iter().enumerate() {
            for (i, b) in list.iter().enumerate() {
                if b.is_permanently_deleted() {
                    continue;
                }
                let bi = BarcodeIndex::new(k, i);
                for slot in b.blobindices.iter().flatten() {
                    blobs[f][*slot].barcodeindices.push(bi);
                }
            }
        }
    }
}

fn run_overlap_filtering(
    frames: &mut [Vec<Vec<Barcode>>],
    blobs: &[Vec<ColorBlob>],
    spatial_indices: &[SpatialIndex],
    colorids: &ColoridTable,
    settings: &ProjectSettings,
) {
    let mchips = colorids.mchips;
    for f in 0..frames.len() {
        let (clusters, _) = spatial_index::find_clusters(&spatial_indices[f], false);
        for cluster in &clusters {
            let mut fb = FrameBarcodes { by_colorid: &mut frames[f] };
            overlap_filter::filter_cluster(cluster, &blobs[f], &mut fb, mchips);
        }
        for k in 0..colorids.len() {
            let mut fb = FrameBarcodes { by_colorid: &mut frames[f] };
            overlap_filter::prune_shares_id(k, &mut fb, &blobs[f], settings.max_inrat_dist);
        }
    }
}

/// Runs one direction of phases 5/6 over the whole video. `tdist` must
/// already be oriented so `tdist[f][i]` names the *previous-in-direction*
/// frame's matching blob indices for frame `f`'s blob `i`. After each frame's
/// tentative propagation, also runs step 5's stranded-cluster recovery,
/// searching both directions within `stranded_cluster_maxskip` frames for a
/// plausible owner of whatever blobs still went unclaimed.
fn run_partial_propagation(
    frames: &mut [Vec<Vec<Barcode>>],
    blobs: &mut [Vec<ColorBlob>],
    spatial_indices: &[SpatialIndex],
    tdist: &[Vec<Vec<usize>>],
    mdindices: &[Vec<i64>],
    colorids: &ColoridTable,
    settings: &ProjectSettings,
    forward: bool,
) {
    let num_frames = frames.len();
    let mchips = colorids.mchips;
    let frame_order: Vec<usize> = if forward {
        (1..num_frames).collect()
    } else {
        (0..num_frames.saturating_sub(1)).rev().collect()
    };

    for f in frame_order {
        let prev_f = if forward { f - 1 } else { f + 1 };
        let prev_snapshot = frames[prev_f].clone();

        let mut used: HashSet<usize> = HashSet::new();
        for list in frames[f].iter() {
            for b in list {
                if !b.is_permanently_deleted() && !b.is_deleted() {
                    used.extend(b.blobindices.iter().flatten());
                }
            }
        }

        partial_propagator::propagate_one_frame(
            &prev_snapshot,
            &mut blobs[f],
            &mut frames[f],
            &spatial_indices[f],
            &tdist[f],
            colorids,
            &mut used,
            mchips,
            settings.max_inrat_dist,
            settings.avg_inrat_dist,
        );

        let (left, right) = frames.split_at_mut(f);
        let (cur_slice, right_rest) = right.split_at_mut(1);
        let cur_frame = &mut cur_slice[0];

        let search_frame = move |offset: i64| -> Option<Vec<partial_propagator::CandidateBarcode>> {
            let target = f as i64 + offset;
            if target < 0 || target as usize >= num_frames {
                return None;
            }
            let target = target as usize;
            let frame_barcodes: &Vec<Vec<Barcode>> = if target < f { &left[target] } else { &right_rest[target - f - 1] };
            let mut out = Vec::new();
            for (k, list) in frame_barcodes.iter().enumerate() {
                for b in list {
                    if b.is_permanently_deleted() || b.is_deleted() {
                        continue;
                    }
                    let has_motion = b.blobindices.iter().flatten().any(|&j| mdindices[target][j] >= 0);
                    out.push(partial_propagator::CandidateBarcode { k, center: b.center, found_count: b.found_count(), has_motion });
                }
            }
            Some(out)
        };

        partial_propagator::recover_stranded_clusters(
            &mut blobs[f],
            cur_frame.as_mut_slice(),
            &spatial_indices[f],
            &mut used,
            colorids,
            mchips,
            settings.avg_inrat_dist,
            settings.stranded_cluster_maxskip,
            settings.max_perframe_dist_md,
            search_frame,
        );
    }
}

/// One motion association per barcode position, 1:1 with `frames[f][k]`
/// (including deleted entries -- `build_trajectories` filters those itself).
fn compute_barcode_motion(
    frames: &[Vec<Vec<Barcode>>],
    motion_blobs: &[Vec<MotionBlob>],
    mdindices: &[Vec<i64>],
) -> Vec<Vec<Vec<Option<MotionBlob>>>> {
    frames
        .iter()
        .enumerate()
        .map(|(f, frame)| {
            frame
                .iter()
                .map(|list| {
                    list.iter()
                        .map(|b| {
                            b.blobindices.iter().flatten().find_map(|&j| {
                                let md = mdindices[f][j];
                                if md >= 0 { Some(motion_blobs[f][md as usize]) } else { None }
                            })
                        })
                        .collect()
                })
                .collect()
        })
        .collect()
}

/// A blob is "unused" once no not-deleted barcode on its frame still claims
/// it, for the `-o`-adjacent `.log` unused-blob report (spec.md §6).
fn compute_unused_blobs(frames: &[Vec<Vec<Barcode>>], blobs: &[Vec<ColorBlob>]) -> Vec<Vec<usize>> {
    blobs
        .iter()
        .enumerate()
        .map(|(f, blist)| {
            blist
                .iter()
                .enumerate()
                .filter_map(|(j, blob)| {
                    let used = blob.barcodeindices.iter().any(|bi| {
                        let b = &frames[f][bi.k][bi.i];
                        !b.is_permanently_deleted() && !b.is_deleted()
                    });
                    if used { None } else { Some(j) }
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::{ColorBlob, MFix};
    use crate::io::parse_colorid_file;

    fn rgb_colorids() -> ColoridTable {
        parse_colorid_file("R 0\nG 1\nB 2\n\nRGB\n").unwrap()
    }

    fn stationary_rgb_frame() -> FrameBlobs {
        FrameBlobs {
            color_blobs: vec![
                ColorBlob::new(0, (100.0, 100.0), 5.0),
                ColorBlob::new(1, (130.0, 100.0), 5.0),
                ColorBlob::new(2, (160.0, 100.0), 5.0),
            ],
            motion_blobs: Vec::new(),
        }
    }

    #[test]
    fn single_stationary_barcode_is_chosen_every_frame() {
        let colorids = rgb_colorids();
        let settings = ProjectSettings::default();
        let frames_in: Vec<FrameBlobs> = (0..10).map(|_| stationary_rgb_frame()).collect();

        let output = run(&colorids, &settings, frames_in, &RunOptions::default()).unwrap();

        for f in 0..10 {
            let chosen: Vec<_> = output.frames[f][0].iter().filter(|b| b.mfix.contains(MFix::CHOSEN)).collect();
            assert_eq!(chosen.len(), 1, "frame {f}");
            assert!(chosen[0].mfix.contains(MFix::FULLFOUND));
        }
    }

    #[test]
    fn nt_option_stops_before_trajectory_construction() {
        let colorids = rgb_colorids();
        let settings = ProjectSettings::default();
        let frames_in: Vec<FrameBlobs> = (0..5).map(|_| stationary_rgb_frame()).collect();
        let options = RunOptions { skip_trajectory_phases: true, debug_end_phase: None };

        let output = run(&colorids, &settings, frames_in, &options).unwrap();

        assert!(output.trajectories.iter().all(Vec::is_empty));
        assert!(output.frames[0][0].iter().any(|b| b.mfix.contains(MFix::FULLFOUND)));
    }
}
