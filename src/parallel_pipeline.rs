//! Optional parallel phase-2 index builder. Phase 2 (spatial index +
//! motion association) is per-frame and embarrassingly parallel in
//! principle (spec.md §5); this module fans that work out across a tokio
//! worker pool, generalizing the teacher's dispatcher/worker-pool split in
//! `WorkerPool`/`ParallelPipeline` (one dispatcher task round-robining work
//! to a fixed pool of long-lived workers) from "one video frame in, one
//! status map out" to "one batch of frames in, one spatial index per frame
//! out". Produces byte-identical results to the sequential path in
//! `pipeline::run`; only the scheduling differs, so it stays out of any
//! correctness-sensitive code path that needs to run in frame order (the
//! temporal index and every phase after phase 2 are still driven
//! sequentially by `pipeline::run`).

use crate::core_modules::spatial_index::SpatialIndex;
use crate::core_modules::types::ColorBlob;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

struct IndexTask {
    frame: usize,
    blobs: Arc<Vec<ColorBlob>>,
    max_inrat_dist: f64,
    result_sender: oneshot::Sender<SpatialIndex>,
}

/// A fixed-size pool of long-lived worker tasks, each pulling frame-index
/// jobs off a shared dispatcher. Mirrors the teacher's `WorkerPool` shape:
/// one unbounded dispatcher channel fans out, round-robin, to one channel
/// per worker.
struct WorkerPool {
    task_sender: mpsc::UnboundedSender<IndexTask>,
    _workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<IndexTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) =
            (0..worker_count).map(|_| mpsc::unbounded_channel::<IndexTask>()).unzip();

        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_senders.len();
            }
        });

        let mut workers = Vec::with_capacity(worker_count);
        for mut worker_receiver in worker_receivers {
            workers.push(tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let index = SpatialIndex::build(&task.blobs, task.max_inrat_dist);
                    let _ = task.result_sender.send(index);
                    let _ = task.frame; // identifies the task only for the caller's bookkeeping
                }
            }));
        }

        Self { task_sender, _workers: workers }
    }

    async fn build(&self, frame: usize, blobs: Arc<Vec<ColorBlob>>, max_inrat_dist: f64) -> SpatialIndex {
        let (result_sender, result_receiver) = oneshot::channel();
        let task = IndexTask { frame, blobs, max_inrat_dist, result_sender };
        if self.task_sender.send(task).is_err() {
            unreachable!("worker pool dispatcher outlives every in-flight build() call");
        }
        result_receiver.await.expect("index worker task panicked")
    }
}

/// Builds every frame's spatial index across a pool of `worker_count`
/// workers (`num_cpus::get()` when `None`), returned in frame order.
pub async fn build_spatial_indices_parallel(
    blobs: &[Vec<ColorBlob>],
    max_inrat_dist: f64,
    worker_count: Option<usize>,
) -> Vec<SpatialIndex> {
    let workers = worker_count.unwrap_or_else(num_cpus::get);
    let pool = WorkerPool::new(workers);

    let futures = blobs.iter().enumerate().map(|(f, fb)| {
        let blobs = Arc::new(fb.clone());
        let pool = &pool;
        async move { pool.build(f, blobs, max_inrat_dist).await }
    });

    futures::future::join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::types::ColorBlob;

    #[tokio::test]
    async fn parallel_indices_match_sequential_build() {
        let blobs: Vec<Vec<ColorBlob>> = (0..10)
            .map(|i| {
                vec![
                    ColorBlob::new(0, (i as f64 * 5.0, 0.0), 5.0),
                    ColorBlob::new(1, (i as f64 * 5.0 + 20.0, 0.0), 5.0),
                ]
            })
            .collect();

        let parallel = build_spatial_indices_parallel(&blobs, 50.0, Some(4)).await;
        let sequential: Vec<SpatialIndex> = blobs.iter().map(|fb| SpatialIndex::build(fb, 50.0)).collect();

        assert_eq!(parallel.len(), sequential.len());
        for (p, s) in parallel.iter().zip(sequential.iter()) {
            assert_eq!(p.neighbors.len(), s.neighbors.len());
            for (pn, sn) in p.neighbors.iter().zip(s.neighbors.iter()) {
                assert_eq!(pn.close, sn.close);
                assert_eq!(pn.second_close, sn.second_close);
            }
        }
    }
}
