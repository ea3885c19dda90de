//! # Row Partitioning
//!
//! Fork-join evaluation of a row range over the state's child replicas.
//! Rows are cut into contiguous partitions of `floor(rows / workers)` rows,
//! the last partition absorbing the remainder. Each partition gets its own
//! refreshed replica and a disjoint slice of the output array, so no locking
//! is needed. Worker statuses are merged serially after the join, and the
//! final reduction always walks the rows in ascending order.

use crate::state::{FitError, OptimizationState, Status};
use rayon::prelude::*;
use std::ops::Range;

/// One worker's share of the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub worker: usize,
    pub rows: Range<usize>,
}

/// Workers actually used for `n_rows` rows: never more than one per row,
/// never fewer than one.
pub fn effective_workers(configured: usize, n_rows: usize) -> usize {
    configured.min(n_rows).max(1)
}

pub fn partition_rows(n_rows: usize, workers: usize) -> Vec<Partition> {
    let workers = workers.max(1);
    let stride = n_rows / workers;
    (0..workers)
        .map(|worker| {
            let start = worker * stride;
            let end = if worker + 1 == workers {
                n_rows
            } else {
                start + stride
            };
            Partition {
                worker,
                rows: start..end,
            }
        })
        .collect()
}

/// Left-to-right sum. Floating-point addition does not associate, so this
/// order is fixed regardless of how the values were produced.
pub fn reduce_ordered(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, &v| acc + v)
}

/// Copies every failing worker status into `parent`, in worker order, so the
/// last failure wins. Successes and warnings never clear a recorded failure.
/// Returns whether any worker failed.
pub fn merge_status(parent: &mut OptimizationState, statuses: &[Status]) -> bool {
    let mut failed = false;
    for status in statuses.iter().filter(|s| s.is_error()) {
        parent.set_status(status.clone());
        failed = true;
    }
    failed
}

/// Runs `job` over `[0, n_rows)` and writes one value per row into `out`.
///
/// With one effective worker the job runs on `state` itself and its error is
/// returned. Otherwise every partition runs on a child replica in parallel;
/// worker errors are recorded into the replicas, merged into `state` and
/// reported as `Ok(false)`.
///
/// A failing job must leave its failing slot and every later slot of its
/// partition untouched. After the join every row past the first failing
/// partition is zeroed, so no row after a fatal row carries a result.
pub fn evaluate_partitioned<F>(
    state: &mut OptimizationState,
    n_rows: usize,
    out: &mut [f64],
    job: F,
) -> Result<bool, FitError>
where
    F: Fn(&mut OptimizationState, Range<usize>, &mut [f64]) -> Result<(), FitError> + Sync,
{
    if out.len() != n_rows {
        return Err(FitError::Shape {
            what: "row output".to_string(),
            expected: format!("length {n_rows}"),
            found: format!("length {}", out.len()),
        });
    }
    out.fill(0.0);

    let workers = effective_workers(state.workers(), n_rows);
    if workers <= 1 {
        job(state, 0..n_rows, out)?;
        return Ok(true);
    }

    let partitions = partition_rows(n_rows, workers);
    let ends: Vec<usize> = partitions.iter().map(|p| p.rows.end).collect();
    let mut children = state.take_children(workers);
    log::debug!("Evaluating {n_rows} rows over {workers} workers");

    let mut rest = &mut *out;
    let mut tasks = Vec::with_capacity(workers);
    for (partition, child) in partitions.into_iter().zip(children.iter_mut()) {
        let (slots, tail) = std::mem::take(&mut rest).split_at_mut(partition.rows.len());
        rest = tail;
        tasks.push((partition, child, slots));
    }

    let statuses: Vec<Status> = tasks
        .into_par_iter()
        .map(|(partition, child, slots)| {
            log::trace!(
                "Worker {} takes rows {}..{}",
                partition.worker,
                partition.rows.start,
                partition.rows.end
            );
            if let Err(err) = job(&mut *child, partition.rows, slots) {
                child.record_error(&err);
            }
            child.status().clone()
        })
        .collect();

    if let Some(first) = statuses.iter().position(Status::is_error) {
        log::debug!("Worker {first} failed; discarding rows {}..{n_rows}", ends[first]);
        out[ends[first]..].fill(0.0);
    }
    let failed = merge_status(state, &statuses);
    state.restore_children(children);
    Ok(!failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::STATUS_ERROR;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn remainder_goes_to_the_last_partition() {
        let parts = partition_rows(10, 3);
        let ranges: Vec<_> = parts.iter().map(|p| p.rows.clone()).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
        assert_eq!(parts[2].worker, 2);
    }

    #[test]
    fn partitions_cover_every_row_exactly_once() {
        for n_rows in 0..40 {
            for workers in 1..8 {
                let parts = partition_rows(n_rows, workers);
                assert_eq!(parts.len(), workers);
                let mut next = 0;
                for (i, part) in parts.iter().enumerate() {
                    assert_eq!(part.rows.start, next);
                    if i + 1 < workers {
                        assert_eq!(part.rows.len(), n_rows / workers);
                    }
                    next = part.rows.end;
                }
                assert_eq!(next, n_rows);
            }
        }
        assert_eq!(effective_workers(8, 3), 3);
        assert_eq!(effective_workers(4, 0), 1);
    }

    fn row_value(row: usize) -> f64 {
        let mut rng = StdRng::seed_from_u64(row as u64);
        rng.gen_range(-50.0..0.0) * 1e-3_f64.powi((row % 7) as i32)
    }

    #[test]
    fn reduction_is_identical_across_worker_counts() {
        let mut sums = Vec::new();
        for workers in [1, 2, 4] {
            let mut state = OptimizationState::new();
            state.set_workers(workers);
            let mut out = vec![0.0; 17];
            let ok = evaluate_partitioned(&mut state, 17, &mut out, |replica, rows, slots| {
                for (slot, row) in slots.iter_mut().zip(rows) {
                    *slot = row_value(row);
                    replica.next_row();
                }
                Ok(())
            })
            .unwrap();
            assert!(ok);
            assert_eq!(state.children().len(), if workers > 1 { workers } else { 0 });
            sums.push(reduce_ordered(&out).to_bits());
        }
        assert_eq!(sums[0], sums[1]);
        assert_eq!(sums[0], sums[2]);
    }

    #[test]
    fn last_failing_worker_status_wins() {
        let mut state = OptimizationState::new();
        state.set_workers(3);
        let mut out = vec![0.0; 9];
        let ok = evaluate_partitioned(&mut state, 9, &mut out, |replica, rows, slots| {
            let worker = replica.replica_index().unwrap_or(0);
            for (slot, row) in slots.iter_mut().zip(rows) {
                if worker != 1 && row % 3 == 1 {
                    return Err(FitError::NotPositiveDefinite { row });
                }
                *slot = 1.0;
            }
            Ok(())
        })
        .unwrap();

        assert!(!ok);
        assert_eq!(state.status().code, STATUS_ERROR);
        assert!(state.status().message.contains("row 7"));
        assert_eq!(out, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn rows_after_a_failure_inside_an_early_partition_are_discarded() {
        let mut state = OptimizationState::new();
        state.set_workers(3);
        let mut out = vec![0.0; 12];
        let ok = evaluate_partitioned(&mut state, 12, &mut out, |_, rows, slots| {
            for (slot, row) in slots.iter_mut().zip(rows) {
                if row == 5 {
                    return Err(FitError::NotPositiveDefinite { row });
                }
                *slot = -(row as f64) - 1.0;
            }
            Ok(())
        })
        .unwrap();

        assert!(!ok);
        assert!(state.status().message.contains("row 5"));
        assert_eq!(&out[..5], &[-1.0, -2.0, -3.0, -4.0, -5.0]);
        assert!(out[5..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn success_never_clears_a_failure() {
        let mut state = OptimizationState::new();
        let failed = merge_status(
            &mut state,
            &[
                Status::new(STATUS_ERROR, "first"),
                Status::default(),
                Status::new(1, "warning"),
            ],
        );
        assert!(failed);
        assert_eq!(state.status().message, "first");
    }

    #[test]
    fn serial_errors_are_returned() {
        let mut state = OptimizationState::new();
        let mut out = vec![0.0; 4];
        let err = evaluate_partitioned(&mut state, 4, &mut out, |_, _, _| {
            Err(FitError::NotPositiveDefinite { row: 0 })
        })
        .unwrap_err();
        assert_eq!(err, FitError::NotPositiveDefinite { row: 0 });
        assert!(state.children().is_empty());
    }
}
