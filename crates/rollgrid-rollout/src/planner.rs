//! Batch planner — resolves a rollout plan into per-batch replica targets.
//!
//! Each batch declares the *cumulative* share of the workload that should
//! run the target version once the batch completes, either as an absolute
//! replica count or as a percentage of desired replicas. Percentages round
//! down, a batch never resolves below its predecessor, and the last batch
//! always resolves to every desired replica.

use rollgrid_state::{BatchSize, RolloutBatch, RolloutPlan};

use crate::error::{RolloutError, RolloutResult};

/// Structural checks that do not depend on the workload's size.
pub fn validate_plan(plan: &RolloutPlan) -> RolloutResult<()> {
    if plan.batches.is_empty() {
        return Err(RolloutError::InvalidPlan(
            "plan declares no batches".to_string(),
        ));
    }
    if let Some(partition) = plan.batch_partition {
        if partition as usize >= plan.batches.len() {
            return Err(RolloutError::InvalidPlan(format!(
                "batch partition {partition} is out of range for {} batches",
                plan.batches.len()
            )));
        }
    }
    for (index, batch) in plan.batches.iter().enumerate() {
        match batch.size {
            BatchSize::Replicas(n) if n < 0 => {
                return Err(RolloutError::InvalidPlan(format!(
                    "batch {index} declares negative replicas ({n})"
                )));
            }
            BatchSize::Percent(p) if p < 0 => {
                return Err(RolloutError::InvalidPlan(format!(
                    "batch {index} declares a negative weight ({p}%)"
                )));
            }
            BatchSize::Percent(p) if p > 100 => {
                return Err(RolloutError::InvalidPlan(format!(
                    "batch {index} declares more than 100% ({p}%)"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Resolve one batch's declared size against the workload size.
fn resolve_batch(index: usize, batch: &RolloutBatch, total: u32) -> RolloutResult<u32> {
    match batch.size {
        BatchSize::Replicas(n) => {
            if n < 0 {
                return Err(RolloutError::InvalidPlan(format!(
                    "batch {index} declares negative replicas ({n})"
                )));
            }
            if n > i64::from(total) {
                return Err(RolloutError::InvalidPlan(format!(
                    "batch {index} declares {n} replicas but the workload only has {total}"
                )));
            }
            Ok(n as u32)
        }
        BatchSize::Percent(p) => {
            if !(0..=100).contains(&p) {
                return Err(RolloutError::InvalidPlan(format!(
                    "batch {index} declares an out-of-range weight ({p}%)"
                )));
            }
            Ok((u64::from(total) * p as u64 / 100) as u32)
        }
    }
}

/// Replicas that should run the target version once batch `batch_index`
/// completes.
///
/// Every batch is resolved (not only those up to `batch_index`) so a bad
/// declaration is reported no matter which batch is current.
pub fn compute_batch_target(
    batches: &[RolloutBatch],
    batch_index: u32,
    total_desired_replicas: u32,
) -> RolloutResult<u32> {
    let index = batch_index as usize;
    if index >= batches.len() {
        return Err(RolloutError::InvalidPlan(format!(
            "batch {batch_index} does not exist in a plan of {} batches",
            batches.len()
        )));
    }

    let mut floor = 0;
    let mut target = 0;
    for (i, batch) in batches.iter().enumerate() {
        let resolved = resolve_batch(i, batch, total_desired_replicas)?;
        floor = floor.max(resolved);
        if i == index {
            target = floor;
        }
    }

    if index == batches.len() - 1 {
        return Ok(total_desired_replicas);
    }
    Ok(target)
}

/// Targets for every batch, in order.
pub fn batch_targets(batches: &[RolloutBatch], total_desired_replicas: u32) -> RolloutResult<Vec<u32>> {
    (0..batches.len() as u32)
        .map(|i| compute_batch_target(batches, i, total_desired_replicas))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percents(values: &[i64]) -> Vec<RolloutBatch> {
        values.iter().map(|p| RolloutBatch::percent(*p)).collect()
    }

    fn plan(batches: Vec<RolloutBatch>, partition: Option<u32>) -> RolloutPlan {
        RolloutPlan {
            batches,
            batch_partition: partition,
            paused: false,
        }
    }

    #[test]
    fn quarter_half_full_over_four() {
        let batches = percents(&[25, 50, 100]);
        assert_eq!(batch_targets(&batches, 4).unwrap(), vec![1, 2, 4]);
    }

    #[test]
    fn percentages_round_down_and_last_absorbs_remainder() {
        let batches = percents(&[33, 66, 90]);
        // 33% of 10 = 3.3, 66% = 6.6, last batch is always everything.
        assert_eq!(batch_targets(&batches, 10).unwrap(), vec![3, 6, 10]);
    }

    #[test]
    fn weights_need_not_reach_one_hundred() {
        let batches = percents(&[10, 20]);
        assert_eq!(batch_targets(&batches, 7).unwrap(), vec![0, 7]);
    }

    #[test]
    fn absolute_counts_mix_with_percentages() {
        let batches = vec![
            RolloutBatch::replicas(1),
            RolloutBatch::percent(50),
            RolloutBatch::replicas(5),
        ];
        assert_eq!(batch_targets(&batches, 8).unwrap(), vec![1, 4, 8]);
    }

    #[test]
    fn targets_never_decrease() {
        let batches = vec![
            RolloutBatch::percent(60),
            RolloutBatch::replicas(1),
            RolloutBatch::percent(20),
            RolloutBatch::percent(100),
        ];
        assert_eq!(batch_targets(&batches, 10).unwrap(), vec![6, 6, 6, 10]);
    }

    #[test]
    fn monotonic_and_exact_for_many_sizes() {
        let plans = [
            percents(&[25, 50, 100]),
            percents(&[1, 1, 1]),
            percents(&[90, 10, 50, 0]),
            vec![RolloutBatch::replicas(0), RolloutBatch::percent(75)],
            percents(&[100]),
        ];
        for batches in &plans {
            for total in 0..=37u32 {
                let targets = match batch_targets(batches, total) {
                    Ok(t) => t,
                    // Absolute counts larger than tiny workloads are rejected.
                    Err(_) => continue,
                };
                assert!(targets.windows(2).all(|w| w[0] <= w[1]), "{targets:?}");
                assert_eq!(*targets.last().unwrap(), total);
            }
        }
    }

    #[test]
    fn count_exceeding_total_is_invalid() {
        let batches = vec![RolloutBatch::replicas(5), RolloutBatch::percent(100)];
        let err = compute_batch_target(&batches, 1, 4).unwrap_err();
        assert!(matches!(err, RolloutError::InvalidPlan(_)));
    }

    #[test]
    fn negative_weight_is_invalid() {
        let batches = vec![RolloutBatch::percent(-10), RolloutBatch::percent(100)];
        assert!(compute_batch_target(&batches, 0, 4).is_err());
        assert!(validate_plan(&plan(batches, None)).is_err());
    }

    #[test]
    fn index_out_of_range_is_invalid() {
        let batches = percents(&[50, 100]);
        assert!(compute_batch_target(&batches, 2, 4).is_err());
    }

    #[test]
    fn validate_rejects_empty_and_bad_partition() {
        assert!(validate_plan(&plan(vec![], None)).is_err());
        assert!(validate_plan(&plan(percents(&[50, 100]), Some(2))).is_err());
        assert!(validate_plan(&plan(percents(&[50, 100]), Some(1))).is_ok());
        assert!(validate_plan(&plan(percents(&[50, 101]), None)).is_err());
    }
}
