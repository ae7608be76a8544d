use htx_protocol::TaskType;
use std::collections::BTreeMap;
use tracing::debug;

/// Decides the target composition of the worker pool for this tick.
///
/// Allocation is proportional to the real (sentinel-free) backlog of each
/// known type: `max(1, ⌊capacity · backlog / total⌋)` per type, leftover
/// slots from flooring handed out by largest fractional remainder, and the
/// total clamped to `capacity` by shaving the largest allocations first.
/// With an empty backlog everywhere the pool shrinks to a single RAW
/// worker so the node keeps serving default work.
///
/// Pure: the same inputs always produce the same plan, so a steady backlog
/// causes no churn. `to_die` is only observed here; the worker map accounts
/// for draining workers when it turns the plan into deltas.
pub fn naive_scheduler(
    backlogs: &BTreeMap<TaskType, usize>,
    capacity: usize,
    prev_plan: Option<&BTreeMap<TaskType, usize>>,
    to_die: &BTreeMap<TaskType, usize>,
) -> BTreeMap<TaskType, usize> {
    let total_backlog: usize = backlogs.values().sum();

    let mut plan: BTreeMap<TaskType, usize> = BTreeMap::new();
    if capacity == 0 {
        return plan;
    }

    if total_backlog == 0 {
        for task_type in backlogs.keys() {
            plan.insert(task_type.clone(), usize::from(task_type.is_raw()));
        }
        log_plan_change(&plan, prev_plan, to_die);
        return plan;
    }

    // Floored proportional share with a floor of one worker per known type.
    let mut remainders: Vec<(TaskType, f64)> = Vec::with_capacity(backlogs.len());
    for (task_type, backlog) in backlogs {
        let exact = capacity as f64 * *backlog as f64 / total_backlog as f64;
        let share = exact.floor() as usize;
        plan.insert(task_type.clone(), share.max(1));
        remainders.push((task_type.clone(), exact - exact.floor()));
    }

    // Hand out slots lost to flooring, largest remainder first, ties in
    // lexicographic type order.
    remainders.sort_by(|(type_a, rem_a), (type_b, rem_b)| {
        rem_b
            .partial_cmp(rem_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| type_a.cmp(type_b))
    });
    let mut allocated: usize = plan.values().sum();
    for (task_type, remainder) in &remainders {
        if allocated >= capacity {
            break;
        }
        if *remainder > 0.0 {
            *plan.get_mut(task_type).unwrap() += 1;
            allocated += 1;
        }
    }

    // The one-worker floor can overshoot the capacity. Take back the
    // proportional extras first, largest share first; break the floor
    // itself only when there are more known types than capacity, shedding
    // idle types before loaded ones.
    while allocated > capacity {
        let victim = plan
            .iter()
            .filter(|(_, share)| **share > 1)
            .max_by_key(|(task_type, share)| (**share, std::cmp::Reverse((*task_type).clone())))
            .map(|(task_type, _)| task_type.clone())
            .or_else(|| {
                plan.iter()
                    .filter(|(_, share)| **share > 0)
                    .max_by_key(|(task_type, _)| {
                        let backlog = backlogs.get(*task_type).copied().unwrap_or(0);
                        (backlog == 0, std::cmp::Reverse(backlog), (*task_type).clone())
                    })
                    .map(|(task_type, _)| task_type.clone())
            });
        match victim {
            Some(task_type) => {
                *plan.get_mut(&task_type).unwrap() -= 1;
                allocated -= 1;
            }
            None => break,
        }
    }

    log_plan_change(&plan, prev_plan, to_die);
    plan
}

fn log_plan_change(
    plan: &BTreeMap<TaskType, usize>,
    prev_plan: Option<&BTreeMap<TaskType, usize>>,
    to_die: &BTreeMap<TaskType, usize>,
) {
    if prev_plan != Some(plan) {
        debug!(?plan, ?to_die, "scheduler produced a new worker plan");
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::check;

    fn backlogs(entries: &[(&str, usize)]) -> BTreeMap<TaskType, usize> {
        entries
            .iter()
            .map(|(name, backlog)| (TaskType::new(*name), *backlog))
            .collect()
    }

    fn plan(entries: &[(&str, usize)]) -> BTreeMap<TaskType, usize> {
        backlogs(entries)
    }

    #[test]
    fn allocation_is_proportional_to_backlog() {
        let result = naive_scheduler(&backlogs(&[("RAW", 2), ("fft", 10)]), 4, None, &BTreeMap::new());
        check!(result == plan(&[("fft", 3), ("RAW", 1)]));
    }

    #[test]
    fn an_idle_type_keeps_one_worker_while_another_takes_the_rest() {
        let result = naive_scheduler(&backlogs(&[("RAW", 5), ("fft", 0)]), 4, None, &BTreeMap::new());
        check!(result == plan(&[("fft", 1), ("RAW", 3)]));
    }

    #[test]
    fn an_empty_backlog_keeps_a_single_raw_worker() {
        let result = naive_scheduler(&backlogs(&[("RAW", 0), ("fft", 0)]), 4, None, &BTreeMap::new());
        check!(result == plan(&[("fft", 0), ("RAW", 1)]));
    }

    #[test]
    fn leftover_slots_go_to_the_largest_remainder() {
        // Shares: a 5*3/9 = 1.67, b 5*3/9 = 1.67, c 5*3/9 = 1.67 -> floors
        // give 3, two leftovers go to a then b.
        let result = naive_scheduler(
            &backlogs(&[("a", 3), ("b", 3), ("c", 3)]),
            5,
            None,
            &BTreeMap::new(),
        );
        check!(result == plan(&[("a", 2), ("b", 2), ("c", 1)]));
    }

    #[test]
    fn more_types_than_capacity_sheds_idle_types_first() {
        let result = naive_scheduler(
            &backlogs(&[("RAW", 0), ("a", 4), ("b", 0), ("c", 0)]),
            2,
            None,
            &BTreeMap::new(),
        );
        check!(result == plan(&[("RAW", 1), ("a", 1), ("b", 0), ("c", 0)]));
    }

    #[test]
    fn zero_capacity_plans_nothing() {
        let result = naive_scheduler(&backlogs(&[("RAW", 3)]), 0, None, &BTreeMap::new());
        check!(result.is_empty());
    }

    #[test]
    fn identical_inputs_produce_identical_plans() {
        let input = backlogs(&[("RAW", 2), ("fft", 7), ("blas", 1)]);
        let first = naive_scheduler(&input, 6, None, &BTreeMap::new());
        let second = naive_scheduler(&input, 6, Some(&first), &BTreeMap::new());
        check!(first == second);
    }
}
