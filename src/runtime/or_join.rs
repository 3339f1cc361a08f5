//! OR-join enablement.
//!
//! An OR-join may fire once at least one preset condition is marked and no
//! unmarked preset condition can still receive a token from the current
//! marking. The analysis runs in two passes:
//!
//! 1. backward: collect every task and condition from which an unmarked
//!    preset condition is reachable, never passing through the OR-join itself;
//! 2. forward: starting from the marked conditions in that region, saturate
//!    the set of conditions that could become marked, treating AND-joins as
//!    needing every preset condition and XOR/OR-joins as needing any.
//!
//! A busy task already holds its join tokens, so it counts as a producer
//! that will fire no matter what its preset holds.
//!
//! The forward pass ignores token counts and consumption, so it
//! over-approximates what is reachable: the OR-join may wait longer than a
//! full coverability check would, but it never fires while a token can still
//! arrive. It is a pure function of `(net, marking, busy, task)` and keeps
//! no cache.

use std::collections::{BTreeSet, HashSet};

use crate::runtime::marking::Marking;
use crate::runtime::net::{ConditionId, JoinType, Net, Task};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrJoinVerdict {
    pub enabled: bool,
    /// Unmarked preset conditions that may still receive a token.
    pub awaiting: Vec<ConditionId>,
}

pub fn is_or_join_enabled(net: &Net, marking: &Marking, task: &str) -> bool {
    analyze(net, marking, task).enabled
}

pub fn analyze(net: &Net, marking: &Marking, task_id: &str) -> OrJoinVerdict {
    analyze_with_busy(net, marking, &BTreeSet::new(), task_id)
}

pub fn analyze_with_busy(
    net: &Net,
    marking: &Marking,
    busy: &BTreeSet<String>,
    task_id: &str,
) -> OrJoinVerdict {
    let Some(task) = net.task(task_id) else {
        return OrJoinVerdict {
            enabled: false,
            awaiting: Vec::new(),
        };
    };

    let (marked, unmarked): (Vec<&ConditionId>, Vec<&ConditionId>) =
        task.preset.iter().partition(|c| marking.is_marked(c));

    if marked.is_empty() {
        return OrJoinVerdict {
            enabled: false,
            awaiting: Vec::new(),
        };
    }
    if unmarked.is_empty() {
        return OrJoinVerdict {
            enabled: true,
            awaiting: Vec::new(),
        };
    }

    let (region_conditions, region_tasks) = backward_region(net, task_id, &unmarked);

    let busy_producer = region_tasks.iter().any(|t| busy.contains(&t.id));
    if !busy_producer && !region_conditions.iter().any(|c| marking.is_marked(c)) {
        return OrJoinVerdict {
            enabled: true,
            awaiting: Vec::new(),
        };
    }

    let receivable = forward_saturate(marking, busy, &region_conditions, &region_tasks);
    let awaiting: Vec<ConditionId> = unmarked
        .into_iter()
        .filter(|c| receivable.contains(c.as_str()))
        .cloned()
        .collect();

    OrJoinVerdict {
        enabled: awaiting.is_empty(),
        awaiting,
    }
}

fn backward_region<'n>(
    net: &'n Net,
    or_join: &str,
    unmarked: &[&'n ConditionId],
) -> (HashSet<&'n str>, Vec<&'n Task>) {
    let mut conditions: HashSet<&str> = unmarked.iter().map(|c| c.as_str()).collect();
    let mut seen_tasks: HashSet<&str> = HashSet::new();
    let mut tasks = Vec::new();
    let mut stack: Vec<&str> = conditions.iter().copied().collect();

    while let Some(condition) = stack.pop() {
        for producer in net.producers_of(condition) {
            if producer == or_join || !seen_tasks.insert(producer.as_str()) {
                continue;
            }
            let Some(t) = net.task(producer) else { continue };
            tasks.push(t);
            for pre in &t.preset {
                if conditions.insert(pre.as_str()) {
                    stack.push(pre.as_str());
                }
            }
        }
    }

    (conditions, tasks)
}

fn forward_saturate<'n>(
    marking: &Marking,
    busy: &BTreeSet<String>,
    region_conditions: &HashSet<&'n str>,
    region_tasks: &[&'n Task],
) -> HashSet<&'n str> {
    let mut reachable: HashSet<&str> = region_conditions
        .iter()
        .copied()
        .filter(|c| marking.is_marked(c))
        .collect();

    loop {
        let mut changed = false;
        for &task in region_tasks {
            let fireable = busy.contains(&task.id)
                || match task.join {
                    JoinType::And => task.preset.iter().all(|c| reachable.contains(c.as_str())),
                    JoinType::Xor | JoinType::Or => task.preset.iter().any(|c| reachable.contains(c.as_str())),
                };
            if !fireable {
                continue;
            }
            for target in task.postset_conditions() {
                if reachable.insert(target.as_str()) {
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    reachable
}
