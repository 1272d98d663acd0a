//! Merge plan construction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::chunk::{ChunkId, ChunkStore};
use crate::error::{Result, SortError};
use crate::record::Record;
use crate::task::MergeTask;

/// The merge plan: a level-ordered queue of merge tasks plus the id of the
/// chunk that holds the final result once the queue has drained.
///
/// The underlying task tree is implicit. Leaves are grouped `fan_in` at a
/// time into level-ordered tasks, each round's outputs become the next
/// round's leaves, and the queue is the level-ascending traversal; output
/// ids flow to parent tasks through their input lists, so no node
/// back-references are kept.
pub(crate) struct MergePlan<T: Record> {
    pub tasks: VecDeque<MergeTask<T>>,
    pub result: ChunkId,
}

/// Builds the plan from the leaf chunks.
///
/// Grouping rule per round: take `min(fan_in, remaining)` leaves; when the
/// leftover after the group would be non-zero but smaller than `fan_in`, the
/// whole remainder is fused into one group instead, so no group ever has a
/// single member. A fused group may reach `2 * fan_in - 1` inputs. A single
/// leaf needs no merging at all and becomes the result directly.
pub(crate) fn build_plan<T: Record>(
    leaves: Vec<ChunkId>,
    fan_in: usize,
    store: &Arc<ChunkStore>,
) -> Result<MergePlan<T>> {
    if leaves.is_empty() {
        return Err(SortError::Invariant(
            "merge plan requested for an empty chunk list".into(),
        ));
    }

    let fan_in = fan_in.max(2);
    let mut next_ids: HashMap<u32, u32> = HashMap::new();
    let mut tasks: Vec<MergeTask<T>> = Vec::new();
    let mut current = leaves;

    while current.len() > 1 {
        let mut produced = Vec::new();
        let mut i = 0;

        while i < current.len() {
            let remaining = current.len() - i;
            let mut take = fan_in.min(remaining);
            let leftover = remaining - take;
            if leftover > 0 && leftover < fan_in {
                take = remaining;
            }

            let group = current[i..i + take].to_vec();
            let level = group.iter().map(|c| c.level).max().unwrap_or(0) + 1;
            let seq = next_ids.entry(level).or_insert(0);
            let output = ChunkId::new(level, *seq);
            *seq += 1;

            tasks.push(MergeTask::new(group, output, store.clone()));
            produced.push(output);
            i += take;
        }

        current = produced;
    }

    // mixed-level leaves can emit a high-level task before a lower one;
    // dependencies only ever point downwards, so a stable level sort fixes
    // the queue order without reordering within a level
    tasks.sort_by_key(|t| t.level());

    Ok(MergePlan {
        result: current[0],
        tasks: tasks.into(),
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::*;

    use crate::chunk::{ChunkId, ChunkStore, StreamBackend};

    use super::build_plan;

    fn store() -> Arc<ChunkStore> {
        Arc::new(ChunkStore::new(
            "./chunks".into(),
            '_',
            StreamBackend::Buffered,
            true,
        ))
    }

    fn leaves(n: u32) -> Vec<ChunkId> {
        (0..n).map(|i| ChunkId::new(0, i)).collect()
    }

    #[rstest]
    #[case(2, 4, vec![2])]
    #[case(4, 4, vec![4])]
    #[case(5, 4, vec![5])]
    #[case(8, 4, vec![4, 4, 2])]
    #[case(10, 4, vec![4, 6, 2])]
    #[case(12, 4, vec![4, 4, 4, 3])]
    fn test_grouping(#[case] n: u32, #[case] fan_in: usize, #[case] expected: Vec<usize>) {
        let plan = build_plan::<u32>(leaves(n), fan_in, &store()).unwrap();
        let widths: Vec<usize> = plan.tasks.iter().map(|t| t.input_count()).collect();
        assert_eq!(widths, expected);
    }

    #[rstest]
    #[case(2, 2)]
    #[case(3, 2)]
    #[case(7, 2)]
    #[case(9, 3)]
    #[case(100, 4)]
    fn test_no_singleton_groups_and_levels_monotone(#[case] n: u32, #[case] fan_in: usize) {
        let plan = build_plan::<u32>(leaves(n), fan_in, &store()).unwrap();

        let mut last_level = 0;
        for task in &plan.tasks {
            assert!(task.input_count() >= 2);
            assert!(task.input_count() <= 2 * fan_in - 1);
            assert!(task.level() >= last_level, "queue must be level-ordered");
            last_level = task.level();
        }

        let root = plan.tasks.back().unwrap();
        assert_eq!(root.id(), plan.result);
        assert_eq!(root.level(), last_level);
    }

    #[test]
    fn test_binary_tree_depth() {
        let plan = build_plan::<u32>(leaves(8), 2, &store()).unwrap();
        // 8 -> 4 -> 2 -> 1: seven tasks, root at level 3
        assert_eq!(plan.tasks.len(), 7);
        assert_eq!(plan.result, ChunkId::new(3, 0));
    }

    #[test]
    fn test_flat_fan_in_collapses_to_root() {
        let plan = build_plan::<u32>(leaves(9), 9, &store()).unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.result, ChunkId::new(1, 0));
        assert_eq!(plan.tasks[0].input_count(), 9);
    }

    #[test]
    fn test_single_leaf_is_the_result() {
        let only = ChunkId::new(0, 0);
        let plan = build_plan::<u32>(vec![only], 4, &store()).unwrap();
        assert!(plan.tasks.is_empty());
        assert_eq!(plan.result, only);
    }

    #[test]
    fn test_fan_in_below_two_is_clamped() {
        let plan = build_plan::<u32>(leaves(4), 0, &store()).unwrap();
        assert!(plan.tasks.iter().all(|t| t.input_count() == 2));
    }

    #[test]
    fn test_mixed_level_leaves() {
        let mixed = vec![
            ChunkId::new(0, 0),
            ChunkId::new(0, 1),
            ChunkId::new(2, 0),
            ChunkId::new(2, 1),
        ];
        let plan = build_plan::<u32>(mixed, 2, &store()).unwrap();

        // (0,0)+(0,1) -> (1,0); (2,0)+(2,1) -> (3,0); (1,0)+(3,0) -> (4,0)
        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(plan.tasks[0].id(), ChunkId::new(1, 0));
        assert_eq!(plan.tasks[1].id(), ChunkId::new(3, 0));
        assert_eq!(plan.tasks[2].id(), ChunkId::new(4, 0));
        assert_eq!(plan.result, ChunkId::new(4, 0));
    }

    #[test]
    fn test_empty_leaves_is_fatal() {
        assert!(build_plan::<u32>(vec![], 4, &store()).is_err());
    }
}
