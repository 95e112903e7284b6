//! Dependency-graph helpers
//!
//! Tasks form a DAG over task ids; edges are `dependency` relations. These
//! are pure functions over task slices so the scheduler and its tests share
//! one definition of "valid topology" and "ready".

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{TaskRecord, TaskSpec, TaskStatus};

/// Topology validation failures, reported at submit time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A workflow must contain at least one task
    #[error("workflow has no tasks")]
    Empty,

    /// Task ids must be unique within a workflow
    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    /// Every dependency must reference a task in the same workflow
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    /// A task cannot depend on itself
    #[error("task {0} depends on itself")]
    SelfDependency(String),

    /// The dependency graph must be acyclic
    #[error("dependency cycle through tasks: {0}")]
    Cycle(String),
}

/// Validate a submitted task list: non-empty, unique ids, dependencies
/// resolve in-workflow, no self-dependencies, acyclic.
pub fn validate(tasks: &[TaskSpec]) -> Result<(), TopologyError> {
    if tasks.is_empty() {
        return Err(TopologyError::Empty);
    }

    let mut ids = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(TopologyError::DuplicateId(task.id.clone()));
        }
    }

    for task in tasks {
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(TopologyError::SelfDependency(task.id.clone()));
            }
            if !ids.contains(dep.as_str()) {
                return Err(TopologyError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm; whatever survives is part of a cycle.
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent).expect("dependent is a task");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if visited != tasks.len() {
        let mut cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        cyclic.sort_unstable();
        return Err(TopologyError::Cycle(cyclic.join(", ")));
    }

    Ok(())
}

/// Tasks eligible for dispatch: Pending, with every dependency Completed.
/// Ordered by priority (desc) then task id, so dispatch tie-breaks are
/// deterministic.
pub fn ready_set(tasks: &[TaskRecord]) -> Vec<&TaskRecord> {
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();

    let mut ready: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.dependencies.iter().all(|d| completed.contains(d.as_str())))
        .collect();

    ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    ready
}

/// Transitive dependents of a task (not including the task itself)
///
/// Used to mark descendants Skipped when an ancestor fails for good.
pub fn descendants(tasks: &[TaskRecord], root: &str) -> HashSet<String> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut found = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(root);

    while let Some(id) = queue.pop_front() {
        for dependent in dependents.get(id).into_iter().flatten() {
            if found.insert(dependent.to_string()) {
                queue.push_back(dependent);
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowRecord;
    use chrono::Utc;

    fn spec(id: &str, deps: Vec<&str>) -> TaskSpec {
        TaskSpec::new(id, "noop").with_dependencies(deps)
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert_eq!(validate(&[]), Err(TopologyError::Empty));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let tasks = vec![spec("a", vec![]), spec("a", vec![])];
        assert_eq!(validate(&tasks), Err(TopologyError::DuplicateId("a".into())));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let tasks = vec![spec("a", vec!["a"])];
        assert_eq!(
            validate(&tasks),
            Err(TopologyError::SelfDependency("a".into()))
        );
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let tasks = vec![spec("a", vec!["ghost"])];
        assert_eq!(
            validate(&tasks),
            Err(TopologyError::UnknownDependency {
                task: "a".into(),
                dependency: "ghost".into(),
            })
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let tasks = vec![spec("a", vec!["c"]), spec("b", vec!["a"]), spec("c", vec!["b"])];
        assert!(matches!(validate(&tasks), Err(TopologyError::Cycle(_))));
    }

    #[test]
    fn test_diamond_accepted() {
        let tasks = vec![
            spec("a", vec![]),
            spec("b", vec!["a"]),
            spec("c", vec!["a"]),
            spec("d", vec!["b", "c"]),
        ];
        assert!(validate(&tasks).is_ok());
    }

    fn workflow(specs: Vec<TaskSpec>) -> WorkflowRecord {
        WorkflowRecord::new("w", specs, Utc::now())
    }

    #[test]
    fn test_ready_set_respects_dependencies() {
        let mut w = workflow(vec![
            spec("a", vec![]),
            spec("b", vec!["a"]),
            spec("c", vec!["a"]),
        ]);

        let ready: Vec<&str> = ready_set(&w.tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        w.task_mut("a").unwrap().status = TaskStatus::Completed;
        let ready: Vec<&str> = ready_set(&w.tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn test_ready_set_priority_order() {
        let w = workflow(vec![
            TaskSpec::new("b", "noop"),
            TaskSpec::new("a", "noop"),
            TaskSpec::new("z", "noop").with_priority(10),
        ]);

        let ready: Vec<&str> = ready_set(&w.tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_ready_set_excludes_running_and_terminal() {
        let mut w = workflow(vec![spec("a", vec![]), spec("b", vec![])]);
        w.task_mut("a").unwrap().status = TaskStatus::Running;

        let ready: Vec<&str> = ready_set(&w.tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn test_descendants_transitive() {
        let w = workflow(vec![
            spec("a", vec![]),
            spec("b", vec!["a"]),
            spec("c", vec!["b"]),
            spec("d", vec![]),
        ]);

        let down = descendants(&w.tasks, "a");
        assert!(down.contains("b"));
        assert!(down.contains("c"));
        assert!(!down.contains("a"));
        assert!(!down.contains("d"));
    }
}
