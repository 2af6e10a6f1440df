use std::collections::HashSet;

use forge_types::{is_safe_relative_path, Task, TaskPlan};

use crate::ValidationError;

/// Checks that `plan` can be executed in its given order.
///
/// Ids must be unique and non-empty, every dependency must name a task that
/// appears earlier in the plan, and every target file must be a safe relative
/// path. Plans are never reordered to satisfy these rules.
pub fn validate_plan(plan: &TaskPlan) -> Result<(), ValidationError> {
    validate_tasks(&plan.tasks)
}

pub(crate) fn validate_tasks(tasks: &[Task]) -> Result<(), ValidationError> {
    let mut all_ids = HashSet::new();
    for (index, task) in tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            return Err(ValidationError::EmptyTaskId { index });
        }
        if !all_ids.insert(task.id.as_str()) {
            return Err(ValidationError::DuplicateTaskId {
                id: task.id.clone(),
            });
        }
    }

    let mut earlier = HashSet::new();
    for task in tasks {
        for dependency in &task.dependencies {
            if *dependency == task.id {
                return Err(ValidationError::SelfDependency {
                    task: task.id.clone(),
                });
            }
            if earlier.contains(dependency.as_str()) {
                continue;
            }
            let err = if all_ids.contains(dependency.as_str()) {
                ValidationError::ForwardDependency {
                    task: task.id.clone(),
                    dependency: dependency.clone(),
                }
            } else {
                ValidationError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dependency.clone(),
                }
            };
            return Err(err);
        }
        if let Some(path) = task.files.iter().find(|p| !is_safe_relative_path(p)) {
            return Err(ValidationError::UnsafePath {
                task: task.id.clone(),
                path: path.clone(),
            });
        }
        earlier.insert(task.id.as_str());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_types::TaskKind;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id, TaskKind::Component).with_dependencies(deps.iter().copied())
    }

    #[test]
    fn accepts_topologically_ordered_plan() {
        let plan = TaskPlan::new(
            "p1",
            vec![
                task("schema", &[]),
                task("api", &["schema"]),
                task("ui", &["api", "schema"]),
            ],
        );
        assert_eq!(validate_plan(&plan), Ok(()));
    }

    #[test]
    fn accepts_empty_plan() {
        assert_eq!(validate_plan(&TaskPlan::new("p1", Vec::new())), Ok(()));
    }

    #[test]
    fn rejects_forward_dependency() {
        let plan = TaskPlan::new("p1", vec![task("ui", &["api"]), task("api", &[])]);
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::ForwardDependency {
                task: "ui".to_string(),
                dependency: "api".to_string(),
            })
        );
    }

    #[test]
    fn rejects_self_and_dangling_dependencies() {
        let plan = TaskPlan::new("p1", vec![task("a", &["a"])]);
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::SelfDependency {
                task: "a".to_string()
            })
        );

        let plan = TaskPlan::new("p1", vec![task("a", &[]), task("b", &["ghost"])]);
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::UnknownDependency {
                task: "b".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn rejects_cycles_as_forward_references() {
        let plan = TaskPlan::new("p1", vec![task("a", &["b"]), task("b", &["a"])]);
        assert!(matches!(
            validate_plan(&plan),
            Err(ValidationError::ForwardDependency { .. })
        ));
    }

    #[test]
    fn rejects_empty_and_duplicate_ids() {
        let plan = TaskPlan::new("p1", vec![task("a", &[]), task(" ", &[])]);
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::EmptyTaskId { index: 1 })
        );

        let plan = TaskPlan::new("p1", vec![task("a", &[]), task("a", &[])]);
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::DuplicateTaskId {
                id: "a".to_string()
            })
        );
    }

    #[test]
    fn rejects_unsafe_target_paths() {
        let plan = TaskPlan::new(
            "p1",
            vec![task("a", &[]).with_files(["src/ok.ts", "../outside.ts"])],
        );
        assert_eq!(
            validate_plan(&plan),
            Err(ValidationError::UnsafePath {
                task: "a".to_string(),
                path: "../outside.ts".to_string(),
            })
        );
    }
}
