//! Enum-keyed task registry

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::definition::{RetryPolicy, TaskDefinition};
use crate::error::TaskError;
use crate::services::TaskServices;
use crate::tasks;

/// Every task the system knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskName {
    DbMaintenance,
    LockOldMovies,
    SeedAchievements,
    RefreshMedia,
    DeleteUser,
    ImportCsv,
    PruneTaskRuns,
}

impl TaskName {
    pub const ALL: [TaskName; 7] = [
        Self::DbMaintenance,
        Self::LockOldMovies,
        Self::SeedAchievements,
        Self::RefreshMedia,
        Self::DeleteUser,
        Self::ImportCsv,
        Self::PruneTaskRuns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DbMaintenance => "db-maintenance",
            Self::LockOldMovies => "lock-old-movies",
            Self::SeedAchievements => "seed-achievements",
            Self::RefreshMedia => "refresh-media",
            Self::DeleteUser => "delete-user",
            Self::ImportCsv => "import-csv",
            Self::PruneTaskRuns => "prune-task-runs",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| TaskError::NotFound(format!("task {}", s)))
    }
}

/// Immutable map from task name to definition
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<TaskName, TaskDefinition>,
    default_retry: RetryPolicy,
}

impl TaskRegistry {
    pub fn new(default_retry: RetryPolicy) -> Self {
        Self {
            tasks: HashMap::new(),
            default_retry,
        }
    }

    /// Add or replace a definition
    pub fn register(&mut self, definition: TaskDefinition) {
        debug!(task = %definition.name, "Registered task");
        self.tasks.insert(definition.name, definition);
    }

    pub fn get(&self, name: TaskName) -> Option<&TaskDefinition> {
        self.tasks.get(&name)
    }

    /// Look a task up by its wire name
    pub fn get_task(&self, name: &str) -> Result<&TaskDefinition, TaskError> {
        let name: TaskName = name.parse()?;
        self.get(name)
            .ok_or_else(|| TaskError::NotFound(format!("task {} is not registered", name)))
    }

    /// Registered definitions in declaration order
    pub fn definitions(&self) -> Vec<&TaskDefinition> {
        TaskName::ALL
            .iter()
            .filter_map(|name| self.tasks.get(name))
            .collect()
    }

    /// Retry policy for a task, falling back to the registry default
    pub fn retry_policy(&self, name: TaskName) -> RetryPolicy {
        self.get(name)
            .and_then(|definition| definition.retry)
            .unwrap_or(self.default_retry)
    }

    pub fn default_retry(&self) -> RetryPolicy {
        self.default_retry
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Build the registry with every task wired to `services`
pub fn register_all_tasks(services: &TaskServices) -> Result<TaskRegistry, TaskError> {
    let mut registry = TaskRegistry::new(services.default_retry);
    for name in TaskName::ALL {
        let definition = match name {
            TaskName::DbMaintenance => tasks::db_maintenance::definition()?,
            TaskName::LockOldMovies => tasks::lock_old_movies::definition(services)?,
            TaskName::SeedAchievements => tasks::seed_achievements::definition(services)?,
            TaskName::RefreshMedia => tasks::refresh_media::definition(services)?,
            TaskName::DeleteUser => tasks::delete_user::definition(services)?,
            TaskName::ImportCsv => tasks::import_csv::definition(services)?,
            TaskName::PruneTaskRuns => tasks::prune_task_runs::definition(services)?,
        };
        registry.register(definition);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for name in TaskName::ALL {
            assert_eq!(name.as_str().parse::<TaskName>().unwrap(), name);
            assert_eq!(
                serde_json::to_value(name).unwrap(),
                serde_json::Value::String(name.as_str().to_string())
            );
        }
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        assert!(matches!(
            "reticulate-splines".parse::<TaskName>(),
            Err(TaskError::NotFound(_))
        ));
    }
}
