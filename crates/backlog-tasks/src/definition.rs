//! Task definitions

use async_trait::async_trait;
use backlog_persist::TriggeredBy;
use backlog_queue::BackoffStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::error::TaskError;
use crate::registry::TaskName;

/// Who may trigger a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Operators only: dashboard, cron or CLI
    Admin,
    /// Any trigger, including end users
    User,
}

impl Visibility {
    pub fn allows(&self, triggered_by: TriggeredBy) -> bool {
        match self {
            Self::User => true,
            Self::Admin => matches!(triggered_by, TriggeredBy::Dashboard | TriggeredBy::CronOrCli),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

/// Compiled JSON Schema for a task's input
pub struct InputSchema {
    raw: serde_json::Value,
    validator: jsonschema::Validator,
}

impl fmt::Debug for InputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSchema").field("raw", &self.raw).finish()
    }
}

impl InputSchema {
    pub fn new(raw: serde_json::Value) -> Result<Self, TaskError> {
        let validator = jsonschema::validator_for(&raw)
            .map_err(|e| TaskError::fatal(format!("invalid input schema: {}", e)))?;
        Ok(Self { raw, validator })
    }

    /// Check `input`, reporting every violation at once
    pub fn validate(&self, input: &serde_json::Value) -> Result<(), TaskError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(input)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TaskError::Validation(errors))
        }
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }
}

/// The work a task performs
#[async_trait]
pub trait TaskHandler: Send + Sync + fmt::Debug {
    /// Must be safe to run again with the same input
    async fn run(&self, ctx: &ExecutionContext, input: serde_json::Value) -> Result<(), TaskError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential {
                initial_secs: 1,
                multiplier: 2.0,
            },
        }
    }
}

/// An immutable task definition
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: TaskName,
    pub description: &'static str,
    pub visibility: Visibility,
    pub input_schema: Arc<InputSchema>,
    /// Falls back to the registry default when unset
    pub retry: Option<RetryPolicy>,
    /// Upper bound on one attempt
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn TaskHandler>,
}

impl TaskDefinition {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject triggers the task's visibility does not admit
    pub fn authorize(&self, triggered_by: TriggeredBy) -> Result<(), TaskError> {
        if self.visibility.allows(triggered_by) {
            Ok(())
        } else {
            Err(TaskError::Forbidden {
                task: self.name.to_string(),
                triggered_by: triggered_by.to_string(),
            })
        }
    }
}

/// Build a definition; fails only when the schema itself is malformed
pub fn define_task(
    name: TaskName,
    description: &'static str,
    visibility: Visibility,
    input_schema: serde_json::Value,
    handler: impl TaskHandler + 'static,
) -> Result<TaskDefinition, TaskError> {
    Ok(TaskDefinition {
        name,
        description,
        visibility,
        input_schema: Arc::new(InputSchema::new(input_schema)?),
        retry: None,
        timeout: None,
        handler: Arc::new(handler),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn run(&self, _ctx: &ExecutionContext, _input: serde_json::Value) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn test_admin_tasks_reject_user_triggers() {
        assert!(!Visibility::Admin.allows(TriggeredBy::User));
        assert!(Visibility::Admin.allows(TriggeredBy::Dashboard));
        assert!(Visibility::Admin.allows(TriggeredBy::CronOrCli));
        assert!(Visibility::User.allows(TriggeredBy::User));
    }

    #[test]
    fn test_schema_reports_every_violation() {
        let schema = InputSchema::new(json!({
            "type": "object",
            "properties": {
                "userId": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1}
            },
            "required": ["userId"],
            "additionalProperties": false
        }))
        .unwrap();

        assert!(schema.validate(&json!({"userId": "u1"})).is_ok());
        match schema.validate(&json!({"limit": 0})) {
            Err(TaskError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_schema_is_rejected() {
        let result = define_task(
            TaskName::DbMaintenance,
            "broken",
            Visibility::Admin,
            json!({"type": "not-a-type"}),
            Noop,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_authorize_names_task_and_trigger() {
        let definition = define_task(
            TaskName::DeleteUser,
            "test",
            Visibility::Admin,
            json!({"type": "object"}),
            Noop,
        )
        .unwrap();
        let err = definition.authorize(TriggeredBy::User).unwrap_err();
        assert_eq!(err.to_string(), "delete-user cannot be triggered by user");
    }
}
