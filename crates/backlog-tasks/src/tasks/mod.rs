//! Concrete task handlers

pub mod db_maintenance;
pub mod delete_user;
pub mod import_csv;
pub mod lock_old_movies;
pub mod prune_task_runs;
pub mod refresh_media;
pub mod seed_achievements;

use serde::de::DeserializeOwned;

use crate::error::TaskError;

/// Schema for tasks that take no input
pub(crate) fn empty_input_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false
    })
}

/// Decode input that already passed schema validation
pub(crate) fn parse_input<T: DeserializeOwned>(input: serde_json::Value) -> Result<T, TaskError> {
    serde_json::from_value(input).map_err(|e| TaskError::validation(e.to_string()))
}
