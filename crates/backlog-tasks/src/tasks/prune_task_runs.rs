//! Delete old run records

use async_trait::async_trait;
use backlog_persist::RunHistoryStore;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::definition::{define_task, TaskDefinition, TaskHandler, Visibility};
use crate::error::TaskError;
use crate::registry::TaskName;
use crate::services::TaskServices;
use crate::tasks::parse_input;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PruneInput {
    older_than_days: u32,
}

#[derive(Debug)]
struct PruneTaskRuns {
    runs: Arc<dyn RunHistoryStore>,
}

#[async_trait]
impl TaskHandler for PruneTaskRuns {
    async fn run(&self, ctx: &ExecutionContext, input: serde_json::Value) -> Result<(), TaskError> {
        let input: PruneInput = parse_input(input)?;
        let cutoff = Utc::now() - Duration::days(i64::from(input.older_than_days));

        let pruned = ctx
            .step("prune", || async {
                Ok(self.runs.delete_finished_before(cutoff).await?)
            })
            .await?;

        ctx.info(format!("Removed runs finished before {}", cutoff.to_rfc3339()));
        ctx.metric("runs.pruned", pruned);
        Ok(())
    }
}

pub fn definition(services: &TaskServices) -> Result<TaskDefinition, TaskError> {
    define_task(
        TaskName::PruneTaskRuns,
        "Delete finished run records older than a number of days",
        Visibility::Admin,
        serde_json::json!({
            "type": "object",
            "properties": {
                "olderThanDays": {"type": "integer", "minimum": 1, "maximum": 3650}
            },
            "required": ["olderThanDays"],
            "additionalProperties": false
        }),
        PruneTaskRuns {
            runs: services.runs.clone(),
        },
    )
}
