//! Remove a user and everything on their list

use async_trait::async_trait;
use backlog_persist::MediaStore;
use serde::Deserialize;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::definition::{define_task, TaskDefinition, TaskHandler, Visibility};
use crate::error::TaskError;
use crate::registry::TaskName;
use crate::services::TaskServices;
use crate::tasks::parse_input;

const TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteUserInput {
    user_id: String,
}

#[derive(Debug)]
struct DeleteUser {
    media: MediaStore,
}

#[async_trait]
impl TaskHandler for DeleteUser {
    async fn run(&self, ctx: &ExecutionContext, input: serde_json::Value) -> Result<(), TaskError> {
        let input: DeleteUserInput = parse_input(input)?;

        let deleted = ctx
            .step("delete", || {
                ctx.db().with_transaction(|_| async {
                    Ok::<_, TaskError>(self.media.delete_user(&input.user_id).await?)
                })
            })
            .await?;

        if deleted.account {
            ctx.info(format!("Deleted user {}", input.user_id));
        } else {
            // Already gone, e.g. a retry after the first attempt committed
            ctx.warn(format!("User {} does not exist, nothing to delete", input.user_id));
        }
        ctx.metric("user.list_entries_deleted", deleted.list_entries);
        Ok(())
    }
}

pub fn definition(services: &TaskServices) -> Result<TaskDefinition, TaskError> {
    define_task(
        TaskName::DeleteUser,
        "Delete a user account and its list entries",
        Visibility::Admin,
        serde_json::json!({
            "type": "object",
            "properties": {
                "userId": {"type": "string", "minLength": 1}
            },
            "required": ["userId"],
            "additionalProperties": false
        }),
        DeleteUser {
            media: services.media.clone(),
        },
    )
    .map(|definition| definition.with_timeout(TIMEOUT))
}
