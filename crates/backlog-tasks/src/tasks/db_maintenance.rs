//! Routine SQLite upkeep

use async_trait::async_trait;
use backlog_persist::StorageError;
use sqlx::Row;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::definition::{define_task, TaskDefinition, TaskHandler, Visibility};
use crate::error::TaskError;
use crate::registry::TaskName;
use crate::tasks::empty_input_schema;

/// VACUUM rewrites the whole file
const TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct DbMaintenance;

async fn pragma_value(ctx: &ExecutionContext, pragma: &str) -> Result<i64, TaskError> {
    let row = ctx
        .db()
        .client()
        .fetch_one(sqlx::query(pragma))
        .await?;
    Ok(row.try_get::<i64, _>(0).map_err(StorageError::from)?)
}

#[async_trait]
impl TaskHandler for DbMaintenance {
    async fn run(&self, ctx: &ExecutionContext, _input: serde_json::Value) -> Result<(), TaskError> {
        let client = ctx.db().client();

        ctx.step("run-pragmas", || async {
            let row = client.fetch_one(sqlx::query("PRAGMA quick_check")).await?;
            let check: String = row.try_get(0).map_err(StorageError::from)?;
            if check != "ok" {
                return Err(TaskError::fatal(format!("quick_check reported: {}", check)));
            }
            client.execute(sqlx::query("PRAGMA optimize")).await?;
            Ok(())
        })
        .await?;

        // VACUUM cannot run inside a transaction
        ctx.step("vacuum", || async {
            client.execute(sqlx::query("VACUUM")).await?;
            Ok(())
        })
        .await?;

        ctx.step("analyze", || async {
            client.execute(sqlx::query("ANALYZE")).await?;
            Ok(())
        })
        .await?;

        ctx.step("collect-settings", || async {
            let page_size = pragma_value(ctx, "PRAGMA page_size").await?;
            let page_count = pragma_value(ctx, "PRAGMA page_count").await?;
            let freelist = pragma_value(ctx, "PRAGMA freelist_count").await?;
            let row = client.fetch_one(sqlx::query("PRAGMA journal_mode")).await?;
            let journal_mode: String = row.try_get(0).map_err(StorageError::from)?;

            ctx.metric("db.page_size", page_size);
            ctx.metric("db.page_count", page_count);
            ctx.metric("db.freelist_count", freelist);
            ctx.metric("db.size_bytes", page_size.saturating_mul(page_count));
            ctx.metric("db.journal_mode", journal_mode);
            Ok(())
        })
        .await
    }
}

pub fn definition() -> Result<TaskDefinition, TaskError> {
    define_task(
        TaskName::DbMaintenance,
        "Check integrity, vacuum and analyze the database, then report its settings",
        Visibility::Admin,
        empty_input_schema(),
        DbMaintenance,
    )
    .map(|definition| definition.with_timeout(TIMEOUT))
}
