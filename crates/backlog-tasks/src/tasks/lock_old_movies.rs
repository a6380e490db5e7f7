//! Lock movie metadata once a title is six months past release

use async_trait::async_trait;
use backlog_persist::MediaStore;
use chrono::{Months, NaiveDate, Utc};

use crate::context::ExecutionContext;
use crate::definition::{define_task, TaskDefinition, TaskHandler, Visibility};
use crate::error::TaskError;
use crate::registry::TaskName;
use crate::services::TaskServices;
use crate::tasks::empty_input_schema;

const LOCK_AFTER_MONTHS: u32 = 6;

#[derive(Debug)]
struct LockOldMovies {
    media: MediaStore,
}

/// Movies released before this date get locked
pub fn cutoff(today: NaiveDate) -> NaiveDate {
    today
        .checked_sub_months(Months::new(LOCK_AFTER_MONTHS))
        .unwrap_or(NaiveDate::MIN)
}

#[async_trait]
impl TaskHandler for LockOldMovies {
    async fn run(&self, ctx: &ExecutionContext, _input: serde_json::Value) -> Result<(), TaskError> {
        let cutoff = cutoff(Utc::now().date_naive());
        ctx.info(format!("Locking movies released before {}", cutoff));

        let locked = ctx
            .step("lock", || {
                ctx.db().with_transaction(|_| async {
                    Ok::<_, TaskError>(self.media.lock_movies_released_before(cutoff).await?)
                })
            })
            .await?;

        ctx.metric("movies.locked", locked);
        Ok(())
    }
}

pub fn definition(services: &TaskServices) -> Result<TaskDefinition, TaskError> {
    define_task(
        TaskName::LockOldMovies,
        "Lock metadata of movies released more than six months ago",
        Visibility::Admin,
        empty_input_schema(),
        LockOldMovies {
            media: services.media.clone(),
        },
    )
}
