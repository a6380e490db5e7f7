//! Seed the achievement ladder

use async_trait::async_trait;
use backlog_persist::{Achievement, MediaStore};

use crate::context::ExecutionContext;
use crate::definition::{define_task, TaskDefinition, TaskHandler, Visibility};
use crate::error::TaskError;
use crate::registry::TaskName;
use crate::services::TaskServices;
use crate::tasks::empty_input_schema;

/// (name, verb, noun, thresholds per tier)
const LADDERS: &[(&str, &str, &str, [u32; 4])] = &[
    ("movie-buff", "Watch", "movies", [10, 50, 250, 1000]),
    ("binge-watcher", "Finish", "series", [5, 25, 100, 300]),
    ("otaku", "Finish", "anime", [5, 25, 100, 300]),
    ("bookworm", "Read", "books", [5, 25, 100, 500]),
    ("completionist", "Finish", "games", [5, 20, 75, 200]),
    ("critic", "Rate", "titles", [10, 100, 500, 2000]),
];

/// Every tier that should exist
pub fn achievement_tiers() -> Vec<Achievement> {
    LADDERS
        .iter()
        .flat_map(|(name, verb, noun, thresholds)| {
            thresholds.iter().enumerate().map(move |(i, threshold)| Achievement {
                name: name.to_string(),
                tier: i as u32 + 1,
                threshold: *threshold,
                description: format!("{} {} {}", verb, threshold, noun),
            })
        })
        .collect()
}

#[derive(Debug)]
struct SeedAchievements {
    media: MediaStore,
}

#[async_trait]
impl TaskHandler for SeedAchievements {
    async fn run(&self, ctx: &ExecutionContext, _input: serde_json::Value) -> Result<(), TaskError> {
        let tiers = achievement_tiers();

        ctx.step("seed", || {
            ctx.db().with_transaction(|_| async {
                Ok::<_, TaskError>(self.media.upsert_achievements(&tiers).await?)
            })
        })
        .await?;

        ctx.metric("achievements.seeded", tiers.len());
        ctx.metric("achievements.total", self.media.count_achievements().await?);
        Ok(())
    }
}

pub fn definition(services: &TaskServices) -> Result<TaskDefinition, TaskError> {
    define_task(
        TaskName::SeedAchievements,
        "Create or update every achievement tier",
        Visibility::Admin,
        empty_input_schema(),
        SeedAchievements {
            media: services.media.clone(),
        },
    )
}
