//! Refresh stored metadata from the external providers
//!
//! Provider calls happen outside any transaction; only the writes of the
//! fetched payloads are wrapped in one.

use async_trait::async_trait;
use backlog_persist::{MediaRecord, MediaStore};
use backlog_providers::{MediaType, ProviderRegistry};
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::definition::{define_task, TaskDefinition, TaskHandler, Visibility};
use crate::error::TaskError;
use crate::registry::TaskName;
use crate::services::TaskServices;
use crate::tasks::parse_input;

/// Rate-limited provider calls for up to 500 titles
const TIMEOUT: Duration = Duration::from_secs(60 * 60);

const DEFAULT_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshInput {
    media_type: MediaType,
    #[serde(default)]
    ids: Option<Vec<String>>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug)]
struct RefreshMedia {
    media: MediaStore,
    providers: ProviderRegistry,
}

struct Fetched {
    payloads: Vec<(i64, serde_json::Value)>,
    failed: usize,
    /// Error that stopped the fetch loop early
    interrupted: Option<TaskError>,
}

/// Title from the fields the providers use for it
fn title_of(payload: &serde_json::Value) -> Option<&str> {
    ["title", "name"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(|v| v.as_str()))
        .filter(|title| !title.trim().is_empty())
}

/// Release date from the fields the providers use for it (leading `YYYY-MM-DD`)
fn release_date_of(payload: &serde_json::Value) -> Option<NaiveDate> {
    ["release_date", "first_air_date", "first_publish_date"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(|v| v.as_str()))
        .find_map(|raw| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

impl RefreshMedia {
    async fn fetch_all(
        &self,
        ctx: &ExecutionContext,
        media_type: MediaType,
        records: &[MediaRecord],
    ) -> Result<Fetched, TaskError> {
        let provider = self.providers.get(media_type).ok_or_else(|| {
            TaskError::NotFound(format!("no provider configured for {}", media_type))
        })?;

        let mut fetched = Fetched {
            payloads: Vec::with_capacity(records.len()),
            failed: 0,
            interrupted: None,
        };
        for (i, record) in records.iter().enumerate() {
            match provider.fetch(&record.external_id).await {
                Ok(payload) => fetched.payloads.push((record.id, payload)),
                Err(e) => {
                    let err = TaskError::from(e);
                    if err.is_retryable() {
                        ctx.warn(format!(
                            "Stopping after {} of {} titles: {}",
                            i,
                            records.len(),
                            err
                        ));
                        fetched.interrupted = Some(err);
                        break;
                    }
                    fetched.failed += 1;
                    ctx.warn(format!("Skipping {}: {}", record.external_id, err));
                }
            }
            // Fetching is most of the work; persisting is the last fifth
            let done = (i + 1) * 80 / records.len();
            ctx.progress(done as u32).await;
        }
        Ok(fetched)
    }
}

#[async_trait]
impl TaskHandler for RefreshMedia {
    async fn run(&self, ctx: &ExecutionContext, input: serde_json::Value) -> Result<(), TaskError> {
        let input: RefreshInput = parse_input(input)?;
        let limit = input.limit.unwrap_or(DEFAULT_LIMIT);

        let records = ctx
            .step("select", || async {
                Ok(self
                    .media
                    .media_for_refresh(input.media_type.as_str(), input.ids.as_deref(), limit)
                    .await?)
            })
            .await?;
        ctx.info(format!("{} {} titles due for refresh", records.len(), input.media_type));
        if records.is_empty() {
            ctx.metric("media.refreshed", 0_i64);
            ctx.progress(100).await;
            return Ok(());
        }

        let fetched = ctx
            .step("fetch", || self.fetch_all(ctx, input.media_type, &records))
            .await?;

        let refreshed = ctx
            .step("persist", || {
                ctx.db().with_transaction(|_| async {
                    let mut refreshed = 0_u64;
                    for (id, payload) in &fetched.payloads {
                        let applied = self
                            .media
                            .apply_refresh(*id, title_of(payload), release_date_of(payload), payload)
                            .await?;
                        if applied {
                            refreshed += 1;
                        }
                    }
                    Ok::<_, TaskError>(refreshed)
                })
            })
            .await?;

        ctx.metric("media.refreshed", refreshed);
        ctx.metric("media.failed", fetched.failed);

        match fetched.interrupted {
            // What was fetched is kept; the retry picks up the rest
            Some(err) => Err(err),
            None => {
                ctx.progress(100).await;
                Ok(())
            }
        }
    }
}

pub fn definition(services: &TaskServices) -> Result<TaskDefinition, TaskError> {
    let media_types: Vec<&str> = MediaType::ALL.iter().map(|t| t.as_str()).collect();
    define_task(
        TaskName::RefreshMedia,
        "Fetch fresh metadata for unlocked titles of one media type",
        Visibility::Admin,
        serde_json::json!({
            "type": "object",
            "properties": {
                "mediaType": {"type": "string", "enum": media_types},
                "ids": {
                    "type": "array",
                    "items": {"type": "string", "minLength": 1},
                    "minItems": 1
                },
                "limit": {"type": "integer", "minimum": 1, "maximum": 500}
            },
            "required": ["mediaType"],
            "additionalProperties": false
        }),
        RefreshMedia {
            media: services.media.clone(),
            providers: services.providers.clone(),
        },
    )
    .map(|definition| definition.with_timeout(TIMEOUT))
}
