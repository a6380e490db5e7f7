//! Import a user's list from an uploaded CSV file
//!
//! Expected header: `external_id,title,status,rating` (any column order,
//! `rating` optional). Fields may be quoted; `""` inside quotes is a quote.

use async_trait::async_trait;
use backlog_persist::{ImportedEntry, MediaStore, TriggeredBy};
use backlog_providers::MediaType;
use serde::Deserialize;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::definition::{define_task, TaskDefinition, TaskHandler, Visibility};
use crate::error::TaskError;
use crate::registry::TaskName;
use crate::services::TaskServices;
use crate::tasks::parse_input;

const TIMEOUT: Duration = Duration::from_secs(10 * 60);

const STATUSES: [&str; 5] = ["planned", "in_progress", "completed", "on_hold", "dropped"];
const MAX_RATING: f64 = 10.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportInput {
    user_id: String,
    file_path: String,
    media_type: MediaType,
}

#[derive(Debug)]
struct ImportCsv {
    media: MediaStore,
}

/// Records of a CSV file, each with the line it starts on.
///
/// Quoted fields may contain commas, doubled quotes and line breaks.
/// Blank lines are skipped.
fn split_records(text: &str) -> Result<Vec<(usize, Vec<String>)>, String> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut saw_quote = false;
    let mut line = 1;
    let mut start = 1;
    let mut chars = text.chars().peekable();

    loop {
        let next = chars.next();
        match (next, quoted) {
            (Some('"'), true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            (Some('"'), true) => quoted = false,
            (Some('"'), false) if field.is_empty() => {
                quoted = true;
                saw_quote = true;
            }
            (Some(','), false) => fields.push(std::mem::take(&mut field)),
            (Some('\r'), false) if chars.peek() == Some(&'\n') => {}
            (None, true) => return Err(format!("line {}: unterminated quoted field", start)),
            (Some('\n'), false) | (None, false) => {
                fields.push(std::mem::take(&mut field));
                let blank = !saw_quote && fields.len() == 1 && fields[0].trim().is_empty();
                let record = std::mem::take(&mut fields);
                if !blank {
                    records.push((start, record));
                }
                if next.is_none() {
                    return Ok(records);
                }
                saw_quote = false;
                line += 1;
                start = line;
            }
            (Some(c), _) => {
                if c == '\n' {
                    line += 1;
                }
                field.push(c);
            }
        }
    }
}

struct Columns {
    external_id: usize,
    title: usize,
    status: usize,
    rating: Option<usize>,
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self, String> {
        let find = |name: &str| {
            header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let require = |name: &str| find(name).ok_or_else(|| format!("missing column {}", name));
        Ok(Self {
            external_id: require("external_id")?,
            title: require("title")?,
            status: require("status")?,
            rating: find("rating"),
        })
    }

    fn entry(&self, fields: &[String]) -> Result<ImportedEntry, String> {
        let get = |i: usize| fields.get(i).map(|f| f.trim()).unwrap_or("");

        let external_id = get(self.external_id);
        if external_id.is_empty() {
            return Err("external_id is empty".to_string());
        }
        let title = get(self.title);
        if title.is_empty() {
            return Err("title is empty".to_string());
        }
        let status = get(self.status).to_ascii_lowercase();
        if !STATUSES.contains(&status.as_str()) {
            return Err(format!("unknown status {:?}", status));
        }
        let rating = match self.rating.map(get).filter(|r| !r.is_empty()) {
            None => None,
            Some(raw) => {
                let rating: f64 = raw.parse().map_err(|_| format!("rating {:?} is not a number", raw))?;
                if !(0.0..=MAX_RATING).contains(&rating) {
                    return Err(format!("rating {} is outside 0..={}", rating, MAX_RATING));
                }
                Some(rating)
            }
        };

        Ok(ImportedEntry {
            external_id: external_id.to_string(),
            title: title.to_string(),
            status,
            rating,
        })
    }
}

/// Parse the whole file, reporting every bad record
pub fn parse_csv(text: &str) -> Result<Vec<ImportedEntry>, TaskError> {
    let mut records = split_records(text).map_err(TaskError::validation)?.into_iter();

    let Some((line, header)) = records.next() else {
        return Err(TaskError::validation("file is empty"));
    };
    let columns = Columns::from_header(&header)
        .map_err(|e| TaskError::validation(format!("line {}: {}", line, e)))?;

    let mut entries = Vec::new();
    let mut errors = Vec::new();
    for (number, fields) in records {
        match columns.entry(&fields) {
            Ok(entry) => entries.push(entry),
            Err(e) => errors.push(format!("line {}: {}", number, e)),
        }
    }

    if errors.is_empty() {
        Ok(entries)
    } else {
        Err(TaskError::Validation(errors))
    }
}

#[async_trait]
impl TaskHandler for ImportCsv {
    async fn run(&self, ctx: &ExecutionContext, input: serde_json::Value) -> Result<(), TaskError> {
        let input: ImportInput = parse_input(input)?;

        // Users may only import into their own list
        if ctx.triggered_by() == TriggeredBy::User && ctx.user_id() != Some(input.user_id.as_str()) {
            return Err(TaskError::Forbidden {
                task: ctx.task_name().to_string(),
                triggered_by: format!("user {}", ctx.user_id().unwrap_or("anonymous")),
            });
        }

        let text = ctx
            .step("read-file", || async {
                Ok(tokio::fs::read_to_string(&input.file_path).await?)
            })
            .await?;

        let entries = ctx.step("parse", || async { parse_csv(&text) }).await?;
        ctx.info(format!("Parsed {} rows", entries.len()));

        let imported = ctx
            .step("persist", || {
                ctx.db().with_transaction(|_| async {
                    if !self.media.user_exists(&input.user_id).await? {
                        return Err(TaskError::NotFound(format!("user {}", input.user_id)));
                    }
                    Ok(self
                        .media
                        .import_entries(&input.user_id, input.media_type.as_str(), &entries)
                        .await?)
                })
            })
            .await?;
        ctx.metric("import.rows", imported);

        ctx.step("cleanup", || async {
            match tokio::fs::remove_file(&input.file_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(TaskError::from(e)),
            }
        })
        .await
    }
}

pub fn definition(services: &TaskServices) -> Result<TaskDefinition, TaskError> {
    let media_types: Vec<&str> = MediaType::ALL.iter().map(|t| t.as_str()).collect();
    define_task(
        TaskName::ImportCsv,
        "Import list entries for a user from an uploaded CSV file",
        Visibility::User,
        serde_json::json!({
            "type": "object",
            "properties": {
                "userId": {"type": "string", "minLength": 1},
                "filePath": {"type": "string", "minLength": 1},
                "mediaType": {"type": "string", "enum": media_types}
            },
            "required": ["userId", "filePath", "mediaType"],
            "additionalProperties": false
        }),
        ImportCsv {
            media: services.media.clone(),
        },
    )
    .map(|definition| definition.with_timeout(TIMEOUT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(text: &str) -> Vec<String> {
        split_records(text).unwrap().remove(0).1
    }

    #[test]
    fn test_quoted_fields() {
        assert_eq!(
            fields(r#"603,"The Matrix, Reloaded",completed,"8.5""#),
            vec!["603", "The Matrix, Reloaded", "completed", "8.5"]
        );
        assert_eq!(
            fields(r#"1,"Say ""hello""",planned,"#),
            vec!["1", r#"Say "hello""#, "planned", ""]
        );
    }

    #[test]
    fn test_quoted_field_spans_lines() {
        let text = "external_id,title,status\r\n\
                    1,\"Part one\r\nPart two\",completed\r\n\
                    2,Plain,planned\r\n";
        let records = split_records(text).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], (2, vec!["1".into(), "Part one\r\nPart two".into(), "completed".into()]));
        // Numbering follows physical lines
        assert_eq!(records[2].0, 4);

        let entries = parse_csv(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Part one\r\nPart two");
        assert_eq!(entries[1].external_id, "2");
    }

    #[test]
    fn test_unterminated_quote_rejects_the_file() {
        let text = "external_id,title,status\n1,\"Never closed,completed\n2,Fine,planned\n";
        match parse_csv(text) {
            Err(TaskError::Validation(errors)) => {
                assert_eq!(errors, vec!["line 2: unterminated quoted field".to_string()]);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_csv() {
        let text = "Title,external_id,status,rating\r\n\
                    Arrival,329865,completed,9\r\n\
                    \r\n\
                    Dune,438631,PLANNED,\r\n";
        let entries = parse_csv(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].external_id, "329865");
        assert_eq!(entries[0].rating, Some(9.0));
        assert_eq!(entries[1].status, "planned");
        assert_eq!(entries[1].rating, None);
    }

    #[test]
    fn test_parse_csv_reports_every_bad_line() {
        let text = "external_id,title,status\n1,Ok,completed\n,Missing id,completed\n3,Bad,finished\n";
        match parse_csv(text) {
            Err(TaskError::Validation(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].starts_with("line 3:"));
                assert!(errors[1].starts_with("line 4:"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_column_is_rejected() {
        assert!(matches!(
            parse_csv("external_id,title\n1,Arrival\n"),
            Err(TaskError::Validation(_))
        ));
    }
}
