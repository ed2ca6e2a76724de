//! Task envelope definitions.
//!
//! - `TaskEnvelope`: the serialized unit of work placed on a queue
//! - `TaskPayload`: one strongly-typed variant per task type
//! - `TaskKind`: the bare discriminator, used for routing and display

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority of an ordinary task (appended to the back of the queue).
pub const PRIORITY_NORMAL: i32 = 1;

/// Lowest priority that is inserted at the front of the queue.
pub const PRIORITY_HIGH: i32 = 2;

/// Default retry budget for a new envelope.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Editing pass over a document section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditDocumentPayload {
    pub document_id: String,
    pub content: String,
    pub instruction: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Layout/formatting pass over a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatDocumentPayload {
    pub document_id: String,
    pub content: String,
    pub style: String,
}

/// Side-by-side bilingual rendition of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BilingualDocumentPayload {
    pub document_id: String,
    pub content: String,
    pub source_language: String,
    pub target_language: String,
}

/// Full translation of a document or chapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslatePayload {
    pub document_id: String,
    pub content: String,
    /// Detected by the handler when absent.
    #[serde(default)]
    pub source_language: Option<String>,
    pub target_language: String,
}

/// Slide deck generation from document content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateSlidesPayload {
    pub document_id: String,
    pub content: String,
    pub slide_count: u32,
    #[serde(default)]
    pub theme: Option<String>,
}

/// Ingestion of an uploaded PDF into book pages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PdfToPagesPayload {
    pub book_id: String,
    pub file_ref: String,
    #[serde(default)]
    pub first_page: Option<u32>,
    #[serde(default)]
    pub last_page: Option<u32>,
}

/// Ingestion of scanned images into a chapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageToChapterPayload {
    pub book_id: String,
    pub chapter_title: String,
    pub image_refs: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Rendering a slide deck to video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportVideoPayload {
    pub slide_deck_id: String,
    pub resolution: String,
    #[serde(default)]
    pub narration_language: Option<String>,
}

/// Task-type-specific payload.
///
/// Serialized inline in the envelope as `"task_type": "...", "payload": {...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "task_type", content = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    EditDocument(EditDocumentPayload),
    FormatDocument(FormatDocumentPayload),
    BilingualDocument(BilingualDocumentPayload),
    Translate(TranslatePayload),
    GenerateSlides(GenerateSlidesPayload),
    PdfToPages(PdfToPagesPayload),
    ImageToChapter(ImageToChapterPayload),
    ExportVideo(ExportVideoPayload),
}

/// Discriminator of a [`TaskPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    EditDocument,
    FormatDocument,
    BilingualDocument,
    Translate,
    GenerateSlides,
    PdfToPages,
    ImageToChapter,
    ExportVideo,
}

impl TaskKind {
    pub const ALL: [TaskKind; 8] = [
        TaskKind::EditDocument,
        TaskKind::FormatDocument,
        TaskKind::BilingualDocument,
        TaskKind::Translate,
        TaskKind::GenerateSlides,
        TaskKind::PdfToPages,
        TaskKind::ImageToChapter,
        TaskKind::ExportVideo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::EditDocument => "edit_document",
            TaskKind::FormatDocument => "format_document",
            TaskKind::BilingualDocument => "bilingual_document",
            TaskKind::Translate => "translate",
            TaskKind::GenerateSlides => "generate_slides",
            TaskKind::PdfToPages => "pdf_to_pages",
            TaskKind::ImageToChapter => "image_to_chapter",
            TaskKind::ExportVideo => "export_video",
        }
    }

    /// The queue-name this kind of task is routed to by default.
    ///
    /// Each category gets its own queue so backpressure and retry budgets stay
    /// isolated.
    pub fn default_queue(&self) -> &'static str {
        match self {
            TaskKind::EditDocument | TaskKind::FormatDocument | TaskKind::BilingualDocument => {
                "ai_editor"
            }
            TaskKind::Translate => "translation_jobs",
            TaskKind::GenerateSlides => "slide_generation",
            TaskKind::PdfToPages | TaskKind::ImageToChapter => "pdf_chapter_queue",
            TaskKind::ExportVideo => "video_export",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown task type '{}'", s))
    }
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::EditDocument(_) => TaskKind::EditDocument,
            TaskPayload::FormatDocument(_) => TaskKind::FormatDocument,
            TaskPayload::BilingualDocument(_) => TaskKind::BilingualDocument,
            TaskPayload::Translate(_) => TaskKind::Translate,
            TaskPayload::GenerateSlides(_) => TaskKind::GenerateSlides,
            TaskPayload::PdfToPages(_) => TaskKind::PdfToPages,
            TaskPayload::ImageToChapter(_) => TaskKind::ImageToChapter,
            TaskPayload::ExportVideo(_) => TaskKind::ExportVideo,
        }
    }

    /// Parses a payload from its task-type name and JSON body.
    pub fn from_parts(kind: TaskKind, payload: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::json!({
            "task_type": kind.as_str(),
            "payload": payload,
        }))
    }

    /// Fields echoed into the Status Record so polling UIs can render the job
    /// without reading the envelope.
    pub fn status_echo(&self) -> Vec<(&'static str, String)> {
        let mut echo = Vec::new();
        match self {
            TaskPayload::EditDocument(p) => {
                echo.push(("document_id", p.document_id.clone()));
                if let Some(lang) = &p.language {
                    echo.push(("language", lang.clone()));
                }
            }
            TaskPayload::FormatDocument(p) => {
                echo.push(("document_id", p.document_id.clone()));
                echo.push(("style", p.style.clone()));
            }
            TaskPayload::BilingualDocument(p) => {
                echo.push(("document_id", p.document_id.clone()));
                echo.push(("source_language", p.source_language.clone()));
                echo.push(("target_language", p.target_language.clone()));
            }
            TaskPayload::Translate(p) => {
                echo.push(("document_id", p.document_id.clone()));
                if let Some(lang) = &p.source_language {
                    echo.push(("source_language", lang.clone()));
                }
                echo.push(("target_language", p.target_language.clone()));
            }
            TaskPayload::GenerateSlides(p) => {
                echo.push(("document_id", p.document_id.clone()));
                echo.push(("slide_count", p.slide_count.to_string()));
            }
            TaskPayload::PdfToPages(p) => {
                echo.push(("book_id", p.book_id.clone()));
                echo.push(("file_ref", p.file_ref.clone()));
            }
            TaskPayload::ImageToChapter(p) => {
                echo.push(("book_id", p.book_id.clone()));
                echo.push(("chapter_title", p.chapter_title.clone()));
                echo.push(("image_count", p.image_refs.len().to_string()));
            }
            TaskPayload::ExportVideo(p) => {
                echo.push(("slide_deck_id", p.slide_deck_id.clone()));
                echo.push(("resolution", p.resolution.clone()));
            }
        }
        echo
    }
}

/// A unit of work stored on a queue.
///
/// `task_id` identifies the envelope inside the queue; `job_id` is the key of
/// the Status Record and stays stable across retries. Callers may set both to
/// the same value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub job_id: String,
    pub owner_id: String,
    #[serde(flatten)]
    pub task: TaskPayload,
    /// Values above 1 are inserted at the front of the queue.
    pub priority: i32,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    /// Set when the envelope is enqueued.
    pub created_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Creates an envelope with a fresh id (used for both `task_id` and
    /// `job_id`), normal priority and the default retry budget.
    pub fn new(owner_id: impl Into<String>, task: TaskPayload) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            task_id: id.clone(),
            job_id: id,
            owner_id: owner_id.into(),
            task,
            priority: PRIORITY_NORMAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.task.kind()
    }

    /// Whether this envelope jumps ahead of normal-priority work.
    pub fn is_priority(&self) -> bool {
        self.priority > PRIORITY_NORMAL
    }

    /// Whether another attempt fits in the retry budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Reads the priority of a serialized envelope without parsing its payload.
///
/// Anything unreadable counts as normal priority.
pub(crate) fn raw_is_priority(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("priority").and_then(serde_json::Value::as_i64))
        .is_some_and(|priority| priority > i64::from(PRIORITY_NORMAL))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate() -> TaskPayload {
        TaskPayload::Translate(TranslatePayload {
            document_id: "doc-1".into(),
            content: "Bonjour".into(),
            source_language: None,
            target_language: "en".into(),
        })
    }

    #[test]
    fn test_envelope_new_defaults() {
        let env = TaskEnvelope::new("user-1", translate());
        assert_eq!(env.task_id, env.job_id);
        assert_eq!(env.priority, PRIORITY_NORMAL);
        assert_eq!(env.max_retries, 3);
        assert_eq!(env.retry_count, 0);
        assert!(!env.is_priority());
        assert!(env.can_retry());
        assert_eq!(env.kind(), TaskKind::Translate);
    }

    #[test]
    fn test_envelope_wire_shape_is_flat() {
        let env = TaskEnvelope::new("user-1", translate())
            .with_task_id("t1")
            .with_job_id("j1")
            .with_priority(3);
        let value = serde_json::to_value(&env).expect("serialize");

        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["job_id"], "j1");
        assert_eq!(value["task_type"], "translate");
        assert_eq!(value["payload"]["target_language"], "en");
        assert_eq!(value["priority"], 3);

        let back: TaskEnvelope = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, env);
    }

    #[test]
    fn test_unknown_task_type_is_rejected() {
        let raw = r#"{"task_id":"t","job_id":"j","owner_id":"u","task_type":"summon_dragon",
            "payload":{},"priority":1,"max_retries":1,"created_at":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<TaskEnvelope>(raw).is_err());
    }

    #[test]
    fn test_retry_count_defaults_when_absent() {
        let raw = r#"{"task_id":"t","job_id":"j","owner_id":"u","task_type":"export_video",
            "payload":{"slide_deck_id":"d","resolution":"1080p"},"priority":1,"max_retries":1,
            "created_at":"2024-01-01T00:00:00Z"}"#;
        let env: TaskEnvelope = serde_json::from_str(raw).expect("parse");
        assert_eq!(env.retry_count, 0);
        assert_eq!(env.kind(), TaskKind::ExportVideo);
    }

    #[test]
    fn test_kind_routing_and_parsing() {
        assert_eq!(TaskKind::Translate.default_queue(), "translation_jobs");
        assert_eq!(TaskKind::PdfToPages.default_queue(), "pdf_chapter_queue");
        assert_eq!(TaskKind::FormatDocument.default_queue(), "ai_editor");
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>(), Ok(kind));
        }
        assert!("nope".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_from_parts() {
        let payload = TaskPayload::from_parts(
            TaskKind::GenerateSlides,
            serde_json::json!({"document_id": "d", "content": "c", "slide_count": 12}),
        )
        .expect("valid payload");
        assert_eq!(payload.kind(), TaskKind::GenerateSlides);

        let bad = TaskPayload::from_parts(TaskKind::GenerateSlides, serde_json::json!({}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_status_echo() {
        let echo = translate().status_echo();
        assert!(echo.contains(&("document_id", "doc-1".to_string())));
        assert!(echo.contains(&("target_language", "en".to_string())));
        assert!(!echo.iter().any(|(k, _)| *k == "source_language"));
    }

    #[test]
    fn test_raw_is_priority() {
        assert!(raw_is_priority(r#"{"priority":2}"#));
        assert!(!raw_is_priority(r#"{"priority":1}"#));
        assert!(!raw_is_priority("not json"));
    }
}
