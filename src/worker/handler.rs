//! Task execution seam.
//!
//! A [`TaskExecutor`] has one method per task kind and [`dispatch`] matches
//! exhaustively on [`TaskPayload`], so adding a task kind fails to compile
//! until every executor decides what to do with it.
//!
//! Handlers receive only the payload. They may run more than once for the same
//! task (delivery is at-least-once) and must be safe to repeat.

use async_trait::async_trait;
use serde_json::json;

use crate::error::HandlerError;
use crate::queue::{
    BilingualDocumentPayload, EditDocumentPayload, ExportVideoPayload, FormatDocumentPayload,
    GenerateSlidesPayload, ImageToChapterPayload, PdfToPagesPayload, TaskKind, TaskOutput,
    TaskPayload, TranslatePayload,
};

pub type HandlerResult = Result<TaskOutput, HandlerError>;

/// Business logic for each task kind.
///
/// Every method defaults to a permanent "unsupported" failure, so an executor
/// deployed for one queue implements only the kinds that queue carries; a
/// stray task of another kind is dead-lettered instead of retried.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn edit_document(&self, payload: &EditDocumentPayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::EditDocument))
    }

    async fn format_document(&self, payload: &FormatDocumentPayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::FormatDocument))
    }

    async fn bilingual_document(&self, payload: &BilingualDocumentPayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::BilingualDocument))
    }

    async fn translate(&self, payload: &TranslatePayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::Translate))
    }

    async fn generate_slides(&self, payload: &GenerateSlidesPayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::GenerateSlides))
    }

    async fn pdf_to_pages(&self, payload: &PdfToPagesPayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::PdfToPages))
    }

    async fn image_to_chapter(&self, payload: &ImageToChapterPayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::ImageToChapter))
    }

    async fn export_video(&self, payload: &ExportVideoPayload) -> HandlerResult {
        let _ = payload;
        Err(unsupported(TaskKind::ExportVideo))
    }
}

fn unsupported(kind: TaskKind) -> HandlerError {
    HandlerError::permanent(format!("no handler registered for task type '{}'", kind))
}

/// Runs the handler matching `task`'s kind.
pub async fn dispatch(executor: &dyn TaskExecutor, task: &TaskPayload) -> HandlerResult {
    match task {
        TaskPayload::EditDocument(p) => executor.edit_document(p).await,
        TaskPayload::FormatDocument(p) => executor.format_document(p).await,
        TaskPayload::BilingualDocument(p) => executor.bilingual_document(p).await,
        TaskPayload::Translate(p) => executor.translate(p).await,
        TaskPayload::GenerateSlides(p) => executor.generate_slides(p).await,
        TaskPayload::PdfToPages(p) => executor.pdf_to_pages(p).await,
        TaskPayload::ImageToChapter(p) => executor.image_to_chapter(p).await,
        TaskPayload::ExportVideo(p) => executor.export_video(p).await,
    }
}

/// Acknowledges every task without doing any work.
///
/// Used to smoke-test a deployment end to end: producers, store, workers and
/// status polling all run for real, only the AI and media calls are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn edit_document(&self, payload: &EditDocumentPayload) -> HandlerResult {
        Ok(TaskOutput::complete(json!({
            "document_id": payload.document_id,
            "content": payload.content,
        })))
    }

    async fn format_document(&self, payload: &FormatDocumentPayload) -> HandlerResult {
        Ok(TaskOutput::complete(json!({
            "document_id": payload.document_id,
            "style": payload.style,
            "content": payload.content,
        })))
    }

    async fn bilingual_document(&self, payload: &BilingualDocumentPayload) -> HandlerResult {
        Ok(TaskOutput::complete(json!({
            "document_id": payload.document_id,
            "source_language": payload.source_language,
            "target_language": payload.target_language,
            "content": payload.content,
        })))
    }

    async fn translate(&self, payload: &TranslatePayload) -> HandlerResult {
        Ok(TaskOutput::complete(json!({
            "document_id": payload.document_id,
            "target_language": payload.target_language,
            "content": payload.content,
        })))
    }

    async fn generate_slides(&self, payload: &GenerateSlidesPayload) -> HandlerResult {
        let slides: Vec<_> = (1..=payload.slide_count)
            .map(|n| json!({ "index": n, "title": format!("Slide {}", n) }))
            .collect();
        Ok(TaskOutput::complete(json!({
            "document_id": payload.document_id,
            "slides": slides,
        })))
    }

    async fn pdf_to_pages(&self, payload: &PdfToPagesPayload) -> HandlerResult {
        Ok(TaskOutput::complete(json!({
            "book_id": payload.book_id,
            "file_ref": payload.file_ref,
            "first_page": payload.first_page,
            "last_page": payload.last_page,
        })))
    }

    async fn image_to_chapter(&self, payload: &ImageToChapterPayload) -> HandlerResult {
        Ok(TaskOutput::complete(json!({
            "book_id": payload.book_id,
            "chapter_title": payload.chapter_title,
            "images": payload.image_refs.len(),
        })))
    }

    async fn export_video(&self, payload: &ExportVideoPayload) -> HandlerResult {
        Ok(TaskOutput::complete(json!({
            "slide_deck_id": payload.slide_deck_id,
            "resolution": payload.resolution,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TranslateOnly;

    #[async_trait]
    impl TaskExecutor for TranslateOnly {
        async fn translate(&self, payload: &TranslatePayload) -> HandlerResult {
            Ok(TaskOutput::complete(json!({ "translated": payload.content.to_uppercase() })))
        }
    }

    fn translate_task() -> TaskPayload {
        TaskPayload::Translate(TranslatePayload {
            document_id: "doc".into(),
            content: "hola".into(),
            source_language: None,
            target_language: "en".into(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let output = dispatch(&TranslateOnly, &translate_task()).await.unwrap();
        assert_eq!(output.result["translated"], "HOLA");
        assert!(!output.partial);
    }

    #[tokio::test]
    async fn test_unimplemented_kind_is_permanent_failure() {
        let task = TaskPayload::ExportVideo(ExportVideoPayload {
            slide_deck_id: "deck".into(),
            resolution: "1080p".into(),
            narration_language: None,
        });
        let err = dispatch(&TranslateOnly, &task).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("export_video"));
    }

    #[tokio::test]
    async fn test_echo_executor_handles_every_kind() {
        let slides = TaskPayload::GenerateSlides(GenerateSlidesPayload {
            document_id: "doc".into(),
            content: "outline".into(),
            slide_count: 3,
            theme: None,
        });
        let output = dispatch(&EchoExecutor, &slides).await.unwrap();
        assert_eq!(output.result["slides"].as_array().map(Vec::len), Some(3));

        let output = dispatch(&EchoExecutor, &translate_task()).await.unwrap();
        assert_eq!(output.result["target_language"], "en");
    }
}
