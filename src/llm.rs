//! LLM-backed capabilities: cover classification and page cleanup.
//!
//! Prompts follow the cache-friendly layout used for every OpenRouter call:
//! the OCR text goes in the system message (stable prefix), instructions in
//! the user message.

use crate::capabilities::{
    CleanedPages, CoverClassification, CoverClassifier, KnownMetadata, TextCleanup,
};
use crate::openrouter::{Message, OpenRouterClient};
use crate::schema::OcrRecord;
use anyhow::{Context, Result};
use tracing::{debug, info};

/// Upper bound on OCR text sent in one cleanup prompt.
const MAX_CONTEXT_CHARS: usize = 60_000;

pub struct LlmCoverClassifier {
    client: OpenRouterClient,
}

impl LlmCoverClassifier {
    pub fn new(client: OpenRouterClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl CoverClassifier for LlmCoverClassifier {
    async fn classify_cover(&self, image: &[u8]) -> Result<CoverClassification> {
        info!("LlmCoverClassifier: classifying {} byte cover", image.len());
        let messages = vec![
            Message::system(
                "You identify books from photographs of their covers. Read the title and \
                 author exactly as printed. Judge from the cover whether the book is \
                 non-fiction and give a one or two word genre.",
            ),
            Message::user_with_image(
                "Identify this book. Set confidence between 0 and 1 to reflect how sure you \
                 are about the title and author.",
                image,
            ),
        ];
        let classification: CoverClassification = self
            .client
            .chat_json(messages, "cover_classification", classification_schema())
            .await?;
        debug!(
            "LlmCoverClassifier: '{}' by '{}' ({:.2})",
            classification.title, classification.author, classification.confidence
        );
        Ok(classification)
    }
}

pub struct LlmTextCleanup {
    client: OpenRouterClient,
}

impl LlmTextCleanup {
    pub fn new(client: OpenRouterClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl TextCleanup for LlmTextCleanup {
    async fn cleanup_and_classify(
        &self,
        records: &[OcrRecord],
        known: &KnownMetadata,
    ) -> Result<CleanedPages> {
        let system_prompt = format!(
            "You clean up OCR output from a book preview. Pages are given in reading order; \
             each printed page was captured as a left and a right half.\n\n\
             --- OCR START ---\n\n{}\n\n--- OCR END ---",
            truncate_for_context(&render_records(records), MAX_CONTEXT_CHARS)
        );

        let mut hints = Vec::new();
        if let Some(title) = &known.title {
            hints.push(format!("Title: {}", title));
        }
        if let Some(author) = &known.author {
            hints.push(format!("Author: {}", author));
        }
        if let Some(non_fiction) = known.is_non_fiction {
            hints.push(format!("Non-fiction: {}", non_fiction));
        }

        let user_prompt = format!(
            "Known metadata (correct it if the text shows otherwise):\n{}\n\n\
             Skip front matter: covers, title pages, copyright, dedications, tables of \
             contents, blank pages. Return the first two pages of actual book content as \
             `firstPage` and `secondPage`, in reading order, with OCR artefacts fixed, \
             hyphenation across line breaks joined and page headers removed. Do not \
             summarise or invent text.",
            if hints.is_empty() {
                "(none)".to_string()
            } else {
                hints.join("\n")
            }
        );

        info!("LlmTextCleanup: cleanup over {} OCR records", records.len());
        self.client
            .chat_json(
                vec![Message::system(system_prompt), Message::user(user_prompt)],
                "cleaned_pages",
                cleaned_pages_schema(),
            )
            .await
            .context("cleanup pass failed")
    }

    async fn direct_extract(&self, records: &[OcrRecord]) -> Result<CleanedPages> {
        let system_prompt = format!(
            "--- OCR START ---\n\n{}\n\n--- OCR END ---",
            truncate_for_context(&render_records(records), MAX_CONTEXT_CHARS)
        );
        let user_prompt = "Copy out, verbatim, the text of the first two pages above that \
                           contain running prose (not front matter). Return JSON with \
                           `firstPage` and `secondPage`.";

        info!("LlmTextCleanup: direct extraction over {} OCR records", records.len());
        self.client
            .chat_json(
                vec![Message::system(system_prompt), Message::user(user_prompt)],
                "direct_pages",
                cleaned_pages_schema(),
            )
            .await
            .context("direct extraction failed")
    }
}

/// OCR records as one text block with a header per half.
pub fn render_records(records: &[OcrRecord]) -> String {
    records
        .iter()
        .map(|r| format!("--- Page {} ({}) ---\n{}", r.page_key, r.side.as_str(), r.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &text[..end]
    }
}

fn classification_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "author": { "type": "string" },
            "isNonFiction": { "type": "boolean" },
            "confidence": { "type": "number" },
            "genre": { "type": "string" }
        },
        "required": ["title", "author", "isNonFiction", "confidence"],
        "additionalProperties": false
    })
}

fn cleaned_pages_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "author": { "type": "string" },
            "isNonFiction": { "type": "boolean" },
            "firstPage": { "type": "string" },
            "secondPage": { "type": "string" }
        },
        "required": ["firstPage", "secondPage"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_key::{PageKey, Side};

    #[test]
    fn test_render_records_labels_halves() {
        let records = vec![
            OcrRecord {
                page_key: PageKey::Seq(1),
                side: Side::Left,
                text: "  Call me Ishmael. ".to_string(),
                confidence: 0.9,
            },
            OcrRecord {
                page_key: PageKey::Seq(1),
                side: Side::Right,
                text: "Some years ago".to_string(),
                confidence: 0.8,
            },
        ];
        assert_eq!(
            render_records(&records),
            "--- Page 1 (left) ---\nCall me Ishmael.\n\n--- Page 1 (right) ---\nSome years ago"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "ééééé";
        assert_eq!(truncate_for_context(text, 3), "é");
        assert_eq!(truncate_for_context(text, 100), text);
    }
}
