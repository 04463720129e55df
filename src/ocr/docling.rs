//! Docling sidecar OCR provider.

use crate::capabilities::{OcrEngine, OcrText};
use serde::Deserialize;
use tracing::debug;

/// Confidence reported when the sidecar does not return one.
const DEFAULT_CONFIDENCE: f64 = 0.95;

/// Docling sidecar response (private deserialization types).
#[derive(Debug, Deserialize)]
struct DoclingResponse {
    markdown: String,
    #[serde(default)]
    pages: Vec<DoclingPageContent>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DoclingPageContent {
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct DoclingProvider {
    url: String,
    client: reqwest::Client,
}

impl DoclingProvider {
    pub fn new(client: reqwest::Client) -> Self {
        let url =
            std::env::var("DOCLING_URL").unwrap_or_else(|_| "http://localhost:3001".to_string());
        Self { url, client }
    }
}

#[async_trait::async_trait]
impl OcrEngine for DoclingProvider {
    fn name(&self) -> &str {
        "docling"
    }

    async fn run_ocr(&self, image: &[u8]) -> anyhow::Result<OcrText> {
        use reqwest::multipart::{Form, Part};

        let part = Part::bytes(image.to_vec())
            .file_name("page.png")
            .mime_str("image/png")?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/convert", self.url))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Docling sidecar error ({}): {}", status, error_text);
        }

        let docling: DoclingResponse = response.json().await?;
        let confidence = docling
            .confidence
            .or_else(|| docling.pages.iter().find_map(|p| p.confidence))
            .unwrap_or(DEFAULT_CONFIDENCE);
        debug!(
            "DoclingProvider: {} chars at confidence {:.2}",
            docling.markdown.len(),
            confidence
        );

        Ok(OcrText {
            text: docling.markdown,
            confidence,
        })
    }
}
