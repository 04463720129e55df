//! Mistral OCR provider (uses Mistral's OCR API).

use crate::capabilities::{OcrEngine, OcrText};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Mistral does not report a confidence; this is the value we assume.
const ASSUMED_CONFIDENCE: f64 = 0.92;

pub struct MistralOcrProvider {
    api_key: String,
    client: reqwest::Client,
}

impl MistralOcrProvider {
    pub fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let api_key = std::env::var("MISTRAL_API_KEY")
            .map_err(|_| anyhow::anyhow!("MISTRAL_API_KEY not set"))?;
        Ok(Self { api_key, client })
    }
}

// ── Mistral API request/response types ──────────────────────────────────────

#[derive(Serialize)]
struct OcrRequest {
    model: String,
    document: DocumentSource,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum DocumentSource {
    #[serde(rename = "image_url")]
    Image { image_url: String },
}

#[derive(Deserialize)]
struct OcrResponse {
    pages: Vec<MistralPage>,
}

#[derive(Deserialize)]
struct MistralPage {
    markdown: String,
}

// ── Provider implementation ─────────────────────────────────────────────────

#[async_trait::async_trait]
impl OcrEngine for MistralOcrProvider {
    fn name(&self) -> &str {
        "mistral_ocr"
    }

    async fn run_ocr(&self, image: &[u8]) -> anyhow::Result<OcrText> {
        let body = OcrRequest {
            model: "mistral-ocr-latest".to_string(),
            document: DocumentSource::Image {
                image_url: format!("data:image/png;base64,{}", BASE64.encode(image)),
            },
        };

        let resp = self
            .client
            .post("https://api.mistral.ai/v1/ocr")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Mistral OCR API error ({}): {}", status, text);
        }

        let raw_text = resp.text().await?;
        debug!(
            "MistralOcrProvider: raw response ({} bytes): {}",
            raw_text.len(),
            raw_text.chars().take(500).collect::<String>()
        );
        let ocr: OcrResponse = serde_json::from_str(&raw_text)?;

        let text = ocr
            .pages
            .into_iter()
            .map(|p| p.markdown)
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(OcrText {
            text,
            confidence: ASSUMED_CONFIDENCE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_image_url_document() {
        let body = OcrRequest {
            model: "mistral-ocr-latest".to_string(),
            document: DocumentSource::Image {
                image_url: "data:image/png;base64,AAAA".to_string(),
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["document"]["type"], "image_url");
        assert_eq!(json["document"]["image_url"], "data:image/png;base64,AAAA");
    }
}
