//! OCR engine adapters.
//!
//! Both backends implement [`OcrEngine`]; which one runs is chosen with the
//! `OCR_PROVIDER` environment variable.

pub mod docling;
pub mod mistral;

use crate::capabilities::OcrEngine;
use std::sync::Arc;

/// Known provider identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcrProviderKind {
    Docling,
    MistralOcr,
}

impl OcrProviderKind {
    /// Parse an `OCR_PROVIDER` value into a provider kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "docling" => Some(Self::Docling),
            "mistral_ocr" => Some(Self::MistralOcr),
            _ => None,
        }
    }
}

/// Build the configured engine. Defaults to the Docling sidecar.
pub fn from_env(client: reqwest::Client) -> anyhow::Result<Arc<dyn OcrEngine>> {
    let raw = std::env::var("OCR_PROVIDER").unwrap_or_else(|_| "docling".to_string());
    let kind = OcrProviderKind::parse(&raw)
        .ok_or_else(|| anyhow::anyhow!("Unknown OCR_PROVIDER: {}", raw))?;
    Ok(match kind {
        OcrProviderKind::Docling => Arc::new(docling::DoclingProvider::new(client)),
        OcrProviderKind::MistralOcr => Arc::new(mistral::MistralOcrProvider::from_env(client)?),
    })
}
