//! Source search (Google Books volumes API) and preview capture (headless
//! browser sidecar).

use crate::capabilities::{PreviewCapture, SourceMatch, SourceSearch};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const GOOGLE_BOOKS_URL: &str = "https://www.googleapis.com/books/v1/volumes";

pub struct GoogleBooksSearch {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl GoogleBooksSearch {
    /// `GOOGLE_BOOKS_API_KEY` is optional; unauthenticated calls are rate limited.
    pub fn from_env(client: reqwest::Client) -> Self {
        Self {
            client,
            api_key: std::env::var("GOOGLE_BOOKS_API_KEY").ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VolumesResponse {
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    id: String,
    #[serde(default)]
    access_info: AccessInfo,
    #[serde(default)]
    volume_info: VolumeInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessInfo {
    #[serde(default)]
    viewability: Option<String>,
    #[serde(default)]
    embeddable: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    #[serde(default)]
    preview_link: Option<String>,
}

impl Volume {
    fn into_match(self) -> SourceMatch {
        let viewability = self
            .access_info
            .viewability
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let viewable_pages = (viewability == "NO_PAGES" || !self.access_info.embeddable).then_some(0);
        let preview_handle = self.volume_info.preview_link.unwrap_or_else(|| {
            format!("https://books.google.com/books?id={}&printsec=frontcover", self.id)
        });
        SourceMatch {
            source_id: self.id,
            viewability,
            viewable_pages,
            preview_handle,
        }
    }
}

#[async_trait::async_trait]
impl SourceSearch for GoogleBooksSearch {
    async fn search_source(&self, title: &str, author: &str) -> Result<Option<SourceMatch>> {
        let mut q = format!("intitle:{}", title.trim());
        if !author.trim().is_empty() {
            q.push_str(&format!(" inauthor:{}", author.trim()));
        }

        let mut request = self
            .client
            .get(GOOGLE_BOOKS_URL)
            .query(&[("q", q.as_str()), ("maxResults", "10"), ("printType", "books")]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request.send().await.context("Google Books request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Google Books API error ({}): {}", status, text);
        }
        let volumes: VolumesResponse = response
            .json()
            .await
            .context("Failed to parse Google Books response")?;

        let found = pick_volume(volumes.items).map(Volume::into_match);
        match &found {
            Some(m) => info!(
                "GoogleBooksSearch: '{}' -> {} ({})",
                title, m.source_id, m.viewability
            ),
            None => warn!("GoogleBooksSearch: no volume for '{}' / '{}'", title, author),
        }
        Ok(found)
    }
}

/// Prefer the first volume that can actually be previewed.
fn pick_volume(items: Vec<Volume>) -> Option<Volume> {
    let previewable = items.iter().position(|v| {
        v.access_info.embeddable
            && v.access_info
                .viewability
                .as_deref()
                .is_some_and(|s| s != "NO_PAGES")
    });
    let index = previewable.unwrap_or(0);
    items.into_iter().nth(index)
}

/// Client for the page-capture sidecar, which drives a headless browser
/// through the preview and returns page screenshots.
pub struct CaptureSidecar {
    url: String,
    client: reqwest::Client,
    max_pages: u32,
}

impl CaptureSidecar {
    pub fn from_env(client: reqwest::Client) -> Self {
        let url = std::env::var("CAPTURE_SIDECAR_URL")
            .unwrap_or_else(|_| "http://localhost:3002".to_string());
        let max_pages = std::env::var("CAPTURE_MAX_PAGES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(12);
        Self {
            url,
            client,
            max_pages,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptureRequest<'a> {
    preview_handle: &'a str,
    max_pages: u32,
}

#[derive(Deserialize)]
struct CaptureResponse {
    /// Base64 PNG screenshots in reading order.
    pages: Vec<String>,
}

#[async_trait::async_trait]
impl PreviewCapture for CaptureSidecar {
    async fn capture_preview_pages(&self, preview_handle: &str) -> Result<Vec<Vec<u8>>> {
        let response = self
            .client
            .post(format!("{}/capture", self.url))
            .json(&CaptureRequest {
                preview_handle,
                max_pages: self.max_pages,
            })
            .send()
            .await
            .context("capture sidecar request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Capture sidecar error ({}): {}", status, text);
        }

        let capture: CaptureResponse = response.json().await?;
        let pages = capture
            .pages
            .iter()
            .enumerate()
            .map(|(i, b64)| {
                BASE64
                    .decode(b64.trim())
                    .with_context(|| format!("page {} is not valid base64", i + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("CaptureSidecar: {} pages for {}", pages.len(), preview_handle);
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volumes(json: &str) -> Vec<Volume> {
        serde_json::from_str::<VolumesResponse>(json).unwrap().items
    }

    #[test]
    fn test_prefers_previewable_volume() {
        let items = volumes(
            r#"{"items": [
                {"id": "a", "accessInfo": {"viewability": "NO_PAGES", "embeddable": false}},
                {"id": "b", "accessInfo": {"viewability": "PARTIAL", "embeddable": true},
                 "volumeInfo": {"previewLink": "https://books.google.com/books?id=b"}}
            ]}"#,
        );
        let m = pick_volume(items).unwrap().into_match();
        assert_eq!(m.source_id, "b");
        assert!(m.has_preview());
        assert_eq!(m.preview_handle, "https://books.google.com/books?id=b");
    }

    #[test]
    fn test_no_pages_volume_reports_zero_viewable() {
        let items = volumes(r#"{"items": [{"id": "a", "accessInfo": {"viewability": "NO_PAGES"}}]}"#);
        let m = pick_volume(items).unwrap().into_match();
        assert_eq!(m.viewable_pages, Some(0));
        assert!(!m.has_preview());
    }

    #[test]
    fn test_empty_search() {
        assert!(pick_volume(volumes("{}")).is_none());
    }
}
