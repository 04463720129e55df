//! Cache janitor: strips book directories down to their essential artifacts.

use crate::content_store::{Artifact, ContentStore};
use crate::error::Result;
use crate::page_key::PageAssetRef;
use crate::schema::StatusKind;
use crate::status::{resolve_status, LogSignatures, StatusResolver};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub kept: usize,
    pub removed_dir: bool,
}

#[derive(Debug, Clone)]
pub struct Janitor {
    store: ContentStore,
    status: StatusResolver,
}

/// Canonical page halves (and unsplit fallbacks) plus the essential JSON
/// artifacts. Everything else is disposable.
fn is_keeper(name: &str) -> bool {
    if let Some(asset) = PageAssetRef::parse_file_name(name) {
        return asset.file_name() == name;
    }
    Artifact::from_file_name(name).is_some_and(|a| a.is_essential())
}

impl Janitor {
    pub fn new(store: ContentStore, status: StatusResolver) -> Self {
        Self { store, status }
    }

    /// Delete every non-essential entry of one book, and the directory
    /// itself if nothing is left. Holds the book lock throughout.
    pub async fn sweep(&self, book_id: &str) -> Result<SweepReport> {
        let dir = self.store.lock(book_id).await?;
        let mut report = SweepReport::default();

        let mut entries = match tokio::fs::read_dir(dir.path()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_file() && is_keeper(&name) {
                report.kept += 1;
                continue;
            }
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            } else {
                tokio::fs::remove_file(entry.path()).await?;
            }
            report.removed.push(name);
        }

        if report.kept == 0 {
            tokio::fs::remove_dir(dir.path()).await?;
            report.removed_dir = true;
        }

        report.removed.sort();
        if !report.removed.is_empty() || report.removed_dir {
            info!(
                "Janitor: '{}' removed {:?}, kept {}{}",
                book_id,
                report.removed,
                report.kept,
                if report.removed_dir { ", directory deleted" } else { "" }
            );
        }
        Ok(report)
    }

    /// Sweep every book whose status is complete on the strength of its
    /// own ContentAnalysis. Returns how many were swept.
    pub async fn sweep_completed(&self) -> Result<usize> {
        let signatures = LogSignatures::default();
        let mut swept = 0;
        for id in self.store.list_book_ids().await? {
            if self.store.is_busy(&id) {
                debug!("Janitor: '{}' busy, skipping", id);
                continue;
            }
            let markers = self.status.load_markers(&id).await?;
            let complete = resolve_status(&markers, &signatures).status == StatusKind::Complete;
            if complete && markers.analysis.as_ref().is_some_and(|a| !a.is_empty()) {
                self.sweep(&id).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Periodic sweep loop; never returns.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep_completed().await {
                Ok(n) => debug!("Janitor: periodic sweep covered {} books", n),
                Err(e) => error!("Janitor: periodic sweep failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::tests::png;
    use crate::identity::IdentityReconciler;
    use crate::page_key::PageKey;
    use crate::schema::{BookMetadata, ContentAnalysis};

    fn janitor(store: &ContentStore) -> Janitor {
        let identity = IdentityReconciler::new(store.clone());
        Janitor::new(store.clone(), StatusResolver::new(store.clone(), identity))
    }

    #[tokio::test]
    async fn test_sweep_keeps_halves_and_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), 10);
        store.put_page_image("b", PageKey::Seq(1), &png(6, 4, 1)).await.unwrap();
        {
            let book = store.lock("b").await.unwrap();
            book.write(Artifact::Metadata, &BookMetadata::default()).await.unwrap();
            book.write_status(StatusKind::Complete, None).await.unwrap();
            book.append_log("done").await.unwrap();
        }
        std::fs::write(dir.path().join("b/page_full_screenshot.png"), b"x").unwrap();
        std::fs::write(dir.path().join("b/.ocr_results.json.abc.tmp"), b"{").unwrap();
        std::fs::create_dir(dir.path().join("b/debug")).unwrap();

        let report = janitor(&store).sweep("b").await.unwrap();
        assert_eq!(report.kept, 3);
        assert_eq!(
            report.removed,
            vec![
                ".ocr_results.json.abc.tmp",
                "debug",
                "logs.txt",
                "page_full_screenshot.png",
                "status.json",
            ]
        );
        assert!(dir.path().join("b/1_left.png").exists());
        assert!(dir.path().join("b/metadata.json").exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), 10);
        store.lock("b").await.unwrap().append_log("started").await.unwrap();

        let report = janitor(&store).sweep("b").await.unwrap();
        assert!(report.removed_dir);
        assert!(!dir.path().join("b").exists());
        assert_eq!(janitor(&store).sweep("b").await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_periodic_sweep_skips_unfinished_books() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path(), 10);
        {
            let done = store.lock("done").await.unwrap();
            done.write(
                Artifact::ContentAnalysis,
                &ContentAnalysis {
                    title: "t".to_string(),
                    author: "a".to_string(),
                    is_non_fiction: false,
                    first_page: "one".to_string(),
                    second_page: "two".to_string(),
                    method: None,
                    analyzed_at: String::new(),
                },
            )
            .await
            .unwrap();
            done.append_log("finished").await.unwrap();
            store.lock("busy").await.unwrap().append_log("capturing").await.unwrap();
        }

        assert_eq!(janitor(&store).sweep_completed().await.unwrap(), 1);
        assert!(!dir.path().join("done/logs.txt").exists());
        assert!(dir.path().join("busy/logs.txt").exists());
    }
}
