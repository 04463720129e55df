//! Acquisition job and the per-book OCR/analysis state machine.
//!
//! ```text
//! NoAssets ──capture──▶ Captured ──run_ocr──▶ OCRed ──run_analysis──▶ Analyzed
//! ```
//!
//! Every transition runs under the book's lock, so concurrent callers see
//! either the previous published state or the next one. Capture additionally
//! holds the book's capture claim from the stage check until the batch marker
//! is written, and OCR never starts on a batch without that marker.
//! [`Pipeline::reconcile`] is the one fix-up pass; it is safe to call at any
//! time and as often as wanted.

use crate::capabilities::{
    CleanedPages, CoverClassifier, KnownMetadata, OcrEngine, PreviewCapture, SourceSearch,
    TextCleanup,
};
use crate::config::{ConfidenceMode, Settings};
use crate::content_store::{Artifact, BookDir, ContentStore};
use crate::error::{BookError, Result};
use crate::identity::IdentityReconciler;
use crate::janitor::Janitor;
use crate::page_key::{PageAssetRef, PageKey};
use crate::schema::{
    now_iso8601, AnalysisMethod, BookMetadata, CaptureBatch, ContentAnalysis, ErrorMarker,
    MappingRecord, OcrCollection, OcrRecord, StatusKind,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// The external services one acquisition needs.
#[derive(Clone)]
pub struct Capabilities {
    pub classifier: Arc<dyn CoverClassifier>,
    pub search: Arc<dyn SourceSearch>,
    pub capture: Arc<dyn PreviewCapture>,
    pub ocr: Arc<dyn OcrEngine>,
    pub cleanup: Arc<dyn TextCleanup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BookStage {
    NoAssets,
    /// Page assets exist, OCR has not produced a collection yet.
    Captured,
    OCRed,
    Analyzed,
}

/// Checks that decide whether displayed pages look like real content.
#[derive(Debug, Clone)]
pub struct PageValidator {
    min_chars: usize,
    sentinels: Vec<String>,
}

impl PageValidator {
    pub fn new(min_chars: usize, sentinels: &[String]) -> Self {
        Self {
            min_chars,
            sentinels: sentinels.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.min_page_chars, &settings.sentinel_errors)
    }

    /// `Err` carries the reason the pair was rejected.
    pub fn check(&self, first: &str, second: &str) -> std::result::Result<(), String> {
        for (label, text) in [("firstPage", first), ("secondPage", second)] {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(format!("{} is empty", label));
            }
            let chars = trimmed.chars().count();
            if chars < self.min_chars {
                return Err(format!("{} has {} chars, need {}", label, chars, self.min_chars));
            }
            let lower = trimmed.to_lowercase();
            if let Some(s) = self.sentinels.iter().find(|s| lower.contains(s.as_str())) {
                return Err(format!("{} contains sentinel {:?}", label, s));
            }
        }
        Ok(())
    }

    pub fn is_valid(&self, analysis: &ContentAnalysis) -> bool {
        self.check(&analysis.first_page, &analysis.second_page).is_ok()
    }
}

#[derive(Clone)]
pub struct Pipeline {
    store: ContentStore,
    identity: IdentityReconciler,
    caps: Capabilities,
    settings: Arc<Settings>,
    validator: PageValidator,
    janitor: Option<Janitor>,
    /// Start of the last analysis attempt `reconcile` made per book.
    attempts: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Pipeline {
    pub fn new(
        store: ContentStore,
        identity: IdentityReconciler,
        caps: Capabilities,
        settings: Arc<Settings>,
    ) -> Self {
        let validator = PageValidator::from_settings(&settings);
        Self {
            store,
            identity,
            caps,
            settings,
            validator,
            janitor: None,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sweep books right after they complete, when the settings ask for it.
    pub fn with_janitor(mut self, janitor: Janitor) -> Self {
        if self.settings.sweep_on_complete {
            self.janitor = Some(janitor);
        }
        self
    }

    pub fn validator(&self) -> &PageValidator {
        &self.validator
    }

    /// Run a full acquisition for a freshly uploaded cover in the
    /// background. The returned handle can be awaited with a deadline;
    /// dropping it does not stop the job.
    pub fn spawn(&self, upload_id: String, cover: Vec<u8>) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.acquire(&upload_id, &cover).await {
                pipeline.record_failure(&upload_id, &e).await;
            }
        })
    }

    /// Classify, search, capture, OCR and analyse one upload.
    pub async fn acquire(&self, upload_id: &str, cover: &[u8]) -> Result<()> {
        {
            let upload = self.store.lock(upload_id).await?;
            upload.ensure_exists().await?;
            upload.clear_error().await?;
            upload
                .write_status(StatusKind::Processing, Some("identifying cover".to_string()))
                .await?;
            upload
                .append_log(&format!("job started ({} byte cover)", cover.len()))
                .await?;
        }

        let classification = self
            .caps
            .classifier
            .classify_cover(cover)
            .await
            .map_err(|e| BookError::capability("classification", e))?;
        let mut metadata = BookMetadata {
            title: classification.title,
            author: classification.author,
            is_non_fiction: classification.is_non_fiction,
            confidence: Some(classification.confidence),
            genre: classification.genre,
            ..BookMetadata::default()
        };
        {
            let upload = self.store.lock(upload_id).await?;
            upload.write(Artifact::Metadata, &metadata).await?;
            upload
                .append_log(&format!(
                    "classified cover as '{}' by '{}'",
                    metadata.title, metadata.author
                ))
                .await?;
        }

        let source = self
            .caps
            .search
            .search_source(&metadata.title, &metadata.author)
            .await
            .map_err(|e| BookError::capability("search", e))?
            .ok_or_else(|| {
                BookError::NotFound(format!(
                    "no source for '{}' by '{}'",
                    metadata.title, metadata.author
                ))
            })?;

        let canonical = source.source_id.clone();
        crate::content_store::validate_book_id(&canonical)?;
        metadata.source_id = Some(canonical.clone());
        metadata.viewability = Some(source.viewability.clone());
        metadata.viewable_pages = source.viewable_pages;
        // The upload keeps the raw classification; source fields live in
        // the mapping snapshot and the canonical metadata.
        self.identity.link_ids(upload_id, &canonical, &metadata).await?;
        let resolved = format!(
            "resolved source {} (viewability={})",
            canonical, source.viewability
        );
        {
            let dir = self.store.lock(&canonical).await?;
            dir.write(Artifact::Metadata, &metadata).await?;
            dir.append_log(&resolved).await?;
        }
        self.store.lock(upload_id).await?.append_log(&resolved).await?;

        if !source.has_preview() {
            return Err(BookError::NoPreviewAvailable {
                book_id: canonical,
            });
        }

        {
            let claim = self.store.claim(&canonical).await?;
            let stage = self.stage(claim.book_id()).await?;
            let has_batch = self.store.exists(claim.book_id(), Artifact::CaptureBatch).await;
            match stage {
                BookStage::NoAssets => {
                    self.set_status(upload_id, "capturing preview pages").await?;
                    let pages = self
                        .caps
                        .capture
                        .capture_preview_pages(&source.preview_handle)
                        .await
                        .map_err(|e| BookError::capability("capture", e))?;
                    if pages.is_empty() {
                        return Err(BookError::NoPreviewAvailable {
                            book_id: canonical,
                        });
                    }
                    self.store_pages(&canonical, &pages).await?;
                }
                BookStage::Captured if !has_batch => {
                    warn!(
                        "Pipeline: '{}' holds pages from an interrupted capture, using them as the batch",
                        canonical
                    );
                    self.mark_batch_complete(&canonical).await?;
                }
                stage => info!(
                    "Pipeline: '{}' already cached at {:?}, skipping capture",
                    canonical, stage
                ),
            }
        }

        self.set_status(upload_id, "reading pages").await?;
        self.run_ocr(&canonical).await?;

        self.set_status(upload_id, "selecting pages").await?;
        self.run_analysis(&canonical).await?;
        let stage = self.reconcile_ids(upload_id, false).await?;

        if stage == BookStage::Analyzed {
            if let Some(janitor) = &self.janitor {
                for id in [canonical.as_str(), upload_id] {
                    if let Err(e) = janitor.sweep(id).await {
                        warn!("Pipeline: eager sweep of '{}' failed: {}", id, e);
                    }
                }
            }
        }
        info!("Pipeline: '{}' finished at {:?}", upload_id, stage);
        Ok(())
    }

    /// Store captured pages as sequence keys 1..n. Pages that cannot be
    /// split are stored whole.
    pub async fn store_pages(&self, book_id: &str, pages: &[Vec<u8>]) -> Result<Vec<PageAssetRef>> {
        let mut stored = Vec::with_capacity(pages.len());
        for (i, bytes) in pages.iter().enumerate() {
            let key = PageKey::Seq(i as u32 + 1);
            let asset = match self.store.put_page_image(book_id, key, bytes).await {
                Ok(asset) => asset,
                Err(BookError::CorruptImage { detail, .. }) => {
                    warn!(
                        "Pipeline: page {} of '{}' unsplittable ({}), storing whole",
                        key, book_id, detail
                    );
                    self.store.put_unsplit_image(book_id, key, bytes).await?
                }
                Err(e) => return Err(e),
            };
            stored.push(asset);
        }
        self.store
            .lock(book_id)
            .await?
            .append_log(&format!("captured {} pages", pages.len()))
            .await?;
        self.mark_batch_complete(book_id).await?;
        Ok(stored)
    }

    /// Publish the capture batch marker over the assets stored right now.
    async fn mark_batch_complete(&self, book_id: &str) -> Result<()> {
        let dir = self.store.lock(book_id).await?;
        let batch = CaptureBatch {
            asset_count: dir.page_assets().await?.len(),
            completed_at: now_iso8601(),
        };
        dir.write(Artifact::CaptureBatch, &batch).await?;
        dir.append_log(&format!("capture batch complete: {} assets", batch.asset_count))
            .await
    }

    /// Where a single directory stands in the state machine.
    pub async fn stage(&self, book_id: &str) -> Result<BookStage> {
        let analysis: Option<ContentAnalysis> =
            self.store.read_lenient(book_id, Artifact::ContentAnalysis).await;
        let has_ocr = self.store.exists(book_id, Artifact::OcrResults).await;
        if has_ocr && analysis.as_ref().is_some_and(|a| self.validator.is_valid(a)) {
            return Ok(BookStage::Analyzed);
        }
        if has_ocr {
            return Ok(BookStage::OCRed);
        }
        if self.store.get_page_assets(book_id).await?.is_empty() {
            Ok(BookStage::NoAssets)
        } else {
            Ok(BookStage::Captured)
        }
    }

    /// Captured → OCRed, once the capture batch marker is published. An
    /// existing collection that covers every current asset is returned as is;
    /// one that does not is redone even without a marker.
    pub async fn run_ocr(&self, book_id: &str) -> Result<OcrCollection> {
        let dir = self.store.lock(book_id).await?;
        let assets = dir.page_assets().await?;
        if assets.is_empty() {
            return Err(BookError::NotFound(format!("no page assets for '{}'", book_id)));
        }

        let existing = dir.read_lenient::<OcrCollection>(Artifact::OcrResults).await;
        if existing.is_none() && !dir.exists(Artifact::CaptureBatch).await {
            return Err(BookError::IncompleteArtifact {
                book_id: book_id.to_string(),
                artifact: "capture_batch.json",
                detail: format!("capture still in progress ({} assets so far)", assets.len()),
            });
        }

        match existing {
            Some(existing) if existing.covers(&assets) => {
                debug!("Pipeline: OCR for '{}' already complete", book_id);
                return Ok(existing);
            }
            Some(existing) => {
                let err = BookError::IncompleteArtifact {
                    book_id: book_id.to_string(),
                    artifact: "ocr_results.json",
                    detail: format!(
                        "{} records for {} assets",
                        existing.records.len(),
                        assets.len()
                    ),
                };
                warn!("Pipeline: {}, re-running OCR", err);
            }
            None => {}
        }

        info!(
            "Pipeline: OCR of {} assets for '{}' with {}",
            assets.len(),
            book_id,
            self.caps.ocr.name()
        );
        let mut records = Vec::with_capacity(assets.len());
        for asset in &assets {
            let bytes = dir.read_asset(asset).await?;
            let ocr = self
                .caps
                .ocr
                .run_ocr(&bytes)
                .await
                .map_err(|e| BookError::capability("ocr", e))?;
            records.push(OcrRecord {
                page_key: asset.key,
                side: asset.side,
                text: ocr.text,
                confidence: ocr.confidence,
            });
        }

        let collection = OcrCollection {
            asset_count: assets.len(),
            records,
            completed_at: now_iso8601(),
        };
        dir.write(Artifact::OcrResults, &collection).await?;
        dir.append_log(&format!("OCR complete: {} records", collection.records.len()))
            .await?;
        Ok(collection)
    }

    /// OCRed → Analyzed. Keeps a valid existing analysis; otherwise runs
    /// the cleanup pass, then direct extraction, and only publishes a
    /// result that passes validation.
    pub async fn run_analysis(&self, book_id: &str) -> Result<ContentAnalysis> {
        let (analysis, known) = {
            let dir = self.store.lock(book_id).await?;
            let Some(ocr) = dir.read_lenient::<OcrCollection>(Artifact::OcrResults).await else {
                return Err(BookError::IncompleteArtifact {
                    book_id: book_id.to_string(),
                    artifact: "ocr_results.json",
                    detail: "no OCR results to analyse".to_string(),
                });
            };

            let existing: Option<ContentAnalysis> =
                dir.read_lenient(Artifact::ContentAnalysis).await;
            if let Some(existing) = &existing {
                match self.validator.check(&existing.first_page, &existing.second_page) {
                    Ok(()) => return Ok(existing.clone()),
                    Err(reason) => {
                        warn!("Pipeline: analysis for '{}' rejected ({}), re-running", book_id, reason)
                    }
                }
            }

            let known = known_metadata(&dir, existing.as_ref()).await;
            let input = select_records(
                &ocr.records,
                self.settings.confidence_mode,
                self.settings.min_page_confidence,
            );
            let (mut pages, method) = self.clean_pages(book_id, &input, &known).await?;
            order_by_capture(&mut pages, &ocr.records);

            let analysis = ContentAnalysis {
                title: pick(&pages.title, known.title.as_deref()),
                author: pick(&pages.author, known.author.as_deref()),
                is_non_fiction: match method {
                    AnalysisMethod::Cleanup => pages.is_non_fiction,
                    AnalysisMethod::Direct => known.is_non_fiction.unwrap_or(pages.is_non_fiction),
                },
                first_page: pages.first_page.trim().to_string(),
                second_page: pages.second_page.trim().to_string(),
                method: Some(method),
                analyzed_at: now_iso8601(),
            };
            dir.write(Artifact::ContentAnalysis, &analysis).await?;
            dir.append_log(&format!("content analysis published ({:?})", method))
                .await?;
            (analysis, known)
        };

        let corrected = known.title.as_deref() != Some(analysis.title.as_str())
            || known.author.as_deref() != Some(analysis.author.as_str())
            || known.is_non_fiction != Some(analysis.is_non_fiction);
        if corrected {
            let metadata = BookMetadata {
                title: analysis.title.clone(),
                author: analysis.author.clone(),
                is_non_fiction: analysis.is_non_fiction,
                ..BookMetadata::default()
            };
            self.identity.record_metadata(book_id, &metadata).await?;
        }
        Ok(analysis)
    }

    /// Primary cleanup call, then the direct-extraction fallback.
    async fn clean_pages(
        &self,
        book_id: &str,
        records: &[OcrRecord],
        known: &KnownMetadata,
    ) -> Result<(CleanedPages, AnalysisMethod)> {
        let mut last_failure = None;

        match self.caps.cleanup.cleanup_and_classify(records, known).await {
            Ok(pages) => match self.validator.check(&pages.first_page, &pages.second_page) {
                Ok(()) => return Ok((pages, AnalysisMethod::Cleanup)),
                Err(reason) => {
                    warn!("Pipeline: cleanup output for '{}' unusable: {}", book_id, reason);
                }
            },
            Err(e) => {
                warn!("Pipeline: cleanup call for '{}' did not succeed: {}", book_id, e);
                last_failure = Some(BookError::capability("cleanup", e));
            }
        }

        match self.caps.cleanup.direct_extract(records).await {
            Ok(pages) => match self.validator.check(&pages.first_page, &pages.second_page) {
                Ok(()) => Ok((pages, AnalysisMethod::Direct)),
                Err(reason) => Err(BookError::IncompleteArtifact {
                    book_id: book_id.to_string(),
                    artifact: "content_analysis.json",
                    detail: reason,
                }),
            },
            Err(e) => Err(last_failure.unwrap_or_else(|| BookError::capability("direct extraction", e))),
        }
    }

    /// Idempotent fix-up for a book under either id: repair the identity
    /// link, redo incomplete OCR, self-correct the analysis and publish the
    /// resulting status. Busy books are left alone. Returns the most
    /// advanced stage among linked ids.
    pub async fn reconcile(&self, book_id: &str) -> Result<BookStage> {
        self.reconcile_ids(book_id, true).await
    }

    /// Run [`Pipeline::reconcile`] on its own task. Read paths use this so
    /// they never wait on OCR or model calls.
    pub fn reconcile_in_background(&self, book_id: &str) {
        let pipeline = self.clone();
        let book_id = book_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pipeline.reconcile(&book_id).await {
                warn!("Pipeline: background reconcile for '{}' failed: {}", book_id, e);
            }
        });
    }

    /// Reserve an analysis attempt for `book_id`; `false` while the previous
    /// attempt is younger than the backoff window.
    fn begin_attempt(&self, book_id: &str) -> bool {
        let window = self.settings.reconcile_backoff();
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.retain(|_, started| now.duration_since(*started) < window);
        if attempts.contains_key(book_id) {
            return false;
        }
        attempts.insert(book_id.to_string(), now);
        true
    }

    fn end_attempt(&self, book_id: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(book_id);
    }

    async fn reconcile_ids(&self, book_id: &str, defer_if_busy: bool) -> Result<BookStage> {
        let mut ids = self.identity.linked_ids(book_id).await?;
        if defer_if_busy {
            if let Some(busy) = ids.iter().find(|id| self.store.is_busy(id)) {
                debug!("Pipeline: '{}' busy, reconcile deferred", busy);
                return self.best_stage(&ids).await;
            }
        }

        let mut with_assets = HashSet::new();
        for id in &ids {
            let assets = self.store.get_page_assets(id).await?;
            if assets.is_empty() {
                continue;
            }
            with_assets.insert(id.clone());
            let ocr: Option<OcrCollection> = self.store.read_lenient(id, Artifact::OcrResults).await;
            if ocr.is_some_and(|ocr| !ocr.covers(&assets)) {
                if let Err(e) = self.run_ocr(id).await {
                    warn!("Pipeline: reconcile OCR for '{}' failed: {}", id, e);
                }
            }
        }

        self.identity.reconcile_links(book_id).await?;

        // Analyse where the pages live first; copies then reach the other ids.
        ids.sort_by_key(|id| !with_assets.contains(id));
        for id in &ids {
            if self.stage(id).await? != BookStage::OCRed {
                continue;
            }
            if !self.begin_attempt(id) {
                debug!("Pipeline: analysis of '{}' failed recently, not retrying yet", id);
                continue;
            }
            match self.run_analysis(id).await {
                Ok(_) => {
                    self.end_attempt(id);
                    self.identity.reconcile_links(book_id).await?
                }
                Err(e) => warn!("Pipeline: reconcile analysis for '{}' failed: {}", id, e),
            }
        }

        let stage = self.best_stage(&ids).await?;
        if stage == BookStage::Analyzed {
            for id in &ids {
                self.publish_complete(id).await?;
            }
        }
        Ok(stage)
    }

    async fn best_stage(&self, ids: &[String]) -> Result<BookStage> {
        let mut best = BookStage::NoAssets;
        for id in ids {
            best = best.max(self.stage(id).await?);
        }
        Ok(best)
    }

    /// Mark a directory complete and drop a retryable error marker. Terminal
    /// errors are kept.
    async fn publish_complete(&self, book_id: &str) -> Result<()> {
        if !self.store.book_exists(book_id).await {
            return Ok(());
        }
        let dir = self.store.lock(book_id).await?;
        if let Some(err) = dir.read_lenient::<ErrorMarker>(Artifact::Error).await {
            if !err.retryable {
                return Ok(());
            }
            dir.clear_error().await?;
            dir.append_log(&format!("cleared recovered error {}", err.report.code))
                .await?;
        }
        let already = dir
            .read_lenient::<crate::schema::StatusMarker>(Artifact::Status)
            .await
            .is_some_and(|m| m.status == StatusKind::Complete);
        if !already {
            dir.write_status(StatusKind::Complete, None).await?;
        }
        Ok(())
    }

    async fn set_status(&self, book_id: &str, message: &str) -> Result<()> {
        let dir = self.store.lock(book_id).await?;
        dir.write_status(StatusKind::Processing, Some(message.to_string()))
            .await?;
        dir.append_log(message).await
    }

    /// Turn a failed job into the upload's error marker and log line.
    pub async fn record_failure(&self, upload_id: &str, err: &BookError) {
        error!("Pipeline: job for '{}' failed: {}", upload_id, err);
        let result: Result<()> = async {
            let dir = self.store.lock(upload_id).await?;
            let line = match err {
                BookError::NoPreviewAvailable { .. } => {
                    format!("No preview available: {}", err)
                }
                _ => format!("job failed ({}): {}", err.code(), err),
            };
            dir.append_log(&line).await?;
            dir.write_error(err.report(), err.is_retryable()).await
        }
        .await;
        if let Err(e) = result {
            error!("Pipeline: could not record failure for '{}': {}", upload_id, e);
        }
    }
}

async fn known_metadata(dir: &BookDir, existing: Option<&ContentAnalysis>) -> KnownMetadata {
    let mapping: Option<MappingRecord> = dir.read_lenient(Artifact::Mapping).await;
    let metadata = match mapping {
        Some(m) => Some(m.snapshot_metadata),
        None => dir.read_lenient::<BookMetadata>(Artifact::Metadata).await,
    };
    let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());

    match (metadata, existing) {
        (Some(m), _) => KnownMetadata {
            title: non_empty(&m.title),
            author: non_empty(&m.author),
            is_non_fiction: Some(m.is_non_fiction),
        },
        (None, Some(a)) => KnownMetadata {
            title: non_empty(&a.title),
            author: non_empty(&a.author),
            is_non_fiction: Some(a.is_non_fiction),
        },
        (None, None) => KnownMetadata::default(),
    }
}

fn pick(primary: &str, fallback: Option<&str>) -> String {
    if primary.trim().is_empty() {
        fallback.unwrap_or_default().to_string()
    } else {
        primary.trim().to_string()
    }
}

/// Combined confidence of one page from its halves.
pub fn page_confidence(halves: &[&OcrRecord], mode: ConfidenceMode) -> f64 {
    if halves.is_empty() {
        return 0.0;
    }
    let mean = halves.iter().map(|r| r.confidence).sum::<f64>() / halves.len() as f64;
    match mode {
        ConfidenceMode::Mean => mean,
        ConfidenceMode::LengthWeighted => {
            let total: usize = halves.iter().map(|r| r.text.trim().len()).sum();
            if total == 0 {
                return mean;
            }
            halves
                .iter()
                .map(|r| r.confidence * r.text.trim().len() as f64)
                .sum::<f64>()
                / total as f64
        }
    }
}

/// Records of pages whose combined confidence meets `min_confidence`, in
/// their original order. Falls back to all records if none qualify.
pub fn select_records(
    records: &[OcrRecord],
    mode: ConfidenceMode,
    min_confidence: f64,
) -> Vec<OcrRecord> {
    let mut pages: BTreeMap<PageKey, Vec<&OcrRecord>> = BTreeMap::new();
    for record in records {
        pages.entry(record.page_key).or_default().push(record);
    }
    let keep: HashSet<PageKey> = pages
        .iter()
        .filter(|(_, halves)| page_confidence(halves, mode) >= min_confidence)
        .map(|(key, _)| *key)
        .collect();

    if keep.is_empty() {
        return records.to_vec();
    }
    records
        .iter()
        .filter(|r| keep.contains(&r.page_key))
        .cloned()
        .collect()
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Index of the OCR record that shares the most words with `page`.
fn capture_position(page: &str, records: &[OcrRecord]) -> Option<usize> {
    let page_words = words(page);
    if page_words.is_empty() {
        return None;
    }
    records
        .iter()
        .enumerate()
        .map(|(i, r)| (i, words(&r.text).intersection(&page_words).count()))
        .filter(|(_, shared)| *shared > 0)
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(i, _)| i)
}

/// Make `first_page` the page captured earlier.
pub fn order_by_capture(pages: &mut CleanedPages, records: &[OcrRecord]) {
    let first = capture_position(&pages.first_page, records);
    let second = capture_position(&pages.second_page, records);
    if let (Some(first), Some(second)) = (first, second) {
        if second < first {
            debug!("Pipeline: swapping pages to capture order ({} > {})", first, second);
            std::mem::swap(&mut pages.first_page, &mut pages.second_page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CoverClassification, OcrText, SourceMatch};
    use crate::content_store::tests::png;
    use crate::janitor::Janitor;
    use crate::page_key::Side;
    use crate::status::StatusResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const FILLER: &str = "the long corridor stretched beyond sight while rain hammered \
                          the windows and somewhere below a door slammed shut";

    struct FakeClassifier;

    #[async_trait::async_trait]
    impl CoverClassifier for FakeClassifier {
        async fn classify_cover(&self, _image: &[u8]) -> anyhow::Result<CoverClassification> {
            Ok(CoverClassification {
                title: "The Corridor".to_string(),
                author: "A. Writer".to_string(),
                is_non_fiction: false,
                confidence: 0.9,
                genre: Some("mystery".to_string()),
            })
        }
    }

    struct FakeSearch {
        viewability: &'static str,
    }

    #[async_trait::async_trait]
    impl SourceSearch for FakeSearch {
        async fn search_source(&self, _t: &str, _a: &str) -> anyhow::Result<Option<SourceMatch>> {
            Ok(Some(SourceMatch {
                source_id: "vol42".to_string(),
                viewability: self.viewability.to_string(),
                viewable_pages: (self.viewability == "NO_PAGES").then_some(0),
                preview_handle: "handle".to_string(),
            }))
        }
    }

    struct FakeCapture {
        pages: Vec<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl PreviewCapture for FakeCapture {
        async fn capture_preview_pages(&self, _h: &str) -> anyhow::Result<Vec<Vec<u8>>> {
            tokio::task::yield_now().await;
            Ok(self.pages.clone())
        }
    }

    /// Reads the seed back out of the test PNGs.
    #[derive(Default)]
    struct FakeOcr {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl OcrEngine for FakeOcr {
        fn name(&self) -> &str {
            "fake"
        }

        async fn run_ocr(&self, image: &[u8]) -> anyhow::Result<OcrText> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let text = match image::load_from_memory(image) {
                Ok(img) => format!("seed{} {}", img.to_rgba8().get_pixel(0, 0)[0], FILLER),
                Err(_) => "unreadable".to_string(),
            };
            Ok(OcrText {
                text,
                confidence: 0.8,
            })
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum CleanupMode {
        /// First two records, in order.
        Good,
        /// First two records, swapped.
        Swapped,
        Sentinel,
        Fail,
    }

    struct FakeCleanup {
        mode: Mutex<CleanupMode>,
        direct_ok: bool,
        /// What the cleanup pass says about the book.
        non_fiction: bool,
        cleanup_calls: AtomicUsize,
        direct_calls: AtomicUsize,
    }

    impl FakeCleanup {
        fn new(mode: CleanupMode, direct_ok: bool) -> Self {
            Self {
                mode: Mutex::new(mode),
                direct_ok,
                non_fiction: false,
                cleanup_calls: AtomicUsize::new(0),
                direct_calls: AtomicUsize::new(0),
            }
        }

        fn pages(&self, records: &[OcrRecord]) -> CleanedPages {
            CleanedPages {
                title: "The Corridor".to_string(),
                author: "A. Writer".to_string(),
                is_non_fiction: self.non_fiction,
                first_page: records[0].text.clone(),
                second_page: records[2].text.clone(),
            }
        }
    }

    #[async_trait::async_trait]
    impl TextCleanup for FakeCleanup {
        async fn cleanup_and_classify(
            &self,
            records: &[OcrRecord],
            _known: &KnownMetadata,
        ) -> anyhow::Result<CleanedPages> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            let mode = *self.mode.lock().unwrap();
            match mode {
                CleanupMode::Good => Ok(self.pages(records)),
                CleanupMode::Swapped => {
                    let mut p = self.pages(records);
                    std::mem::swap(&mut p.first_page, &mut p.second_page);
                    Ok(p)
                }
                CleanupMode::Sentinel => Ok(CleanedPages {
                    first_page: "Error processing content".to_string(),
                    second_page: "Error processing content".to_string(),
                    ..CleanedPages::default()
                }),
                CleanupMode::Fail => anyhow::bail!("model overloaded"),
            }
        }

        async fn direct_extract(&self, records: &[OcrRecord]) -> anyhow::Result<CleanedPages> {
            self.direct_calls.fetch_add(1, Ordering::SeqCst);
            if self.direct_ok {
                let mut p = self.pages(records);
                p.title.clear();
                Ok(p)
            } else {
                anyhow::bail!("still overloaded")
            }
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        store: ContentStore,
        pipeline: Pipeline,
        status: StatusResolver,
        ocr: Arc<FakeOcr>,
        cleanup: Arc<FakeCleanup>,
    }

    fn harness(pages: Vec<Vec<u8>>, viewability: &'static str, cleanup: FakeCleanup) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings {
            cache_root: dir.path().to_path_buf(),
            ..Settings::default()
        });
        let store = ContentStore::new(dir.path(), settings.max_duplicate_slots);
        let identity = IdentityReconciler::new(store.clone());
        let status = StatusResolver::new(store.clone(), identity.clone());
        let ocr = Arc::new(FakeOcr::default());
        let cleanup = Arc::new(cleanup);
        let caps = Capabilities {
            classifier: Arc::new(FakeClassifier),
            search: Arc::new(FakeSearch { viewability }),
            capture: Arc::new(FakeCapture { pages }),
            ocr: ocr.clone(),
            cleanup: cleanup.clone(),
        };
        let pipeline = Pipeline::new(store.clone(), identity, caps, settings)
            .with_janitor(Janitor::new(store.clone(), status.clone()));
        Harness {
            dir,
            store,
            pipeline,
            status,
            ocr,
            cleanup,
        }
    }

    fn four_pages() -> Vec<Vec<u8>> {
        (1..=4).map(|seed| png(8, 6, seed)).collect()
    }

    #[tokio::test]
    async fn test_four_distinct_pages_complete() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Good, true));
        h.pipeline.acquire("up1", b"cover").await.unwrap();

        let assets = h.store.get_page_assets("vol42").await.unwrap();
        let keys: Vec<PageKey> = assets.iter().map(|a| a.key).collect();
        assert_eq!(
            keys,
            vec![1, 1, 2, 2, 3, 3, 4, 4].into_iter().map(PageKey::Seq).collect::<Vec<_>>()
        );

        let ocr: OcrCollection = h.store.read("vol42", Artifact::OcrResults).await.unwrap().unwrap();
        assert_eq!(ocr.records.len(), 8);
        assert!(ocr.records[0].text.starts_with("seed1"));
        assert_eq!(ocr.records[1].side, Side::Right);
        assert!(ocr.records[7].text.starts_with("seed4"));

        let analysis: ContentAnalysis = h
            .store
            .read("vol42", Artifact::ContentAnalysis)
            .await
            .unwrap()
            .unwrap();
        assert!(analysis.first_page.chars().count() > 50);
        assert!(analysis.second_page.chars().count() > 50);
        assert!(analysis.first_page.starts_with("seed1"));
        assert!(analysis.second_page.starts_with("seed2"));

        for id in ["up1", "vol42"] {
            assert_eq!(h.status.get_status(id).await.unwrap().status, StatusKind::Complete);
        }
        // Eager sweep left only halves and essential JSON in the canonical dir.
        assert!(!h.dir.path().join("vol42/logs.txt").exists());
        assert!(h.dir.path().join("vol42/4_right.png").exists());
        assert!(h.dir.path().join("up1/content_analysis.json").exists());
    }

    #[tokio::test]
    async fn test_zero_viewable_pages_is_terminal_error() {
        let h = harness(four_pages(), "NO_PAGES", FakeCleanup::new(CleanupMode::Good, true));
        let err = h.pipeline.acquire("up1", b"cover").await.unwrap_err();
        assert!(matches!(err, BookError::NoPreviewAvailable { .. }));
        h.pipeline.record_failure("up1", &err).await;

        let raw: BookMetadata = h.store.read("up1", Artifact::Metadata).await.unwrap().unwrap();
        assert_eq!(raw.title, "The Corridor");
        assert_eq!(raw.source_id, None);
        assert_eq!(raw.viewable_pages, None);
        let record = h.store.get_mapping_record("up1").await.unwrap().unwrap();
        assert_eq!(record.snapshot_metadata.viewable_pages, Some(0));
        let canonical: BookMetadata = h.store.read("vol42", Artifact::Metadata).await.unwrap().unwrap();
        assert_eq!(canonical.source_id.as_deref(), Some("vol42"));
        let status = h.status.get_status("up1").await.unwrap();
        assert_eq!(status.status, StatusKind::Error);
        assert_eq!(status.detail.unwrap().code.as_deref(), Some("NO_PAGES_AVAILABLE"));
        assert!(h.store.get_page_assets("vol42").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_analysis_run_keeps_valid_pages() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Good, true));
        h.pipeline.store_pages("vol42", &four_pages()).await.unwrap();
        h.pipeline.run_ocr("vol42").await.unwrap();

        let first = h.pipeline.run_analysis("vol42").await.unwrap();
        *h.cleanup.mode.lock().unwrap() = CleanupMode::Sentinel;
        let second = h.pipeline.run_analysis("vol42").await.unwrap();

        assert_eq!(first.first_page, second.first_page);
        assert_eq!(first.second_page, second.second_page);
        assert_eq!(h.cleanup.cleanup_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sentinel_analysis_is_redone_via_direct_fallback() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Fail, true));
        h.pipeline.store_pages("vol42", &four_pages()).await.unwrap();
        h.pipeline.run_ocr("vol42").await.unwrap();
        {
            let dir = h.store.lock("vol42").await.unwrap();
            dir.write(
                Artifact::ContentAnalysis,
                &ContentAnalysis {
                    title: "The Corridor".to_string(),
                    author: "A. Writer".to_string(),
                    is_non_fiction: false,
                    first_page: "Error processing content".to_string(),
                    second_page: "short".to_string(),
                    method: None,
                    analyzed_at: String::new(),
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(h.pipeline.stage("vol42").await.unwrap(), BookStage::OCRed);
        let analysis = h.pipeline.run_analysis("vol42").await.unwrap();
        assert_eq!(analysis.method, Some(AnalysisMethod::Direct));
        assert_eq!(analysis.title, "The Corridor");
        assert!(h.pipeline.validator().is_valid(&analysis));
        assert_eq!(h.cleanup.direct_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_cleanup_never_overwrites() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Sentinel, false));
        let err = h.pipeline.run_analysis("vol42").await.unwrap_err();
        assert!(matches!(err, BookError::IncompleteArtifact { .. }));
        assert!(!h.store.exists("vol42", Artifact::ContentAnalysis).await);

        h.pipeline.store_pages("vol42", &four_pages()).await.unwrap();
        h.pipeline.run_ocr("vol42").await.unwrap();
        let err = h.pipeline.run_analysis("vol42").await.unwrap_err();
        assert!(matches!(err, BookError::CapabilityUnavailable { .. }));
        assert!(!h.store.exists("vol42", Artifact::ContentAnalysis).await);
    }

    #[tokio::test]
    async fn test_swapped_cleanup_output_is_reordered() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Swapped, true));
        h.pipeline.store_pages("vol42", &four_pages()).await.unwrap();
        h.pipeline.run_ocr("vol42").await.unwrap();
        let analysis = h.pipeline.run_analysis("vol42").await.unwrap();
        assert!(analysis.first_page.starts_with("seed1"));
        assert!(analysis.second_page.starts_with("seed2"));
    }

    #[tokio::test]
    async fn test_concurrent_ocr_runs_once() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Good, true));
        h.pipeline.store_pages("vol42", &four_pages()).await.unwrap();

        let (a, b) = tokio::join!(h.pipeline.run_ocr("vol42"), h.pipeline.run_ocr("vol42"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_reconcile_redoes_incomplete_ocr() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Good, true));
        h.pipeline.store_pages("vol42", &four_pages()).await.unwrap();
        let mut partial = h.pipeline.run_ocr("vol42").await.unwrap();
        partial.records.truncate(3);
        h.store
            .lock("vol42")
            .await
            .unwrap()
            .write(Artifact::OcrResults, &partial)
            .await
            .unwrap();

        let stage = h.pipeline.reconcile("vol42").await.unwrap();
        assert_eq!(stage, BookStage::Analyzed);
        let ocr: OcrCollection = h.store.read("vol42", Artifact::OcrResults).await.unwrap().unwrap();
        assert_eq!(ocr.records.len(), 8);
        assert_eq!(h.status.get_status("vol42").await.unwrap().status, StatusKind::Complete);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_capture_once() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Good, true));
        let (a, b) = tokio::join!(
            h.pipeline.acquire("upA", b"cover"),
            h.pipeline.acquire("upB", b"cover")
        );
        a.unwrap();
        b.unwrap();

        let assets = h.store.get_page_assets("vol42").await.unwrap();
        assert_eq!(assets.len(), 8);
        assert!(assets.iter().all(|a| matches!(a.key, PageKey::Seq(_))));
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 8);
        assert_eq!(h.cleanup.cleanup_calls.load(Ordering::SeqCst), 1);

        let canonical = h.store.get_mapping_record("vol42").await.unwrap().unwrap();
        let mut uploads = canonical.upload_ids();
        uploads.sort();
        assert_eq!(uploads, vec!["upA", "upB"]);
        for id in ["upA", "upB", "vol42"] {
            assert_eq!(h.status.get_status(id).await.unwrap().status, StatusKind::Complete);
        }
    }

    #[tokio::test]
    async fn test_ocr_waits_for_complete_capture_batch() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Good, true));
        for (i, bytes) in four_pages().iter().take(2).enumerate() {
            h.store
                .put_page_image("vol42", PageKey::Seq(i as u32 + 1), bytes)
                .await
                .unwrap();
        }

        let err = h.pipeline.run_ocr("vol42").await.unwrap_err();
        assert!(matches!(err, BookError::IncompleteArtifact { artifact: "capture_batch.json", .. }));
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 0);

        // A new job adopts the leftover pages instead of capturing again.
        h.pipeline.acquire("up1", b"cover").await.unwrap();
        assert_eq!(h.store.get_page_assets("vol42").await.unwrap().len(), 4);
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.status.get_status("up1").await.unwrap().status, StatusKind::Complete);
    }

    #[tokio::test]
    async fn test_non_fiction_correction_reaches_snapshot() {
        let mut cleanup = FakeCleanup::new(CleanupMode::Good, true);
        cleanup.non_fiction = true;
        let h = harness(four_pages(), "PARTIAL", cleanup);
        h.pipeline.acquire("up1", b"cover").await.unwrap();

        for id in ["up1", "vol42"] {
            let analysis: ContentAnalysis =
                h.store.read(id, Artifact::ContentAnalysis).await.unwrap().unwrap();
            assert!(analysis.is_non_fiction, "{}", id);
            let record = h.store.get_mapping_record(id).await.unwrap().unwrap();
            assert!(record.snapshot_metadata.is_non_fiction, "{}", id);
        }
    }

    #[tokio::test]
    async fn test_failed_analysis_waits_before_retry() {
        let h = harness(four_pages(), "PARTIAL", FakeCleanup::new(CleanupMode::Fail, false));
        h.pipeline.store_pages("vol42", &four_pages()).await.unwrap();
        h.pipeline.run_ocr("vol42").await.unwrap();

        assert_eq!(h.pipeline.reconcile("vol42").await.unwrap(), BookStage::OCRed);
        assert_eq!(h.pipeline.reconcile("vol42").await.unwrap(), BookStage::OCRed);
        assert_eq!(h.cleanup.cleanup_calls.load(Ordering::SeqCst), 1);

        // Once the pages are good the next window succeeds and clears the entry.
        *h.cleanup.mode.lock().unwrap() = CleanupMode::Good;
        h.pipeline.end_attempt("vol42");
        assert_eq!(h.pipeline.reconcile("vol42").await.unwrap(), BookStage::Analyzed);
        assert!(h.pipeline.begin_attempt("vol42"));
    }

    #[tokio::test]
    async fn test_corrupt_capture_stored_whole_and_read() {
        let mut pages = four_pages();
        pages[1] = b"not an image".to_vec();
        let h = harness(pages.clone(), "PARTIAL", FakeCleanup::new(CleanupMode::Good, true));
        let stored = h.pipeline.store_pages("vol42", &pages).await.unwrap();
        assert_eq!(stored[1].file_name(), "2_full.png");

        let ocr = h.pipeline.run_ocr("vol42").await.unwrap();
        assert_eq!(ocr.records.len(), 7);
        assert_eq!(ocr.records[2].text, "unreadable");
    }

    #[test]
    fn test_validator_thresholds() {
        let v = PageValidator::new(10, &["Unable to extract".to_string()]);
        assert!(v.check("a long enough page", "another long page").is_ok());
        assert!(v.check("short", "another long page").is_err());
        assert!(v.check("a long enough page", "").is_err());
        assert!(v.check("UNABLE TO EXTRACT text here", "another long page").is_err());
    }

    #[test]
    fn test_confidence_modes_and_selection() {
        let rec = |key, side, text: &str, confidence| OcrRecord {
            page_key: PageKey::Seq(key),
            side,
            text: text.to_string(),
            confidence,
        };
        let records = vec![
            rec(1, Side::Left, "", 0.1),
            rec(1, Side::Right, "lots of text on this half", 0.9),
            rec(2, Side::Left, "x", 0.2),
            rec(2, Side::Right, "y", 0.2),
        ];
        let page1: Vec<&OcrRecord> = records[..2].iter().collect();
        assert!((page_confidence(&page1, ConfidenceMode::Mean) - 0.5).abs() < 1e-9);
        assert!((page_confidence(&page1, ConfidenceMode::LengthWeighted) - 0.9).abs() < 1e-9);

        let kept = select_records(&records, ConfidenceMode::LengthWeighted, 0.5);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.page_key == PageKey::Seq(1)));
        assert_eq!(select_records(&records, ConfidenceMode::Mean, 0.99).len(), 4);
    }
}
