//! Upload id ↔ canonical source id reconciliation.
//!
//! A book starts life under the client's upload id and later gains a
//! canonical source id. Each upload directory carries its own
//! [`MappingRecord`] and the canonical directory carries one listing every
//! upload linked to it. Everything here is a "make consistent" pass and never
//! computes content.

use crate::content_store::{write_mapping_copy, write_mapping_pair, Artifact, BookDir, ContentStore};
use crate::error::{BookError, Result};
use crate::schema::{BookMetadata, ContentAnalysis, MappingRecord, OcrCollection};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Upper bound on directories visited when walking the mapping graph.
const MAX_LINKED_IDS: usize = 64;

#[derive(Debug, Clone)]
pub struct IdentityReconciler {
    store: ContentStore,
}

impl IdentityReconciler {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }

    /// Canonical source id for an upload, if it has been resolved.
    pub async fn resolve(&self, upload_id: &str) -> Result<Option<String>> {
        let record: Option<MappingRecord> =
            self.store.read_lenient(upload_id, Artifact::Mapping).await;
        Ok(record
            .filter(|r| r.upload_id == upload_id)
            .map(|r| r.canonical_source_id))
    }

    /// Create or refresh the mapping in both directories. Linking an upload
    /// to a second, different canonical id is refused; several uploads may
    /// share one canonical id.
    pub async fn link_ids(
        &self,
        upload_id: &str,
        canonical_id: &str,
        metadata: &BookMetadata,
    ) -> Result<MappingRecord> {
        let (primary, mirror) = self.store.lock_pair(upload_id, canonical_id).await?;

        let existing: Option<MappingRecord> = primary.read_lenient(Artifact::Mapping).await;
        if let Some(existing) = &existing {
            if existing.upload_id == upload_id && existing.canonical_source_id != canonical_id {
                return Err(BookError::IdentityConflict {
                    upload_id: upload_id.to_string(),
                    existing: existing.canonical_source_id.clone(),
                    requested: canonical_id.to_string(),
                });
            }
        }

        let mut record = MappingRecord::new(upload_id, canonical_id, metadata.clone());
        if let Some(previous) = existing.as_ref().filter(|r| r.upload_id == upload_id) {
            record.linked_at = previous.linked_at.clone();
        }

        let mirror_current = match &mirror {
            Some(m) => m
                .read_lenient::<MappingRecord>(Artifact::Mapping)
                .await
                .is_some_and(|r| {
                    r.canonical_source_id == canonical_id
                        && r.mentions(upload_id)
                        && r.snapshot_metadata == record.snapshot_metadata
                }),
            None => true,
        };
        if existing.as_ref() == Some(&record) && mirror_current {
            debug!("Identity: '{}' -> '{}' already linked", upload_id, canonical_id);
            return Ok(record);
        }

        write_mapping_pair(&primary, mirror.as_ref(), &record).await?;
        info!("Identity: linked '{}' -> '{}'", upload_id, canonical_id);
        Ok(record)
    }

    /// Every id reachable from `book_id` through mapping records, starting
    /// with `book_id` itself. Missing mirrors just end the walk there.
    pub async fn linked_ids(&self, book_id: &str) -> Result<Vec<String>> {
        crate::content_store::validate_book_id(book_id)?;
        let mut seen = HashSet::from([book_id.to_string()]);
        let mut order = vec![book_id.to_string()];
        let mut queue = VecDeque::from([book_id.to_string()]);

        while let Some(id) = queue.pop_front() {
            let Some(record) = self
                .store
                .read_lenient::<MappingRecord>(&id, Artifact::Mapping)
                .await
            else {
                continue;
            };
            let mut next_ids = record.upload_ids();
            next_ids.push(record.canonical_source_id);
            for next in next_ids {
                if order.len() >= MAX_LINKED_IDS {
                    warn!("Identity: mapping graph from '{}' truncated", book_id);
                    return Ok(order);
                }
                if crate::content_store::validate_book_id(&next).is_ok() && seen.insert(next.clone()) {
                    order.push(next.clone());
                    queue.push_back(next);
                }
            }
        }
        Ok(order)
    }

    /// Rewrite the metadata fields of ContentAnalysis in every linked
    /// directory that already has OCR results. Returns the ids that changed.
    pub async fn propagate_metadata(
        &self,
        book_id: &str,
        metadata: &BookMetadata,
    ) -> Result<Vec<String>> {
        let mut updated = Vec::new();
        for id in self.linked_ids(book_id).await? {
            let dir = self.store.lock(&id).await?;
            if refresh_analysis_metadata(&dir, metadata).await? {
                updated.push(id);
            }
        }
        if !updated.is_empty() {
            info!("Identity: refreshed metadata in {:?}", updated);
        }
        Ok(updated)
    }

    /// Store corrected metadata in the mapping snapshot and push it to every
    /// linked analysis. Books without a mapping only get the propagation.
    pub async fn record_metadata(&self, book_id: &str, metadata: &BookMetadata) -> Result<()> {
        if let Some((owner, record)) = self.owning_record(book_id).await {
            let mut merged = record.snapshot_metadata.clone();
            merge_metadata(&mut merged, metadata);
            if merged != record.snapshot_metadata {
                let updated = MappingRecord {
                    snapshot_metadata: merged,
                    ..record
                };
                self.store.put_mapping_record(&owner, &updated).await?;
            }
        }
        self.propagate_metadata(book_id, metadata).await?;
        Ok(())
    }

    /// The record that lists every link of `book_id`'s book: the canonical
    /// directory's when it mentions `book_id`, otherwise `book_id`'s own.
    /// Returns the directory it came from.
    async fn owning_record(&self, book_id: &str) -> Option<(String, MappingRecord)> {
        let record: MappingRecord = self.store.read_lenient(book_id, Artifact::Mapping).await?;
        if record.canonical_source_id != book_id {
            let canonical: Option<MappingRecord> = self
                .store
                .read_lenient(&record.canonical_source_id, Artifact::Mapping)
                .await;
            if let Some(canonical) = canonical.filter(|c| c.mentions(book_id)) {
                return Some((record.canonical_source_id.clone(), canonical));
            }
        }
        Some((book_id.to_string(), record))
    }

    /// Repair the links around `book_id`: restore a missing or stale mirror
    /// record, copy derived artifacts to the side lacking them and refresh
    /// ContentAnalysis metadata from the mapping snapshot.
    pub async fn reconcile_links(&self, book_id: &str) -> Result<()> {
        let Some(record) = self
            .store
            .read_lenient::<MappingRecord>(book_id, Artifact::Mapping)
            .await
        else {
            return Ok(());
        };
        let partners = record.partners(book_id);
        if partners.is_empty() {
            warn!(
                "Identity: mapping in '{}' does not mention it ({} -> {})",
                book_id, record.upload_id, record.canonical_source_id
            );
            return Ok(());
        }

        for other in partners {
            let (primary, mirror) = self.store.lock_pair(book_id, &other).await?;
            let Some(mirror) = mirror else {
                continue;
            };

            let mirrored: Option<MappingRecord> = mirror.read_lenient(Artifact::Mapping).await;
            match mirrored {
                Some(m) if m.canonical_source_id == record.canonical_source_id && m.mentions(book_id) => {}
                Some(m) if mirror.id() != record.canonical_source_id => {
                    warn!(
                        "Identity: '{}' is linked to '{}', not '{}'",
                        mirror.id(),
                        m.canonical_source_id,
                        record.canonical_source_id
                    );
                    continue;
                }
                _ => {
                    write_mapping_copy(&mirror, &record).await?;
                    info!("Identity: restored mirror mapping in '{}'", mirror.id());
                }
            }

            copy_derived(&primary, &mirror).await?;
            copy_derived(&mirror, &primary).await?;

            refresh_analysis_metadata(&primary, &record.snapshot_metadata).await?;
            refresh_analysis_metadata(&mirror, &record.snapshot_metadata).await?;
        }
        Ok(())
    }
}

/// Update metadata fields of an existing ContentAnalysis, only where OCR
/// results exist. Never creates an analysis.
async fn refresh_analysis_metadata(dir: &BookDir, metadata: &BookMetadata) -> Result<bool> {
    if !dir.exists(Artifact::OcrResults).await {
        debug!("Identity: '{}' has no OCR results, skipping", dir.id());
        return Ok(false);
    }
    let Some(mut analysis) = dir
        .read_lenient::<ContentAnalysis>(Artifact::ContentAnalysis)
        .await
    else {
        return Ok(false);
    };
    if !analysis.apply_metadata(metadata) {
        return Ok(false);
    }
    dir.write(Artifact::ContentAnalysis, &analysis).await?;
    Ok(true)
}

/// Copy OCR results, then ContentAnalysis, from `src` to `dst` where `dst`
/// lacks them. An analysis is only copied once `dst` has OCR results.
async fn copy_derived(src: &BookDir, dst: &BookDir) -> Result<()> {
    if !dst.exists(Artifact::OcrResults).await {
        if let Some(ocr) = src.read_lenient::<OcrCollection>(Artifact::OcrResults).await {
            dst.write(Artifact::OcrResults, &ocr).await?;
            info!(
                "Identity: copied {} OCR records '{}' -> '{}'",
                ocr.records.len(),
                src.id(),
                dst.id()
            );
        }
    }
    if dst.exists(Artifact::OcrResults).await && !dst.exists(Artifact::ContentAnalysis).await {
        if let Some(analysis) = src
            .read_lenient::<ContentAnalysis>(Artifact::ContentAnalysis)
            .await
        {
            dst.write(Artifact::ContentAnalysis, &analysis).await?;
            info!("Identity: copied content analysis '{}' -> '{}'", src.id(), dst.id());
        }
    }
    Ok(())
}

/// Overlay non-empty fields of `update` onto `base`.
fn merge_metadata(base: &mut BookMetadata, update: &BookMetadata) {
    if !update.title.trim().is_empty() {
        base.title = update.title.clone();
    }
    if !update.author.trim().is_empty() {
        base.author = update.author.clone();
    }
    base.is_non_fiction = update.is_non_fiction;
    if update.confidence.is_some() {
        base.confidence = update.confidence;
    }
    if update.genre.is_some() {
        base.genre = update.genre.clone();
    }
}
