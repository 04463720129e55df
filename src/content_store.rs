//! On-disk content store, one directory per book id.
//!
//! Page images are stored as immutable halves named `<pageKey>_<side>.png`;
//! derived artifacts are JSON files published by write-then-rename so readers
//! never see a partial file. Every read-then-write goes through a [`BookDir`],
//! which holds that book's lock for as long as it lives.
//!
//! Duplicate detection has no separate index. A book's fingerprints are
//! recomputed from the stored halves (dimensions plus RGBA rows, left row
//! then right row), which hash the same as the original unsplit image.

use crate::error::{BookError, ErrorReport, Result};
use crate::page_key::{sort_capture_order, PageAssetRef, PageKey, Side};
use crate::schema::{now_iso8601, ErrorMarker, MappingRecord, StatusKind, StatusMarker};
use image::{DynamicImage, GenericImageView, ImageOutputFormat, RgbaImage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

pub const LOG_FILE: &str = "logs.txt";

/// JSON artifacts a book directory may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Mapping,
    OcrResults,
    ContentAnalysis,
    Metadata,
    Status,
    Error,
    CaptureBatch,
}

impl Artifact {
    pub const ALL: [Artifact; 7] = [
        Artifact::Mapping,
        Artifact::OcrResults,
        Artifact::ContentAnalysis,
        Artifact::Metadata,
        Artifact::Status,
        Artifact::Error,
        Artifact::CaptureBatch,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Mapping => "id_mapping.json",
            Self::OcrResults => "ocr_results.json",
            Self::ContentAnalysis => "content_analysis.json",
            Self::Metadata => "metadata.json",
            Self::Status => "status.json",
            Self::Error => "error.json",
            Self::CaptureBatch => "capture_batch.json",
        }
    }

    /// Artifacts that survive a janitor sweep.
    pub fn is_essential(&self) -> bool {
        matches!(
            self,
            Self::Mapping | Self::OcrResults | Self::ContentAnalysis | Self::Metadata
        )
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.file_name() == name)
    }
}

/// Book ids become directory names, so only a conservative charset is allowed.
pub fn validate_book_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(BookError::InvalidBookId(id.to_string()))
    }
}

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Registry entry for `book_id`, dropping entries nobody else holds.
fn registry_entry(map: &Mutex<LockMap>, book_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = map.lock().unwrap_or_else(|e| e.into_inner());
    locks.retain(|id, m| id == book_id || Arc::strong_count(m) > 1);
    locks.entry(book_id.to_string()).or_default().clone()
}

/// Handle to the cache root. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    max_duplicate_slots: u32,
    locks: Arc<Mutex<LockMap>>,
    claims: Arc<Mutex<LockMap>>,
}

/// Exclusive right to capture pages into one book. Held across the stage
/// check and the whole batch, while the book lock is taken per write.
#[derive(Debug)]
pub struct CaptureClaim {
    book_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl CaptureClaim {
    pub fn book_id(&self) -> &str {
        &self.book_id
    }
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>, max_duplicate_slots: u32) -> Self {
        Self {
            root: root.into(),
            max_duplicate_slots,
            locks: Arc::new(Mutex::new(HashMap::new())),
            claims: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn book_path(&self, book_id: &str) -> Result<PathBuf> {
        validate_book_id(book_id)?;
        Ok(self.root.join(book_id))
    }

    /// Acquire exclusive access to one book directory.
    pub async fn lock(&self, book_id: &str) -> Result<BookDir> {
        let path = self.book_path(book_id)?;
        let guard = registry_entry(&self.locks, book_id).lock_owned().await;
        Ok(BookDir {
            id: book_id.to_string(),
            path,
            max_duplicate_slots: self.max_duplicate_slots,
            _guard: guard,
        })
    }

    /// Wait for the capture claim on `book_id`. Independent of [`ContentStore::lock`].
    pub async fn claim(&self, book_id: &str) -> Result<CaptureClaim> {
        validate_book_id(book_id)?;
        let guard = registry_entry(&self.claims, book_id).lock_owned().await;
        Ok(CaptureClaim {
            book_id: book_id.to_string(),
            _guard: guard,
        })
    }

    /// Whether some task currently holds the book's lock.
    pub fn is_busy(&self, book_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.get(book_id).is_some_and(|m| m.try_lock().is_err())
    }

    /// Lock two books in a fixed order so concurrent pairs cannot deadlock.
    /// Returns the handles in argument order; the second is `None` when both
    /// ids are the same.
    pub async fn lock_pair(&self, a: &str, b: &str) -> Result<(BookDir, Option<BookDir>)> {
        if a == b {
            return Ok((self.lock(a).await?, None));
        }
        if a < b {
            let first = self.lock(a).await?;
            let second = self.lock(b).await?;
            Ok((first, Some(second)))
        } else {
            let second = self.lock(b).await?;
            let first = self.lock(a).await?;
            Ok((first, Some(second)))
        }
    }

    pub async fn put_page_image(
        &self,
        book_id: &str,
        key: PageKey,
        image_bytes: &[u8],
    ) -> Result<PageAssetRef> {
        self.lock(book_id)
            .await?
            .put_page_image(key, image_bytes)
            .await
    }

    pub async fn put_unsplit_image(
        &self,
        book_id: &str,
        key: PageKey,
        image_bytes: &[u8],
    ) -> Result<PageAssetRef> {
        self.lock(book_id)
            .await?
            .put_unsplit_image(key, image_bytes)
            .await
    }

    /// Published assets in capture order.
    pub async fn get_page_assets(&self, book_id: &str) -> Result<Vec<PageAssetRef>> {
        list_assets(&self.book_path(book_id)?).await
    }

    /// Read a published artifact without taking the lock.
    pub async fn read<T: DeserializeOwned>(
        &self,
        book_id: &str,
        artifact: Artifact,
    ) -> Result<Option<T>> {
        read_json(&self.book_path(book_id)?.join(artifact.file_name())).await
    }

    /// Like [`ContentStore::read`], but an unparsable file counts as absent.
    pub async fn read_lenient<T: DeserializeOwned>(
        &self,
        book_id: &str,
        artifact: Artifact,
    ) -> Option<T> {
        match self.read(book_id, artifact).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "ContentStore: ignoring unreadable {} for '{}': {}",
                    artifact.file_name(),
                    book_id,
                    e
                );
                None
            }
        }
    }

    pub async fn exists(&self, book_id: &str, artifact: Artifact) -> bool {
        match self.book_path(book_id) {
            Ok(path) => tokio::fs::try_exists(path.join(artifact.file_name()))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn book_exists(&self, book_id: &str) -> bool {
        match self.book_path(book_id) {
            Ok(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn read_log(&self, book_id: &str) -> Result<Option<String>> {
        let path = self.book_path(book_id)?.join(LOG_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a page image by its canonical filename.
    pub async fn read_page_image(&self, book_id: &str, file_name: &str) -> Result<Vec<u8>> {
        let asset = PageAssetRef::parse_file_name(file_name)
            .filter(|a| a.file_name() == file_name)
            .ok_or_else(|| BookError::NotFound(file_name.to_string()))?;
        let path = self.book_path(book_id)?.join(asset.file_name());
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BookError::NotFound(format!("{}/{}", book_id, file_name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every book directory under the root.
    pub async fn list_book_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_book_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn get_mapping_record(&self, book_id: &str) -> Result<Option<MappingRecord>> {
        self.read(book_id, Artifact::Mapping).await
    }

    /// Write `record` into `book_id`'s directory and mirror it into every
    /// linked one.
    pub async fn put_mapping_record(&self, book_id: &str, record: &MappingRecord) -> Result<()> {
        let partners = record.partners(book_id);
        if partners.is_empty() {
            return Err(BookError::NotFound(format!(
                "mapping record does not mention '{}'",
                book_id
            )));
        }
        for other in partners {
            let (primary, mirror) = self.lock_pair(book_id, &other).await?;
            write_mapping_pair(&primary, mirror.as_ref(), record).await?;
        }
        Ok(())
    }
}

/// Write a mapping record under already-held locks and mirror it into the
/// linked directory. A failed mirror write is logged and tolerated.
pub async fn write_mapping_pair(
    primary: &BookDir,
    mirror: Option<&BookDir>,
    record: &MappingRecord,
) -> Result<()> {
    write_mapping_copy(primary, record).await?;
    if let Some(mirror) = mirror {
        if let Err(e) = write_mapping_copy(mirror, record).await {
            warn!(
                "ContentStore: mirror mapping write to '{}' failed: {}",
                mirror.id(),
                e
            );
        }
    }
    Ok(())
}

/// Store `record` as `dir` sees it. The canonical directory merges its
/// existing upload list; an upload directory keeps only its own link.
pub async fn write_mapping_copy(dir: &BookDir, record: &MappingRecord) -> Result<()> {
    if dir.id() == record.canonical_source_id {
        let mut merged = record.clone();
        if let Some(existing) = dir.read_lenient::<MappingRecord>(Artifact::Mapping).await {
            merged.merge_uploads(&existing);
        }
        dir.write(Artifact::Mapping, &merged).await
    } else {
        dir.write(Artifact::Mapping, &record.for_upload(dir.id())).await
    }
}

/// Exclusive handle on one book directory.
pub struct BookDir {
    id: String,
    path: PathBuf,
    max_duplicate_slots: u32,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for BookDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookDir").field("id", &self.id).finish()
    }
}

impl BookDir {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_exists(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Split `image_bytes` into halves and store them under `key`, or under
    /// the next free `PT<n>` when the content or the key is already taken.
    /// Returns the left half.
    pub async fn put_page_image(&self, key: PageKey, image_bytes: &[u8]) -> Result<PageAssetRef> {
        self.ensure_exists().await?;

        let bytes = image_bytes.to_vec();
        let key_label = key.to_string();
        let split = tokio::task::spawn_blocking(move || split_image(&bytes, &key_label))
            .await
            .map_err(|e| std::io::Error::other(format!("split task failed: {}", e)))??;

        let index = self.fingerprint_index().await?;
        let target = self.choose_key(key, &split.fingerprint, &index)?;

        let left = PageAssetRef::new(target, Side::Left);
        let right = PageAssetRef::new(target, Side::Right);
        write_atomic(&self.path, &right.file_name(), &split.right).await?;
        write_atomic(&self.path, &left.file_name(), &split.left).await?;

        info!(
            "ContentStore: stored {} for '{}' ({}px wide, {}/{} split)",
            target,
            self.id,
            split.width,
            split.width / 2,
            split.width - split.width / 2
        );
        Ok(left)
    }

    /// Store an image that could not be split as `<key>_full.png`, with the
    /// same duplicate handling as split pages.
    pub async fn put_unsplit_image(&self, key: PageKey, image_bytes: &[u8]) -> Result<PageAssetRef> {
        self.ensure_exists().await?;
        let fingerprint = raw_fingerprint(image_bytes);
        let index = self.fingerprint_index().await?;
        let target = self.choose_key(key, &fingerprint, &index)?;

        let asset = PageAssetRef::new(target, Side::Full);
        write_atomic(&self.path, &asset.file_name(), image_bytes).await?;
        info!(
            "ContentStore: stored unsplit {} for '{}' ({} bytes)",
            target,
            self.id,
            image_bytes.len()
        );
        Ok(asset)
    }

    fn choose_key(
        &self,
        requested: PageKey,
        fingerprint: &str,
        index: &FingerprintIndex,
    ) -> Result<PageKey> {
        let duplicate_of = index.by_fingerprint.get(fingerprint);
        if duplicate_of.is_none() && !index.used_keys.contains(&requested) {
            return Ok(requested);
        }
        let slot = allocate_dup_slot(&index.used_keys, self.max_duplicate_slots).ok_or_else(
            || BookError::DuplicateSlotsExhausted {
                page_key: requested.to_string(),
                limit: self.max_duplicate_slots,
            },
        )?;
        match duplicate_of {
            Some(original) => info!(
                "ContentStore: '{}' page {} duplicates {}, stored as {}",
                self.id, requested, original, slot
            ),
            None => info!(
                "ContentStore: '{}' key {} already used, stored as {}",
                self.id, requested, slot
            ),
        }
        Ok(slot)
    }

    async fn fingerprint_index(&self) -> Result<FingerprintIndex> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || build_fingerprint_index(&path))
            .await
            .map_err(|e| std::io::Error::other(format!("fingerprint task failed: {}", e)))?
    }

    pub async fn page_assets(&self) -> Result<Vec<PageAssetRef>> {
        list_assets(&self.path).await
    }

    pub async fn read_asset(&self, asset: &PageAssetRef) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path.join(asset.file_name())).await?)
    }

    pub async fn exists(&self, artifact: Artifact) -> bool {
        tokio::fs::try_exists(self.path.join(artifact.file_name()))
            .await
            .unwrap_or(false)
    }

    pub async fn read<T: DeserializeOwned>(&self, artifact: Artifact) -> Result<Option<T>> {
        read_json(&self.path.join(artifact.file_name())).await
    }

    /// Read an artifact, treating an unparsable file as absent.
    pub async fn read_lenient<T: DeserializeOwned>(&self, artifact: Artifact) -> Option<T> {
        match self.read(artifact).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "ContentStore: ignoring unreadable {} for '{}': {}",
                    artifact.file_name(),
                    self.id,
                    e
                );
                None
            }
        }
    }

    pub async fn write<T: Serialize>(&self, artifact: Artifact, value: &T) -> Result<()> {
        self.ensure_exists().await?;
        let json = serde_json::to_vec_pretty(value)?;
        write_atomic(&self.path, artifact.file_name(), &json).await?;
        debug!(
            "ContentStore: published {} for '{}'",
            artifact.file_name(),
            self.id
        );
        Ok(())
    }

    /// Remove an artifact. Returns whether it existed.
    pub async fn remove(&self, artifact: Artifact) -> Result<bool> {
        match tokio::fs::remove_file(self.path.join(artifact.file_name())).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one timestamped line to the activity log.
    pub async fn append_log(&self, line: &str) -> Result<()> {
        self.ensure_exists().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.join(LOG_FILE))
            .await?;
        file.write_all(format!("[{}] {}\n", now_iso8601(), line).as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn write_status(&self, status: StatusKind, message: Option<String>) -> Result<()> {
        let marker = StatusMarker {
            status,
            message,
            updated_at: now_iso8601(),
        };
        self.write(Artifact::Status, &marker).await
    }

    /// Drop the error marker. Returns whether one existed.
    pub async fn clear_error(&self) -> Result<bool> {
        self.remove(Artifact::Error).await
    }

    pub async fn write_error(&self, report: ErrorReport, retryable: bool) -> Result<()> {
        let marker = ErrorMarker {
            report,
            retryable,
            recorded_at: now_iso8601(),
        };
        self.write(Artifact::Error, &marker).await
    }
}

/// Fingerprints of a book's stored assets.
#[derive(Debug, Default)]
struct FingerprintIndex {
    by_fingerprint: HashMap<String, PageKey>,
    used_keys: HashSet<PageKey>,
}

fn build_fingerprint_index(dir: &Path) -> Result<FingerprintIndex> {
    let mut index = FingerprintIndex::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => return Err(e.into()),
    };

    let mut by_key: HashMap<PageKey, HashSet<Side>> = HashMap::new();
    for entry in entries {
        let entry = entry?;
        if let Some(asset) = entry
            .file_name()
            .to_str()
            .and_then(PageAssetRef::parse_file_name)
        {
            by_key.entry(asset.key).or_default().insert(asset.side);
        }
    }

    let mut keys: Vec<_> = by_key.into_iter().collect();
    keys.sort_by_key(|(key, _)| *key);
    for (key, sides) in keys {
        index.used_keys.insert(key);
        let fingerprint = if sides.contains(&Side::Left) && sides.contains(&Side::Right) {
            stored_pair_fingerprint(dir, key)
        } else if sides.contains(&Side::Full) {
            std::fs::read(dir.join(PageAssetRef::new(key, Side::Full).file_name()))
                .ok()
                .map(|bytes| raw_fingerprint(&bytes))
        } else {
            None
        };
        match fingerprint {
            Some(fp) => {
                index.by_fingerprint.entry(fp).or_insert(key);
            }
            None => debug!("ContentStore: no fingerprint for {} in {:?}", key, dir),
        }
    }
    Ok(index)
}

/// Recompute the fingerprint of the original image from its two halves.
fn stored_pair_fingerprint(dir: &Path, key: PageKey) -> Option<String> {
    let load = |side| {
        let bytes = std::fs::read(dir.join(PageAssetRef::new(key, side).file_name())).ok()?;
        image::load_from_memory(&bytes).ok().map(|img| img.to_rgba8())
    };
    let left = load(Side::Left)?;
    let right = load(Side::Right)?;
    if left.height() != right.height() {
        return None;
    }

    let (lw, rw) = (left.width() as usize * 4, right.width() as usize * 4);
    let rows = left
        .as_raw()
        .chunks_exact(lw.max(1))
        .zip(right.as_raw().chunks_exact(rw.max(1)))
        .flat_map(|(l, r)| [l, r]);
    Some(pixel_fingerprint(
        left.width() + right.width(),
        left.height(),
        rows,
    ))
}

fn pixel_fingerprint<'a>(width: u32, height: u32, rows: impl Iterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"rgba8:");
    hasher.update(width.to_le_bytes());
    hasher.update(height.to_le_bytes());
    for row in rows {
        hasher.update(row);
    }
    format!("{:x}", hasher.finalize())
}

fn raw_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"raw:");
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// First `PT<n>` not present among `used`, searching at most `limit` slots.
fn allocate_dup_slot(used: &HashSet<PageKey>, limit: u32) -> Option<PageKey> {
    (1..=limit).map(PageKey::Dup).find(|key| !used.contains(key))
}

struct SplitPage {
    fingerprint: String,
    width: u32,
    left: Vec<u8>,
    right: Vec<u8>,
}

/// Decode, fingerprint and halve an image. The left half is `width / 2`
/// wide and the right half takes the remainder.
fn split_image(bytes: &[u8], page_key: &str) -> Result<SplitPage> {
    let corrupt = |detail: String| BookError::CorruptImage {
        page_key: page_key.to_string(),
        detail,
    };

    let img = image::load_from_memory(bytes).map_err(|e| corrupt(e.to_string()))?;
    let (width, height) = img.dimensions();
    if width < 2 || height == 0 {
        return Err(corrupt(format!("cannot split {}x{} image", width, height)));
    }

    let rgba = img.to_rgba8();
    let fingerprint = pixel_fingerprint(width, height, rgba.as_raw().chunks_exact(width as usize * 4));

    let half = width / 2;
    let left = image::imageops::crop_imm(&rgba, 0, 0, half, height).to_image();
    let right = image::imageops::crop_imm(&rgba, half, 0, width - half, height).to_image();

    Ok(SplitPage {
        fingerprint,
        width,
        left: encode_png(left).map_err(|e| corrupt(e.to_string()))?,
        right: encode_png(right).map_err(|e| corrupt(e.to_string()))?,
    })
}

fn encode_png(img: RgbaImage) -> image::ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img).write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)?;
    Ok(buf)
}

async fn list_assets(dir: &Path) -> Result<Vec<PageAssetRef>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut assets = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(asset) = entry
            .file_name()
            .to_str()
            .and_then(PageAssetRef::parse_file_name)
        {
            assets.push(asset);
        }
    }
    sort_capture_order(&mut assets);
    Ok(assets)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a hidden temp sibling and rename into place.
async fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, dir.join(file_name)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
