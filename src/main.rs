//! Cover Reader - photographed book cover in, first two content pages out.

mod capabilities;
mod config;
mod content_store;
mod error;
mod identity;
mod janitor;
mod llm;
mod ocr;
mod openrouter;
mod page_key;
mod pipeline;
mod schema;
mod sources;
mod status;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use config::Settings;
use content_store::{Artifact, ContentStore};
use error::{BookError, ErrorReport};
use identity::IdentityReconciler;
use janitor::Janitor;
use openrouter::OpenRouterClient;
use pipeline::{Capabilities, Pipeline};
use schema::{BookMetadata, ContentAnalysis};
use serde::Serialize;
use status::{BookStatus, StatusResolver};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: ContentStore,
    identity: IdentityReconciler,
    status: StatusResolver,
    pipeline: Pipeline,
    settings: Arc<Settings>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "cover_reader=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env()?);
    let store = ContentStore::new(&settings.cache_root, settings.max_duplicate_slots);
    info!("Cache root: {:?}", store.root());
    let identity = IdentityReconciler::new(store.clone());
    let status = StatusResolver::new(store.clone(), identity.clone());
    let janitor = Janitor::new(store.clone(), status.clone());

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let openrouter = OpenRouterClient::from_env()?;
    info!("OpenRouter client initialized ({})", openrouter.model());
    let ocr = ocr::from_env(http.clone())?;
    info!("OCR engine: {}", ocr.name());

    let caps = Capabilities {
        classifier: Arc::new(llm::LlmCoverClassifier::new(openrouter.clone())),
        search: Arc::new(sources::GoogleBooksSearch::from_env(http.clone())),
        capture: Arc::new(sources::CaptureSidecar::from_env(http.clone())),
        ocr,
        cleanup: Arc::new(llm::LlmTextCleanup::new(openrouter)),
    };
    let pipeline = Pipeline::new(store.clone(), identity.clone(), caps, settings.clone())
        .with_janitor(janitor.clone());

    if let Some(interval) = settings.janitor_interval() {
        info!("Janitor sweeping every {:?}", interval);
        tokio::spawn(janitor.run(interval));
    }

    let state = AppState {
        store,
        identity,
        status,
        pipeline,
        settings: settings.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/books", post(upload_cover))
        .route("/books/{id}", get(get_book))
        .route("/books/{id}/content", get(get_content))
        .route("/books/{id}/status", get(get_status))
        .route("/books/{id}/error", post(report_error))
        .route("/images/{id}/{filename}", get(get_image))
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024)) // 20MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

struct ApiError(BookError);

impl From<BookError> for ApiError {
    fn from(err: BookError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BookError::InvalidBookId(_) | BookError::CorruptImage { .. } => StatusCode::BAD_REQUEST,
            BookError::NotFound(_) => StatusCode::NOT_FOUND,
            BookError::IdentityConflict { .. } => StatusCode::CONFLICT,
            BookError::NoPreviewAvailable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BookError::CapabilityUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(self.0.report())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BookView {
    book_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    canonical_id: Option<String>,
    status: BookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<BookMetadata>,
    /// `/images/...` paths in capture order.
    images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<ContentAnalysis>,
}

/// Upload a cover photo and start acquisition. Answers with the finished
/// book if the job completes within the deadline, otherwise 202 and the
/// current status; the job keeps running either way.
async fn upload_cover(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<BookView>)> {
    let bad_upload = |detail: String| {
        ApiError(BookError::CorruptImage {
            page_key: "cover".to_string(),
            detail,
        })
    };

    let mut cover = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_upload(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            cover = field
                .bytes()
                .await
                .map_err(|e| bad_upload(format!("Failed to read file: {}", e)))?
                .to_vec();
            break;
        }
    }
    if cover.is_empty() {
        return Err(bad_upload("No file uploaded".to_string()));
    }

    let upload_id = uuid::Uuid::new_v4().to_string();
    info!("Received cover {} ({} bytes)", upload_id, cover.len());

    let job = state.pipeline.spawn(upload_id.clone(), cover);
    let finished = match tokio::time::timeout(state.settings.request_deadline(), job).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Acquisition task for {} panicked: {}", upload_id, e);
            true
        }
        Err(_) => {
            info!("Acquisition for {} still running after deadline", upload_id);
            false
        }
    };

    let view = book_view(&state, &upload_id).await?;
    let code = if finished { StatusCode::OK } else { StatusCode::ACCEPTED };
    Ok((code, Json(view)))
}

/// Merged view of a book across its linked ids. Repairs start in the
/// background; the answer reflects what is published now.
async fn get_book(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<BookView>> {
    state.pipeline.reconcile_in_background(&id);
    Ok(Json(book_view(&state, &id).await?))
}

/// The two display pages, once published.
async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContentAnalysis>> {
    state.pipeline.reconcile_in_background(&id);
    find_content(&state, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(BookError::NotFound(format!("no content for '{}' yet", id))))
}

async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<BookStatus>> {
    state.pipeline.reconcile_in_background(&id);
    Ok(Json(state.status.get_status(&id).await?))
}

/// Record a client-side failure as the book's error marker.
async fn report_error(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<ErrorReport>,
) -> ApiResult<Json<BookStatus>> {
    {
        let dir = state.store.lock(&id).await?;
        dir.append_log(&format!("client reported error {}: {}", report.code, report.message))
            .await?;
        dir.write_error(report, false).await?;
    }
    Ok(Json(state.status.get_status(&id).await?))
}

/// Serve one stored page image. Falls back to linked ids when the file is
/// not in the requested directory.
async fn get_image(
    State(state): State<AppState>,
    Path((id, filename)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let mut last = BookError::NotFound(format!("{}/{}", id, filename));
    for linked in state.identity.linked_ids(&id).await? {
        match state.store.read_page_image(&linked, &filename).await {
            Ok(bytes) => {
                let mime = openrouter::sniff_mime(&bytes);
                return Ok(([(header::CONTENT_TYPE, mime)], bytes));
            }
            Err(e @ BookError::NotFound(_)) => last = e,
            Err(e) => return Err(e.into()),
        }
    }
    Err(last.into())
}

// ============================================================================
// Helper functions
// ============================================================================

async fn find_content(state: &AppState, id: &str) -> error::Result<Option<ContentAnalysis>> {
    for linked in state.identity.linked_ids(id).await? {
        let analysis: Option<ContentAnalysis> =
            state.store.read_lenient(&linked, Artifact::ContentAnalysis).await;
        if let Some(analysis) = analysis.filter(|a| state.pipeline.validator().is_valid(a)) {
            return Ok(Some(analysis));
        }
    }
    Ok(None)
}

async fn book_view(state: &AppState, id: &str) -> error::Result<BookView> {
    let ids = state.identity.linked_ids(id).await?;
    if !state.store.book_exists(id).await {
        return Err(BookError::NotFound(format!("book '{}'", id)));
    }

    let mut metadata: Option<BookMetadata> = None;
    let mut images = Vec::new();
    for linked in &ids {
        if metadata.is_none() {
            metadata = match state.store.get_mapping_record(linked).await? {
                Some(record) => Some(record.snapshot_metadata),
                None => state.store.read_lenient(linked, Artifact::Metadata).await,
            };
        }
        if images.is_empty() {
            images = state
                .store
                .get_page_assets(linked)
                .await?
                .iter()
                .map(|asset| format!("/images/{}/{}", linked, asset.file_name()))
                .collect();
        }
    }

    Ok(BookView {
        book_id: id.to_string(),
        canonical_id: state.identity.resolve(id).await?,
        status: state.status.get_status(id).await?,
        metadata,
        images,
        content: find_content(state, id).await?,
    })
}
