// Local HTTP API for the capture-to-translation pipeline

use capword::{
    core::{
        config::ClassifierStrategy,
        languages::{Language, SUPPORTED_LANGUAGES},
        types::{CapturedWord, Contour, Label, Orientation, SourceImage},
        ClassificationError, Config, PipelineError, StorageError, TranslationError,
    },
    orchestration::{CaptureOptions, CapturePipeline},
    services::{
        classification::{LocalClassifier, OnnxObservationModel, RankingPolicy, VisionClassifier},
        network::{FetchOptions, NetworkClient, PathMonitor, TcpPathProbe},
        segmentation::{ForegroundSegmenter, OnnxMaskGenerator},
        speech::{HeadlessSynthesizer, NoopAudioSession, SpeechNarrator, SpeechStyle, Utterance},
        translation::{CachedTranslator, GoogleTranslator, IdentityTranslator, TranslationService},
        ObjectClassifier, Translator,
    },
    storage::WordStore,
    utils::{decode_with_orientation_async, Metrics},
};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

type ApiError = (StatusCode, String);

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pipeline: Arc<CapturePipeline>,
    store: WordStore,
    narrator: Arc<SpeechNarrator>,
    network: Arc<NetworkClient>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "capword={},tower_http=info,ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== CAPWORD ===");
    info!(
        "Config: classifier={:?} targets={:?} cache={} halo={}",
        config.classifier.strategy,
        config.translation.default_targets,
        config.translation.cache_capacity,
        if config.segmentation.halo_enabled { "ON" } else { "OFF" }
    );

    let metrics = Metrics::new();
    let state = build_state(config.clone(), metrics).await?;

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/languages", get(languages))
        .route("/capture", post(capture))
        .route("/words", get(list_words).delete(delete_all_words))
        .route("/words/count", get(count_words))
        .route("/words/:id", axum::routing::delete(delete_word))
        .route("/words/:id/image", get(word_image))
        .route("/words/:id/speech", get(word_speech))
        .route("/words/:id/review", post(review_word))
        .route("/words/:id/notes", put(update_notes))
        .route_layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            track_requests,
        ))
        .with_state(state)
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024)) // full-resolution photos
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET    /                  - Root endpoint");
    info!("  GET    /health            - Health check");
    info!("  GET    /metrics           - Prometheus metrics");
    info!("  GET    /stats             - Detailed statistics");
    info!("  GET    /languages         - Supported target languages");
    info!("  POST   /capture           - Run the pipeline on a photo (multipart/form-data)");
    info!("  GET    /words             - Saved words, newest first");
    info!("  DELETE /words             - Delete every word");
    info!("  GET    /words/count       - Word count");
    info!("  GET    /words/:id/image   - Stored cut-out (PNG)");
    info!("  GET    /words/:id/speech  - Narration plan for a translation");
    info!("  POST   /words/:id/review  - Mark reviewed");
    info!("  PUT    /words/:id/notes   - Update notes");
    info!("  DELETE /words/:id         - Delete a word");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Wire every service from configuration
async fn build_state(config: Arc<Config>, metrics: Metrics) -> Result<AppState> {
    let probe = TcpPathProbe::new(
        config.network.connectivity_probe_addr.clone(),
        config.network.probe_timeout,
    );
    let monitor = PathMonitor::spawn(Arc::new(probe), config.network.monitor_interval);
    let network = Arc::new(NetworkClient::new(&config.network, monitor, Some(metrics.clone()))?);
    let fetch_options = FetchOptions::from_config(&config.network);

    info!("Loading foreground mask model...");
    let generator = OnnxMaskGenerator::new(&config.segmentation)
        .context("Failed to load foreground mask model")?;
    info!("Mask model backend: {}", generator.backend());
    let segmenter = ForegroundSegmenter::new(Arc::new(generator), config.segmentation.clone())?;

    let classifier: Arc<dyn ObjectClassifier> = match config.classifier.strategy {
        ClassifierStrategy::Local => {
            info!("Loading object classifier from {}...", config.classifier.models_dir);
            let model = OnnxObservationModel::load(&config.classifier)?;
            Arc::new(LocalClassifier::new(
                Arc::new(model),
                RankingPolicy::from_config(&config.classifier),
            ))
        }
        ClassifierStrategy::Remote => {
            info!("Using remote label detection at {}", config.classifier.vision_endpoint);
            Arc::new(VisionClassifier::new(
                network.clone(),
                &config.classifier,
                fetch_options.clone(),
            )?)
        }
    };

    let provider: Arc<dyn Translator> = if config.translation.api_key.is_some() {
        Arc::new(GoogleTranslator::new(
            network.clone(),
            &config.translation,
            fetch_options,
        )?)
    } else {
        warn!("No translation API key configured; translations will echo the label");
        Arc::new(IdentityTranslator)
    };
    let provider: Arc<dyn Translator> = match NonZeroUsize::new(config.translation.cache_capacity) {
        Some(capacity) => Arc::new(CachedTranslator::new(provider, capacity, Some(metrics.clone()))),
        None => provider,
    };

    let store = WordStore::open(&config.storage)?;
    info!("Word store ready at {} ({} words)", store.path().display(), store.count().await?);

    let (synthesizer, events) = HeadlessSynthesizer::new();
    let narrator = SpeechNarrator::new(
        Arc::new(synthesizer),
        Arc::new(NoopAudioSession),
        config.speech.clone(),
        events,
    );

    let pipeline = CapturePipeline::new(
        Arc::new(segmenter),
        classifier,
        Arc::new(TranslationService::new(provider)),
        Some(store.clone()),
        config.translation.default_targets.clone(),
        metrics.clone(),
    );

    Ok(AppState {
        config,
        pipeline: Arc::new(pipeline),
        store,
        narrator: Arc::new(narrator),
        network,
        metrics,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn track_requests(
    State(metrics): State<Metrics>,
    matched: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(path) = matched {
        metrics.record_endpoint_request(path.as_str());
    }
    next.run(request).await
}

async fn root() -> &'static str {
    "Capword - capture, name and translate everyday objects"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "networkConnected": state.network.is_connected(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

async fn languages() -> Json<Vec<Language>> {
    Json(SUPPORTED_LANGUAGES.to_vec())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptureResponse {
    labels: Vec<Label>,
    translations: HashMap<String, String>,
    contour: Contour,
    /// Contour as an SVG path in cut-out pixel space
    contour_path: String,
    width: u32,
    height: u32,
    segmentation_fallback: bool,
    saved: Vec<CapturedWord>,
}

/// Run the pipeline on an uploaded photo
///
/// # Request Format:
/// - multipart/form-data
/// - Field "image": the photo (PNG/JPEG)
/// - Field "orientation" (optional): EXIF orientation 1-8, overrides the file's own
/// - Field "targets" (optional): comma-separated language codes
/// - Field "save" (optional): "true" to persist one word per target
async fn capture(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CaptureResponse>, ApiError> {
    let start_time = std::time::Instant::now();

    let mut image_bytes = None;
    let mut orientation = None;
    let mut options = CaptureOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
                image_bytes = Some(data.to_vec());
            }
            "orientation" => {
                let text = field_text(field).await?;
                orientation = Some(parse_orientation(&text)?);
            }
            "targets" => {
                options.targets = parse_targets(&field_text(field).await?);
            }
            "save" => {
                options.save = parse_flag(&field_text(field).await?)?;
            }
            _ => {}
        }
    }

    let bytes = image_bytes.ok_or((StatusCode::BAD_REQUEST, "No image provided".to_string()))?;
    for target in &options.targets {
        if Language::by_code(target).is_none() {
            warn!("Target '{}' is not in the language catalogue", target);
        }
    }

    let (image, stored_orientation) = decode_with_orientation_async(bytes)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid image: {:#}", e)))?;
    let source = SourceImage::new(
        image,
        orientation.unwrap_or(stored_orientation),
        state.config.segmentation.display_scale,
    );

    let outcome = state
        .pipeline
        .run(source, &options)
        .await
        .map_err(pipeline_error)?;

    let result = outcome.result;
    let (width, height) = (result.cutout.width(), result.cutout.height());
    info!(
        "Capture completed in {:.2}s: '{}' -> {} translations, {} saved",
        start_time.elapsed().as_secs_f64(),
        result.best_label().map(|l| l.identifier.as_str()).unwrap_or(""),
        result.translations.len(),
        outcome.saved.len()
    );

    Ok(Json(CaptureResponse {
        contour_path: result.contour.to_svg_path(width as f32, height as f32),
        labels: result.labels,
        translations: result.translations,
        contour: result.contour,
        width,
        height,
        segmentation_fallback: outcome.segmentation_fallback,
        saved: outcome.saved,
    }))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))
}

fn parse_orientation(text: &str) -> Result<Orientation, ApiError> {
    match text.trim().parse::<u8>() {
        Ok(value @ 1..=8) => Ok(Orientation::from_exif(value)),
        _ => Err((
            StatusCode::BAD_REQUEST,
            format!("orientation must be 1-8, got '{}'", text.trim()),
        )),
    }
}

fn parse_targets(text: &str) -> Vec<String> {
    text.split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn parse_flag(text: &str) -> Result<bool, ApiError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err((StatusCode::BAD_REQUEST, format!("invalid flag '{}'", other))),
    }
}

fn pipeline_error(err: PipelineError) -> ApiError {
    let status = match &err {
        _ if err.is_connectivity() => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::InvalidImage(_)
        | PipelineError::Classification(ClassificationError::InvalidImage(_)) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::Classification(ClassificationError::NoObjectsDetected) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PipelineError::Classification(ClassificationError::Remote(_))
        | PipelineError::Translation(TranslationError::Failed { .. })
        | PipelineError::Translation(TranslationError::InvalidResponse(_)) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Capture failed: {:?}", err);
    }
    (status, err.to_string())
}

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        other => {
            error!("Word store failure: {:?}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct WordsQuery {
    language: Option<String>,
    limit: Option<usize>,
}

async fn list_words(
    State(state): State<AppState>,
    Query(query): Query<WordsQuery>,
) -> Result<Json<Vec<CapturedWord>>, ApiError> {
    let mut words = match (&query.language, query.limit) {
        (Some(language), _) => state.store.fetch_by_language(language).await,
        (None, Some(limit)) => state.store.fetch_recent(limit).await,
        (None, None) => state.store.fetch_all().await,
    }
    .map_err(storage_error)?;
    if let Some(limit) = query.limit {
        words.truncate(limit);
    }
    Ok(Json(words))
}

#[derive(Debug, Deserialize)]
struct CountQuery {
    language: Option<String>,
}

async fn count_words(
    State(state): State<AppState>,
    Query(query): Query<CountQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = match &query.language {
        Some(language) => state.store.count_by_language(language).await,
        None => state.store.count().await,
    }
    .map_err(storage_error)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

async fn word_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let word = state.store.get(id).await.map_err(storage_error)?;
    let bytes = word
        .image_data
        .ok_or((StatusCode::NOT_FOUND, format!("Word {} has no image", id)))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes))
}

#[derive(Debug, Deserialize)]
struct SpeechQuery {
    style: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechPlan {
    language: String,
    style: SpeechStyle,
    utterances: Vec<Utterance>,
}

/// Narration plan for a word's translation
async fn word_speech(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SpeechQuery>,
) -> Result<Json<SpeechPlan>, ApiError> {
    let style = match query.style.as_deref() {
        Some(s) => s
            .parse::<SpeechStyle>()
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
        None => SpeechStyle::Natural,
    };
    let word = state.store.get(id).await.map_err(storage_error)?;
    let language = Language::speech_locale_for(&word.target_language);
    let utterances = state.narrator.plan(&word.translation, &language, style);
    Ok(Json(SpeechPlan {
        language,
        style,
        utterances,
    }))
}

async fn review_word(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CapturedWord>, ApiError> {
    state
        .store
        .mark_reviewed(id)
        .await
        .map(Json)
        .map_err(storage_error)
}

#[derive(Debug, Deserialize)]
struct NotesBody {
    notes: Option<String>,
}

async fn update_notes(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<NotesBody>,
) -> Result<Json<CapturedWord>, ApiError> {
    let notes = body.notes.filter(|n| !n.trim().is_empty());
    state
        .store
        .update_notes(id, notes)
        .await
        .map_err(storage_error)?;
    state.store.get(id).await.map(Json).map_err(storage_error)
}

async fn delete_word(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(id).await.map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_words(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.store.delete_all().await.map_err(storage_error)?;
    info!("Deleted {} words", deleted);
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
