// Location Reconciliation - Web Server
// JSON API over the reconciliation service (Axum)

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use location_reconciliation::logging::{default_directive, init_tracing};
use location_reconciliation::{
    GroupKey, LocationType, ReconciliationConfig, ReconciliationError, ReconciliationService,
    SqliteStore,
};

#[derive(Parser)]
#[command(name = "reconciliation-server", version)]
#[command(about = "JSON API for location reconciliation")]
struct Args {
    /// SQLite database (overrides database_path from the config file)
    #[arg(long)]
    db: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:3000")]
    addr: String,

    #[arg(short, long)]
    verbose: bool,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<ReconciliationService>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

/// Error details for clients deciding whether to retry
#[derive(Serialize)]
struct ErrorInfo {
    retryable: bool,
    partially_applied: bool,
}

fn error_response(err: ReconciliationError) -> Response {
    let status = match &err {
        ReconciliationError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReconciliationError::ConcurrentModification { .. } => StatusCode::CONFLICT,
        ReconciliationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ReconciliationError::Persistence { .. } | ReconciliationError::Store(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ReconciliationError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    warn!(status = status.as_u16(), error = %err, "request failed");

    let body = ApiResponse {
        success: false,
        data: ErrorInfo {
            retryable: err.is_retryable(),
            partially_applied: err.partially_applied(),
        },
        error: Some(err.to_string()),
    };

    (status, Json(body)).into_response()
}

/// Runs a service call on the blocking pool; SQLite sits behind a Mutex
async fn run_blocking<T, F>(state: &AppState, work: F) -> Result<T, Response>
where
    F: FnOnce(&ReconciliationService) -> T + Send + 'static,
    T: Send + 'static,
{
    let service = Arc::clone(&state.service);
    tokio::task::spawn_blocking(move || work(&service))
        .await
        .map_err(|e| {
            warn!(error = %e, "blocking task did not complete");
            let body: ApiResponse<Option<ErrorInfo>> = ApiResponse {
                success: false,
                data: None,
                error: Some(format!("internal error: {}", e)),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        })
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct MergeRequest {
    name: String,
    location_type: LocationType,
    keeper_id: String,
}

#[derive(Deserialize)]
struct FixOrphanRequest {
    parent_id: String,
}

#[derive(Deserialize)]
struct NormalizeRequest {
    pattern: String,
    canonical_form: String,
}

#[derive(Serialize)]
struct RewriteCount {
    rewritten: usize,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/report - Duplicate groups, orphans, linkage issues
async fn get_report(State(state): State<AppState>) -> Response {
    let report = match run_blocking(&state, |service| service.detect_duplicates()).await {
        Ok(report) => report,
        Err(response) => return response,
    };

    let status = if report.read_error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(ApiResponse::ok(report))).into_response()
}

/// GET /api/orphans
async fn get_orphans(State(state): State<AppState>) -> Response {
    match run_blocking(&state, |service| service.detect_orphans()).await {
        Ok(orphans) => Json(ApiResponse::ok(orphans)).into_response(),
        Err(response) => response,
    }
}

/// POST /api/merge - Merge the group stored under (name, type) into keeper_id
async fn merge_group(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Response {
    let key = GroupKey::new(&request.name, request.location_type);
    let keeper_id = request.keeper_id;

    match run_blocking(&state, move |service| service.merge(&key, &keeper_id)).await {
        Ok(Ok(result)) => (StatusCode::OK, Json(ApiResponse::ok(result))).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(response) => response,
    }
}

/// POST /api/orphans/:id/parent - Attach an orphan to a parent
async fn fix_orphan(
    State(state): State<AppState>,
    Path(orphan_id): Path<String>,
    Json(request): Json<FixOrphanRequest>,
) -> Response {
    let id = orphan_id.clone();
    let outcome = run_blocking(&state, move |service| {
        service.fix_orphan(&id, &request.parent_id)
    })
    .await;

    match outcome {
        Ok(Ok(())) => (StatusCode::OK, Json(ApiResponse::ok(orphan_id))).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(response) => response,
    }
}

/// POST /api/normalize - One-off variant rewrite
async fn normalize_variant(
    State(state): State<AppState>,
    Json(request): Json<NormalizeRequest>,
) -> Response {
    let outcome = run_blocking(&state, move |service| {
        service.normalize_known_variant(&request.pattern, &request.canonical_form)
    })
    .await;

    match outcome {
        Ok(Ok(rewritten)) => {
            (StatusCode::OK, Json(ApiResponse::ok(RewriteCount { rewritten }))).into_response()
        }
        Ok(Err(e)) => error_response(e),
        Err(response) => response,
    }
}

/// POST /api/rules/apply - Every configured variant rule
async fn apply_rules(State(state): State<AppState>) -> Response {
    match run_blocking(&state, |service| service.apply_variant_rules()).await {
        Ok(Ok(rewritten)) => {
            (StatusCode::OK, Json(ApiResponse::ok(RewriteCount { rewritten }))).into_response()
        }
        Ok(Err(e)) => error_response(e),
        Err(response) => response,
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&default_directive(args.verbose));

    println!("🌐 Location Reconciliation - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut config = match &args.config {
        Some(path) => ReconciliationConfig::from_file(path)?,
        None => ReconciliationConfig::default(),
    };
    if let Some(db) = &args.db {
        config.database_path = db.clone();
    }

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;
    println!("✓ Database opened: {:?}", config.database_path);

    // Create shared state
    let state = AppState {
        service: Arc::new(
            ReconciliationService::sqlite(Arc::new(store))
                .with_config(config)
                .with_actor("api"),
        ),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/report", get(get_report))
        .route("/orphans", get(get_orphans))
        .route("/orphans/:id/parent", post(fix_orphan))
        .route("/merge", post(merge_group))
        .route("/normalize", post(normalize_variant))
        .route("/rules/apply", post(apply_rules))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    info!(addr = %args.addr, "server listening");
    println!("\n🚀 Server running on http://{}", args.addr);
    println!("   API: http://{}/api/report", args.addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use location_reconciliation::LocationNode;

    fn create_test_state() -> AppState {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, name, usage) in [("A", "El Millon", 5), ("B", "El Millón", 12)] {
            let node = LocationNode::new(name, LocationType::Sector, Some("C1".to_string()))
                .with_id(id)
                .with_stats(40, usage);
            store.insert_location(&node).unwrap();
        }

        AppState {
            service: Arc::new(ReconciliationService::sqlite(Arc::new(store))),
        }
    }

    #[tokio::test]
    async fn test_merge_runs_on_blocking_pool() {
        let state = create_test_state();
        let request = MergeRequest {
            name: "el millon".to_string(),
            location_type: LocationType::Sector,
            keeper_id: "B".to_string(),
        };

        let response = merge_group(State(state.clone()), Json(request)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let report = get_report(State(state)).await;
        assert_eq!(report.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_orphan_maps_to_unprocessable() {
        let state = create_test_state();
        let request = FixOrphanRequest {
            parent_id: "C1".to_string(),
        };

        let response = fix_orphan(State(state), Path("missing".to_string()), Json(request)).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
