/*!
sheetbase REST API Server

Serves uploaded tabular data: dynamic tables provisioned from upload headers and
the generic per-file row store.

## Usage

```bash
sheetbase-rest --database duckdb://sheetbase.duckdb --host 127.0.0.1 --port 3001
```

## Endpoints

- `POST /api/upload` - Store parsed rows (dynamic table or generic store)
- `GET /api/tables` - List dynamic tables
- `GET /api/tables/:tableName` - Describe a table
- `GET /api/tables/:tableName/data` - Page through a table
- `DELETE /api/tables/:tableName` - Drop a table
- `PUT /api/tables/:tableName/headers` - Replace display headers
- `PUT /api/tables/:tableName/lock` - Lock or unlock a table
- `PUT /api/tables/:tableName/rows/:id` - Update one row
- `GET /api/data` - Page through the most recent generic upload
- `GET /api/files` - List generic uploads
- `GET /api/data/:fileName` - Page through one generic upload
- `GET /api/health` - Health check
- `GET /api/version` - Version information
*/

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sheetbase::catalog::HeaderMapping;
use sheetbase::generic::FileSummary;
use sheetbase::query::PageParams;
use sheetbase::service::{UploadOutcome, UploadRequest};
use sheetbase::store::DuckDBStore;
use sheetbase::{
    ColumnDescriptor, DataService, PageRequest, PageResult, Record, ServiceConfig, SheetbaseError,
    TableDescriptor, VERSION,
};

/// CLI arguments for the REST API server
#[derive(Parser)]
#[command(name = "sheetbase-rest")]
#[command(about = "sheetbase REST API Server")]
#[command(version = VERSION)]
struct Cli {
    /// Database connection string (duckdb://memory or duckdb://<path>)
    #[arg(long, env = "SHEETBASE_DATABASE", default_value = "duckdb://sheetbase.duckdb")]
    database: String,

    /// Host address to bind to
    #[arg(long, env = "SHEETBASE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind to
    #[arg(long, env = "SHEETBASE_PORT", default_value = "3001")]
    port: u16,

    /// CORS allowed origins (comma-separated)
    #[arg(long, env = "SHEETBASE_CORS_ORIGIN", default_value = "*")]
    cors_origin: String,

    /// Rows per INSERT statement when ingesting uploads
    #[arg(long, env = "SHEETBASE_BATCH_SIZE", default_value = "100")]
    batch_size: usize,

    /// Largest page size a caller may request
    #[arg(long, env = "SHEETBASE_MAX_PAGE_SIZE", default_value = "1000")]
    max_page_size: u64,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    /// Wrapped in Arc<Mutex> since the DuckDB connection is not Sync
    service: Arc<Mutex<DataService>>,
}

impl AppState {
    fn new(service: DataService) -> Self {
        Self {
            service: Arc::new(Mutex::new(service)),
        }
    }

    fn service(&self) -> Result<MutexGuard<'_, DataService>, ApiErrorResponse> {
        self.service.lock().map_err(|e| {
            SheetbaseError::StoreError(format!(
                "Database connection unavailable (mutex poisoned): {}",
                e
            ))
            .into()
        })
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for PUT /api/tables/:tableName/headers
#[derive(Debug, Deserialize)]
struct HeadersRequest {
    headers: HeaderMapping,
}

/// Request body for PUT /api/tables/:tableName/lock
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRequest {
    locked: bool,
    #[serde(default)]
    system_table: Option<bool>,
}

/// Request body for PUT /api/tables/:tableName/rows/:id
#[derive(Debug, Deserialize)]
struct RowUpdateRequest {
    data: Record,
}

/// Successful API response: `success: true` plus the payload's fields
#[derive(Debug, Serialize)]
struct ApiSuccess<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

fn success<T: Serialize>(data: T) -> Json<ApiSuccess<T>> {
    Json(ApiSuccess {
        success: true,
        data,
    })
}

/// Error API response
#[derive(Debug, Serialize)]
struct ApiError {
    success: bool,
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Serialize)]
struct TablesResult {
    tables: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FilesResult {
    files: Vec<FileSummary>,
}

#[derive(Debug, Serialize)]
struct MessageResult {
    message: String,
}

#[derive(Debug, Serialize)]
struct RowResult {
    data: Record,
}

/// One page of rows
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    data: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    columns: Option<Vec<ColumnDescriptor>>,
    total: u64,
    page: u64,
    page_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<FileSummary>,
}

impl From<PageResult> for PageResponse {
    fn from(page: PageResult) -> Self {
        Self {
            data: page.rows,
            columns: None,
            total: page.total,
            page: page.page,
            page_size: page.page_size,
            message: None,
            file: None,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Version response
#[derive(Debug, Serialize)]
struct VersionResponse {
    version: String,
    backend: String,
    features: Vec<String>,
}

// ============================================================================
// Error Handling
// ============================================================================

/// Custom error type for API responses
struct ApiErrorResponse {
    status: StatusCode,
    error: ApiError,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let json = Json(self.error);
        (self.status, json).into_response()
    }
}

impl From<SheetbaseError> for ApiErrorResponse {
    fn from(err: SheetbaseError) -> Self {
        let (status, error_type) = match &err {
            SheetbaseError::InvalidName(_) => (StatusCode::BAD_REQUEST, "InvalidName"),
            SheetbaseError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            SheetbaseError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            SheetbaseError::TableLocked(_) => (StatusCode::CONFLICT, "TableLocked"),
            SheetbaseError::ProvisionFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "ProvisionFailed"),
            SheetbaseError::IngestFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "IngestFailed"),
            SheetbaseError::QueryFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "QueryFailed"),
            SheetbaseError::StoreError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "StoreError"),
        };

        if status.is_server_error() {
            tracing::error!("{}", err);
        }

        ApiErrorResponse {
            status,
            error: ApiError {
                success: false,
                message: err.to_string(),
                error_type: error_type.to_string(),
            },
        }
    }
}

type ApiResult<T> = Result<Json<ApiSuccess<T>>, ApiErrorResponse>;

// ============================================================================
// Handler Functions
// ============================================================================

/// POST /api/upload - Store parsed rows
async fn upload_handler(State(state): State<AppState>, Json(request): Json<UploadRequest>) -> ApiResult<UploadOutcome> {
    info!(
        "Upload '{}': {} rows, {} columns",
        request.file_name,
        request.rows.len(),
        request.columns.len()
    );
    let outcome = state.service()?.upload(request)?;
    Ok(success(outcome))
}

/// GET /api/tables - List dynamic tables
async fn list_tables_handler(State(state): State<AppState>) -> ApiResult<TablesResult> {
    let tables = state.service()?.list_tables()?;
    Ok(success(TablesResult { tables }))
}

/// GET /api/tables/:tableName - Describe a table
async fn describe_table_handler(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
) -> ApiResult<TableDescriptor> {
    let table = state.service()?.describe_table(&table_name)?;
    Ok(success(table))
}

/// GET /api/tables/:tableName/data - Page through a table
async fn table_data_handler(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<PageResponse> {
    let service = state.service()?;
    let request = PageRequest::from_params(&params, service.config());
    let table_page = service.query_table(&table_name, &request)?;

    let mut response = PageResponse::from(table_page.page);
    response.columns = Some(table_page.columns);
    Ok(success(response))
}

/// DELETE /api/tables/:tableName - Drop a table
async fn drop_table_handler(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
) -> ApiResult<MessageResult> {
    state.service()?.drop_table(&table_name)?;
    Ok(success(MessageResult {
        message: format!("Table '{}' dropped", table_name),
    }))
}

/// PUT /api/tables/:tableName/headers - Replace display headers
async fn headers_handler(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
    Json(request): Json<HeadersRequest>,
) -> ApiResult<TableDescriptor> {
    let table = state.service()?.set_headers(&table_name, request.headers)?;
    Ok(success(table))
}

/// PUT /api/tables/:tableName/lock - Lock or unlock a table
async fn lock_handler(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
    Json(request): Json<LockRequest>,
) -> ApiResult<TableDescriptor> {
    let service = state.service()?;
    let mut table = service.set_locked(&table_name, request.locked)?;
    if let Some(system_table) = request.system_table {
        table = service.set_system_table(&table_name, system_table)?;
    }
    Ok(success(table))
}

/// PUT /api/tables/:tableName/rows/:id - Update one row
async fn update_row_handler(
    State(state): State<AppState>,
    Path((table_name, id)): Path<(String, i64)>,
    Json(request): Json<RowUpdateRequest>,
) -> ApiResult<RowResult> {
    let data = state.service()?.update_row(&table_name, id, &request.data)?;
    Ok(success(RowResult { data }))
}

/// GET /api/data - Page through the most recent generic upload
async fn latest_data_handler(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<PageResponse> {
    let service = state.service()?;
    let request = PageRequest::from_params(&params, service.config());
    let file_page = service.query_latest_file(&request)?;

    let mut response = PageResponse::from(file_page.page);
    response.message = file_page.message;
    response.file = file_page.file;
    Ok(success(response))
}

/// GET /api/files - List generic uploads
async fn files_handler(State(state): State<AppState>) -> ApiResult<FilesResult> {
    let files = state.service()?.list_files()?;
    Ok(success(FilesResult { files }))
}

/// GET /api/data/:fileName - Page through one generic upload
async fn file_data_handler(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<PageResponse> {
    let service = state.service()?;
    let request = PageRequest::from_params(&params, service.config());
    let page = service.query_file(&file_name, &request)?;
    Ok(success(PageResponse::from(page)))
}

/// GET /api/health - Health check
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: VERSION.to_string(),
    })
}

/// GET /api/version - Version information
async fn version_handler(State(state): State<AppState>) -> Result<Json<VersionResponse>, ApiErrorResponse> {
    let backend = state.service()?.store().backend().to_string();
    Ok(Json(VersionResponse {
        version: VERSION.to_string(),
        backend,
        features: vec!["rest-api".to_string()],
    }))
}

/// Root handler
async fn root_handler() -> &'static str {
    "sheetbase REST API Server - See /api/health for status"
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .route("/api/version", get(version_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/tables", get(list_tables_handler))
        .route(
            "/api/tables/:tableName",
            get(describe_table_handler).delete(drop_table_handler),
        )
        .route("/api/tables/:tableName/data", get(table_data_handler))
        .route("/api/tables/:tableName/headers", put(headers_handler))
        .route("/api/tables/:tableName/lock", put(lock_handler))
        .route("/api/tables/:tableName/rows/:id", put(update_row_handler))
        .route("/api/data", get(latest_data_handler))
        .route("/api/data/:fileName", get(file_data_handler))
        .route("/api/files", get(files_handler))
        .with_state(state)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheetbase=info,sheetbase_rest=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    info!("Opening database {}", cli.database);
    let store = DuckDBStore::from_connection_string(&cli.database)?;
    let config = ServiceConfig::default()
        .with_batch_size(cli.batch_size)
        .with_max_page_size(cli.max_page_size);
    let service = DataService::new(Box::new(store), config)?;

    // Configure CORS
    let cors = if cli.cors_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    } else {
        let origins: Vec<_> = cli
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    };

    let app = build_router(AppState::new(service))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;

    info!("Starting sheetbase REST API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
