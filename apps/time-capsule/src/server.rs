use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Request, State, multipart::MultipartError},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::account::token::SessionTokens;
use crate::account::types::{AccountView, RegisterRequest, SessionToken, SignInRequest};
use crate::account::{AccountError, AccountService};
use crate::capsule::types::{Capsule, CreateCapsuleRequest, UpdateCapsuleRequest};
use crate::capsule::{CapsuleError, CapsuleService};
use crate::object_store::{ObjectStore, ObjectStoreError, StoredFile};
use crate::rate_limit::RateLimiter;

pub const MAX_IMAGE_BYTES: usize = 5 << 20;
const IMAGE_FIELD: &str = "image";
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];

#[derive(Clone)]
pub struct AppState {
    capsules: CapsuleService,
    accounts: AccountService,
    objects: Arc<dyn ObjectStore>,
    rate_limiter: Arc<RateLimiter>,
    request_timeout: Duration,
}

impl AppState {
    #[must_use]
    pub fn new(
        capsules: CapsuleService,
        accounts: AccountService,
        objects: Arc<dyn ObjectStore>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            capsules,
            accounts,
            objects,
            rate_limiter,
            request_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Authenticated account id, inserted by the auth middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/me", get(me))
        .route("/capsules", post(create_capsule).get(list_capsules))
        .route(
            "/capsules/:capsule_id",
            get(get_capsule)
                .patch(update_capsule)
                .delete(delete_capsule),
        )
        .route(
            "/capsules/:capsule_id/images",
            post(upload_image).layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES + 64 * 1024)),
        )
        .route(
            "/capsules/:capsule_id/images/:image",
            get(get_image).delete(delete_image),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_gate));

    let api = Router::new()
        .route("/sign-up", post(sign_up))
        .route("/sign-in", post(sign_in))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_gate));

    let request_timeout = state.request_timeout;
    Router::new()
        .route("/healthz", get(health))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
}

async fn auth_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    match caller_from_headers(&state, request.headers()) {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(error) => error.into_response(),
    }
}

fn caller_from_headers(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = SessionTokens::extract_bearer_token(header_value)
        .map_err(|error| ApiError::Unauthorized(error.code()))?;
    let account_id = state
        .accounts
        .verify_token(token)
        .map_err(ApiError::from_account)?;
    Ok(Caller(account_id))
}

async fn rate_limit_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match state.rate_limiter.try_acquire().await {
        Ok(()) => next.run(request).await,
        Err(retry_after_ms) => {
            tracing::warn!(retry_after_ms, "request rejected by rate limiter");
            ApiError::RateLimited { retry_after_ms }.into_response()
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    object_store: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        object_store: state.objects.driver_name(),
    })
}

async fn sign_up(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AccountView>), ApiError> {
    let account = state
        .accounts
        .register(body)
        .await
        .map_err(ApiError::from_account)?;
    Ok((StatusCode::CREATED, Json(AccountView::from(account))))
}

async fn sign_in(
    State(state): State<AppState>,
    Json(body): Json<SignInRequest>,
) -> Result<Json<SessionToken>, ApiError> {
    let token = state
        .accounts
        .authenticate(&body.email, &body.password)
        .await
        .map_err(ApiError::from_account)?;
    Ok(Json(token))
}

async fn me(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<AccountView>, ApiError> {
    let account = state
        .accounts
        .get_account(caller.0)
        .await
        .map_err(ApiError::from_account)?;
    Ok(Json(AccountView::from(account)))
}

async fn create_capsule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateCapsuleRequest>,
) -> Result<(StatusCode, Json<Capsule>), ApiError> {
    let capsule = state
        .capsules
        .create_capsule(caller.0, body)
        .await
        .map_err(ApiError::from_capsule)?;
    Ok((StatusCode::CREATED, Json(capsule)))
}

async fn list_capsules(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<Capsule>>, ApiError> {
    let capsules = state
        .capsules
        .get_all_capsules(caller.0)
        .await
        .map_err(ApiError::from_capsule)?;
    Ok(Json(capsules))
}

async fn get_capsule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(capsule_id): Path<Uuid>,
) -> Result<Json<Capsule>, ApiError> {
    let capsule = state
        .capsules
        .get_capsule_by_id(caller.0, capsule_id)
        .await
        .map_err(ApiError::from_capsule)?;
    Ok(Json(capsule))
}

async fn update_capsule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(capsule_id): Path<Uuid>,
    Json(body): Json<UpdateCapsuleRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .capsules
        .update_capsule(caller.0, capsule_id, body)
        .await
        .map_err(ApiError::from_capsule)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_capsule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(capsule_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .capsules
        .delete_capsule(caller.0, capsule_id)
        .await
        .map_err(ApiError::from_capsule)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_image(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(capsule_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<StoredFile>), ApiError> {
    state
        .capsules
        .get_capsule_by_id(caller.0, capsule_id)
        .await
        .map_err(ApiError::from_capsule)?;

    let bytes = read_image_field(&mut multipart).await?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }
    let extension = sniff_image_extension(&bytes).ok_or_else(|| {
        ApiError::InvalidRequest(
            "invalid_file_type",
            "only PNG and JPEG images are accepted".to_string(),
        )
    })?;

    let file = StoredFile::new(format!("{}.{extension}", Uuid::now_v7()), bytes);
    let name = file.name.clone();
    let size = file.size;
    state
        .objects
        .upload(file)
        .await
        .map_err(|error| ApiError::from_object_store("upload_image", error))?;

    if let Err(error) = state.capsules.add_image(caller.0, capsule_id, &name).await {
        if let Err(cleanup) = state.objects.delete(&name).await {
            tracing::error!(
                capsule_id = %capsule_id,
                image = %name,
                reason = %cleanup,
                "upload_image: orphaned object could not be removed"
            );
        }
        return Err(ApiError::from_capsule(error));
    }

    tracing::info!(capsule_id = %capsule_id, image = %name, size, "image attached");
    Ok((
        StatusCode::CREATED,
        Json(StoredFile {
            name,
            bytes: Vec::new(),
            size,
        }),
    ))
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| multipart_error(&error, "unable to parse the form"))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|error| multipart_error(&error, "failed to read the uploaded file"))?;
        return Ok(bytes.to_vec());
    }
    Err(ApiError::InvalidRequest(
        "invalid_form",
        "missing image field".to_string(),
    ))
}

fn multipart_error(error: &MultipartError, message: &str) -> ApiError {
    tracing::debug!(reason = %error, "multipart read failed");
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::InvalidRequest("invalid_form", message.to_string())
    }
}

fn sniff_image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(PNG_MAGIC) {
        Some("png")
    } else if bytes.starts_with(JPEG_MAGIC) {
        Some("jpg")
    } else {
        None
    }
}

async fn get_image(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((capsule_id, image)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let capsule = state
        .capsules
        .get_capsule_by_id(caller.0, capsule_id)
        .await
        .map_err(ApiError::from_capsule)?;
    if !capsule.has_image(&image) {
        return Err(ApiError::NotFound);
    }

    let file = state
        .objects
        .get(&image)
        .await
        .map_err(|error| ApiError::from_object_store("get_image", error))?;
    let content_type = mime_guess::from_path(&file.name)
        .first_or_octet_stream()
        .to_string();
    Ok(([(header::CONTENT_TYPE, content_type)], file.bytes).into_response())
}

async fn delete_image(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((capsule_id, image)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    let capsule = state
        .capsules
        .get_capsule_by_id(caller.0, capsule_id)
        .await
        .map_err(ApiError::from_capsule)?;
    if !capsule.has_image(&image) {
        return Err(ApiError::NotFound);
    }

    state
        .capsules
        .remove_image(caller.0, capsule_id, &image)
        .await
        .map_err(ApiError::from_capsule)?;
    state
        .objects
        .delete(&image)
        .await
        .map_err(|error| ApiError::from_object_store("delete_image", error))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(&'static str, String),
    Unauthorized(&'static str),
    Forbidden,
    NotFound,
    Conflict(&'static str, String),
    PayloadTooLarge,
    RateLimited { retry_after_ms: u64 },
    Internal,
}

impl ApiError {
    fn from_capsule(error: CapsuleError) -> Self {
        match error {
            CapsuleError::NotFound => Self::NotFound,
            CapsuleError::Forbidden => Self::Forbidden,
            CapsuleError::StorageFailure | CapsuleError::DbFailure => Self::Internal,
            validation => Self::InvalidRequest(validation.code(), validation.message()),
        }
    }

    fn from_account(error: AccountError) -> Self {
        match error {
            AccountError::InvalidUsername
            | AccountError::InvalidEmail
            | AccountError::InvalidPassword => Self::InvalidRequest(error.code(), error.message()),
            AccountError::UsernameDuplicate | AccountError::EmailDuplicate => {
                Self::Conflict(error.code(), error.message())
            }
            AccountError::InvalidCredentials
            | AccountError::TokenExpired
            | AccountError::InvalidToken => Self::Unauthorized(error.code()),
            AccountError::NotFound => Self::NotFound,
            AccountError::PasswordHashFailure
            | AccountError::DbFailure
            | AccountError::TokenCreationFailed => Self::Internal,
        }
    }

    fn from_object_store(operation: &'static str, error: ObjectStoreError) -> Self {
        match error {
            ObjectStoreError::NotFound(_) | ObjectStoreError::InvalidKey(_) => Self::NotFound,
            other => {
                tracing::error!(operation, reason = %other, "object store failure");
                Self::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidRequest(code, message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": code,
                    "message": message,
                })),
            )
                .into_response(),
            Self::Unauthorized(code) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": code,
                    "message": "authentication required",
                })),
            )
                .into_response(),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": "forbidden",
                    "message": CapsuleError::Forbidden.message(),
                })),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                    "message": "not found",
                })),
            )
                .into_response(),
            Self::Conflict(code, message) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": code,
                    "message": message,
                })),
            )
                .into_response(),
            Self::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({
                    "error": "payload_too_large",
                    "message": "images are limited to 5 MiB",
                })),
            )
                .into_response(),
            Self::RateLimited { retry_after_ms } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(
                    header::RETRY_AFTER,
                    retry_after_ms.div_ceil(1_000).max(1).to_string(),
                )],
                Json(serde_json::json!({
                    "error": "rate_limited",
                    "message": "too many requests",
                    "retry_after_ms": retry_after_ms,
                })),
            )
                .into_response(),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal",
                    "message": CapsuleError::DbFailure.message(),
                })),
            )
                .into_response(),
        }
    }
}
