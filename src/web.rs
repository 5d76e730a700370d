use crate::attachments::Upload;
use crate::config::TrackerConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{CategoryViewParams, TaskViewParams};
use crate::session::{authorize, require_authenticated, SessionGate};
use crate::tracker::{ActionScope, FormFields, Mutation, TaskTracker};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State},
    http::{
        header::{
            CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_SECURITY_POLICY, CONTENT_TYPE, PRAGMA,
            REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
        },
        HeaderName, HeaderValue, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Form, Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const CONTENT_SECURITY: &str = "default-src 'self'; style-src 'self' 'unsafe-inline'; base-uri 'none'; \
form-action 'self'; frame-ancestors 'none'; object-src 'none'";

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<TaskTracker>,
    pub session: Arc<dyn SessionGate>,
    pub max_request_bytes: usize,
    pub max_file_bytes: usize,
}

impl AppState {
    pub fn new(tracker: Arc<TaskTracker>, session: Arc<dyn SessionGate>, config: &TrackerConfig) -> Self {
        Self {
            tracker,
            session,
            max_request_bytes: config.max_request_bytes,
            max_file_bytes: config.max_file_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(task_page).post(task_action))
        .route("/categories", get(category_page).post(category_action))
        .layer(DefaultBodyLimit::max(state.max_request_bytes))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn task_page(State(state): State<AppState>, Query(params): Query<TaskViewParams>) -> AppResult<Response> {
    require_authenticated(state.session.as_ref())?;
    if let Some(requested) = params.download.clone().filter(|value| !value.is_empty()) {
        let tracker = Arc::clone(&state.tracker);
        let (path, name) = blocking(move || tracker.task_download(&requested)).await?;
        return file_response(path, &name).await;
    }

    let tracker = Arc::clone(&state.tracker);
    let mut view = blocking(move || Ok(tracker.task_view(&params))).await?;
    view.csrf_token = state.session.csrf_token();
    Ok(Json(view).into_response())
}

async fn category_page(
    State(state): State<AppState>,
    Query(params): Query<CategoryViewParams>,
) -> AppResult<Response> {
    require_authenticated(state.session.as_ref())?;
    if let Some(requested) = params.download.clone().filter(|value| !value.is_empty()) {
        let tracker = Arc::clone(&state.tracker);
        let (path, name) = blocking(move || tracker.category_download(&requested)).await?;
        return file_response(path, &name).await;
    }

    let tracker = Arc::clone(&state.tracker);
    let mut view = blocking(move || Ok(tracker.category_view(&params))).await?;
    view.csrf_token = state.session.csrf_token();
    Ok(Json(view).into_response())
}

async fn task_action(State(state): State<AppState>, ActionForm(fields): ActionForm) -> AppResult<Response> {
    mutate(state, ActionScope::Tasks, fields).await
}

async fn category_action(State(state): State<AppState>, ActionForm(fields): ActionForm) -> AppResult<Response> {
    mutate(state, ActionScope::Categories, fields).await
}

/// Authorizes, parses and applies one mutation, then redirects back to the view it came from.
async fn mutate(state: AppState, scope: ActionScope, fields: FormFields) -> AppResult<Response> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("mutation", request_id = %request_id, scope = ?scope);

    if let Err(error) = authorize(state.session.as_ref(), fields.first("csrf_token")) {
        tracing::warn!(parent: &span, error = %error, "mutation rejected");
        return Err(error);
    }

    let location = view_location(scope, &fields);
    let mutation = Mutation::parse(scope, fields)?;
    let tracker = Arc::clone(&state.tracker);
    let worker_span = span.clone();
    let result = blocking(move || {
        let _entered = worker_span.enter();
        tracker.apply(mutation)
    })
    .await;

    match result {
        Ok(_) => Ok(Redirect::to(&location).into_response()),
        Err(error @ (AppError::Upload(_) | AppError::Persistence(_) | AppError::Io(_) | AppError::Internal(_))) => {
            tracing::error!(parent: &span, error = %error, "mutation failed");
            Ok(update_failed(scope, &error))
        }
        Err(error) => Err(error),
    }
}

fn update_failed(scope: ActionScope, error: &AppError) -> Response {
    let status = match error {
        AppError::Upload(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let subject = match scope {
        ActionScope::Tasks => "tasks",
        ActionScope::Categories => "categories",
    };
    (status, format!("Could not update {}. Please try again.", subject)).into_response()
}

/// The page a mutation was posted from, with its search and paging parameters.
fn view_location(scope: ActionScope, fields: &FormFields) -> String {
    let (path, keys): (&str, &[&str]) = match scope {
        ActionScope::Tasks => ("/", &["q", "page", "per_page"]),
        ActionScope::Categories => ("/categories", &["q"]),
    };
    let query: Vec<String> = keys
        .iter()
        .filter_map(|key| {
            fields
                .first(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| format!("{}={}", key, urlencoding::encode(value)))
        })
        .collect();
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query.join("&"))
    }
}

async fn file_response(path: PathBuf, name: &str) -> AppResult<Response> {
    let bytes = tokio::fs::read(&path).await.map_err(|error| {
        tracing::warn!(path = %path.to_string_lossy(), error = %error, "attachment unreadable");
        AppError::NotFound("File not found".to_string())
    })?;
    let disposition = content_disposition(name);
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_DISPOSITION, disposition)
        .header(CONTENT_LENGTH, bytes.len())
        .body(Body::from(bytes))
        .map_err(|error| AppError::Internal(error.to_string()))
}

/// Plain ASCII `filename` for old clients, the exact name in `filename*` (RFC 6266).
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|ch| match ch {
            ' '..='~' if ch != '"' && ch != '\\' => ch,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    )
}

async fn blocking<T, F>(work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| AppError::Internal(format!("blocking task failed: {}", error)))?
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static(CONTENT_SECURITY));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Mutation body, either `application/x-www-form-urlencoded` or `multipart/form-data`.
pub struct ActionForm(pub FormFields);

#[axum::async_trait]
impl FromRequest<AppState> for ActionForm {
    type Rejection = AppError;

    async fn from_request(request: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let is_multipart = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim_start().starts_with("multipart/form-data"));

        if !is_multipart {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, state)
                .await
                .map_err(|rejection| AppError::Validation(rejection.body_text()))?;
            return Ok(Self(FormFields::from_pairs(pairs)));
        }

        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|rejection| AppError::Validation(rejection.body_text()))?;
        let mut fields = FormFields::new();

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|error| AppError::Validation(format!("invalid multipart payload: {}", error)))?
        {
            let Some(name) = field.name().map(ToString::to_string) else {
                continue;
            };
            let Some(file_name) = field.file_name().map(ToString::to_string) else {
                let value = field
                    .text()
                    .await
                    .map_err(|error| AppError::Validation(format!("invalid {} field: {}", name, error)))?;
                fields.push_value(name, value);
                continue;
            };

            let mut bytes = Vec::new();
            let mut failure: Option<String> = None;
            let mut stream_broken = false;
            loop {
                match field.chunk().await {
                    Ok(Some(_)) if failure.is_some() => {}
                    Ok(Some(chunk)) if bytes.len() + chunk.len() > state.max_file_bytes => {
                        failure = Some("file exceeds the upload size limit".to_string());
                        bytes.clear();
                    }
                    Ok(Some(chunk)) => bytes.extend_from_slice(&chunk),
                    Ok(None) => break,
                    Err(error) => {
                        failure = Some(error.to_string());
                        stream_broken = true;
                        break;
                    }
                }
            }

            let upload = match failure {
                Some(reason) => Upload::failed(file_name, reason),
                None if file_name.is_empty() => Upload::missing(),
                None => Upload::received(file_name, bytes),
            };
            fields.push_upload(name, upload);
            // the rest of the body is unreadable once a field stream fails
            if stream_broken {
                break;
            }
        }

        Ok(Self(fields))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            AppError::InvalidAction(message) | AppError::Validation(message) => (StatusCode::BAD_REQUEST, message),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Upload(_) => (StatusCode::BAD_REQUEST, "Upload failed. Please try again.".to_string()),
            AppError::Persistence(_) | AppError::Io(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong. Please try again.".to_string(),
            ),
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_location_keeps_only_non_empty_view_params() {
        let fields = FormFields::from_pairs([
            ("action", "toggle"),
            ("q", "oat milk"),
            ("page", "2"),
            ("per_page", ""),
        ]);
        assert_eq!(view_location(ActionScope::Tasks, &fields), "/?q=oat%20milk&page=2");
        assert_eq!(view_location(ActionScope::Categories, &fields), "/categories?q=oat%20milk");
        assert_eq!(view_location(ActionScope::Tasks, &FormFields::new()), "/");
    }

    #[test]
    fn disposition_carries_ascii_fallback_and_encoded_name() {
        assert_eq!(
            content_disposition("meeting notes.txt"),
            "attachment; filename=\"meeting notes.txt\"; filename*=UTF-8''meeting%20notes.txt"
        );
        assert_eq!(
            content_disposition("résumé \"v2\".pdf"),
            "attachment; filename=\"r_sum_ _v2_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9%20%22v2%22.pdf"
        );
    }

    #[test]
    fn failures_map_to_generic_messages() {
        let response = update_failed(ActionScope::Tasks, &AppError::Upload("bad type".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = update_failed(ActionScope::Categories, &AppError::Persistence("disk full".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(AppError::NotFound("File not found".to_string()).into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Forbidden("x".to_string()).into_response().status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Unauthorized("x".to_string()).into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
