use axum::extract::rejection::{FormRejection, JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts};
use axum::http::header::{HeaderName, HeaderValue, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

#[derive(Debug, Clone)]
pub(crate) struct ErrorMeta {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub hint: String,
    pub trace_id: String,
    pub timestamp: f64,
}

impl ErrorMeta {
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "status": self.status,
            "hint": self.hint,
            "trace_id": self.trace_id,
            "timestamp": self.timestamp,
        })
    }
}

pub(crate) fn build_error_meta(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
    hint: Option<&str>,
) -> ErrorMeta {
    let message = message.into();
    let code = code
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_error_code(status))
        .to_string();
    let hint = hint
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_hint(status))
        .to_string();
    ErrorMeta {
        code,
        message,
        status: status.as_u16(),
        hint,
        trace_id: format!("err_{}", Uuid::new_v4().simple()),
        timestamp: now_unix_seconds(),
    }
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    error_response_with_detail(status, None, message, None, None)
}

pub fn error_response_with_detail(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
    hint: Option<&str>,
    detail: Option<Value>,
) -> Response {
    let meta = build_error_meta(status, code, message, hint);
    let detail = build_detail_payload(&meta.message, detail);
    let payload = json!({
        "ok": false,
        "error": meta.to_value(),
        "detail": detail,
    });

    let mut response = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&meta.trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    response
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    error_response(StatusCode::UNAUTHORIZED, message)
}

pub fn not_found(what: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("{what} not found"))
}

pub fn unprocessable(message: impl Into<String>) -> Response {
    error_response(StatusCode::UNPROCESSABLE_ENTITY, message)
}

/// Logs the underlying failure and answers with an opaque 500.
pub fn internal_error(context: &str, err: impl Display) -> Response {
    error!("{context}: {err}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Extractor rejection rendered with the unified error body.
pub struct ApiRejection(Response);

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response {
        self.0
    }
}

impl From<JsonRejection> for ApiRejection {
    fn from(rejection: JsonRejection) -> Self {
        Self(error_response(rejection.status(), rejection.body_text()))
    }
}

impl From<FormRejection> for ApiRejection {
    fn from(rejection: FormRejection) -> Self {
        Self(error_response(rejection.status(), rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiRejection {
    fn from(rejection: QueryRejection) -> Self {
        Self(unprocessable(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiRejection {
    fn from(rejection: PathRejection) -> Self {
        Self(unprocessable(rejection.body_text()))
    }
}

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiRejection))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequest)]
#[from_request(via(axum::Form), rejection(ApiRejection))]
pub struct ApiForm<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiRejection))]
pub struct ApiQuery<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiRejection))]
pub struct ApiPath<T>(pub T);

fn build_detail_payload(message: &str, detail: Option<Value>) -> Value {
    match detail {
        Some(Value::Object(mut map)) => {
            map.entry("message".to_string())
                .or_insert_with(|| Value::String(message.to_string()));
            Value::Object(map)
        }
        Some(value) => json!({
            "message": message,
            "detail": value,
        }),
        None => json!({
            "message": message,
        }),
    }
}

fn default_error_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "BAD_REQUEST",
        StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
        StatusCode::PAYMENT_REQUIRED => "QUOTA_EXCEEDED",
        StatusCode::FORBIDDEN => "FORBIDDEN",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::CONFLICT => "CONFLICT",
        StatusCode::PAYLOAD_TOO_LARGE => "PAYLOAD_TOO_LARGE",
        StatusCode::UNSUPPORTED_MEDIA_TYPE => "CONTENT_TYPE_NOT_SUPPORTED",
        StatusCode::UNPROCESSABLE_ENTITY => "VALIDATION_ERROR",
        StatusCode::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
        _ if status.is_server_error() => "INTERNAL_ERROR",
        _ => "REQUEST_ERROR",
    }
}

fn default_hint(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Verify request parameters and payload format.",
        StatusCode::UNAUTHORIZED => "Log in again or refresh the access token.",
        StatusCode::FORBIDDEN => "Check authentication credentials and permission scope.",
        StatusCode::PAYMENT_REQUIRED => "Upgrade the subscription plan or wait for next month.",
        StatusCode::NOT_FOUND => "Verify requested resource path or identifier.",
        StatusCode::UNPROCESSABLE_ENTITY => "Check required fields and value ranges.",
        StatusCode::SERVICE_UNAVAILABLE => "The task queue is busy. Retry later.",
        _ if status.is_server_error() => "Retry later or contact support with trace_id.",
        _ => "Inspect request and try again.",
    }
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn default_error_response_contains_unified_fields() {
        let response = error_response(StatusCode::BAD_REQUEST, "invalid payload");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let trace_id = response
            .headers()
            .get(TRACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(trace_id.starts_with("err_"));

        let error_code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert_eq!(error_code, "BAD_REQUEST");
        assert!(response.headers().get(WWW_AUTHENTICATE).is_none());

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let payload: Value = serde_json::from_slice(&body).expect("parse response json");

        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("BAD_REQUEST"));
        assert_eq!(payload["error"]["message"], json!("invalid payload"));
        assert_eq!(payload["error"]["status"], json!(400));
        assert_eq!(payload["error"]["trace_id"], json!(trace_id));
        assert!(payload["error"]["timestamp"].as_f64().unwrap_or_default() > 0.0);
        assert_eq!(payload["detail"]["message"], json!("invalid payload"));
    }

    #[tokio::test]
    async fn unauthorized_carries_bearer_challenge() {
        let response = unauthorized("Could not validate credentials");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            &HeaderValue::from_static("Bearer")
        );
    }

    #[tokio::test]
    async fn custom_error_code_and_detail_are_preserved() {
        let response = error_response_with_detail(
            StatusCode::PAYMENT_REQUIRED,
            Some("MONTHLY_LIMIT"),
            "Monthly task limit exceeded",
            None,
            Some(json!({ "limit": 10 })),
        );
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let payload: Value = serde_json::from_slice(&body).expect("parse response json");

        assert_eq!(payload["error"]["code"], json!("MONTHLY_LIMIT"));
        assert_eq!(
            payload["error"]["hint"],
            json!("Upgrade the subscription plan or wait for next month.")
        );
        assert_eq!(payload["detail"]["limit"], json!(10));
        assert_eq!(payload["detail"]["message"], json!("Monthly task limit exceeded"));
    }
}
