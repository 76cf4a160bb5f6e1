use axum::{
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes from the OCI distribution spec, plus the 429 code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    Denied,
    Unsupported,
    NameInvalid,
    NameUnknown,
    BlobUnknown,
    BlobUploadUnknown,
    BlobUploadInvalid,
    DigestInvalid,
    SizeInvalid,
    ManifestUnknown,
    ManifestInvalid,
    ManifestBlobUnknown,
    TooManyRequests,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Denied => "DENIED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::NameInvalid => "NAME_INVALID",
            ErrorCode::NameUnknown => "NAME_UNKNOWN",
            ErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            ErrorCode::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            ErrorCode::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            ErrorCode::DigestInvalid => "DIGEST_INVALID",
            ErrorCode::SizeInvalid => "SIZE_INVALID",
            ErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            ErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            ErrorCode::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn default_status(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Denied => StatusCode::FORBIDDEN,
            ErrorCode::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::NameInvalid => StatusCode::BAD_REQUEST,
            ErrorCode::NameUnknown => StatusCode::NOT_FOUND,
            ErrorCode::BlobUnknown => StatusCode::NOT_FOUND,
            ErrorCode::BlobUploadUnknown => StatusCode::NOT_FOUND,
            ErrorCode::BlobUploadInvalid => StatusCode::BAD_REQUEST,
            ErrorCode::DigestInvalid => StatusCode::BAD_REQUEST,
            ErrorCode::SizeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorCode::ManifestUnknown => StatusCode::NOT_FOUND,
            ErrorCode::ManifestInvalid => StatusCode::BAD_REQUEST,
            ErrorCode::ManifestBlobUnknown => StatusCode::NOT_FOUND,
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "authentication required",
            ErrorCode::Denied => "requested access to the resource is denied",
            ErrorCode::Unsupported => "the operation is unsupported",
            ErrorCode::NameInvalid => "invalid repository name",
            ErrorCode::NameUnknown => "repository name not known to registry",
            ErrorCode::BlobUnknown => "blob unknown to registry",
            ErrorCode::BlobUploadUnknown => "blob upload unknown to registry",
            ErrorCode::BlobUploadInvalid => "blob upload invalid",
            ErrorCode::DigestInvalid => "provided digest did not match uploaded content",
            ErrorCode::SizeInvalid => "provided length did not match content length",
            ErrorCode::ManifestUnknown => "manifest unknown",
            ErrorCode::ManifestInvalid => "manifest invalid",
            ErrorCode::ManifestBlobUnknown => "blob unknown to repository",
            ErrorCode::TooManyRequests => "too many requests",
            ErrorCode::Unknown => "unknown error",
        }
    }
}

/// An error that renders as a Registry v2 JSON error body.
#[derive(Debug)]
pub struct RegistryError {
    pub code: ErrorCode,
    pub status: StatusCode,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl RegistryError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            status: code.default_status(),
            message: code.default_message().to_string(),
            detail: None,
            headers: Vec::new(),
        }
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::Unauthorized).with_message(message)
    }

    pub fn denied<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::Denied).with_message(message)
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::Unsupported).with_message(message)
    }

    pub fn digest_invalid<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::DigestInvalid).with_message(message)
    }

    pub fn size_invalid<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::SizeInvalid).with_message(message)
    }

    pub fn manifest_invalid<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCode::ManifestInvalid).with_message(message)
    }

    /// 429 with the `Retry-After` hint used by the replication paths.
    pub fn too_many_requests(retry_after_secs: u32) -> Self {
        Self::new(ErrorCode::TooManyRequests).with_header(
            HeaderName::from_static("retry-after"),
            HeaderValue::from_str(&retry_after_secs.to_string())
                .unwrap_or(HeaderValue::from_static("10")),
        )
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let body = json!({
            "errors": [{
                "code": self.code.as_str(),
                "message": self.message,
                "detail": self.detail,
            }]
        });
        let mut response = (self.status, Json(body)).into_response();
        for (name, value) in self.headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("{0}")]
    Registry(RegistryError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Registry(e) => e.into_response(),
            other => {
                tracing::error!(error = %other, "request failed with internal error");
                RegistryError::new(ErrorCode::Unknown).into_response()
            }
        }
    }
}
