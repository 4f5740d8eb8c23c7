use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::{repos::RepoError, screenshot::ScreenshotError},
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<ScreenshotError> for HttpError {
    fn from(error: ScreenshotError) -> Self {
        const SOURCE: &str = "application::error::screenshot_error_to_http";

        match error.root() {
            ScreenshotError::Render(_) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Card could not be rendered",
                &error,
            ),
            ScreenshotError::Store(_) | ScreenshotError::Repo(_) => HttpError::from_error(
                SOURCE,
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable",
                &error,
            ),
            ScreenshotError::Shared(_) => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &error,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Screenshot(#[from] ScreenshotError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::screenshot::{EngineError, RenderError, RenderStage, StoreError};
    use std::sync::Arc;

    #[test]
    fn render_failures_map_to_bad_gateway() {
        let err = ScreenshotError::Render(RenderError::InvalidCapture { bytes: 0 });
        assert_eq!(HttpError::from(err).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn shared_failures_map_like_their_root() {
        let inner = ScreenshotError::Render(RenderError::InvalidCapture { bytes: 0 });
        let err = ScreenshotError::Shared(Arc::new(inner));
        assert_eq!(HttpError::from(err).status(), StatusCode::BAD_GATEWAY);

        let inner = ScreenshotError::Store(StoreError::Missing {
            key: "k".to_string(),
        });
        let err = ScreenshotError::Shared(Arc::new(inner));
        assert_eq!(HttpError::from(err).status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn report_collects_the_source_chain() {
        let err = RenderError::Stage {
            stage: RenderStage::AwaitFonts,
            source: EngineError::Script("boom".to_string()),
        };
        let report = ErrorReport::from_error("test", StatusCode::BAD_GATEWAY, &err);
        assert_eq!(report.messages.len(), 2);
        assert_eq!(report.messages[1], "page script failed: boom");
    }
}
