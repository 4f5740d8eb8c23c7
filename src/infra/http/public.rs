use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{
        HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;

use crate::application::{
    error::{ErrorReport, HttpError},
    repos::CardsRepo,
    screenshot::ScreenshotService,
};

use super::middleware::{log_responses, set_request_context};

const PNG_CACHE_CONTROL: &str = "public, max-age=300";

#[derive(Clone)]
pub struct HttpState {
    pub screenshots: Arc<ScreenshotService>,
    pub cards: Arc<dyn CardsRepo>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/screenshots/{id_or_slug}", get(screenshot))
        .route("/_health", get(health))
        .route("/_health/db", get(cards_health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn screenshot(State(state): State<HttpState>, Path(id_or_slug): Path<String>) -> Response {
    const SOURCE: &str = "infra::http::public::screenshot";

    match state
        .screenshots
        .fetch_screenshot_by_id_or_slug(&id_or_slug)
        .await
    {
        Ok(Some(png)) => png_response(png),
        Ok(None) => HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Card not found",
            format!("no published card `{id_or_slug}`"),
        )
        .into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn cards_health(State(state): State<HttpState>) -> Response {
    match state.cards.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::public::cards_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

fn png_response(png: Bytes) -> Response {
    let length = png.len();
    let mut response = (StatusCode::OK, png).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(PNG_CACHE_CONTROL));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}
