//! Capabilities the orchestrator needs from a headless rendering engine.
//!
//! Any browser binding that can launch an isolated instance, navigate, run
//! script in the page, wait on a page condition, capture the viewport and shut
//! down can drive the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Output size of a capture in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// "Mostly idle" navigation criterion: at most `max_inflight` outstanding
/// requests for at least `quiet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkIdle {
    pub max_inflight: u32,
    pub quiet: Duration,
}

impl Default for NetworkIdle {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            quiet: Duration::from_millis(500),
        }
    }
}

/// A console call made by the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch rendering engine: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("page script failed: {0}")]
    Script(String),
    #[error("timed out after {waited:?} waiting for `{condition}`")]
    Timeout { condition: String, waited: Duration },
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("rendering engine transport error: {0}")]
    Transport(String),
    #[error("rendering engine session already closed")]
    Closed,
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Start an instance that shares no state with any other session.
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn RenderSession>, EngineError>;
}

#[async_trait]
pub trait RenderSession: Send {
    async fn navigate(&mut self, url: &Url, idle: NetworkIdle) -> Result<(), EngineError>;

    /// Run `script` as a function body; `args` are available as `arguments`.
    async fn evaluate(&mut self, script: &str, args: Vec<Value>) -> Result<Value, EngineError>;

    /// Block until the JavaScript expression `condition` is truthy or the
    /// engine's own step timeout elapses.
    async fn wait_for(&mut self, condition: &str) -> Result<(), EngineError>;

    /// PNG of the current viewport.
    async fn screenshot(&mut self) -> Result<Bytes, EngineError>;

    /// Console output collected since the previous call.
    async fn take_console(&mut self) -> Vec<ConsoleMessage>;

    /// Shut the instance down. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), EngineError>;
}
