//! Card snapshot pipeline.
//!
//! A request computes the card's fingerprint, serves the stored snapshot at
//! that address when present, and otherwise renders the card in a headless
//! engine and stores the result. Stored snapshots are immutable: a changed
//! card, pipeline version or render-affecting deploy yields a new address and
//! superseded entries are left in place.

mod engine;
mod fingerprint;
mod inflight;
mod orchestrator;
mod service;
mod store;

pub use engine::{ConsoleMessage, EngineError, NetworkIdle, RenderEngine, RenderSession, Viewport};
pub use fingerprint::{
    DeployTag, DeployTagError, Fingerprint, FingerprintBuilder, PIPELINE_VERSION, content_digest,
};
pub use inflight::InFlightRenders;
pub use orchestrator::{CaptureSettings, RenderError, RenderHost, RenderOrchestrator, RenderStage};
pub use service::{CachePolicy, ScreenshotError, ScreenshotService};
pub use store::{SnapshotStore, StoreError};
