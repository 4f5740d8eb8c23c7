use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::cards::{Card, RelatedCards};

use super::engine::{EngineError, NetworkIdle, RenderEngine, RenderSession, Viewport};

const SOURCE: &str = "application::screenshot::orchestrator";
const CONSOLE_TARGET: &str = "cardshot::page_console";

const FONTS_LOADED: &str = "document.fonts.status === 'loaded'";
const INJECT_SCRIPT: &str = "window[arguments[0]](arguments[1], arguments[2]);";

/// Steps of a render, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Launch,
    Navigate,
    AwaitInjectionHook,
    InjectData,
    AwaitFonts,
    AwaitRenderComplete,
    Settle,
    Capture,
}

impl RenderStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStage::Launch => "launch",
            RenderStage::Navigate => "navigate",
            RenderStage::AwaitInjectionHook => "await_injection_hook",
            RenderStage::InjectData => "inject_data",
            RenderStage::AwaitFonts => "await_fonts",
            RenderStage::AwaitRenderComplete => "await_render_complete",
            RenderStage::Settle => "settle",
            RenderStage::Capture => "capture",
        }
    }
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render failed during {stage}: {source}")]
    Stage {
        stage: RenderStage,
        #[source]
        source: EngineError,
    },
    #[error("invalid rendering host url: {0}")]
    HostUrl(#[from] url::ParseError),
    #[error("failed to encode card for injection: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("captured image is not a PNG ({bytes} bytes)")]
    InvalidCapture { bytes: usize },
}

impl RenderError {
    fn at(stage: RenderStage) -> impl FnOnce(EngineError) -> RenderError {
        move |source| RenderError::Stage { stage, source }
    }

    pub fn stage(&self) -> Option<RenderStage> {
        match self {
            RenderError::Stage { stage, .. } => Some(*stage),
            RenderError::InvalidCapture { .. } => Some(RenderStage::Capture),
            RenderError::HostUrl(_) | RenderError::Encode(_) => None,
        }
    }
}

/// The page that knows how to draw a single card once data is pushed into it.
#[derive(Debug, Clone)]
pub struct RenderHost {
    pub base_url: Url,
    pub card_path: String,
    /// Global function accepting `(card, relatedCards)`.
    pub inject_hook: String,
    /// Global flag set once the card has been laid out and painted.
    pub rendered_flag: String,
}

impl RenderHost {
    pub fn card_url(&self, card_id: &str) -> Result<Url, url::ParseError> {
        let mut url = self.base_url.join(&self.card_path)?;
        url.query_pairs_mut().append_pair("id", card_id);
        Ok(url)
    }

    fn hook_ready_condition(&self) -> String {
        format!(
            "window[{}] !== undefined",
            Value::String(self.inject_hook.clone())
        )
    }

    fn rendered_condition(&self) -> String {
        format!("Boolean(window[{}])", Value::String(self.rendered_flag.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub viewport: Viewport,
    pub network_idle: NetworkIdle,
    /// Blind wait after the render-complete flag, covering the host's fade-in.
    pub settle: Duration,
}

/// Drives one isolated engine session per render through the readiness gates
/// and returns the captured PNG.
pub struct RenderOrchestrator {
    engine: Arc<dyn RenderEngine>,
    host: RenderHost,
    capture: CaptureSettings,
}

impl RenderOrchestrator {
    pub fn new(engine: Arc<dyn RenderEngine>, host: RenderHost, capture: CaptureSettings) -> Self {
        Self {
            engine,
            host,
            capture,
        }
    }

    pub async fn render(&self, card: &Card, related: &RelatedCards) -> Result<Bytes, RenderError> {
        let started_at = Instant::now();
        let url = self.host.card_url(&card.id)?;
        let card_value = serde_json::to_value(card)?;
        let related_value = serde_json::to_value(related)?;

        debug!(
            target = SOURCE,
            op = "render",
            stage = RenderStage::Launch.as_str(),
            card_id = %card.id,
            width = self.capture.viewport.width,
            height = self.capture.viewport.height,
            "Launching rendering engine"
        );
        let session = self
            .engine
            .launch(self.capture.viewport)
            .await
            .map_err(RenderError::at(RenderStage::Launch))?;

        let mut guard = SessionGuard::new(session, card.id.clone());
        let result = match guard.session.as_mut() {
            Some(session) => {
                let outcome = self
                    .drive(session.as_mut(), &url, &card.id, card_value, related_value)
                    .await;
                forward_console(session.as_mut(), &card.id).await;
                outcome
            }
            None => Err(RenderError::at(RenderStage::Launch)(EngineError::Closed)),
        };
        guard.close().await;

        match &result {
            Ok(png) => info!(
                target = SOURCE,
                op = "render",
                result = "ok",
                card_id = %card.id,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                png_bytes = png.len(),
                "Card rendered"
            ),
            Err(err) => warn!(
                target = SOURCE,
                op = "render",
                result = "error",
                card_id = %card.id,
                stage = err.stage().map(|stage| stage.as_str()).unwrap_or("prepare"),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "Card render failed"
            ),
        }

        result
    }

    async fn drive(
        &self,
        session: &mut dyn RenderSession,
        url: &Url,
        card_id: &str,
        card: Value,
        related: Value,
    ) -> Result<Bytes, RenderError> {
        // The host has no card data yet, so full network idle would only add latency.
        log_stage(RenderStage::Navigate, card_id);
        session
            .navigate(url, self.capture.network_idle)
            .await
            .map_err(RenderError::at(RenderStage::Navigate))?;
        forward_console(session, card_id).await;

        log_stage(RenderStage::AwaitInjectionHook, card_id);
        session
            .wait_for(&self.host.hook_ready_condition())
            .await
            .map_err(RenderError::at(RenderStage::AwaitInjectionHook))?;

        log_stage(RenderStage::InjectData, card_id);
        session
            .evaluate(
                INJECT_SCRIPT,
                vec![Value::String(self.host.inject_hook.clone()), card, related],
            )
            .await
            .map_err(RenderError::at(RenderStage::InjectData))?;
        forward_console(session, card_id).await;

        log_stage(RenderStage::AwaitFonts, card_id);
        session
            .wait_for(FONTS_LOADED)
            .await
            .map_err(RenderError::at(RenderStage::AwaitFonts))?;

        log_stage(RenderStage::AwaitRenderComplete, card_id);
        session
            .wait_for(&self.host.rendered_condition())
            .await
            .map_err(RenderError::at(RenderStage::AwaitRenderComplete))?;
        forward_console(session, card_id).await;

        log_stage(RenderStage::Settle, card_id);
        tokio::time::sleep(self.capture.settle).await;

        log_stage(RenderStage::Capture, card_id);
        let png = session
            .screenshot()
            .await
            .map_err(RenderError::at(RenderStage::Capture))?;
        self.check_capture(&png, card_id)?;
        Ok(png)
    }

    fn check_capture(&self, png: &[u8], card_id: &str) -> Result<(), RenderError> {
        if !matches!(imagesize::image_type(png), Ok(imagesize::ImageType::Png)) {
            return Err(RenderError::InvalidCapture { bytes: png.len() });
        }

        let viewport = self.capture.viewport;
        if let Ok(size) = imagesize::blob_size(png)
            && (size.width != viewport.width as usize || size.height != viewport.height as usize)
        {
            warn!(
                target = SOURCE,
                op = "render",
                card_id = %card_id,
                expected_width = viewport.width,
                expected_height = viewport.height,
                width = size.width as u64,
                height = size.height as u64,
                "Captured image does not match the configured viewport"
            );
        }
        Ok(())
    }
}

fn log_stage(stage: RenderStage, card_id: &str) {
    debug!(
        target = SOURCE,
        op = "render",
        stage = stage.as_str(),
        card_id = %card_id,
        "Entering render stage"
    );
}

async fn forward_console(session: &mut dyn RenderSession, card_id: &str) {
    for message in session.take_console().await {
        info!(
            target = CONSOLE_TARGET,
            card_id = %card_id,
            level = %message.level,
            "Page logged via console: {}",
            message.text
        );
    }
}

/// Owns the engine session for the duration of a render.
///
/// If the render future is dropped before [`SessionGuard::close`] completes,
/// the session is closed on the runtime in the background. A render dropped
/// while `launch` is still pending has no session yet and is not covered.
struct SessionGuard {
    session: Option<Box<dyn RenderSession>>,
    card_id: String,
}

impl SessionGuard {
    fn new(session: Box<dyn RenderSession>, card_id: String) -> Self {
        Self {
            session: Some(session),
            card_id,
        }
    }

    /// The session is released only once `close` has resolved, so a teardown
    /// cancelled halfway is retried from `Drop`.
    async fn close(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let outcome = session.close().await;
        self.session = None;
        if let Err(err) = outcome {
            warn!(
                target = SOURCE,
                op = "render::teardown",
                card_id = %self.card_id,
                error = %err,
                "Failed to close rendering engine"
            );
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let card_id = std::mem::take(&mut self.card_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = session.close().await {
                        warn!(
                            target = SOURCE,
                            op = "render::teardown",
                            card_id = %card_id,
                            error = %err,
                            "Failed to close rendering engine after cancellation"
                        );
                    }
                });
            }
            Err(_) => warn!(
                target = SOURCE,
                op = "render::teardown",
                card_id = %card_id,
                "No runtime available to close rendering engine after cancellation"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::application::screenshot::engine::ConsoleMessage;
    use crate::domain::cards::RelatedCard;

    fn png(width: u32, height: u32) -> Bytes {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        Bytes::from(bytes)
    }

    #[derive(Default)]
    struct Journal {
        calls: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, call: impl Into<String>) {
            self.calls.lock().expect("journal").push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("journal").clone()
        }
    }

    struct FakeEngine {
        journal: Arc<Journal>,
        fail_on: Option<&'static str>,
        capture: Bytes,
    }

    struct FakeSession {
        journal: Arc<Journal>,
        fail_on: Option<&'static str>,
        capture: Bytes,
        console: Vec<ConsoleMessage>,
        close_stalls: bool,
    }

    impl FakeSession {
        fn step(&self, name: &str) -> Result<(), EngineError> {
            self.journal.push(name);
            match self.fail_on {
                Some(fail) if name.starts_with(fail) => Err(EngineError::Timeout {
                    condition: name.to_string(),
                    waited: Duration::from_secs(30),
                }),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RenderEngine for FakeEngine {
        async fn launch(&self, viewport: Viewport) -> Result<Box<dyn RenderSession>, EngineError> {
            self.journal
                .push(format!("launch {}x{}", viewport.width, viewport.height));
            Ok(Box::new(FakeSession {
                journal: Arc::clone(&self.journal),
                fail_on: self.fail_on,
                capture: self.capture.clone(),
                console: vec![ConsoleMessage {
                    level: "log".to_string(),
                    text: "booted".to_string(),
                }],
                close_stalls: false,
            }))
        }
    }

    #[async_trait]
    impl RenderSession for FakeSession {
        async fn navigate(&mut self, url: &Url, idle: NetworkIdle) -> Result<(), EngineError> {
            self.step(&format!("navigate {url} idle<={}", idle.max_inflight))
        }

        async fn evaluate(&mut self, script: &str, args: Vec<Value>) -> Result<Value, EngineError> {
            self.step(&format!("evaluate {script} args={}", args.len()))?;
            Ok(Value::Null)
        }

        async fn wait_for(&mut self, condition: &str) -> Result<(), EngineError> {
            self.step(&format!("wait {condition}"))
        }

        async fn screenshot(&mut self) -> Result<Bytes, EngineError> {
            self.step("screenshot")?;
            Ok(self.capture.clone())
        }

        async fn take_console(&mut self) -> Vec<ConsoleMessage> {
            std::mem::take(&mut self.console)
        }

        async fn close(&mut self) -> Result<(), EngineError> {
            self.journal.push("close");
            if std::mem::take(&mut self.close_stalls) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn orchestrator(journal: &Arc<Journal>, fail_on: Option<&'static str>, capture: Bytes) -> RenderOrchestrator {
        RenderOrchestrator::new(
            Arc::new(FakeEngine {
                journal: Arc::clone(journal),
                fail_on,
                capture,
            }),
            RenderHost {
                base_url: Url::parse("http://render.test/app/").expect("url"),
                card_path: "basic-card".to_string(),
                inject_hook: "injectFetchedCard".to_string(),
                rendered_flag: "cardRendered".to_string(),
            },
            CaptureSettings {
                viewport: Viewport {
                    width: 1330,
                    height: 768,
                },
                network_idle: NetworkIdle::default(),
                settle: Duration::ZERO,
            },
        )
    }

    fn card() -> (Card, RelatedCards) {
        let mut card = Card::new("c 1");
        card.published = true;
        let mut related = RelatedCards::new();
        related.insert("c2".to_string(), RelatedCard::published());
        (card, related)
    }

    #[tokio::test]
    async fn runs_every_gate_in_order_then_closes() {
        let journal = Arc::new(Journal::default());
        let (card, related) = card();

        let bytes = orchestrator(&journal, None, png(1330, 768))
            .render(&card, &related)
            .await
            .expect("render");

        assert_eq!(bytes, png(1330, 768));
        assert_eq!(
            journal.calls(),
            vec![
                "launch 1330x768".to_string(),
                "navigate http://render.test/app/basic-card?id=c+1 idle<=2".to_string(),
                "wait window[\"injectFetchedCard\"] !== undefined".to_string(),
                format!("evaluate {INJECT_SCRIPT} args=3"),
                format!("wait {FONTS_LOADED}"),
                "wait Boolean(window[\"cardRendered\"])".to_string(),
                "screenshot".to_string(),
                "close".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failing_gate_still_tears_down() {
        let journal = Arc::new(Journal::default());
        let (card, related) = card();

        let err = orchestrator(&journal, Some("wait document.fonts"), png(1330, 768))
            .render(&card, &related)
            .await
            .expect_err("fonts never load");

        assert_eq!(err.stage(), Some(RenderStage::AwaitFonts));
        let calls = journal.calls();
        assert_eq!(calls.last().map(String::as_str), Some("close"));
        assert!(!calls.iter().any(|call| call == "screenshot"));
    }

    #[tokio::test]
    async fn navigation_failure_is_reported_against_navigate() {
        let journal = Arc::new(Journal::default());
        let (card, related) = card();

        let err = orchestrator(&journal, Some("navigate"), png(1330, 768))
            .render(&card, &related)
            .await
            .expect_err("navigation fails");

        assert_eq!(err.stage(), Some(RenderStage::Navigate));
        assert_eq!(journal.calls().len(), 3);
    }

    #[tokio::test]
    async fn non_png_capture_is_rejected() {
        let journal = Arc::new(Journal::default());
        let (card, related) = card();

        let err = orchestrator(&journal, None, Bytes::from_static(b"<html>"))
            .render(&card, &related)
            .await
            .expect_err("not a png");

        assert!(matches!(err, RenderError::InvalidCapture { bytes: 6 }));
        assert_eq!(journal.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_elapses_before_capture() {
        let journal = Arc::new(Journal::default());
        let (card, related) = card();
        let mut orchestrator = orchestrator(&journal, None, png(1330, 768));
        orchestrator.capture.settle = Duration::from_millis(1000);

        let started = tokio::time::Instant::now();
        orchestrator.render(&card, &related).await.expect("render");
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn dropped_render_closes_session_in_background() {
        let journal = Arc::new(Journal::default());
        let session = FakeSession {
            journal: Arc::clone(&journal),
            fail_on: None,
            capture: png(1, 1),
            console: Vec::new(),
            close_stalls: false,
        };

        drop(SessionGuard::new(Box::new(session), "c1".to_string()));
        tokio::task::yield_now().await;

        assert_eq!(journal.calls(), vec!["close".to_string()]);
    }

    #[tokio::test]
    async fn interrupted_teardown_is_retried_in_background() {
        let journal = Arc::new(Journal::default());
        let session = FakeSession {
            journal: Arc::clone(&journal),
            fail_on: None,
            capture: png(1, 1),
            console: Vec::new(),
            close_stalls: true,
        };

        let mut guard = SessionGuard::new(Box::new(session), "c1".to_string());
        let interrupted = tokio::time::timeout(Duration::from_millis(10), guard.close()).await;
        assert!(interrupted.is_err());
        assert!(guard.session.is_some(), "session is kept until close resolves");

        drop(guard);
        tokio::task::yield_now().await;

        assert_eq!(journal.calls(), vec!["close".to_string(), "close".to_string()]);
    }
}
