#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cardshot::{
    application::screenshot::{
        CachePolicy, CaptureSettings, ConsoleMessage, DeployTag, EngineError, FingerprintBuilder,
        NetworkIdle, RenderEngine, RenderHost, RenderOrchestrator, RenderSession,
        ScreenshotService, SnapshotStore, StoreError, Viewport,
    },
    domain::cards::Card,
    infra::fixtures::FixtureCards,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use url::Url;

pub const WIDTH: u32 = 1330;
pub const HEIGHT: u32 = 768;

/// Smallest byte string `imagesize` accepts as a PNG of the given size.
pub fn png(width: u32, height: u32) -> Bytes {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    Bytes::from(bytes)
}

pub fn published(id: &str) -> Card {
    let mut card = Card::new(id);
    card.published = true;
    card
}

/// Engine double that counts sessions and can hold captures behind a gate.
#[derive(Default)]
pub struct FakeEngine {
    launches: AtomicUsize,
    closes: Arc<AtomicUsize>,
    captures: Mutex<Vec<Bytes>>,
    gate: Option<Arc<Semaphore>>,
    fail_capture: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures block until the semaphore hands out a permit.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Every capture handed out so far, in order.
    pub fn captures(&self) -> Vec<Bytes> {
        self.captures.lock().expect("captures").clone()
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    async fn launch(&self, viewport: Viewport) -> Result<Box<dyn RenderSession>, EngineError> {
        let serial = self.launches.fetch_add(1, Ordering::SeqCst) as u32;
        // Each session paints a distinct PNG so tests can tell renders apart.
        let capture = png(viewport.width, viewport.height + serial);
        self.captures.lock().expect("captures").push(capture.clone());
        Ok(Box::new(FakeSession {
            closes: Arc::clone(&self.closes),
            capture,
            gate: self.gate.clone(),
            fail_capture: self.fail_capture,
        }))
    }
}

struct FakeSession {
    closes: Arc<AtomicUsize>,
    capture: Bytes,
    gate: Option<Arc<Semaphore>>,
    fail_capture: bool,
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn navigate(&mut self, _url: &Url, _idle: NetworkIdle) -> Result<(), EngineError> {
        Ok(())
    }

    async fn evaluate(&mut self, _script: &str, _args: Vec<Value>) -> Result<Value, EngineError> {
        Ok(Value::Null)
    }

    async fn wait_for(&mut self, _condition: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Bytes, EngineError> {
        if let Some(gate) = self.gate.as_ref() {
            let permit = gate
                .acquire()
                .await
                .map_err(|err| EngineError::Capture(err.to_string()))?;
            permit.forget();
        }
        if self.fail_capture {
            return Err(EngineError::Capture("renderer crashed".to_string()));
        }
        Ok(self.capture.clone())
    }

    async fn take_console(&mut self) -> Vec<ConsoleMessage> {
        Vec::new()
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory store that records how it was used.
#[derive(Default)]
pub struct RecordingStore {
    entries: Mutex<HashMap<String, Bytes>>,
    exists_calls: AtomicUsize,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl RecordingStore {
    pub fn seed(&self, key: &str, bytes: Bytes) {
        self.entries
            .lock()
            .expect("entries")
            .insert(key.to_string(), bytes);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().expect("entries").get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().expect("entries").keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn calls(&self) -> (usize, usize, usize) {
        (
            self.exists_calls.load(Ordering::SeqCst),
            self.read_calls.load(Ordering::SeqCst),
            self.write_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl SnapshotStore for RecordingStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().expect("entries").contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Bytes, StoreError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.get(key).ok_or_else(|| StoreError::Missing {
            key: key.to_string(),
        })
    }

    async fn write(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.seed(key, bytes);
        Ok(())
    }
}

pub fn orchestrator(engine: Arc<FakeEngine>) -> RenderOrchestrator {
    RenderOrchestrator::new(
        engine,
        RenderHost {
            base_url: Url::parse("http://render.test/").expect("url"),
            card_path: "basic-card".to_string(),
            inject_hook: "injectFetchedCard".to_string(),
            rendered_flag: "cardRendered".to_string(),
        },
        CaptureSettings {
            viewport: Viewport {
                width: WIDTH,
                height: HEIGHT,
            },
            network_idle: NetworkIdle::default(),
            settle: Duration::ZERO,
        },
    )
}

pub fn service_with(
    cards: FixtureCards,
    store: Arc<dyn SnapshotStore>,
    engine: Arc<FakeEngine>,
    deploy_tag: &str,
    policy: CachePolicy,
) -> ScreenshotService {
    ScreenshotService::new(
        Arc::new(cards),
        store,
        Arc::new(orchestrator(engine)),
        FingerprintBuilder::new(7, DeployTag::parse(deploy_tag).expect("deploy tag")),
        policy,
    )
}

pub fn service(
    cards: FixtureCards,
    store: Arc<RecordingStore>,
    engine: Arc<FakeEngine>,
    policy: CachePolicy,
) -> ScreenshotService {
    service_with(cards, store, engine, "deploy-2024-01-01-00-00", policy)
}
