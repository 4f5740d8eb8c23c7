use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    application::repos::{CardsRepo, RepoError},
    domain::cards::{Card, RelatedCards},
};

use super::{
    fingerprint::{Fingerprint, FingerprintBuilder},
    inflight::InFlightRenders,
    orchestrator::{RenderError, RenderOrchestrator},
    store::{SnapshotStore, StoreError},
};

const SOURCE: &str = "application::screenshot::service";

#[derive(Debug, Error)]
pub enum ScreenshotError {
    #[error("failed to load card data: {0}")]
    Repo(#[from] RepoError),
    #[error("snapshot store failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Render(#[from] RenderError),
    /// A failure produced by a render this request joined rather than ran.
    #[error(transparent)]
    Shared(Arc<ScreenshotError>),
}

impl ScreenshotError {
    /// The underlying error, looking through [`ScreenshotError::Shared`].
    pub fn root(&self) -> &ScreenshotError {
        match self {
            ScreenshotError::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

/// How the coordinator uses the snapshot store.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Treat every lookup as a miss but still write fresh renders back.
    pub bypass_reads: bool,
    /// Let concurrent misses on one key share a single render.
    pub single_flight: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            bypass_reads: false,
            single_flight: true,
        }
    }
}

/// Serves card snapshots from the store, rendering and storing them on a miss.
pub struct ScreenshotService {
    cards: Arc<dyn CardsRepo>,
    store: Arc<dyn SnapshotStore>,
    orchestrator: Arc<RenderOrchestrator>,
    fingerprints: FingerprintBuilder,
    policy: CachePolicy,
    inflight: InFlightRenders,
}

impl ScreenshotService {
    pub fn new(
        cards: Arc<dyn CardsRepo>,
        store: Arc<dyn SnapshotStore>,
        orchestrator: Arc<RenderOrchestrator>,
        fingerprints: FingerprintBuilder,
        policy: CachePolicy,
    ) -> Self {
        Self {
            cards,
            store,
            orchestrator,
            fingerprints,
            policy,
            inflight: InFlightRenders::new(),
        }
    }

    pub fn fingerprint(&self, card: &Card, related: &RelatedCards) -> Fingerprint {
        self.fingerprints.compute(card, related)
    }

    /// Resolve a card by id or slug and serve its snapshot.
    ///
    /// Unknown and unpublished cards yield `Ok(None)`.
    pub async fn fetch_screenshot_by_id_or_slug(
        &self,
        id_or_slug: &str,
    ) -> Result<Option<Bytes>, ScreenshotError> {
        let card = self.cards.find_card_by_id_or_slug(id_or_slug).await?;
        if card.is_none() {
            counter!("cardshot_screenshot_skipped_total", "reason" => "not_found").increment(1);
            warn!(
                target = SOURCE,
                op = "fetch_screenshot_by_id_or_slug",
                result = "skipped",
                id_or_slug = %id_or_slug,
                "No such card"
            );
            return Ok(None);
        }
        self.fetch_screenshot_for_card(card.as_ref()).await
    }

    /// Serve the snapshot of `card`, loading its related cards from the data layer.
    pub async fn fetch_screenshot_for_card(
        &self,
        card: Option<&Card>,
    ) -> Result<Option<Bytes>, ScreenshotError> {
        let Some(card) = publishable(card) else {
            return Ok(None);
        };
        let related = self.cards.related_cards_for(card).await?;
        self.fetch_published(card, &related).await.map(Some)
    }

    /// Serve the snapshot of `card` as it would render alongside `related`.
    ///
    /// A missing or unpublished card yields `Ok(None)` without touching the
    /// store or the renderer.
    pub async fn fetch_screenshot(
        &self,
        card: Option<&Card>,
        related: &RelatedCards,
    ) -> Result<Option<Bytes>, ScreenshotError> {
        let Some(card) = publishable(card) else {
            return Ok(None);
        };
        self.fetch_published(card, related).await.map(Some)
    }

    async fn fetch_published(
        &self,
        card: &Card,
        related: &RelatedCards,
    ) -> Result<Bytes, ScreenshotError> {
        let started_at = Instant::now();
        let fingerprint = self.fingerprints.compute(card, related);
        let key = fingerprint.path();

        if self.store.exists(&key).await? {
            if self.policy.bypass_reads {
                info!(
                    target = SOURCE,
                    op = "fetch_screenshot",
                    card_id = %card.id,
                    key = %key,
                    "Screenshot exists in cache, but cache reads are bypassed"
                );
            } else {
                let bytes = self.store.read(&key).await?;
                counter!("cardshot_screenshot_cache_hit_total").increment(1);
                info!(
                    target = SOURCE,
                    op = "fetch_screenshot",
                    result = "cache_hit",
                    card_id = %card.id,
                    key = %key,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    png_bytes = bytes.len(),
                    "Screenshot served from cache"
                );
                return Ok(bytes);
            }
        }

        counter!("cardshot_screenshot_cache_miss_total").increment(1);
        info!(
            target = SOURCE,
            op = "fetch_screenshot",
            result = "cache_miss",
            card_id = %card.id,
            key = %key,
            "Screenshot not in storage, rendering"
        );

        let render = render_and_store(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.store),
            key.clone(),
            card.clone(),
            related.clone(),
        );
        let result = if self.policy.single_flight {
            self.inflight.run(key.clone(), render).await
        } else {
            render.await
        };

        match &result {
            Ok(bytes) => info!(
                target = SOURCE,
                op = "fetch_screenshot",
                result = "rendered",
                card_id = %card.id,
                key = %key,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                png_bytes = bytes.len(),
                "Screenshot rendered and stored"
            ),
            Err(err) => {
                counter!("cardshot_screenshot_render_failed_total").increment(1);
                warn!(
                    target = SOURCE,
                    op = "fetch_screenshot",
                    result = "error",
                    card_id = %card.id,
                    key = %key,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "Screenshot could not be produced"
                );
            }
        }

        result
    }
}

fn publishable(card: Option<&Card>) -> Option<&Card> {
    match card {
        None => {
            counter!("cardshot_screenshot_skipped_total", "reason" => "missing").increment(1);
            warn!(
                target = SOURCE,
                op = "fetch_screenshot",
                result = "skipped",
                "No card provided"
            );
            None
        }
        Some(card) if !card.is_published() => {
            counter!("cardshot_screenshot_skipped_total", "reason" => "unpublished").increment(1);
            warn!(
                target = SOURCE,
                op = "fetch_screenshot",
                result = "skipped",
                card_id = %card.id,
                "The card wasn't published"
            );
            None
        }
        Some(card) if card.id.is_empty() => {
            counter!("cardshot_screenshot_skipped_total", "reason" => "empty_id").increment(1);
            warn!(
                target = SOURCE,
                op = "fetch_screenshot",
                result = "skipped",
                "The card has no id"
            );
            None
        }
        Some(card) => Some(card),
    }
}

async fn render_and_store(
    orchestrator: Arc<RenderOrchestrator>,
    store: Arc<dyn SnapshotStore>,
    key: String,
    card: Card,
    related: RelatedCards,
) -> Result<Bytes, ScreenshotError> {
    let started_at = Instant::now();
    let bytes = orchestrator.render(&card, &related).await?;
    histogram!("cardshot_screenshot_render_ms").record(started_at.elapsed().as_secs_f64() * 1000.0);
    store.write(&key, bytes.clone()).await?;
    Ok(bytes)
}
