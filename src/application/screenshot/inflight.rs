use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tracing::debug;

use super::service::ScreenshotError;

type SharedRender = Shared<BoxFuture<'static, Result<Bytes, Arc<ScreenshotError>>>>;

struct Slot {
    generation: u64,
    waiters: usize,
    render: SharedRender,
}

/// Renders currently in progress, keyed by storage path.
///
/// Callers that miss the cache for the same key while a render is running
/// await that render instead of starting their own. Followers observe the
/// leader's bytes or the leader's failure. The slot lives until the render
/// finishes or every waiter has gone, so cancelling the leader alone does not
/// free the key.
#[derive(Default, Clone)]
pub struct InFlightRenders {
    slots: Arc<DashMap<String, Slot>>,
    generations: Arc<AtomicU64>,
}

impl InFlightRenders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `render` for `key` unless a render for `key` is already running, in
    /// which case wait for that one.
    pub async fn run<F>(&self, key: String, render: F) -> Result<Bytes, ScreenshotError>
    where
        F: Future<Output = Result<Bytes, ScreenshotError>> + Send + 'static,
    {
        use dashmap::mapref::entry::Entry;

        let (generation, shared) = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                debug!(
                    target = "application::screenshot::inflight",
                    key = %key,
                    "joining in-flight render"
                );
                let slot = occupied.get_mut();
                slot.waiters += 1;
                (slot.generation, slot.render.clone())
            }
            Entry::Vacant(vacant) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let slots = Arc::clone(&self.slots);
                let finished_key = key.clone();
                let shared = async move {
                    let result = render.await.map_err(Arc::new);
                    slots.remove_if(&finished_key, |_, slot| slot.generation == generation);
                    result
                }
                .boxed()
                .shared();
                vacant.insert(Slot {
                    generation,
                    waiters: 1,
                    render: shared.clone(),
                });
                (generation, shared)
            }
        };

        let _waiter = Waiter {
            slots: Arc::clone(&self.slots),
            key,
            generation,
        };

        shared.await.map_err(ScreenshotError::Shared)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Drops the slot when the last waiter of an unfinished render goes away,
/// which also drops the render itself. A newer slot under the same key is
/// left alone.
struct Waiter {
    slots: Arc<DashMap<String, Slot>>,
    key: String,
    generation: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.slots.remove_if_mut(&self.key, |_, slot| {
            if slot.generation != self.generation {
                return false;
            }
            slot.waiters = slot.waiters.saturating_sub(1);
            slot.waiters == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::application::screenshot::store::StoreError;

    #[tokio::test]
    async fn concurrent_callers_share_one_render() {
        let inflight = InFlightRenders::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let make = |runs: Arc<AtomicUsize>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ScreenshotError>(Bytes::from_static(b"png"))
        };

        let (a, b) = tokio::join!(
            inflight.run("k".to_string(), make(Arc::clone(&runs))),
            inflight.run("k".to_string(), make(Arc::clone(&runs))),
        );

        assert_eq!(a.expect("a"), Bytes::from_static(b"png"));
        assert_eq!(b.expect("b"), Bytes::from_static(b"png"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn different_keys_render_independently() {
        let inflight = InFlightRenders::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let make = |runs: Arc<AtomicUsize>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ScreenshotError>(Bytes::from_static(b"png"))
        };

        let (a, b) = tokio::join!(
            inflight.run("a".to_string(), make(Arc::clone(&runs))),
            inflight.run("b".to_string(), make(Arc::clone(&runs))),
        );
        a.expect("a");
        b.expect("b");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_leader_keeps_the_render_for_remaining_waiters() {
        let inflight = InFlightRenders::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let make = |runs: Arc<AtomicUsize>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok::<_, ScreenshotError>(Bytes::from_static(b"png"))
        };

        let leader = tokio::spawn({
            let inflight = inflight.clone();
            let render = make(Arc::clone(&runs));
            async move { inflight.run("k".to_string(), render).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = tokio::spawn({
            let inflight = inflight.clone();
            let render = make(Arc::clone(&runs));
            async move { inflight.run("k".to_string(), render).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert!(leader.await.is_err_and(|err| err.is_cancelled()));
        assert_eq!(inflight.len(), 1, "follower still holds the slot");

        let third = inflight
            .run("k".to_string(), make(Arc::clone(&runs)))
            .await
            .expect("joined render");
        assert_eq!(third, Bytes::from_static(b"png"));
        assert_eq!(
            follower.await.expect("follower task").expect("follower"),
            Bytes::from_static(b"png")
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn dropping_every_waiter_frees_the_key() {
        let inflight = InFlightRenders::new();

        let stalled = inflight.run("k".to_string(), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ScreenshotError>(Bytes::from_static(b"stale"))
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), stalled).await;
        assert!(timed_out.is_err());
        assert!(inflight.is_empty());

        let fresh = inflight
            .run("k".to_string(), async {
                Ok::<_, ScreenshotError>(Bytes::from_static(b"png"))
            })
            .await;
        assert_eq!(fresh.expect("fresh render"), Bytes::from_static(b"png"));
    }

    #[tokio::test]
    async fn failures_reach_every_waiter_and_free_the_key() {
        let inflight = InFlightRenders::new();

        let failing = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<Bytes, _>(ScreenshotError::Store(StoreError::Missing {
                key: "k".to_string(),
            }))
        };
        let follower = async { Ok::<_, ScreenshotError>(Bytes::from_static(b"never used")) };

        let (a, b) = tokio::join!(
            inflight.run("k".to_string(), failing),
            inflight.run("k".to_string(), follower),
        );
        assert!(matches!(a, Err(ScreenshotError::Shared(_))));
        assert!(matches!(b, Err(ScreenshotError::Shared(_))));
        assert!(inflight.is_empty());

        let retry = inflight
            .run("k".to_string(), async {
                Ok::<_, ScreenshotError>(Bytes::from_static(b"png"))
            })
            .await;
        assert_eq!(retry.expect("fresh render"), Bytes::from_static(b"png"));
    }
}
