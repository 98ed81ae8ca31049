use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{
    local::LocalStore,
    remote::{RemoteEvent, RemoteStore, RemoteSubscription},
};

/// Connectivity flags for one synchronized document, shown by the UI's
/// sync indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_online: true,
            is_syncing: false,
            last_error: None,
        }
    }
}

/// Either a replacement value or a function of the previous value.
/// The function form composes: it always sees the result of the prior
/// update within this process.
pub enum Update<T> {
    Value(T),
    With(Box<dyn FnOnce(&T) -> T + Send>),
}

struct EngineState<T> {
    value: T,
    status: SyncStatus,
}

/// Keeps one document consistent across memory, the [LocalStore] and
/// the [RemoteStore].
///
/// Local state is authoritative for this process: [SyncEngine::update]
/// applies the new value to memory and the local store before it
/// returns, and the remote push resolves in the background. A failed
/// push only flips the status flags; nothing is ever rolled back.
///
/// Incoming remote snapshots overwrite both memory and the local store
/// unconditionally: last write observed wins, whole-document
/// granularity.
pub struct SyncEngine<T> {
    inner: Arc<EngineInner<T>>,
    shutdown: CancellationToken,
}

struct EngineInner<T> {
    key: String,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    state: Mutex<EngineState<T>>,
    observers: watch::Sender<T>,
}

impl<T> SyncEngine<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Loads `key` from the local store, falling back to `fallback` on
    /// absence or corrupt JSON, then wires up the remote change feed
    /// and the cross-tab local feed. Must run on a tokio runtime; the
    /// listener tasks live until [SyncEngine::shutdown] or drop.
    pub async fn connect(
        key: impl Into<String>,
        fallback: T,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let key = key.into();
        let value = read_local(local.as_ref(), &key).unwrap_or(fallback);
        let (observers, _) = watch::channel(value.clone());
        let inner = Arc::new(EngineInner {
            key,
            local,
            remote,
            state: Mutex::new(EngineState {
                value,
                status: SyncStatus::default(),
            }),
            observers,
        });
        let shutdown = CancellationToken::new();

        let subscription = inner.remote.subscribe(&inner.key).await?;
        tokio::spawn(remote_loop(
            Arc::clone(&inner),
            subscription,
            shutdown.clone(),
        ));

        let local_changes = inner.local.subscribe();
        tokio::spawn(local_loop(
            Arc::clone(&inner),
            local_changes,
            shutdown.clone(),
        ));

        Ok(Self { inner, shutdown })
    }

    /// Applies an update and returns the new value. The in-memory copy
    /// and the local store are current when this returns; the remote
    /// push is reported later through [SyncEngine::status]. Callers
    /// never see a storage or network error here.
    pub fn update(&self, update: Update<T>) -> T {
        let next = {
            let mut state = lock(&self.inner.state);
            let next = match update {
                Update::Value(value) => value,
                Update::With(f) => f(&state.value),
            };
            state.value = next.clone();
            state.status.is_syncing = true;
            next
        };

        match serde_json::to_string(&next) {
            Ok(serialized) => {
                if let Err(e) = self.inner.local.set(&self.inner.key, &serialized) {
                    // Memory stays the source of truth for this
                    // process even when the disk write fails.
                    warn!("Saving {:?} locally failed: {e:?}", self.inner.key);
                }
                let inner = Arc::clone(&self.inner);
                let shutdown = self.shutdown.clone();
                tokio::spawn(push_to_remote(inner, serialized, shutdown));
            }
            Err(e) => {
                warn!("Serializing {:?} failed: {e}", self.inner.key);
                let mut state = lock(&self.inner.state);
                state.status.is_syncing = false;
                state.status.last_error = Some(e.to_string());
            }
        }

        let _ = self.inner.observers.send(next.clone());
        next
    }

    pub fn set(&self, value: T) -> T {
        self.update(Update::Value(value))
    }

    pub fn modify(&self, f: impl FnOnce(&T) -> T + Send + 'static) -> T {
        self.update(Update::With(Box::new(f)))
    }

    pub fn value(&self) -> T {
        lock(&self.inner.state).value.clone()
    }

    pub fn status(&self) -> SyncStatus {
        lock(&self.inner.state).status.clone()
    }

    /// Observes the in-memory value: fires on every local update and
    /// every applied remote or cross-tab change.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.observers.subscribe()
    }

    /// Tears down both listener loops. Also happens on drop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl<T> Drop for SyncEngine<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T>(state: &Mutex<EngineState<T>>) -> MutexGuard<'_, EngineState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads and parses the locally persisted copy. Both a missing key and
/// corrupt JSON mean "no prior value".
fn read_local<T: DeserializeOwned>(local: &dyn LocalStore, key: &str) -> Option<T> {
    let raw = match local.get(key) {
        Ok(raw) => raw?,
        Err(e) => {
            warn!("Reading local key {key:?} failed: {e:?}");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Local value under {key:?} is not valid JSON, starting fresh: {e}");
            None
        }
    }
}

/// Background half of [SyncEngine::update]. Only the status flags
/// react to the outcome; the local value stands regardless.
async fn push_to_remote<T>(
    inner: Arc<EngineInner<T>>,
    serialized: String,
    shutdown: CancellationToken,
) {
    let result = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = inner.remote.push(&inner.key, &serialized) => result,
    };
    let mut state = lock(&inner.state);
    state.status.is_syncing = false;
    match result {
        Ok(()) => {
            state.status.is_online = true;
            state.status.last_error = None;
        }
        Err(e) => {
            warn!("Pushing {:?} to the remote failed: {e:?}", inner.key);
            state.status.is_online = false;
            state.status.last_error = Some(format!("{e:#}"));
        }
    }
}

/// Applies the remote change feed. Every existing snapshot overwrites
/// memory and the local store; the next notification simply wins.
async fn remote_loop<T>(
    inner: Arc<EngineInner<T>>,
    mut subscription: RemoteSubscription,
    shutdown: CancellationToken,
) where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                subscription.cancel();
                return;
            }
            event = subscription.events.recv() => event,
        };
        let Some(event) = event else { return };
        match event {
            RemoteEvent::Changed(Some(payload)) => {
                let value: T = match serde_json::from_str(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            "Ignoring unreadable remote payload for {:?}: {e}",
                            inner.key
                        );
                        continue;
                    }
                };
                if let Err(e) = inner.local.set(&inner.key, &payload) {
                    warn!("Mirroring remote value of {:?} locally failed: {e:?}", inner.key);
                }
                let mut state = lock(&inner.state);
                state.value = value.clone();
                state.status.is_online = true;
                state.status.last_error = None;
                drop(state);
                let _ = inner.observers.send(value);
            }
            RemoteEvent::Changed(None) => {
                debug!("Remote snapshot for {:?} does not exist yet", inner.key);
            }
            RemoteEvent::Error(message) => {
                warn!("Remote feed for {:?} reported: {message}", inner.key);
                let mut state = lock(&inner.state);
                state.status.is_online = false;
                state.status.last_error = Some(message);
            }
        }
    }
}

/// Cross-tab path: when another handle on the same profile writes our
/// key, refresh the in-memory copy from the local store. Connectivity
/// flags are untouched, nothing went over the network.
async fn local_loop<T>(
    inner: Arc<EngineInner<T>>,
    mut changes: broadcast::Receiver<String>,
    shutdown: CancellationToken,
) where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        let changed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            changed = changes.recv() => changed,
        };
        match changed {
            Ok(key) if key == inner.key => refresh_from_local(&inner),
            Ok(_) => (),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(
                    "Local change feed lagged by {skipped}, re-reading {:?}",
                    inner.key
                );
                refresh_from_local(&inner);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn refresh_from_local<T>(inner: &Arc<EngineInner<T>>)
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    if let Some(value) = read_local::<T>(inner.local.as_ref(), &inner.key) {
        let mut state = lock(&inner.state);
        state.value = value.clone();
        drop(state);
        let _ = inner.observers.send(value);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::{
        model::{append_record, ActivityLog, ActivityRecord},
        store::{
            local::{LocalStore, MemoryStore, MockLocalStore},
            remote::{InMemoryRemoteStore, MockRemoteStore, RemoteEvent, RemoteStore,
                RemoteSubscription},
        },
        utils::logging::TEST_LOGGING,
    };

    use super::*;

    const KEY: &str = "daily-activities";

    fn record(id: &str) -> ActivityRecord {
        ActivityRecord {
            id: id.into(),
            category: "Job".into(),
            activity: "Meeting".into(),
            start_time: "2025-01-01T09:00:00.000Z".into(),
            end_time: "2025-01-01T09:30:00.000Z".into(),
            duration: 30.0,
            notes: None,
            date: "2025-01-01".into(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Remote whose push never resolves and whose event feed is driven
    /// by the test, for pinning down in-flight orderings.
    struct StalledRemote {
        events: Mutex<Option<mpsc::Receiver<RemoteEvent>>>,
    }

    impl StalledRemote {
        fn new() -> (Arc<Self>, mpsc::Sender<RemoteEvent>) {
            let (sender, events) = mpsc::channel(16);
            let remote = Arc::new(Self {
                events: Mutex::new(Some(events)),
            });
            (remote, sender)
        }
    }

    #[async_trait]
    impl RemoteStore for StalledRemote {
        async fn push(&self, _key: &str, _payload: &str) -> anyhow::Result<()> {
            futures::future::pending::<()>().await;
            unreachable!()
        }

        async fn subscribe(&self, _key: &str) -> anyhow::Result<RemoteSubscription> {
            let events = self
                .events
                .lock()
                .unwrap()
                .take()
                .expect("subscribed twice");
            Ok(RemoteSubscription::new(events, CancellationToken::new()))
        }
    }

    #[tokio::test]
    async fn updates_apply_in_call_order() -> anyhow::Result<()> {
        *TEST_LOGGING;
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], local.clone(), remote).await?;

        engine.modify(|log| append_record(log.clone(), record("1")));
        engine.modify(|log| append_record(log.clone(), record("2")));
        let last = engine.modify(|log| append_record(log.clone(), record("3")));

        // Each updater saw the result of the previous one.
        let ids: Vec<_> = last.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(engine.value(), last);

        // The local store already matches, no waiting on the network.
        let stored: ActivityLog = serde_json::from_str(&local.get(KEY)?.unwrap())?;
        assert_eq!(stored, last);
        Ok(())
    }

    #[tokio::test]
    async fn value_or_updater_both_dispatch() -> anyhow::Result<()> {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], local, remote).await?;

        engine.set(vec![record("a")]);
        assert_eq!(engine.value().len(), 1);

        engine.update(Update::With(Box::new(|log| {
            append_record(log.clone(), record("b"))
        })));
        assert_eq!(engine.value().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_local_value_falls_back() -> anyhow::Result<()> {
        let local = Arc::new(MemoryStore::new());
        local.set(KEY, "{not json")?;
        let remote = Arc::new(InMemoryRemoteStore::new());

        let fallback = vec![record("fallback")];
        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, fallback.clone(), local, remote).await?;

        assert_eq!(engine.value(), fallback);
        Ok(())
    }

    #[tokio::test]
    async fn push_failure_only_flips_the_flags() -> anyhow::Result<()> {
        *TEST_LOGGING;
        let local = Arc::new(MemoryStore::new());
        let mut remote = MockRemoteStore::new();
        remote.expect_subscribe().returning(|_| {
            // A feed that never produces anything.
            let (_sender, events) = mpsc::channel(1);
            Ok(RemoteSubscription::new(events, CancellationToken::new()))
        });
        remote
            .expect_push()
            .returning(|_, _| Err(anyhow!("server unreachable")));

        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], local.clone(), Arc::new(remote)).await?;

        let value = engine.set(vec![record("1")]);
        // Local side is committed before the push even runs.
        assert_eq!(engine.value(), value);
        let stored: ActivityLog = serde_json::from_str(&local.get(KEY)?.unwrap())?;
        assert_eq!(stored, value);

        wait_until(|| !engine.status().is_syncing).await;
        let status = engine.status();
        assert!(!status.is_online);
        assert!(status.last_error.unwrap().contains("server unreachable"));
        Ok(())
    }

    #[tokio::test]
    async fn local_write_failure_does_not_abort_the_update() -> anyhow::Result<()> {
        *TEST_LOGGING;
        let mut local = MockLocalStore::new();
        local.expect_get().returning(|_| Ok(None));
        local
            .expect_set()
            .returning(|_, _| Err(anyhow!("quota exceeded")));
        local
            .expect_subscribe()
            .returning(|| broadcast::channel(1).1);

        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], Arc::new(local), remote).await?;

        let value = engine.set(vec![record("1")]);

        // The in-memory state is committed and the push still goes out.
        assert_eq!(engine.value(), value);
        wait_until(|| !engine.status().is_syncing).await;
        assert!(engine.status().is_online);
        assert_eq!(engine.status().last_error, None);
        Ok(())
    }

    #[tokio::test]
    async fn remote_overwrite_beats_an_in_flight_push() -> anyhow::Result<()> {
        *TEST_LOGGING;
        let local = Arc::new(MemoryStore::new());
        let (remote, feed) = StalledRemote::new();
        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], local.clone(), remote).await?;

        engine.set(vec![record("local")]);

        // The push of "local" is still pending when the remote
        // delivers a different document.
        let remote_value = vec![record("remote")];
        feed.send(RemoteEvent::Changed(Some(serde_json::to_string(&remote_value)?)))
            .await?;

        wait_until(|| engine.value() == remote_value).await;
        let stored: ActivityLog = serde_json::from_str(&local.get(KEY)?.unwrap())?;
        assert_eq!(stored, remote_value);
        Ok(())
    }

    #[tokio::test]
    async fn remote_snapshot_overwrites_at_startup() -> anyhow::Result<()> {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let seeded = vec![record("seeded")];
        remote.push(KEY, &serde_json::to_string(&seeded)?).await?;

        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], local, remote).await?;

        wait_until(|| engine.value() == seeded).await;
        assert!(engine.status().is_online);
        Ok(())
    }

    #[tokio::test]
    async fn remote_feed_error_goes_offline() -> anyhow::Result<()> {
        let local = Arc::new(MemoryStore::new());
        let (remote, feed) = StalledRemote::new();
        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], local, remote).await?;

        feed.send(RemoteEvent::Error("permission denied".into()))
            .await?;

        wait_until(|| !engine.status().is_online).await;
        assert_eq!(engine.status().last_error.as_deref(), Some("permission denied"));
        Ok(())
    }

    #[tokio::test]
    async fn tabs_sharing_a_profile_stay_consistent() -> anyhow::Result<()> {
        *TEST_LOGGING;
        let profile = MemoryStore::new();
        let first_tab: SyncEngine<ActivityLog> = SyncEngine::connect(
            KEY,
            vec![],
            Arc::new(profile.clone()),
            Arc::new(InMemoryRemoteStore::new()),
        )
        .await?;
        let second_tab: SyncEngine<ActivityLog> = SyncEngine::connect(
            KEY,
            vec![],
            Arc::new(profile.clone()),
            Arc::new(InMemoryRemoteStore::new()),
        )
        .await?;

        let value = first_tab.set(vec![record("from-first-tab")]);

        // The second tab picks the write up through the store
        // notification alone; its remote never saw anything.
        wait_until(|| second_tab.value() == value).await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_reacting_to_the_feed() -> anyhow::Result<()> {
        let local = Arc::new(MemoryStore::new());
        let (remote, feed) = StalledRemote::new();
        let engine: SyncEngine<ActivityLog> =
            SyncEngine::connect(KEY, vec![], local, remote).await?;

        engine.shutdown();
        // Give the listener a chance to observe the cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stale = vec![record("stale")];
        let _ = feed
            .send(RemoteEvent::Changed(Some(serde_json::to_string(&stale)?)))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(engine.value().is_empty());
        Ok(())
    }
}
