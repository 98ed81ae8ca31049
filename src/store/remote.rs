use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, mpsc},
};
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{debug, warn};

/// A change observed on the remote replica.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The document changed. `None` means the snapshot does not exist.
    Changed(Option<String>),
    /// The connection degraded. The subscription keeps retrying.
    Error(String),
}

/// Live feed of [RemoteEvent]s for one key. Cancelling (or dropping)
/// the subscription stops the producer task, so nothing is delivered
/// after teardown.
pub struct RemoteSubscription {
    pub events: mpsc::Receiver<RemoteEvent>,
    token: CancellationToken,
}

impl RemoteSubscription {
    pub(crate) fn new(events: mpsc::Receiver<RemoteEvent>, token: CancellationToken) -> Self {
        Self { events, token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Contract for the replicated document store: whole-value writes and
/// a push-based change feed. Last write wins; there is no merging.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Replaces the whole document stored under `key`.
    async fn push(&self, key: &str, payload: &str) -> Result<()>;

    /// Opens a change feed for `key`. The current snapshot arrives
    /// first when the backend knows it.
    async fn subscribe(&self, key: &str) -> Result<RemoteSubscription>;
}

/// Connection settings for [HttpRemoteStore], passed in explicitly so
/// independent stores against different backends can coexist.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the database, e.g. `https://myapp.firebaseio.com`.
    pub base_url: String,
    /// Optional `auth` query token.
    pub auth_token: Option<String>,
}

/// REST adapter for a realtime-database style backend: documents live
/// at `{base}/{key}.json`, pushes are `PUT`s of the whole value, and
/// the change feed is a server-sent event stream of `put`/`patch`
/// frames.
pub struct HttpRemoteStore {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn document_url(&self, key: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match &self.config.auth_token {
            Some(token) => format!("{base}/{key}.json?auth={token}"),
            None => format!("{base}/{key}.json"),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn push(&self, key: &str, payload: &str) -> Result<()> {
        let response = self
            .client
            .put(self.document_url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_owned())
            .send()
            .await
            .with_context(|| format!("pushing {key:?} to the remote store"))?;
        response
            .error_for_status()
            .with_context(|| format!("remote store rejected the push of {key:?}"))?;
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<RemoteSubscription> {
        let (sender, events) = mpsc::channel(16);
        let token = CancellationToken::new();
        let url = self.document_url(key);
        let client = self.client.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            stream_events(client, url, sender, task_token).await;
        });
        Ok(RemoteSubscription::new(events, token))
    }
}

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Long-lived event-stream reader. Exits only on cancellation or a
/// dropped consumer; any connection failure is reported as a
/// [RemoteEvent::Error] and then retried.
async fn stream_events(
    client: reqwest::Client,
    url: String,
    sender: mpsc::Sender<RemoteEvent>,
    token: CancellationToken,
) {
    loop {
        let attempt = read_stream(&client, &url, &sender, &token).await;
        if token.is_cancelled() || sender.is_closed() {
            return;
        }
        if let Err(e) = attempt {
            warn!("Event stream dropped: {e:?}");
            if sender
                .send(RemoteEvent::Error(format!("{e:#}")))
                .await
                .is_err()
            {
                return;
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => (),
        }
    }
}

async fn read_stream(
    client: &reqwest::Client,
    url: &str,
    sender: &mpsc::Sender<RemoteEvent>,
    token: &CancellationToken,
) -> Result<()> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?
        .error_for_status()?;

    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    let mut lines = BufReader::new(StreamReader::new(bytes)).lines();

    let mut event_name = String::new();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Err(anyhow!("event stream closed by the server"));
        };
        if let Some(name) = line.strip_prefix("event:") {
            event_name = name.trim().to_owned();
        } else if let Some(data) = line.strip_prefix("data:") {
            if let Some(event) = parse_frame(&event_name, data.trim()) {
                if sender.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Converts one server-sent frame into a [RemoteEvent]. Frames carry
/// `{"path": …, "data": <document>}`; keep-alives produce nothing.
fn parse_frame(event_name: &str, data: &str) -> Option<RemoteEvent> {
    match event_name {
        "put" | "patch" => {
            let frame: serde_json::Value = match serde_json::from_str(data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Skipping unreadable {event_name} frame: {e}");
                    return None;
                }
            };
            match frame.get("data") {
                Some(serde_json::Value::Null) | None => Some(RemoteEvent::Changed(None)),
                Some(document) => Some(RemoteEvent::Changed(Some(document.to_string()))),
            }
        }
        "cancel" | "auth_revoked" => Some(RemoteEvent::Error(format!(
            "server ended the stream: {event_name}"
        ))),
        _ => None,
    }
}

/// Process-local replica. Clones share documents and subscribers, so a
/// second handle behaves like the same backend seen from another
/// device. Useful for offline setups and for tests.
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    documents: Arc<Mutex<HashMap<String, String>>>,
    changes: broadcast::Sender<(String, Option<String>)>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            documents: Arc::default(),
            changes,
        }
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn push(&self, key: &str, payload: &str) -> Result<()> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), payload.to_owned());
        let _ = self.changes.send((key.to_owned(), Some(payload.to_owned())));
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<RemoteSubscription> {
        let (sender, events) = mpsc::channel(16);
        let token = CancellationToken::new();

        let snapshot = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        let mut changes = self.changes.subscribe();
        let key = key.to_owned();
        let task_token = token.clone();

        tokio::spawn(async move {
            // Same listener semantics as the HTTP backend: the current
            // snapshot arrives first, then live changes.
            if sender.send(RemoteEvent::Changed(snapshot)).await.is_err() {
                return;
            }
            loop {
                // Checked first so an event racing the cancellation is
                // never delivered after teardown.
                let next = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => return,
                    next = changes.recv() => next,
                };
                match next {
                    Ok((changed_key, payload)) if changed_key == key => {
                        if sender.send(RemoteEvent::Changed(payload)).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => (),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Feed for {key:?} lagged behind by {skipped} changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(RemoteSubscription::new(events, token))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn put_frame_becomes_changed_event() {
        let event = parse_frame("put", r#"{"path":"/","data":[{"id":"1"}]}"#);
        assert_eq!(event, Some(RemoteEvent::Changed(Some(r#"[{"id":"1"}]"#.into()))));
    }

    #[test]
    fn null_data_means_absent_snapshot() {
        let event = parse_frame("put", r#"{"path":"/","data":null}"#);
        assert_eq!(event, Some(RemoteEvent::Changed(None)));
    }

    #[test]
    fn keep_alive_and_garbage_frames_are_dropped() {
        assert_eq!(parse_frame("keep-alive", "null"), None);
        assert_eq!(parse_frame("put", "not json"), None);
    }

    #[test]
    fn server_cancel_surfaces_as_error() {
        let event = parse_frame("cancel", "null");
        assert!(matches!(event, Some(RemoteEvent::Error(_))));
    }

    #[test]
    fn document_urls_include_the_auth_token() {
        let store = HttpRemoteStore::new(RemoteConfig {
            base_url: "https://tracker.example.com/".into(),
            auth_token: Some("secret".into()),
        });
        assert_eq!(
            store.document_url("daily-activities"),
            "https://tracker.example.com/daily-activities.json?auth=secret"
        );

        let anonymous = HttpRemoteStore::new(RemoteConfig {
            base_url: "https://tracker.example.com".into(),
            auth_token: None,
        });
        assert_eq!(
            anonymous.document_url("daily-activities"),
            "https://tracker.example.com/daily-activities.json"
        );
    }

    #[tokio::test]
    async fn subscribers_see_snapshot_then_changes() -> Result<()> {
        let hub = InMemoryRemoteStore::new();
        hub.push("daily-activities", "[1]").await?;

        let mut subscription = hub.subscribe("daily-activities").await?;
        assert_eq!(
            subscription.events.recv().await,
            Some(RemoteEvent::Changed(Some("[1]".into())))
        );

        // A clone of the store stands in for another device.
        hub.clone().push("daily-activities", "[1,2]").await?;
        assert_eq!(
            subscription.events.recv().await,
            Some(RemoteEvent::Changed(Some("[1,2]".into())))
        );
        Ok(())
    }

    #[tokio::test]
    async fn absent_snapshot_is_delivered_as_none() -> Result<()> {
        let hub = InMemoryRemoteStore::new();
        let mut subscription = hub.subscribe("daily-activities").await?;
        assert_eq!(
            subscription.events.recv().await,
            Some(RemoteEvent::Changed(None))
        );
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_delivering() -> Result<()> {
        let hub = InMemoryRemoteStore::new();
        let mut subscription = hub.subscribe("daily-activities").await?;
        assert_eq!(
            subscription.events.recv().await,
            Some(RemoteEvent::Changed(None))
        );

        subscription.cancel();
        hub.push("daily-activities", "[1]").await?;

        // The producer task exits on cancellation, closing the channel.
        assert_eq!(subscription.events.recv().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn changes_for_other_keys_are_filtered_out() -> Result<()> {
        let hub = InMemoryRemoteStore::new();
        let mut subscription = hub.subscribe("daily-activities").await?;
        assert_eq!(
            subscription.events.recv().await,
            Some(RemoteEvent::Changed(None))
        );

        hub.push("settings", "{}").await?;
        hub.push("daily-activities", "[1]").await?;

        assert_eq!(
            subscription.events.recv().await,
            Some(RemoteEvent::Changed(Some("[1]".into())))
        );
        Ok(())
    }
}
