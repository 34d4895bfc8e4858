//! Key/latest-value broadcast, independent of the entity stream.
//!
//! A [`Notifier`] is a typed view of one key on a [`NotifyBackend`].
//! `notify` stores and publishes a value, `fetch` reads it once, and `on`
//! installs a listener that first receives the current value and then every
//! later one. Listeners never see a missing value and never see the same
//! value twice in a row, including across reconnects.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backoff::{Backoff, BackoffConfig};
use crate::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::config::NotifierConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotifyError {
    #[error("notify backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("notify value codec error: {details}")]
    Codec { details: String },
}

type Slot = Option<Vec<u8>>;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NotifyBackend: Send + Sync {
    /// Store `value` under `key` and publish it to every listener.
    async fn notify(&self, key: &str, value: Vec<u8>) -> Result<(), NotifyError>;

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, NotifyError>;

    /// A receiver whose initial value is the current one (`None` if never
    /// set). It closes when the backend loses the listener.
    async fn listen(&self, key: &str) -> Result<watch::Receiver<Slot>, NotifyError>;
}

#[derive(Debug, Default)]
struct BackendInner {
    values: HashMap<String, Vec<u8>>,
    channels: HashMap<String, watch::Sender<Slot>>,
    unavailable: bool,
}

impl BackendInner {
    fn check_available(&self) -> Result<(), NotifyError> {
        if self.unavailable {
            Err(NotifyError::Unavailable {
                reason: "in-memory notify backend marked unavailable".into(),
            })
        } else {
            Ok(())
        }
    }

    /// Forget channels whose last listener went away.
    fn prune_channels(&mut self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

/// One `watch` channel per listened key, dropped once nobody listens.
#[derive(Debug, Default)]
pub struct InMemoryNotifyBackend {
    inner: Mutex<BackendInner>,
}

impl InMemoryNotifyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys with at least one open listener.
    pub fn channel_count(&self) -> usize {
        let mut inner = self.lock();
        inner.prune_channels();
        inner.channels.len()
    }

    /// Going unavailable closes every open listener; stored values survive.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.lock();
        inner.unavailable = !available;
        if !available {
            inner.channels.clear();
        }
    }
}

#[async_trait]
impl NotifyBackend for InMemoryNotifyBackend {
    async fn notify(&self, key: &str, value: Vec<u8>) -> Result<(), NotifyError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.prune_channels();
        if let Some(tx) = inner.channels.get(key) {
            tx.send_replace(Some(value.clone()));
        }
        inner.values.insert(key.to_owned(), value);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, NotifyError> {
        let inner = self.lock();
        inner.check_available()?;
        Ok(inner.values.get(key).cloned())
    }

    async fn listen(&self, key: &str) -> Result<watch::Receiver<Slot>, NotifyError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.prune_channels();
        if let Some(tx) = inner.channels.get(key) {
            return Ok(tx.subscribe());
        }
        let (tx, rx) = watch::channel(inner.values.get(key).cloned());
        inner.channels.insert(key.to_owned(), tx);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

pub struct Notifier<T> {
    backend: Arc<dyn NotifyBackend>,
    key: String,
    config: NotifierConfig,
    _value: PhantomData<fn() -> T>,
}

impl<T> Notifier<T>
where
    T: Serialize + DeserializeOwned + PartialEq + Clone + Send + 'static,
{
    pub fn new(backend: Arc<dyn NotifyBackend>, key: impl Into<String>, config: NotifierConfig) -> Self {
        Self {
            backend,
            key: key.into(),
            config,
            _value: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn notify(&self, value: &T) -> Result<(), NotifyError> {
        let bytes = serde_json::to_vec(value).map_err(|e| NotifyError::Codec {
            details: e.to_string(),
        })?;
        self.backend.notify(&self.key, bytes).await
    }

    /// One-shot read; does not subscribe.
    pub async fn fetch(&self) -> Result<Option<T>, NotifyError> {
        match self.backend.fetch(&self.key).await? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Call `listener` with the current value, then with every change, until
    /// the returned handle is stopped or dropped.
    pub fn on<F>(&self, listener: F) -> ListenerHandle
    where
        F: FnMut(T) + Send + 'static,
    {
        let (cancel, signal) = cancel_pair();
        let task = tokio::spawn(listen_loop(
            Arc::clone(&self.backend),
            self.key.clone(),
            self.config.backoff.clone(),
            listener,
            signal,
        ));
        ListenerHandle {
            cancel,
            task: Some(task),
        }
    }
}

impl<T> std::fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("key", &self.key).finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NotifyError> {
    serde_json::from_slice(bytes).map_err(|e| NotifyError::Codec {
        details: e.to_string(),
    })
}

/// Stops its listener when stopped or dropped.
#[derive(Debug)]
pub struct ListenerHandle {
    cancel: CancelHandle,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Stop the listener and wait for its task to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "notify listener task failed");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Delivery<T, F> {
    last: Option<T>,
    listener: F,
}

impl<T, F> Delivery<T, F>
where
    T: DeserializeOwned + PartialEq + Clone,
    F: FnMut(T),
{
    fn offer(&mut self, key: &str, slot: Slot) {
        let Some(bytes) = slot else {
            return;
        };
        let value: T = match decode(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "skipping undecodable notify value");
                return;
            }
        };
        if self.last.as_ref() == Some(&value) {
            return;
        }
        self.last = Some(value.clone());
        (self.listener)(value);
    }
}

async fn listen_loop<T, F>(
    backend: Arc<dyn NotifyBackend>,
    key: String,
    backoff: BackoffConfig,
    listener: F,
    mut cancel: CancelSignal,
) where
    T: DeserializeOwned + PartialEq + Clone + Send,
    F: FnMut(T) + Send,
{
    let mut backoff = Backoff::new(backoff);
    let mut delivery = Delivery {
        last: None,
        listener,
    };
    while !cancel.is_cancelled() {
        match backend.listen(&key).await {
            Ok(mut rx) => {
                backoff.reset();
                loop {
                    let slot = rx.borrow_and_update().clone();
                    delivery.offer(&key, slot);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!(%key, "notify listener disconnected");
            }
            Err(e) => tracing::warn!(%key, error = %e, "notify listen failed"),
        }

        let Some(delay) = backoff.next_delay() else {
            tracing::error!(%key, "notify listener giving up");
            return;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
