//! Archiver - records channel history off the bus
//!
//! Storage sits behind [`ChannelStore`]; the in-memory [`MemoryStore`] is the
//! only backend shipped here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoordinationResult;
use crate::events::{Event, EventFilter, SharedEventBus, Subscription};

/// Shared reference to a history backend
pub type SharedChannelStore = Arc<dyn ChannelStore>;

/// One recorded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Channel history storage
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Append an entry to `channel`
    async fn append(&self, channel: &str, entry: HistoryEntry) -> CoordinationResult<()>;

    /// Channels with at least one recorded entry
    async fn get_channels(&self) -> CoordinationResult<Vec<String>>;

    /// Entries of `channel`, oldest first
    async fn get_history(&self, channel: &str) -> CoordinationResult<Vec<HistoryEntry>>;
}

/// Volatile history store
#[derive(Debug, Default)]
pub struct MemoryStore {
    channels: Mutex<BTreeMap<String, Vec<HistoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<HistoryEntry>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a shared, type-erased handle to this store
    pub fn shared(self) -> SharedChannelStore {
        Arc::new(self)
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn append(&self, channel: &str, entry: HistoryEntry) -> CoordinationResult<()> {
        self.lock().entry(channel.to_string()).or_default().push(entry);
        Ok(())
    }
    async fn get_channels(&self) -> CoordinationResult<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    async fn get_history(&self, channel: &str) -> CoordinationResult<Vec<HistoryEntry>> {
        Ok(self.lock().get(channel).cloned().unwrap_or_default())
    }
}

/// Records every bus event that carries content
pub struct Archiver {
    bus: SharedEventBus,
    store: SharedChannelStore,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Archiver {
    pub fn new(bus: SharedEventBus, store: SharedChannelStore) -> Self {
        Self {
            bus,
            store,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn store(&self) -> SharedChannelStore {
        self.store.clone()
    }

    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let events = self.bus.subscribe(EventFilter::new());
        *task = Some(tokio::spawn(run(
            events,
            self.store.clone(),
            self.cancel.clone(),
        )));
        info!("Archiver started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn archive(store: &dyn ChannelStore, event: Event) {
    let Some(content) = event.content else {
        return;
    };
    debug!(channel = %event.channel, sender = %event.sender, "Archiving message");
    let entry = HistoryEntry {
        sender: event.sender,
        content,
        timestamp: event.timestamp,
    };
    if let Err(e) = store.append(&event.channel, entry).await {
        warn!(channel = %event.channel, "Failed to archive message: {}", e);
    }
}

async fn run(mut events: Subscription, store: SharedChannelStore, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => archive(store.as_ref(), event).await,
                None => break,
            },
        }
    }
    // Keep what was already delivered
    while let Some(event) = events.try_recv() {
        archive(store.as_ref(), event).await;
    }
    info!("Archiver stopped");
}
