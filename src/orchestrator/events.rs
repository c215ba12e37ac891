//! Run events and the sinks that receive them.
//!
//! Sinks are fire-and-forget: `emit` never blocks and never fails, so a slow
//! or broken consumer cannot stall generation.

use crate::model::StageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One observable moment in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    /// Stage involved; `None` for loop-level events such as commits.
    pub stage: Option<StageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_index: Option<u32>,
    /// Cumulative committed words at the time of the event.
    pub word_count: u64,
    pub message: String,
    pub level: EventLevel,
}

impl RunEvent {
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stage: None,
            chapter_index: None,
            word_count: 0,
            message: message.into(),
            level,
        }
    }

    pub fn with_stage(mut self, stage: StageKind) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_chapter(mut self, chapter_index: u32) -> Self {
        self.chapter_index = Some(chapter_index);
        self
    }

    pub fn with_word_count(mut self, words: u64) -> Self {
        self.word_count = words;
        self
    }
}

/// Receiver of run events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Forwards events to `tracing` at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: RunEvent) {
        let stage = event.stage.map(|s| s.as_str()).unwrap_or("loop");
        let chapter = event.chapter_index.unwrap_or(0);
        let words = event.word_count;
        match event.level {
            EventLevel::Debug => tracing::debug!(stage, chapter, words, "{}", event.message),
            EventLevel::Info => tracing::info!(stage, chapter, words, "{}", event.message),
            EventLevel::Warn => tracing::warn!(stage, chapter, words, "{}", event.message),
            EventLevel::Error => tracing::error!(stage, chapter, words, "{}", event.message),
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: RunEvent) {}
}

/// Pushes events into a bounded channel, dropping them when it is full.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<RunEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events discarded because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: RunEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Delivers every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: RunEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
