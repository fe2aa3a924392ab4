//! Signal status tracking.
//!
//! [`SignalStatus`] is the `Active -> Completed | Failed` state machine
//! shared by the simulator and live tracking. [`spawn_tracker`] runs a
//! [`LiveTracker`] behind a bounded channel and applies price updates in
//! batches.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::{Direction, PatternSignal, TradeLevels};

// ============================================================
// STATUS STATE MACHINE
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    #[default]
    Active,
    /// Target reached
    Completed,
    /// Stop reached
    Failed,
}

impl SignalStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, SignalStatus::Active)
    }

    /// Next status after a trade at `price`. Terminal states never change.
    pub fn observe(self, direction: Direction, levels: &TradeLevels, price: f64) -> SignalStatus {
        if self.is_terminal() {
            return self;
        }
        let (hit_target, hit_stop) = match direction {
            Direction::Bullish => (price >= levels.target, price <= levels.stop),
            Direction::Bearish => (price <= levels.target, price >= levels.stop),
        };
        if hit_stop {
            SignalStatus::Failed
        } else if hit_target {
            SignalStatus::Completed
        } else {
            SignalStatus::Active
        }
    }
}

/// Which level a bar crossed, and the price it filled at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarExit {
    pub status: SignalStatus,
    pub price: f64,
}

/// Resolve one bar's range against the levels. The stop is checked first, so a
/// bar spanning both levels counts as stopped out.
pub fn bar_exit(direction: Direction, levels: &TradeLevels, high: f64, low: f64) -> Option<BarExit> {
    let adverse = direction.adverse_extreme(high, low);
    if SignalStatus::Active.observe(direction, levels, adverse) == SignalStatus::Failed {
        return Some(BarExit {
            status: SignalStatus::Failed,
            price: levels.stop,
        });
    }
    let favorable = direction.favorable_extreme(high, low);
    if SignalStatus::Active.observe(direction, levels, favorable) == SignalStatus::Completed {
        return Some(BarExit {
            status: SignalStatus::Completed,
            price: levels.target,
        });
    }
    None
}

// ============================================================
// LIVE TRACKER
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub signal_id: String,
    pub symbol: String,
    pub from: SignalStatus,
    pub to: SignalStatus,
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Active signals grouped by symbol
#[derive(Debug, Default)]
pub struct LiveTracker {
    active: HashMap<String, Vec<PatternSignal>>,
}

impl LiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `signal`. Signals already in a terminal state are ignored.
    pub fn track(&mut self, signal: PatternSignal) {
        if signal.status.is_terminal() {
            return;
        }
        self.active
            .entry(signal.symbol.clone())
            .or_default()
            .push(signal);
    }

    pub fn active_count(&self) -> usize {
        self.active.values().map(Vec::len).sum()
    }

    pub fn active_for(&self, symbol: &str) -> &[PatternSignal] {
        self.active.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Apply one price. Signals that reach a terminal state stop being tracked.
    pub fn apply(&mut self, update: &PriceUpdate) -> Vec<StatusTransition> {
        let Some(signals) = self.active.get_mut(&update.symbol) else {
            return Vec::new();
        };
        let mut transitions = Vec::new();
        signals.retain_mut(|signal| {
            let next = signal
                .status
                .observe(signal.direction, &signal.levels(), update.price);
            if next == signal.status {
                return true;
            }
            transitions.push(StatusTransition {
                signal_id: signal.id.clone(),
                symbol: signal.symbol.clone(),
                from: signal.status,
                to: next,
                price: update.price,
                at: update.at,
            });
            signal.status = next;
            !next.is_terminal()
        });
        if signals.is_empty() {
            self.active.remove(&update.symbol);
        }
        transitions
    }

    /// Apply updates in arrival order
    pub fn apply_batch(&mut self, updates: &[PriceUpdate]) -> Vec<StatusTransition> {
        updates.iter().flat_map(|u| self.apply(u)).collect()
    }
}

// ============================================================
// BATCHED UPDATES
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            batch_size: 64,
            flush_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LiveEvent {
    Price(PriceUpdate),
    Track(PatternSignal),
}

/// Handles to a running tracker task
pub struct TrackerHandle {
    pub events: mpsc::Sender<LiveEvent>,
    pub transitions: mpsc::Receiver<StatusTransition>,
    /// Resolves to the tracker once every event sender is dropped
    pub task: JoinHandle<LiveTracker>,
}

/// Run `tracker` on a task fed through a bounded channel.
///
/// Prices are buffered and applied when `batch_size` accumulate or the flush
/// interval fires, whichever comes first. A `Track` event flushes pending
/// prices before registering the signal so updates stay in arrival order.
pub fn spawn_tracker(tracker: LiveTracker, config: BatchConfig) -> TrackerHandle {
    let capacity = config.channel_capacity.max(1);
    let (event_tx, mut event_rx) = mpsc::channel(capacity);
    let (transition_tx, transition_rx) = mpsc::channel(capacity);

    let task = tokio::spawn(async move {
        let mut tracker = tracker;
        let mut batcher = UpdateBatcher::new(config.batch_size);
        let mut ticker = interval(Duration::from_millis(config.flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(LiveEvent::Price(update)) => {
                        if batcher.push(update) {
                            batcher.flush(&mut tracker, &transition_tx).await;
                        }
                    }
                    Some(LiveEvent::Track(signal)) => {
                        batcher.flush(&mut tracker, &transition_tx).await;
                        tracker.track(signal);
                    }
                    None => {
                        batcher.flush(&mut tracker, &transition_tx).await;
                        break;
                    }
                },
                _ = ticker.tick() => batcher.flush(&mut tracker, &transition_tx).await,
            }
        }
        info!(active = tracker.active_count(), "live tracker stopped");
        tracker
    });

    TrackerHandle {
        events: event_tx,
        transitions: transition_rx,
        task,
    }
}

/// Accumulates price updates until a batch is full
#[derive(Debug)]
pub struct UpdateBatcher {
    batch_size: usize,
    pending: Vec<PriceUpdate>,
}

impl UpdateBatcher {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Buffer an update. Returns true when the batch is full.
    pub fn push(&mut self, update: PriceUpdate) -> bool {
        self.pending.push(update);
        self.pending.len() >= self.batch_size
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    async fn flush(&mut self, tracker: &mut LiveTracker, out: &mpsc::Sender<StatusTransition>) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        debug!(updates = batch.len(), "flushing price batch");
        for transition in tracker.apply_batch(&batch) {
            if out.send(transition).await.is_err() {
                debug!("transition receiver dropped");
                break;
            }
        }
    }
}
