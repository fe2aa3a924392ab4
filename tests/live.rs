//! Live status tracking through the batching task.

mod common;

use chrono::Utc;
use common::bull_flag_series;
use patternscope::live::{spawn_tracker, BatchConfig};
use patternscope::prelude::*;

fn flag_signal(symbol: &str) -> PatternSignal {
    let engine = EngineBuilder::new().with_flag_defaults().build().unwrap();
    engine.scan(&bull_flag_series(symbol, Timeframe::H1)).remove(0)
}

fn price(symbol: &str, price: f64) -> LiveEvent {
    LiveEvent::Price(PriceUpdate {
        symbol: symbol.to_string(),
        price,
        at: Utc::now(),
    })
}

#[tokio::test]
async fn test_tracker_emits_transitions_in_order() {
    let aapl = flag_signal("AAPL");
    let msft = flag_signal("MSFT");
    let config = BatchConfig {
        batch_size: 2,
        flush_interval_ms: 10,
        ..BatchConfig::default()
    };
    let mut handle = spawn_tracker(LiveTracker::new(), config);

    handle.events.send(LiveEvent::Track(aapl.clone())).await.unwrap();
    handle.events.send(LiveEvent::Track(msft.clone())).await.unwrap();
    handle.events.send(price("AAPL", aapl.entry_price + 0.1)).await.unwrap();
    handle.events.send(price("MSFT", msft.stop_loss - 0.1)).await.unwrap();
    handle.events.send(price("AAPL", aapl.target_price + 0.1)).await.unwrap();
    // Ignored: AAPL already completed
    handle.events.send(price("AAPL", aapl.stop_loss - 1.0)).await.unwrap();
    drop(handle.events);

    let mut transitions = Vec::new();
    while let Some(t) = handle.transitions.recv().await {
        transitions.push(t);
    }
    let tracker = handle.task.await.unwrap();

    assert_eq!(transitions.len(), 2);
    assert_eq!(transitions[0].symbol, "MSFT");
    assert_eq!(transitions[0].to, SignalStatus::Failed);
    assert_eq!(transitions[1].symbol, "AAPL");
    assert_eq!(transitions[1].from, SignalStatus::Active);
    assert_eq!(transitions[1].to, SignalStatus::Completed);
    assert_eq!(tracker.active_count(), 0);
}

#[test]
fn test_tracker_ignores_terminal_signals() {
    let mut done = flag_signal("AAPL");
    done.status = SignalStatus::Completed;
    let mut tracker = LiveTracker::new();
    tracker.track(done);
    tracker.track(flag_signal("MSFT"));
    assert_eq!(tracker.active_count(), 1);
    assert!(tracker.active_for("AAPL").is_empty());

    let updates = [PriceUpdate {
        symbol: "MSFT".into(),
        price: 1.0,
        at: Utc::now(),
    }];
    let transitions = tracker.apply_batch(&updates);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, SignalStatus::Failed);
    assert_eq!(tracker.active_count(), 0);
}
