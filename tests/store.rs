//! Persistence through the JSON lines store.

mod common;

use std::path::PathBuf;

use common::bull_flag_series;
use patternscope::backtest::record_results;
use patternscope::prelude::*;
use patternscope::store::JsonlStore;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("patternscope-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn signals(symbol: &str) -> Vec<PatternSignal> {
    EngineBuilder::new()
        .with_all_defaults()
        .build()
        .unwrap()
        .scan(&bull_flag_series(symbol, Timeframe::H1))
}

#[tokio::test]
async fn test_signals_survive_reopen_and_upsert_by_id() {
    let dir = scratch_dir("signals");
    let store = JsonlStore::open(&dir).unwrap();
    let aapl = signals("AAPL");
    for s in aapl.iter().chain(&signals("MSFT")) {
        store.save_signal(s).await.unwrap();
    }
    let mut done = aapl[0].clone();
    done.status = SignalStatus::Completed;
    store.save_signal(&done).await.unwrap();

    let reopened = JsonlStore::open(&dir).unwrap();
    let filter = SignalFilter {
        symbol: Some("AAPL".into()),
        ..SignalFilter::default()
    };
    let loaded = reopened.load_recent_signals(&filter).await.unwrap();
    assert_eq!(loaded.len(), aapl.len());
    let reloaded = loaded.iter().find(|s| s.id == done.id).unwrap();
    assert_eq!(reloaded.status, SignalStatus::Completed);

    let active_only = SignalFilter {
        status: Some(SignalStatus::Active),
        limit: 1,
        ..SignalFilter::default()
    };
    let active = reopened.load_recent_signals(&active_only).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].id, done.id);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_backtest_results_appended() {
    let dir = scratch_dir("results");
    let store = JsonlStore::open(&dir).unwrap();
    assert!(store.backtest_results().await.unwrap().is_empty());

    let signal = signals("AAPL").remove(0);
    let results = vec![simulate(&signal, &[], 30), simulate(&signal, &[], 10)];
    record_results(&store, &results).await.unwrap();
    record_results(&store, &results[..1]).await.unwrap();

    let saved = store.backtest_results().await.unwrap();
    assert_eq!(saved.len(), 3);
    assert!(saved.iter().all(|r| r.signal_id == signal.id && !r.is_resolved()));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_corrupt_line_is_a_store_error() {
    let dir = scratch_dir("corrupt");
    let store = JsonlStore::open(&dir).unwrap();
    std::fs::write(dir.join("signals.jsonl"), "{not json}\n").unwrap();
    let err = store
        .load_recent_signals(&SignalFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PatternError::Store(_)));

    let _ = std::fs::remove_dir_all(&dir);
}
