mod common;

use std::time::Duration;

use common::*;
use ipo_storage::SnapshotCache;
use ipo_sync::{PipelineSettings, Scheduler, SchedulerState};
use tokio::time::Instant;

const INTERVAL: Duration = Duration::from_secs(840);

async fn wait_for_cycles(handle: &ipo_sync::SchedulerHandle, cycles: u64) {
    while handle.stats().cycles_completed() < cycles {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn failed_cycle_is_followed_by_next_tick() {
    let h = Harness::new(
        ScriptedSource::faulty(vec![raw("Alpha Hydro", "IPO", "AH")], SourceFault::FetchError, 1),
        NotifyMode::Accept,
    );
    let scheduler = Scheduler::new(h.pipeline.clone(), request(), INTERVAL).unwrap();
    let handle = scheduler.start();

    wait_for_cycles(&handle, 2).await;
    handle.stop().await;

    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.notifier.call_count().await, 1);

    let starts = h.source.fetch_started_at.lock().await.clone();
    assert!(starts.len() >= 2);
    assert!(starts[1] - starts[0] >= INTERVAL, "failed cycle must not shorten the sleep");
}

#[tokio::test(start_paused = true)]
async fn panicking_cycle_does_not_kill_the_loop() {
    let h = Harness::new(
        ScriptedSource::faulty(vec![raw("Beta Finance", "FPO", "BF")], SourceFault::Panic, 1),
        NotifyMode::Accept,
    );
    let handle = Scheduler::new(h.pipeline.clone(), request(), INTERVAL)
        .unwrap()
        .start();

    wait_for_cycles(&handle, 2).await;
    let failed = handle.stats().cycles_failed();
    handle.stop().await;

    assert_eq!(failed, 1);
    assert_eq!(h.store.len().await, 1);
    assert!(!h.pipeline.is_running());
    assert_eq!(h.source.authenticated(), 2);
    assert_eq!(h.source.closed(), 2);
}

#[tokio::test(start_paused = true)]
async fn reader_never_sees_a_miss_between_successful_cycles() {
    let h = Harness::new(
        ScriptedSource::new(vec![raw("Alpha Hydro", "IPO", "AH")]),
        NotifyMode::Accept,
    );
    let handle = Scheduler::new(h.pipeline.clone(), request(), INTERVAL)
        .unwrap()
        .start();

    wait_for_cycles(&handle, 1).await;
    let deadline = Instant::now() + INTERVAL * 3;
    while Instant::now() < deadline {
        assert!(
            h.cache.read_raw().await.unwrap().is_some(),
            "cache miss at {:?}",
            Instant::now()
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    assert!(handle.stats().cycles_completed() >= 3);
    handle.stop().await;

    assert_eq!(h.notifier.call_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_loop_and_reports_stopped() {
    let h = Harness::new(ScriptedSource::new(vec![]), NotifyMode::Accept);
    let handle = Scheduler::new(h.pipeline.clone(), request(), INTERVAL)
        .unwrap()
        .start();

    wait_for_cycles(&handle, 1).await;
    assert_eq!(handle.state(), SchedulerState::Idle);
    let stats = handle.stats().clone();
    handle.stop().await;

    assert_eq!(stats.state(), SchedulerState::Stopped);
    let completed = stats.cycles_completed();
    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(stats.cycles_completed(), completed);
}

#[test]
fn ttl_not_exceeding_interval_is_rejected() {
    let settings = PipelineSettings {
        cache_ttl: INTERVAL,
        ..PipelineSettings::default()
    };
    let h = Harness::with_settings(ScriptedSource::new(vec![]), NotifyMode::Accept, settings);
    assert!(Scheduler::new(h.pipeline.clone(), request(), INTERVAL).is_err());
    assert!(Scheduler::new(h.pipeline.clone(), request(), Duration::ZERO).is_err());
}
