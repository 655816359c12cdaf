//! Flow behaviour across the public API, including the state-flow
//! conflation and debounce timing scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strand_core::channel::{Channel, OverflowPolicy};
use strand_core::dispatch::PoolDispatcher;
use strand_core::error::{Outcome, StrandError};
use strand_core::run::run_blocking;
use strand_core::scope::coroutine_scope;
use strand_core::time::delay;
use strand_flow::{
    channel_count_hint, channel_flow, flow, flow_of, FlowOps, MutableSharedFlow,
    MutableStateFlow,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ---------------------------------------------------------------------------
// Cold flows and operators
// ---------------------------------------------------------------------------

#[test]
fn flow_body_runs_once_per_collection() {
    init_tracing();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let numbers = flow(move |mut sink| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            for i in 1..=3 {
                sink.emit(i).await?;
            }
            Ok(())
        }
    });

    let first = run_blocking(numbers.to_vec()).unwrap();
    let second = run_blocking(numbers.to_vec()).unwrap();
    assert_eq!(first, vec![1, 2, 3]);
    assert_eq!(second, vec![1, 2, 3]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn operators_compose_without_channels() {
    let composed = flow_of([1, 2, 3, 4, 5, 6])
        .filter(|v| v % 2 == 0)
        .map(|v| v * 10)
        .skip(1);
    assert_eq!(channel_count_hint(&composed), 0);
    assert_eq!(run_blocking(composed.to_vec()).unwrap(), vec![40, 60]);
}

#[test]
fn take_stops_the_upstream_early() {
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&produced);
    let endless = flow(move |mut sink| {
        let counter = Arc::clone(&counter);
        async move {
            let mut i = 0u64;
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                sink.emit(i).await?;
                i += 1;
            }
        }
    });

    let taken = run_blocking(endless.take(3).to_vec()).unwrap();
    assert_eq!(taken, vec![0, 1, 2]);
    assert_eq!(produced.load(Ordering::SeqCst), 3);
}

#[test]
fn first_and_count_terminals() {
    let numbers = flow_of([7, 8, 9]);
    assert_eq!(run_blocking(numbers.first()).unwrap(), Some(7));
    assert_eq!(run_blocking(numbers.count()).unwrap(), 3);

    let empty = flow_of(Vec::<u32>::new());
    assert_eq!(run_blocking(empty.first()).unwrap(), None);
}

#[test]
fn emission_outside_the_collecting_task_is_rejected() {
    let smuggling = flow(|mut sink| async move {
        coroutine_scope(|scope| async move {
            let job = scope.launch(async move {
                // Emitting from a different task violates context
                // preservation.
                sink.emit(1).await
            });
            job.join().await?;
            Ok(())
        })
        .await
    });

    let result: Outcome<Vec<u32>> = run_blocking(smuggling.to_vec());
    let err = result.unwrap_err();
    assert!(err.to_string().contains("flow invariant"));
}

// ---------------------------------------------------------------------------
// Channel-based operators
// ---------------------------------------------------------------------------

#[test]
fn buffered_flow_delivers_everything_in_order() {
    let values: Vec<u64> = (0..100).collect();
    let buffered = flow_of(values.clone()).buffer(4);
    assert_eq!(channel_count_hint(&buffered), 1);
    assert_eq!(run_blocking(buffered.to_vec()).unwrap(), values);
}

#[test]
fn flow_on_collects_upstream_on_the_target_dispatcher() {
    let pool = PoolDispatcher::new("flow-pool", 1);
    let upstream_thread = Arc::new(Mutex::new(String::new()));
    let seen = Arc::clone(&upstream_thread);

    let tagged = flow_of([1, 2, 3])
        .on_each(move |_| {
            let name = std::thread::current().name().unwrap_or("").to_string();
            *seen.lock().unwrap() = name;
        })
        .flow_on(pool);

    let collected = run_blocking(tagged.to_vec()).unwrap();
    assert_eq!(collected, vec![1, 2, 3]);
    assert!(upstream_thread.lock().unwrap().starts_with("flow-pool"));
}

#[test]
fn channel_flow_producer_runs_concurrently() {
    let produced = channel_flow(|ch: Channel<u32>| async move {
        for i in 0..5 {
            ch.send(i).await.map_err(StrandError::from)?;
        }
        Ok(())
    });
    assert_eq!(run_blocking(produced.to_vec()).unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn conflation_keeps_most_recent_for_slow_collectors() {
    let conflated = flow(|mut sink| async move {
        for i in 0..50u32 {
            sink.emit(i).await?;
        }
        Ok(())
    })
    .conflate();

    let seen = run_blocking(conflated.to_vec()).unwrap();
    // Everything observed is in order and the final value always arrives.
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*seen.last().unwrap(), 49);
}

// ---------------------------------------------------------------------------
// State flow conflation scenario
// ---------------------------------------------------------------------------

#[test]
fn state_flow_suppresses_equal_updates() {
    let state = MutableStateFlow::new(0);
    let observed = run_blocking(coroutine_scope(|scope| async move {
        let source = state.clone();
        let collected = scope.spawn(async move { source.as_flow().take(3).to_vec().await });

        // Let the collector see the initial value before updating.
        delay(Duration::from_millis(30)).await?;
        state.set(1);
        delay(Duration::from_millis(30)).await?;
        state.set(1); // suppressed: no emission
        delay(Duration::from_millis(30)).await?;
        state.set(2);
        collected.await_result().await
    }));
    assert_eq!(observed.unwrap(), vec![0, 1, 2]);
}

// ---------------------------------------------------------------------------
// Shared flow
// ---------------------------------------------------------------------------

#[test]
fn shared_flow_replays_to_late_collectors() {
    let shared = MutableSharedFlow::new(2, 2, OverflowPolicy::Suspend);
    let result = run_blocking(coroutine_scope(|scope| async move {
        shared.emit(1).await?;
        shared.emit(2).await?;
        shared.emit(3).await?;

        // A late collector sees the replay window first.
        let source = shared.clone();
        let collected = scope.spawn(async move { source.as_flow().take(3).to_vec().await });
        delay(Duration::from_millis(30)).await?;
        shared.emit(4).await?;
        collected.await_result().await
    }));
    assert_eq!(result.unwrap(), vec![2, 3, 4]);
}

#[test]
fn shared_flow_counts_subscribers_and_frees_slots() {
    let shared: MutableSharedFlow<u32> = MutableSharedFlow::new(1, 1, OverflowPolicy::Suspend);
    let result = run_blocking(coroutine_scope(|scope| async move {
        assert_eq!(shared.subscription_count(), 0);
        let source = shared.clone();
        let collector = scope.spawn(async move { source.as_flow().take(1).to_vec().await });
        delay(Duration::from_millis(30)).await?;
        assert_eq!(shared.subscription_count(), 1);

        shared.emit(9).await?;
        let seen = collector.await_result().await?;
        assert_eq!(seen, vec![9]);
        delay(Duration::from_millis(10)).await?;
        assert_eq!(shared.subscription_count(), 0);
        Ok(())
    }));
    assert!(result.is_ok());
}

// ---------------------------------------------------------------------------
// Debounce / sample timing scenarios
// ---------------------------------------------------------------------------

#[test]
fn debounce_emits_once_per_quiet_window() {
    // Values at t=0, 90, 180, 1200; window 100 ms. The first quiet window
    // closes around t=280 with value 3; the trailing value 4 arrives at
    // about t=1300.
    let source = flow(|mut sink| async move {
        sink.emit(1u32).await?;
        delay(Duration::from_millis(90)).await?;
        sink.emit(2).await?;
        delay(Duration::from_millis(90)).await?;
        sink.emit(3).await?;
        delay(Duration::from_millis(1020)).await?;
        sink.emit(4).await?;
        delay(Duration::from_millis(400)).await?;
        Ok(())
    });

    let log: Arc<Mutex<Vec<(u32, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let start = Instant::now();
    run_blocking(source.debounce(Duration::from_millis(100)).for_each(move |v| {
        sink.lock().unwrap().push((v, start.elapsed()));
    }))
    .unwrap();

    let seen = log.lock().unwrap().clone();
    let values: Vec<u32> = seen.iter().map(|(v, _)| *v).collect();
    assert_eq!(values, vec![3, 4]);
    assert!(seen[0].1 >= Duration::from_millis(260), "3 arrived at {:?}", seen[0].1);
    assert!(seen[1].1 >= Duration::from_millis(1260), "4 arrived at {:?}", seen[1].1);
}

#[test]
fn sample_emits_latest_value_per_tick() {
    let source = flow(|mut sink| async move {
        sink.emit(1u32).await?;
        delay(Duration::from_millis(70)).await?;
        sink.emit(2).await?;
        delay(Duration::from_millis(100)).await?;
        Ok(())
    });

    let seen = run_blocking(source.sample(Duration::from_millis(50)).to_vec()).unwrap();
    assert_eq!(seen, vec![1, 2]);
}
