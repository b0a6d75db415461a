// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use eventuals::{Eventual, Value};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::warn;

/// How far past its interval a tick may run before we complain about it.
const OVERRUN_GRACE: Duration = Duration::from_secs(5);

/// Cancellation guard for a periodic task. Dropping it stops future ticks;
/// a tick that is already running completes normally, since cancellation is
/// only observed while the loop is sleeping between ticks.
pub struct TimerHandle {
    stop: Option<oneshot::Sender<()>>,
}

impl TimerHandle {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { stop: Some(tx) }, rx)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Runs `work` forever on a single task, with the next tick scheduled
/// `interval` after the *completion* of the previous one. Ticks therefore
/// never overlap and missed intervals are not queued. A failed tick is logged
/// under `name` and the loop continues.
pub fn sequential_timer<F, Fut>(name: &'static str, interval: Duration, mut work: F) -> TimerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let (handle, mut stop) = TimerHandle::new();
    tokio::spawn(async move {
        loop {
            let started = Instant::now();
            if let Err(err) = work().await {
                warn!(task = name, error = %err, "Periodic task failed; will retry on the next tick");
            }
            let elapsed = started.elapsed();
            if elapsed > interval + OVERRUN_GRACE {
                warn!(
                    task = name,
                    interval_ms = interval.as_millis() as u64,
                    duration_ms = elapsed.as_millis() as u64,
                    "Periodic task ran past its interval"
                );
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = &mut stop => break,
            }
        }
    });
    handle
}

/// Like [`sequential_timer`], but each successful tick produces a value that
/// is surfaced through an [`Eventual`]. A value equal to the previously
/// pushed one is suppressed; a failed tick leaves the observable untouched.
pub fn sequential_timer_map<T, F, Fut>(
    name: &'static str,
    interval: Duration,
    mut work: F,
) -> (TimerHandle, Eventual<T>)
where
    T: Value + PartialEq,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    let (mut writer, eventual) = Eventual::new();
    let (handle, mut stop) = TimerHandle::new();
    tokio::spawn(async move {
        let mut last: Option<T> = None;
        loop {
            let started = Instant::now();
            match work().await {
                Ok(next) => {
                    if last.as_ref() != Some(&next) {
                        writer.write(next.clone());
                        last = Some(next);
                    }
                }
                Err(err) => {
                    warn!(task = name, error = %err, "Periodic task failed; keeping the previous value");
                }
            }
            let elapsed = started.elapsed();
            if elapsed > interval + OVERRUN_GRACE {
                warn!(
                    task = name,
                    interval_ms = interval.as_millis() as u64,
                    duration_ms = elapsed.as_millis() as u64,
                    "Periodic task ran past its interval"
                );
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = &mut stop => break,
            }
        }
    });
    (handle, eventual)
}

/// The reducing variant: each tick folds the previous accumulator into the
/// next one, and the latest accumulator is observable. `work` receives a clone
/// of the current accumulator and returns the next; returning the same value
/// suppresses the push.
pub fn sequential_timer_reduce<T, F, Fut>(
    name: &'static str,
    interval: Duration,
    initial: T,
    mut work: F,
) -> (TimerHandle, Eventual<T>)
where
    T: Value + PartialEq,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send,
{
    let (mut writer, eventual) = Eventual::new();
    let (handle, mut stop) = TimerHandle::new();
    tokio::spawn(async move {
        let mut acc = initial;
        let mut last: Option<T> = None;
        loop {
            let started = Instant::now();
            acc = work(acc.clone()).await;
            if last.as_ref() != Some(&acc) {
                writer.write(acc.clone());
                last = Some(acc.clone());
            }
            let elapsed = started.elapsed();
            if elapsed > interval + OVERRUN_GRACE {
                warn!(
                    task = name,
                    interval_ms = interval.as_millis() as u64,
                    duration_ms = elapsed.as_millis() as u64,
                    "Periodic task ran past its interval"
                );
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = &mut stop => break,
            }
        }
    });
    (handle, eventual)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_never_overlap_and_respect_the_interval() {
        let spans: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::default();
        let spans_in_task = spans.clone();

        let _handle = sequential_timer("test", Duration::from_millis(100), move || {
            let spans = spans_in_task.clone();
            async move {
                let start = Instant::now();
                // A tick deliberately longer than the interval.
                sleep(Duration::from_millis(250)).await;
                spans.lock().unwrap().push((start, Instant::now()));
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let spans = spans.lock().unwrap();
        assert!(spans.len() >= 3);
        for pair in spans.windows(2) {
            // The next tick starts a full interval after the previous one ended.
            assert!(pair[1].0 >= pair[0].1 + Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_tick_does_not_stop_the_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_task = calls.clone();

        let _handle = sequential_timer("test", Duration::from_millis(50), move || {
            let calls = calls_in_task.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_future_ticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_task = calls.clone();

        let handle = sequential_timer("test", Duration::from_millis(50), move || {
            let calls = calls_in_task.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(220)).await;
        drop(handle);
        let at_drop = calls.load(Ordering::SeqCst);
        assert!(at_drop >= 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        // At most the tick that was in flight when the handle dropped.
        assert!(calls.load(Ordering::SeqCst) <= at_drop + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn map_surfaces_the_latest_value_and_keeps_it_on_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_task = calls.clone();

        let (_handle, values) =
            sequential_timer_map("test", Duration::from_millis(50), move || {
                let calls = calls_in_task.clone();
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 => Ok(7u64),
                        1 => anyhow::bail!("upstream hiccup"),
                        _ => Ok(11u64),
                    }
                }
            });

        assert_eq!(values.value().await.unwrap(), 7);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(values.value().await.unwrap(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn reduce_folds_the_accumulator_across_ticks() {
        let (_handle, totals) =
            sequential_timer_reduce("test", Duration::from_millis(50), 0u64, |acc| async move {
                acc + 1
            });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let total = totals.value().await.unwrap();
        assert!(total >= 5);
    }
}
