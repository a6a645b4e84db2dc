//! Cycle scheduler: a fixed-interval driver for one long-lived action
//!
//! Each periodic job gets its own scheduler and its own loop task. The loop
//! polls at one-second resolution and invokes the wrapped [`CycleAction`]
//! whenever a full cycle has elapsed since the previous invocation. The
//! next-run marker is advanced before the action is invoked, so a slow or
//! failing action cannot cause a fast re-fire loop.
//!
//! Controls: `pause`/`unpause` gate the loop without interrupting an
//! in-flight action, and `force_run` fires one out-of-band cycle. A cycle
//! can be vetoed by the config's `prevent_cycle_run` hook or by the
//! action's own `prevent_run`; a vetoed cycle is consumed, not retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveTime};
use parking_lot::{Mutex, RwLock};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poll resolution of an enabled scheduler loop.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Poll resolution while the wrapped action reports itself disabled.
const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// A long-lived periodic job driven by a [`CycleScheduler`].
#[async_trait]
pub trait CycleAction: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    /// Disabled actions are polled slowly and never invoked. The interval
    /// marker does not advance while disabled, so re-enabling a due action
    /// fires it on the next poll.
    fn enabled(&self) -> bool {
        true
    }

    /// True while a run is in flight. `force_run` is refused while active.
    fn is_active(&self) -> bool;

    /// Veto for the current cycle. A vetoed cycle is consumed, not retried,
    /// so the next attempt is a full cycle away.
    fn prevent_run(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SchedulerConfig {
    /// Interval between invocations.
    pub cycle_time: Duration,
    /// Offset of the first eligible invocation after `start()`.
    pub initial_delay: Duration,
    /// Clock-of-day gate. When set, cycles only fire inside the window
    /// `[start_time, start_time + cycle_time)`; a cycle falling outside it
    /// is deferred by a full interval.
    pub start_time: Option<NaiveTime>,
    /// Suppress the per-cycle debug line for chatty jobs.
    pub silent: bool,
    /// Caller-supplied veto consulted alongside the action's own
    /// `prevent_run`. Either source returning true skips the cycle while
    /// still consuming it.
    pub prevent_cycle_run: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    /// Start in the paused state.
    pub paused: bool,
}

impl SchedulerConfig {
    pub fn new(cycle_time: Duration) -> Self {
        Self {
            cycle_time,
            initial_delay: Duration::ZERO,
            start_time: None,
            silent: false,
            prevent_cycle_run: None,
            paused: false,
        }
    }
}

pub struct CycleScheduler {
    inner: Arc<Inner>,
    /// Loop task handle; set in start(), taken in stop().
    handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

struct Inner {
    action: Arc<dyn CycleAction>,
    config: SchedulerConfig,
    paused: AtomicBool,
    force: AtomicBool,
    stop: CancellationToken,
    /// Earliest instant the next regular cycle may fire.
    next_run: Mutex<Instant>,
}

impl Inner {
    fn vetoed(&self) -> bool {
        let hooked = self
            .config
            .prevent_cycle_run
            .as_ref()
            .is_some_and(|hook| hook());
        hooked || self.action.prevent_run()
    }
}

impl CycleScheduler {
    pub fn new(action: Arc<dyn CycleAction>, config: SchedulerConfig) -> Self {
        let next_run = Instant::now() + config.initial_delay;
        let paused = config.paused;
        Self {
            inner: Arc::new(Inner {
                action,
                config,
                paused: AtomicBool::new(paused),
                force: AtomicBool::new(false),
                stop: CancellationToken::new(),
                next_run: Mutex::new(next_run),
            }),
            handle: RwLock::new(None),
        }
    }

    /// Spawn the loop task. Calling start on a running scheduler is a no-op.
    pub fn start(&self) {
        let mut slot = self.handle.write();
        if slot.is_some() {
            warn!(job = self.inner.action.name(), "scheduler already started");
            return;
        }
        info!(
            job = self.inner.action.name(),
            cycle_secs = self.inner.config.cycle_time.as_secs(),
            "cycle scheduler started"
        );
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(run_loop(inner)));
    }

    /// Signal the loop to exit and wait for it. An in-flight action finishes
    /// its current run first.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let handle = self.handle.write().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
        info!(job = self.inner.action.name(), "cycle scheduler stopped");
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Request one out-of-band cycle, bypassing the interval and clock-of-day
    /// checks but not the action's veto. Refused while the action is active;
    /// returns whether the request was accepted.
    pub fn force_run(&self) -> bool {
        if self.inner.action.is_active() {
            debug!(
                job = self.inner.action.name(),
                "force run refused; action is active"
            );
            return false;
        }
        self.inner.force.store(true, Ordering::SeqCst);
        true
    }

    /// Time until the next regular cycle becomes eligible.
    pub fn next_cycle_in(&self) -> Duration {
        let next = *self.inner.next_run.lock();
        next.saturating_duration_since(Instant::now())
    }
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        if inner.stop.is_cancelled() {
            break;
        }

        if inner.paused.load(Ordering::SeqCst) {
            tokio::select! {
                _ = inner.stop.cancelled() => break,
                _ = time::sleep(POLL_INTERVAL) => {}
            }
            continue;
        }

        if !inner.action.enabled() {
            tokio::select! {
                _ = inner.stop.cancelled() => break,
                _ = time::sleep(DISABLED_POLL_INTERVAL) => {}
            }
            continue;
        }

        let forced = inner.force.swap(false, Ordering::SeqCst);
        let mut should_run = forced;
        if !should_run {
            let now = Instant::now();
            if now >= *inner.next_run.lock() {
                match inner.config.start_time {
                    Some(start)
                        if !in_window(Local::now().time(), start, inner.config.cycle_time) =>
                    {
                        // Outside the clock-of-day window; consume this cycle
                        // so the window is re-checked one interval from now.
                        *inner.next_run.lock() = now + inner.config.cycle_time;
                    }
                    _ => should_run = true,
                }
            }
        }

        if should_run {
            if inner.vetoed() {
                debug!(job = inner.action.name(), "cycle vetoed; skipping");
                *inner.next_run.lock() = Instant::now() + inner.config.cycle_time;
            } else {
                // Advance before invoking so a long run cannot re-fire early.
                *inner.next_run.lock() = Instant::now() + inner.config.cycle_time;
                if !inner.config.silent {
                    debug!(job = inner.action.name(), forced, "cycle starting");
                }
                if let Err(e) = inner.action.run().await {
                    error!(job = inner.action.name(), "cycle failed: {e:#}");
                }
            }
        }

        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Whether `now` falls inside the window opening at `start` and spanning one
/// cycle, wrapping across midnight.
fn in_window(now: NaiveTime, start: NaiveTime, cycle: Duration) -> bool {
    // Floor to whole minutes in seconds first; num_minutes() truncates
    // toward zero and would count the minute before `start` as minute 0.
    let minutes_since = now
        .signed_duration_since(start)
        .num_seconds()
        .div_euclid(60)
        .rem_euclid(24 * 60);
    let window_minutes = (cycle.as_secs() / 60).max(1) as i64;
    minutes_since < window_minutes
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;

    struct TestAction {
        runs: AtomicUsize,
        active: AtomicBool,
        veto: AtomicBool,
        enabled: AtomicBool,
        fail: AtomicBool,
        stamps: Mutex<Vec<Instant>>,
    }

    impl TestAction {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                active: AtomicBool::new(false),
                veto: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                stamps: Mutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CycleAction for TestAction {
        fn name(&self) -> &str {
            "test_action"
        }

        fn enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn prevent_run(&self) -> bool {
            self.veto.load(Ordering::SeqCst)
        }

        async fn run(&self) -> Result<()> {
            self.stamps.lock().push(Instant::now());
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                bail!("scripted failure");
            }
            Ok(())
        }
    }

    fn scheduler(action: &Arc<TestAction>, config: SchedulerConfig) -> CycleScheduler {
        CycleScheduler::new(Arc::clone(action) as Arc<dyn CycleAction>, config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_runs_are_a_full_cycle_apart() {
        let action = TestAction::new();
        let sched = scheduler(&action, SchedulerConfig::new(Duration::from_secs(10)));
        sched.start();

        time::sleep(Duration::from_secs(35)).await;
        sched.stop().await;

        let runs = action.runs();
        assert!((3..=5).contains(&runs), "expected 3-5 runs, got {runs}");
        let stamps = action.stamps.lock();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_defers_the_first_run() {
        let action = TestAction::new();
        let config = SchedulerConfig {
            initial_delay: Duration::from_secs(60),
            ..SchedulerConfig::new(Duration::from_secs(3600))
        };
        let sched = scheduler(&action, config);
        sched.start();

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(action.runs(), 0);
        time::sleep(Duration::from_secs(40)).await;
        assert_eq!(action.runs(), 1);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_run_fires_once_and_respects_active() {
        let action = TestAction::new();
        let config = SchedulerConfig {
            initial_delay: Duration::from_secs(3600),
            ..SchedulerConfig::new(Duration::from_secs(3600))
        };
        let sched = scheduler(&action, config);
        sched.start();

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(action.runs(), 0);

        assert!(sched.force_run());
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(action.runs(), 1);

        // Consumed; no further runs until the interval elapses.
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(action.runs(), 1);

        action.active.store(true, Ordering::SeqCst);
        assert!(!sched.force_run());
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_veto_consumes_the_cycle() {
        let action = TestAction::new();
        action.veto.store(true, Ordering::SeqCst);
        let sched = scheduler(&action, SchedulerConfig::new(Duration::from_secs(5)));
        sched.start();

        time::sleep(Duration::from_secs(12)).await;
        assert_eq!(action.runs(), 0);
        // The vetoed cycle advanced the interval rather than spinning on it.
        assert!(sched.next_cycle_in() > Duration::ZERO);

        // The veto also holds against a forced run.
        assert!(sched.force_run());
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(action.runs(), 0);

        action.veto.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_secs(7)).await;
        assert!(action.runs() >= 1);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_veto_hook_gates_cycles() {
        let action = TestAction::new();
        let suspended = Arc::new(AtomicBool::new(true));
        let hook = Arc::clone(&suspended);
        let config = SchedulerConfig {
            prevent_cycle_run: Some(Arc::new(move || hook.load(Ordering::SeqCst))),
            ..SchedulerConfig::new(Duration::from_secs(5))
        };
        let sched = scheduler(&action, config);
        sched.start();

        time::sleep(Duration::from_secs(12)).await;
        assert_eq!(action.runs(), 0);
        // The hook consumes cycles the same way the action veto does.
        assert!(sched.next_cycle_in() > Duration::ZERO);

        // And it holds against a forced run.
        assert!(sched.force_run());
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(action.runs(), 0);

        suspended.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_secs(7)).await;
        assert!(action.runs() >= 1);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_action_is_polled_but_never_run() {
        let action = TestAction::new();
        action.enabled.store(false, Ordering::SeqCst);
        let sched = scheduler(&action, SchedulerConfig::new(Duration::from_secs(1)));
        sched.start();

        time::sleep(Duration::from_secs(90)).await;
        assert_eq!(action.runs(), 0);

        // The interval marker did not advance while disabled, so enabling a
        // long-overdue action fires on the next slow poll.
        action.enabled.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_secs(35)).await;
        assert!(action.runs() >= 1);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_gates_new_cycles() {
        let action = TestAction::new();
        let config = SchedulerConfig {
            paused: true,
            ..SchedulerConfig::new(Duration::from_secs(5))
        };
        let sched = scheduler(&action, config);
        sched.start();

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(action.runs(), 0);
        assert!(sched.is_paused());

        sched.unpause();
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(action.runs(), 1);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let action = TestAction::new();
        action.fail.store(true, Ordering::SeqCst);
        let sched = scheduler(&action, SchedulerConfig::new(Duration::from_secs(5)));
        sched.start();

        time::sleep(Duration::from_secs(12)).await;
        assert!(action.runs() >= 2);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outside_the_clock_window_defers_a_full_cycle() {
        let action = TestAction::new();
        // A window opening six hours from now is never entered during the
        // test, regardless of when it runs.
        let start = (Local::now() + chrono::Duration::hours(6)).time();
        let config = SchedulerConfig {
            start_time: Some(start),
            ..SchedulerConfig::new(Duration::from_secs(3600))
        };
        let sched = scheduler(&action, config);
        sched.start();

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(action.runs(), 0);
        assert!(sched.next_cycle_in() > Duration::from_secs(3000));
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_the_loop() {
        let action = TestAction::new();
        let sched = scheduler(&action, SchedulerConfig::new(Duration::from_secs(2)));
        sched.start();
        time::sleep(Duration::from_secs(3)).await;
        sched.stop().await;

        let seen = action.runs();
        assert!(seen >= 1);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(action.runs(), seen);
    }

    #[test]
    fn test_window_predicate() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        let hour = Duration::from_secs(3600);

        assert!(in_window(t(3, 0), t(3, 0), hour));
        assert!(in_window(t(3, 59), t(3, 0), hour));
        assert!(!in_window(t(4, 0), t(3, 0), hour));
        assert!(!in_window(t(2, 59), t(3, 0), hour));

        // Sub-minute offsets do not open the window early.
        let s = |h, m, sec| NaiveTime::from_hms_opt(h, m, sec).unwrap();
        assert!(!in_window(s(2, 59, 30), t(3, 0), hour));
        assert!(in_window(s(3, 0, 30), t(3, 0), hour));

        // The window wraps across midnight.
        let two_hours = Duration::from_secs(7200);
        assert!(in_window(t(23, 30), t(23, 0), two_hours));
        assert!(in_window(t(0, 30), t(23, 0), two_hours));
        assert!(!in_window(t(1, 30), t(23, 0), two_hours));
    }
}
