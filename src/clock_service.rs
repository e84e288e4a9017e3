use std::{
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    broadcast::{Subscribers, Subscription},
    clock_state::ClockState,
    config::SyncConfig,
    time_source::TimeSource,
    wall_clock::WallClock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Cached state is fresh or another fetch is running; no request made.
    Skipped,
    Updated(ClockState),
    /// The request failed; cached state is untouched.
    Failed,
}

#[derive(Debug, Default)]
struct FetchMarks {
    last_attempt: Option<i64>,
    last_success: Option<i64>,
    in_flight: bool,
}

/// Owns the cached clock and its subscribers.
///
/// `fetch` pulls authoritative time, `tick` advances the cache locally, and
/// both push the result to every subscriber. The state lock is held while
/// broadcasting so subscribers observe updates in the order they were made.
pub struct ClockService {
    source: Box<dyn TimeSource>,
    clock: Box<dyn WallClock>,
    sync: SyncConfig,
    state: Mutex<Option<ClockState>>,
    marks: Mutex<FetchMarks>,
    subscribers: Subscribers,
}

impl ClockService {
    pub fn new(
        source: impl TimeSource + 'static,
        clock: impl WallClock + 'static,
        sync: SyncConfig,
    ) -> Self {
        Self {
            source: Box::new(source),
            clock: Box::new(clock),
            sync,
            state: Mutex::new(None),
            marks: Mutex::new(FetchMarks::default()),
            subscribers: Subscribers::default(),
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<ClockState> {
        *lock(&self.state)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Refreshes the cache from the time source unless it was attempted
    /// within the freshness window or a fetch is already running.
    pub fn fetch(&self) -> FetchOutcome {
        let started = self.clock.now_millis();
        {
            let mut marks = lock(&self.marks);
            let has_state = lock(&self.state).is_some();
            let fresh = marks.last_attempt.is_some_and(|at| {
                started.saturating_sub(at) < self.sync.freshness_window_millis()
            });
            if marks.in_flight || (has_state && fresh) {
                debug!(in_flight = marks.in_flight, "skipping time fetch, cache is fresh");
                return FetchOutcome::Skipped;
            }
            marks.in_flight = true;
            marks.last_attempt = Some(started);
        }

        debug!("fetching time from the time API");
        let result = self.source.fetch();
        let finished = self.clock.now_millis();

        let mut marks = lock(&self.marks);
        marks.in_flight = false;
        match result {
            Ok(at) => {
                marks.last_success = Some(finished);
                drop(marks);
                let state = ClockState::synced(at, finished);
                let mut current = lock(&self.state);
                *current = Some(state);
                self.subscribers.broadcast(&state);
                drop(current);
                info!(time = %state.format("%H:%M:%S"), "synchronised with time API");
                FetchOutcome::Updated(state)
            }
            Err(e) => {
                warn!(error = %e, "time fetch failed, keeping cached time");
                FetchOutcome::Failed
            }
        }
    }

    /// Advances the cached clock by the elapsed wall-clock time and pushes it
    /// to subscribers. Triggers a re-sync once the last successful fetch is
    /// older than the drift threshold. Does nothing before the first fetch.
    pub fn tick(&self) -> Option<ClockState> {
        let now = self.clock.now_millis();
        let since_sync = lock(&self.marks)
            .last_success
            .map(|at| now.saturating_sub(at));

        let advanced = {
            let mut current = lock(&self.state);
            let state = (*current)?.advanced_to(now);
            *current = Some(state);
            if !self.subscribers.is_empty() {
                self.subscribers.broadcast(&state);
            }
            state
        };

        if since_sync.is_some_and(|elapsed| elapsed > self.sync.drift_resync_millis()) {
            debug!(since_sync_ms = ?since_sync, "local clock ran too long, forcing re-sync");
            self.fetch();
        }
        Some(advanced)
    }

    /// Registers a subscriber. If a state exists it is queued immediately so
    /// the subscriber does not wait for the next tick.
    pub fn subscribe(&self) -> Subscription {
        let current = lock(&self.state);
        self.subscribers.subscribe(*current)
    }

    /// Closes the subscription. Nothing reaches it afterwards, even from a
    /// broadcast that is already in progress.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers.remove(subscription.id());
    }

    /// Runs the initial fetch and spawns the fetch and tick timers.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from spawning a timer thread.
    pub fn start(self: &Arc<Self>) -> io::Result<ClockTasks> {
        self.fetch();
        let mut tasks = ClockTasks::default();
        tasks.spawn("clock-fetch", self.sync.fetch_interval(), Arc::clone(self), |service| {
            service.fetch();
        })?;
        tasks.spawn("clock-tick", self.sync.tick_interval(), Arc::clone(self), |service| {
            service.tick();
        })?;
        info!(
            fetch_interval_secs = self.sync.fetch_interval_secs,
            tick_interval_ms = self.sync.tick_interval_ms,
            "time service initialised"
        );
        Ok(tasks)
    }
}

/// Handles to the periodic timers started by [`ClockService::start`].
#[derive(Default)]
pub struct ClockTasks {
    stops: Vec<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl ClockTasks {
    fn spawn(
        &mut self,
        name: &str,
        interval: Duration,
        service: Arc<ClockService>,
        job: impl Fn(&ClockService) + Send + 'static,
    ) -> io::Result<()> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    job(service.as_ref());
                }
            })?;
        self.stops.push(stop);
        self.handles.push(handle);
        Ok(())
    }

    /// Stops both timers and waits for them to finish their current run.
    pub fn shutdown(self) {
        drop(self.stops);
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("clock timer thread panicked");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
            mpsc::TryRecvError,
        },
        time::Duration,
    };

    use chrono::{NaiveDate, NaiveDateTime};

    use super::*;
    use crate::{error::FetchError, wall_clock::ManualClock};

    const T0: i64 = 1_710_032_398_000;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .and_then(|date| date.and_hms_opt(h, mi, s))
            .unwrap()
    }

    /// Replays queued responses and counts calls. An empty queue fails.
    #[derive(Clone, Default)]
    struct ScriptedSource {
        responses: Arc<Mutex<VecDeque<Result<NaiveDateTime, FetchError>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn push_ok(&self, at: NaiveDateTime) {
            self.responses.lock().unwrap().push_back(Ok(at));
        }

        fn push_err(&self, err: FetchError) {
            self.responses.lock().unwrap().push_back(Err(err));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TimeSource for ScriptedSource {
        fn fetch(&self) -> Result<NaiveDateTime, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Status(503)))
        }
    }

    fn service() -> (ClockService, ScriptedSource, ManualClock) {
        let source = ScriptedSource::default();
        let clock = ManualClock::new(T0);
        let service = ClockService::new(source.clone(), clock.clone(), SyncConfig::default());
        (service, source, clock)
    }

    #[test]
    fn example_scenario_three_ticks() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 3, 10, 1, 59, 58));
        assert!(matches!(service.fetch(), FetchOutcome::Updated(_)));
        for _ in 0..3 {
            clock.advance(Duration::from_secs(1));
            service.tick();
        }
        let state = service.current().unwrap();
        assert_eq!(
            (state.day(), state.hour(), state.minute(), state.seconds()),
            (10, 2, 0, 1)
        );
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn tick_without_state_is_a_noop() {
        let (service, source, clock) = service();
        clock.advance(Duration::from_secs(1));
        assert_eq!(service.tick(), None);
        assert_eq!(service.current(), None);
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn fetch_within_freshness_window_makes_no_call() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 1, 1, 0, 0, 0));
        service.fetch();
        clock.advance(Duration::from_millis(4_999));
        assert_eq!(service.fetch(), FetchOutcome::Skipped);
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn fetch_after_freshness_window_replaces_state() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 1, 1, 0, 0, 0));
        source.push_ok(at(2024, 1, 1, 0, 0, 30));
        service.fetch();
        clock.advance(Duration::from_secs(5));
        let FetchOutcome::Updated(state) = service.fetch() else {
            panic!("expected a fresh fetch");
        };
        assert_eq!(source.calls(), 2);
        assert_eq!(state.datetime(), at(2024, 1, 1, 0, 0, 30));
        assert_eq!(state.timestamp(), T0 + 5_000);
        assert_eq!(service.current(), Some(state));
    }

    #[test]
    fn fetch_without_state_ignores_window() {
        let (service, source, clock) = service();
        assert_eq!(service.fetch(), FetchOutcome::Failed);
        clock.advance(Duration::from_millis(10));
        source.push_ok(at(2024, 1, 1, 0, 0, 0));
        assert!(matches!(service.fetch(), FetchOutcome::Updated(_)));
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn failed_fetch_keeps_previous_state() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 7, 1, 12, 0, 0));
        service.fetch();
        let before = service.current();
        let sub = service.subscribe();
        assert_eq!(sub.try_recv().map(Some), Ok(before));

        clock.advance(Duration::from_secs(6));
        let body = "not json";
        source.push_err(FetchError::Malformed(
            serde_json::from_str::<serde_json::Value>(body).unwrap_err(),
        ));
        assert_eq!(service.fetch(), FetchOutcome::Failed);
        clock.advance(Duration::from_secs(6));
        source.push_err(FetchError::Status(500));
        assert_eq!(service.fetch(), FetchOutcome::Failed);

        assert_eq!(service.current(), before);
        assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn drift_threshold_forces_exactly_one_resync() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 1, 1, 0, 0, 0));
        service.fetch();

        clock.advance(Duration::from_secs(900));
        service.tick();
        assert_eq!(source.calls(), 1);

        source.push_ok(at(2024, 1, 1, 0, 15, 3));
        clock.advance(Duration::from_secs(1));
        let state = service.tick().unwrap();
        assert_eq!(state.datetime(), at(2024, 1, 1, 0, 15, 1));
        assert_eq!(source.calls(), 2);
        assert_eq!(service.current().unwrap().datetime(), at(2024, 1, 1, 0, 15, 3));

        clock.advance(Duration::from_secs(1));
        service.tick();
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn unreachable_source_is_retried_once_per_window() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 1, 1, 0, 0, 0));
        service.fetch();
        clock.advance(Duration::from_secs(901));
        for _ in 0..4 {
            service.tick();
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(source.calls(), 2);
        clock.advance(Duration::from_secs(2));
        service.tick();
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn late_subscriber_gets_current_state_first() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 3, 10, 1, 59, 58));
        service.fetch();
        let sub = service.subscribe();
        clock.advance(Duration::from_secs(1));
        service.tick();
        assert_eq!(sub.try_recv().unwrap().seconds(), 58);
        assert_eq!(sub.try_recv().unwrap().seconds(), 59);
        assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn early_subscriber_waits_for_first_fetch() {
        let (service, source, _clock) = service();
        let sub = service.subscribe();
        assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));
        source.push_ok(at(2024, 3, 10, 1, 0, 0));
        service.fetch();
        assert_eq!(sub.try_recv().unwrap().hour(), 1);
    }

    #[test]
    fn unsubscribed_channel_gets_nothing_more() {
        let (service, source, clock) = service();
        source.push_ok(at(2024, 3, 10, 1, 0, 0));
        service.fetch();
        let stays = service.subscribe();
        let leaves = service.subscribe();
        assert_eq!(service.subscriber_count(), 2);
        service.unsubscribe(leaves);
        assert_eq!(service.subscriber_count(), 1);
        clock.advance(Duration::from_secs(1));
        service.tick();
        assert_eq!(stays.try_recv().unwrap().seconds(), 0);
        assert_eq!(stays.try_recv().unwrap().seconds(), 1);
    }

    #[test]
    fn timers_run_until_shutdown() {
        let source = ScriptedSource::default();
        source.push_ok(at(2024, 1, 1, 0, 0, 0));
        let sync = SyncConfig {
            tick_interval_ms: 10,
            ..SyncConfig::default()
        };
        let clock = ManualClock::new(T0);
        let service = Arc::new(ClockService::new(source.clone(), clock.clone(), sync));
        let tasks = service.start().unwrap();
        let sub = service.subscribe();
        assert_eq!(sub.recv_timeout(Duration::from_secs(1)).unwrap().seconds(), 0);
        clock.advance(Duration::from_secs(3));
        let mut latest = 0;
        while latest < 3 {
            latest = sub.recv_timeout(Duration::from_secs(1)).unwrap().seconds();
        }
        tasks.shutdown();
        while sub.try_recv().is_ok() {}
        clock.advance(Duration::from_secs(3));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(source.calls(), 1);
    }

    /// Blocks inside `fetch` until released, so a second fetch can run
    /// while the first one is outstanding.
    struct GatedSource {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        calls: Arc<AtomicUsize>,
    }

    impl TimeSource for GatedSource {
        fn fetch(&self) -> Result<NaiveDateTime, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(at(2024, 1, 1, 12, 0, 0))
        }
    }

    #[test]
    fn concurrent_fetch_makes_a_single_call() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = GatedSource {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            calls: Arc::clone(&calls),
        };
        let clock = ManualClock::new(T0);
        let service = Arc::new(ClockService::new(source, clock.clone(), SyncConfig::default()));

        let first = {
            let service = Arc::clone(&service);
            std::thread::spawn(move || service.fetch())
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(service.fetch(), FetchOutcome::Skipped);
        assert_eq!(service.tick(), None);

        release_tx.send(()).unwrap();
        assert!(matches!(first.join().unwrap(), FetchOutcome::Updated(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(service.current().is_some());
    }
}
