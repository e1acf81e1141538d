//! Cooperative background scheduling.
//!
//! Periodic work (liveness probing, config polling, process discovery, trace
//! sampling) runs on a [`Ticker`] owned by a [`Worker`] thread. A shared
//! [`CancellationToken`] stops every ticker promptly: cancelling wakes any
//! thread blocked in [`CancellationToken::wait_timeout`], so shutdown never
//! waits out a full period.

use std::ops::ControlFlow;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cloneable flag that stops every worker holding a clone.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.state.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            self.state.wake.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock()
    }

    /// Block for up to `timeout`. Returns true if cancelled, early or not.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.state.cancelled.lock();
        while !*cancelled {
            if self.state.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// What a ticker waits on between iterations.
pub trait Timer: Send {
    /// Wait one period. Returns false when the ticker should stop.
    fn wait(&mut self, token: &CancellationToken) -> bool;
}

/// Real timer: sleeps one period, cut short by cancellation.
#[derive(Debug, Clone, Copy)]
pub struct SleepTimer {
    period: Duration,
}

impl SleepTimer {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Timer for SleepTimer {
    fn wait(&mut self, token: &CancellationToken) -> bool {
        !token.wait_timeout(self.period)
    }
}

/// Test timer: fires a fixed number of times without sleeping, then reports
/// the ticker as finished.
#[derive(Debug, Clone, Copy)]
pub struct ManualTimer {
    remaining: usize,
}

impl ManualTimer {
    pub fn new(ticks: usize) -> Self {
        Self { remaining: ticks }
    }
}

impl Timer for ManualTimer {
    fn wait(&mut self, token: &CancellationToken) -> bool {
        if token.is_cancelled() || self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Runs a closure once per timer period until it breaks, the timer ends, or
/// the token is cancelled.
pub struct Ticker<T: Timer = SleepTimer> {
    timer: T,
    token: CancellationToken,
}

impl Ticker<SleepTimer> {
    pub fn new(period: Duration, token: CancellationToken) -> Self {
        Self::with_timer(SleepTimer::new(period), token)
    }
}

impl<T: Timer> Ticker<T> {
    pub fn with_timer(timer: T, token: CancellationToken) -> Self {
        Self { timer, token }
    }

    /// Drive `tick` until it returns `Break`. Returns the number of ticks run.
    ///
    /// The first tick runs after the first period, not immediately.
    pub fn run<F>(mut self, mut tick: F) -> usize
    where
        F: FnMut() -> ControlFlow<()>,
    {
        let mut count = 0;
        while self.timer.wait(&self.token) {
            if self.token.is_cancelled() {
                break;
            }
            count += 1;
            if tick().is_break() {
                break;
            }
        }
        count
    }
}

/// A named background thread tied to a cancellation token.
#[derive(Debug)]
pub struct Worker {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    done: mpsc::Receiver<()>,
}

impl Worker {
    pub fn spawn<F>(name: &str, token: CancellationToken, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let (done_tx, done) = mpsc::channel();
        let thread_token = token.clone();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            body(thread_token);
            let _ = done_tx.send(());
        })?;

        debug!(worker = name, "Worker started");
        Ok(Self {
            name: name.to_string(),
            token,
            handle: Some(handle),
            done,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel and join for at most `timeout`.
    ///
    /// Returns false if the thread did not finish in time; it is then
    /// detached and left to observe the token on its own.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.token.cancel();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!(worker = %self.name, "Worker panicked");
                }
                debug!(worker = %self.name, "Worker stopped");
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, ?timeout, "Worker did not stop in time, detaching");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn manual_timer_drives_exact_tick_count() {
        let token = CancellationToken::new();
        let mut seen = 0;
        let ticks = Ticker::with_timer(ManualTimer::new(5), token).run(|| {
            seen += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(ticks, 5);
        assert_eq!(seen, 5);
    }

    #[test]
    fn tick_can_stop_the_ticker() {
        let token = CancellationToken::new();
        let ticks = Ticker::with_timer(ManualTimer::new(100), token).run({
            let mut n = 0;
            move || {
                n += 1;
                if n == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });
        assert_eq!(ticks, 3);
    }

    #[test]
    fn cancellation_from_inside_a_tick_stops_the_next_one() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let ticks = Ticker::with_timer(ManualTimer::new(10), token).run(|| {
            inner.cancel();
            ControlFlow::Continue(())
        });
        assert_eq!(ticks, 1);
    }

    #[test]
    fn cancelled_token_returns_immediately_from_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn worker_shutdown_wakes_a_sleeping_ticker() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let worker = Worker::spawn("test-ticker", CancellationToken::new(), move |token| {
            Ticker::new(Duration::from_secs(60), token).run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            });
        })
        .unwrap();

        assert_eq!(worker.name(), "test-ticker");
        assert!(worker.shutdown(Duration::from_secs(10)));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_shutdown_detaches_a_stuck_thread() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = Worker::spawn("stuck", CancellationToken::new(), move |_token| {
            let _ = release_rx.recv();
        })
        .unwrap();

        assert!(!worker.shutdown(Duration::from_millis(20)));
        let _ = release_tx.send(());
    }
}
