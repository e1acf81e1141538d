//! Frame-rate readings for a process observed from outside, fed by
//! presentation events from the kernel trace session in [`crate::etw`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use shared::frame::{
    DisplayRateEstimator, FrameCounter, FrameReadout, RenderRateEstimator, SmoothingPolicy,
    DEFAULT_UPDATE_INTERVAL,
};
use shared::schedule::{Ticker, Timer};
use shared::time::{Clock, Timestamp};

pub const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// Timestamps arrive on the trace thread; readings are taken on a sampler
/// thread. Both go through one lock.
pub struct TraceSampler {
    counter: Mutex<FrameCounter>,
    events: AtomicU64,
}

impl TraceSampler {
    /// Averages every reading taken inside an update interval, which keeps
    /// the printed value steady at 10 samples a second.
    pub fn new(refresh_rate: Option<u32>) -> Self {
        Self {
            counter: Mutex::new(FrameCounter::new(
                RenderRateEstimator::new(DEFAULT_UPDATE_INTERVAL, SmoothingPolicy::Mean),
                DisplayRateEstimator::new(refresh_rate),
            )),
            events: AtomicU64::new(0),
        }
    }

    /// Count one presentation at the moment it is delivered. Real-time
    /// sessions hand events over in buffer flushes, so header timestamps can
    /// already be outside the census window when the next sample is taken.
    pub fn record(&self, clock: &dyn Clock) {
        self.record_at(clock.now());
    }

    fn record_at(&self, at: Timestamp) {
        self.counter.lock().record_only(at);
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample(&self, now: Timestamp) -> FrameReadout {
        self.counter.lock().sample(now)
    }

    /// Presentation events seen so far.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

/// Sample once per tick, reporting each reading that differs from the last
/// one reported. Returns the number of samples taken.
pub fn run_sampler<T: Timer>(
    ticker: Ticker<T>,
    sampler: &TraceSampler,
    clock: &dyn Clock,
    mut report: impl FnMut(&FrameReadout),
) -> usize {
    let mut last: Option<FrameReadout> = None;
    ticker.run(|| {
        let readout = sampler.sample(clock.now());
        if last.map_or(true, |previous| previous.render != readout.render) {
            report(&readout);
            last = Some(readout);
        }
        ControlFlow::Continue(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::schedule::{CancellationToken, ManualTimer};
    use shared::time::ManualClock;

    const HZ: i64 = 10_000_000;

    #[test]
    fn sixty_events_a_second_read_as_sixty_fps() {
        let sampler = TraceSampler::new(Some(144));
        for frame in 1..=60 {
            sampler.record_at(Timestamp::from_secs_f64(frame as f64 / 60.0, HZ));
        }

        let readout = sampler.sample(Timestamp::from_secs_f64(1.0, HZ));
        assert_eq!(readout.raw.fps, 60);
        assert!((readout.render.fps - 60.0).abs() <= 1.0);
        assert!(!readout.vsync);
        assert_eq!(readout.display.fps, 60);
        assert_eq!(sampler.events(), 60);
    }

    #[test]
    fn readings_decay_once_events_stop() {
        let sampler = TraceSampler::new(None);
        for frame in 1..=30 {
            sampler.record_at(Timestamp::from_secs_f64(frame as f64 / 30.0, HZ));
        }
        assert_eq!(sampler.sample(Timestamp::from_secs_f64(1.0, HZ)).raw.fps, 30);

        let later = sampler.sample(Timestamp::from_secs_f64(5.0, HZ));
        assert_eq!(later.raw.fps, 0);
        assert_eq!(later.raw.frame_time_ms, None);
    }

    #[test]
    fn flushed_batches_count_when_delivered() {
        let sampler = TraceSampler::new(None);
        let clock = ManualClock::new(HZ);

        // Four flushes a second, fifteen presents each.
        for _ in 0..4 {
            clock.advance(Duration::from_millis(250));
            for _ in 0..15 {
                sampler.record(&clock);
            }
        }

        clock.advance(Duration::from_millis(100));
        assert_eq!(sampler.sample(clock.now()).raw.fps, 60);
        assert_eq!(sampler.events(), 60);
    }

    #[test]
    fn sampler_reports_only_changes() {
        let sampler = TraceSampler::new(None);
        let clock = ManualClock::new(HZ);
        let mut reports = Vec::new();

        let ticks = run_sampler(
            Ticker::with_timer(ManualTimer::new(4), CancellationToken::new()),
            &sampler,
            &clock,
            |readout| reports.push(readout.render.fps),
        );

        // Nothing recorded: the first zero reading is reported, repeats are not.
        assert_eq!(ticks, 4);
        assert_eq!(reports, [0.0]);
    }
}
