//! Frame timestamp ring and the render/display rate estimators built on it.
//!
//! Every presentation call records one [`Timestamp`] into a
//! [`FrameTimestampRing`]. The render rate is a census of the samples inside
//! the last second; the display rate is either measured from the graphics
//! API's own present counter or inferred from the VSync flag and the monitor
//! refresh rate. [`FrameCounter`] bundles the three for callers that hold
//! them behind one lock.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use crate::time::Timestamp;

/// Samples older than this, relative to the newest `now`, are evicted.
pub const RETENTION: Duration = Duration::from_secs(2);

/// Width of the census window the render rate is counted over.
pub const CENSUS_WINDOW: Duration = Duration::from_secs(1);

/// Interval between native present-counter measurements.
pub const NATIVE_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(80);
pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(200);

/// Refresh rate assumed when the monitor query fails or reports nonsense.
pub const FALLBACK_REFRESH_RATE: u32 = 60;

/// Enough room for two seconds at 1000 fps before the deque has to grow.
const INITIAL_CAPACITY: usize = 2048;

/// Time-bounded ring of recent presentation timestamps, newest at the back.
///
/// Not synchronized; callers sharing a ring across threads wrap it (usually
/// as part of a [`FrameCounter`]) in a mutex.
#[derive(Debug, Clone)]
pub struct FrameTimestampRing {
    samples: VecDeque<Timestamp>,
}

impl FrameTimestampRing {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Append `now` and drop everything older than the retention window.
    pub fn record(&mut self, now: Timestamp) {
        self.samples.push_back(now);
        self.evict_before(now);
    }

    /// Drop every sample older than `now - RETENTION`.
    pub fn evict_before(&mut self, now: Timestamp) {
        let cutoff = now.saturating_sub(RETENTION);
        while self.samples.front().is_some_and(|oldest| *oldest < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.samples.front().copied()
    }

    pub fn newest(&self) -> Option<Timestamp> {
        self.samples.back().copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Timestamp> + '_ {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for FrameTimestampRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantaneous render rate over the last census window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RenderSample {
    pub fps: u32,
    /// Delta between the two newest samples in the window.
    pub frame_time_ms: Option<f64>,
}

/// Count the samples at or after `now - 1s`.
///
/// The count is the render rate for that second; the frame time is the gap
/// between the two most recent samples in the window. Fewer than two samples
/// in the window yields `fps == 0` and no frame time.
pub fn compute_render_fps(ring: &FrameTimestampRing, now: Timestamp) -> RenderSample {
    let cutoff = now.saturating_sub(CENSUS_WINDOW);
    let mut window = ring.iter().rev().take_while(|sample| **sample >= cutoff);

    let (Some(newest), Some(previous)) = (window.next(), window.next()) else {
        return RenderSample::default();
    };
    let count = 2 + window.count();

    RenderSample {
        fps: count as u32,
        frame_time_ms: Some(newest.millis_since(*previous).max(0.0)),
    }
}

/// Smoothed render rate, as shown to the user.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RenderRateEstimate {
    pub fps: f32,
    pub frame_time_ms: f32,
}

/// How the smoothed value is derived from raw samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SmoothingPolicy {
    /// Emit the raw census at the moment the interval elapses.
    #[default]
    Latest,
    /// Emit the mean of every raw sample observed since the last emission.
    Mean,
}

/// Rate-limits the raw render census into a displayable value.
///
/// The smoothed value changes at most once per update interval, however
/// often raw samples arrive. The first observation is emitted immediately.
#[derive(Debug, Clone)]
pub struct RenderRateEstimator {
    interval: Duration,
    policy: SmoothingPolicy,
    last_emit: Option<Timestamp>,
    raw: RenderSample,
    smoothed: RenderRateEstimate,
    fps_sum: f64,
    fps_samples: u32,
    frame_time_sum: f64,
    frame_time_samples: u32,
}

impl RenderRateEstimator {
    /// `interval` is clamped to the supported 80–300 ms range.
    pub fn new(interval: Duration, policy: SmoothingPolicy) -> Self {
        Self {
            interval: interval.clamp(MIN_UPDATE_INTERVAL, MAX_UPDATE_INTERVAL),
            policy,
            last_emit: None,
            raw: RenderSample::default(),
            smoothed: RenderRateEstimate::default(),
            fps_sum: 0.0,
            fps_samples: 0,
            frame_time_sum: 0.0,
            frame_time_samples: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Feed a raw sample taken at `now`. Returns true if the smoothed value
    /// was re-emitted.
    pub fn observe(&mut self, raw: RenderSample, now: Timestamp) -> bool {
        self.raw = raw;
        self.fps_sum += raw.fps as f64;
        self.fps_samples += 1;
        if let Some(frame_time) = raw.frame_time_ms {
            self.frame_time_sum += frame_time;
            self.frame_time_samples += 1;
        }

        let due = match self.last_emit {
            None => true,
            Some(previous) => now.has_elapsed(previous, self.interval),
        };
        if !due {
            return false;
        }

        self.smoothed = match self.policy {
            SmoothingPolicy::Latest => RenderRateEstimate {
                fps: raw.fps as f32,
                frame_time_ms: raw.frame_time_ms.unwrap_or(0.0) as f32,
            },
            SmoothingPolicy::Mean => RenderRateEstimate {
                fps: (self.fps_sum / self.fps_samples as f64) as f32,
                frame_time_ms: if self.frame_time_samples == 0 {
                    0.0
                } else {
                    (self.frame_time_sum / self.frame_time_samples as f64) as f32
                },
            },
        };

        self.fps_sum = 0.0;
        self.fps_samples = 0;
        self.frame_time_sum = 0.0;
        self.frame_time_samples = 0;
        self.last_emit = Some(now);
        true
    }

    pub fn raw(&self) -> RenderSample {
        self.raw
    }

    pub fn smoothed(&self) -> RenderRateEstimate {
        self.smoothed
    }
}

impl Default for RenderRateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_INTERVAL, SmoothingPolicy::default())
    }
}

/// Perceived display rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisplayRateEstimate {
    pub fps: u32,
    /// True when measured from the API's present counter rather than
    /// inferred from VSync and refresh rate.
    pub is_measured: bool,
}

/// Which strategy currently feeds the display estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayStrategy {
    /// No present-counter sample has succeeded yet; every call probes again.
    Probing,
    /// The present counter answered once; it is now sampled once a second.
    Native,
}

#[derive(Clone, Copy, Debug)]
struct Baseline {
    present_count: u32,
    at: Timestamp,
}

/// Normalize a monitor refresh rate query result.
pub fn normalize_refresh_rate(queried: Option<u32>) -> u32 {
    match queried {
        Some(rate) if rate > 1 => rate,
        _ => FALLBACK_REFRESH_RATE,
    }
}

/// Infer the display rate from the render rate and VSync state.
///
/// VSync on clamps to the refresh rate. VSync off passes the render rate
/// through uncapped (tearing lets every frame reach the screen in part).
pub fn infer_display_fps(render_fps: u32, sync_interval: u32, refresh_rate: u32) -> u32 {
    if sync_interval > 0 {
        render_fps.min(refresh_rate)
    } else {
        render_fps
    }
}

/// Derives the perceived display rate, preferring the native present counter.
#[derive(Debug, Clone)]
pub struct DisplayRateEstimator {
    refresh_rate: u32,
    baseline: Option<Baseline>,
    measured: Option<u32>,
    sync_interval: u32,
    estimate: DisplayRateEstimate,
}

impl DisplayRateEstimator {
    /// `refresh_rate` is the raw monitor query result, queried once.
    pub fn new(refresh_rate: Option<u32>) -> Self {
        Self {
            refresh_rate: normalize_refresh_rate(refresh_rate),
            baseline: None,
            measured: None,
            sync_interval: 0,
            estimate: DisplayRateEstimate::default(),
        }
    }

    pub fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    pub fn strategy(&self) -> DisplayStrategy {
        if self.baseline.is_some() {
            DisplayStrategy::Native
        } else {
            DisplayStrategy::Probing
        }
    }

    pub fn vsync_enabled(&self) -> bool {
        self.sync_interval > 0
    }

    /// Whether the caller should query the present counter on this call.
    ///
    /// Always true until the first successful query, then only once the
    /// native sample period has passed since the baseline.
    pub fn wants_native_sample(&self, now: Timestamp) -> bool {
        match self.baseline {
            None => true,
            Some(baseline) => now.has_elapsed(baseline.at, NATIVE_SAMPLE_PERIOD),
        }
    }

    /// Re-evaluate for one presentation call.
    ///
    /// `present_count` is the native counter if it was queried and succeeded.
    pub fn update(
        &mut self,
        render_fps: u32,
        sync_interval: u32,
        present_count: Option<u32>,
        now: Timestamp,
    ) -> DisplayRateEstimate {
        self.sync_interval = sync_interval;
        if let Some(count) = present_count {
            self.observe_present_count(count, now);
        }

        self.estimate = match self.measured {
            Some(fps) => DisplayRateEstimate {
                fps,
                is_measured: true,
            },
            None => DisplayRateEstimate {
                fps: infer_display_fps(render_fps, sync_interval, self.refresh_rate),
                is_measured: false,
            },
        };
        self.estimate
    }

    pub fn estimate(&self) -> DisplayRateEstimate {
        self.estimate
    }

    fn observe_present_count(&mut self, count: u32, now: Timestamp) {
        let Some(baseline) = self.baseline else {
            debug!(present_count = count, "Present counter available, baseline stored");
            self.baseline = Some(Baseline {
                present_count: count,
                at: now,
            });
            return;
        };

        if !now.has_elapsed(baseline.at, NATIVE_SAMPLE_PERIOD) {
            return;
        }

        let elapsed = now.seconds_since(baseline.at);
        let presented = count.wrapping_sub(baseline.present_count);
        self.measured = Some((presented as f64 / elapsed) as u32);
        self.baseline = Some(Baseline {
            present_count: count,
            at: now,
        });
    }
}

/// Everything a presentation call produces for the overlay.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameReadout {
    pub raw: RenderSample,
    pub render: RenderRateEstimate,
    pub display: DisplayRateEstimate,
    pub vsync: bool,
}

/// Ring plus both estimators, updated together under one lock.
#[derive(Debug, Clone)]
pub struct FrameCounter {
    ring: FrameTimestampRing,
    render: RenderRateEstimator,
    display: DisplayRateEstimator,
}

impl FrameCounter {
    pub fn new(render: RenderRateEstimator, display: DisplayRateEstimator) -> Self {
        Self {
            ring: FrameTimestampRing::new(),
            render,
            display,
        }
    }

    pub fn wants_native_sample(&self, now: Timestamp) -> bool {
        self.display.wants_native_sample(now)
    }

    /// Record one presentation at `now` and refresh every estimate.
    pub fn record_present(
        &mut self,
        now: Timestamp,
        sync_interval: u32,
        present_count: Option<u32>,
    ) -> FrameReadout {
        self.ring.record(now);
        self.refresh(now, sync_interval, present_count)
    }

    /// Refresh the estimates without recording, for sources whose samples
    /// arrive on another thread.
    pub fn sample(&mut self, now: Timestamp) -> FrameReadout {
        self.ring.evict_before(now);
        let sync_interval = self.display.sync_interval;
        self.refresh(now, sync_interval, None)
    }

    /// Record a timestamp without estimating.
    pub fn record_only(&mut self, at: Timestamp) {
        self.ring.record(at);
    }

    pub fn ring(&self) -> &FrameTimestampRing {
        &self.ring
    }

    pub fn display(&self) -> &DisplayRateEstimator {
        &self.display
    }

    fn refresh(
        &mut self,
        now: Timestamp,
        sync_interval: u32,
        present_count: Option<u32>,
    ) -> FrameReadout {
        let raw = compute_render_fps(&self.ring, now);
        self.render.observe(raw, now);
        let render = self.render.smoothed();
        let display = self.display.update(
            render.fps.round() as u32,
            sync_interval,
            present_count,
            now,
        );

        FrameReadout {
            raw,
            render,
            display,
            vsync: sync_interval > 0,
        }
    }
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new(RenderRateEstimator::default(), DisplayRateEstimator::new(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HZ: i64 = 10_000_000;

    fn at(seconds: f64) -> Timestamp {
        Timestamp::from_secs_f64(seconds, HZ)
    }

    fn ring_of(times: impl IntoIterator<Item = f64>) -> FrameTimestampRing {
        let mut ring = FrameTimestampRing::new();
        for t in times {
            ring.record(at(t));
        }
        ring
    }

    #[test]
    fn ring_never_retains_samples_older_than_retention() {
        let mut ring = FrameTimestampRing::new();
        let mut t = 0.0;
        // Irregular spacing, including a long stall.
        for step in [0.016, 0.016, 0.5, 0.033, 1.9, 0.001, 0.25, 2.5, 0.016] {
            t += step;
            ring.record(at(t));
            let cutoff = at(t).saturating_sub(RETENTION);
            assert!(ring.iter().all(|sample| *sample >= cutoff));
            assert_eq!(ring.newest(), Some(at(t)));
        }
    }

    #[test]
    fn evicting_without_recording_enforces_retention() {
        let mut ring = ring_of([0.0, 0.5, 1.0]);
        ring.evict_before(at(2.75));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.oldest(), Some(at(1.0)));
    }

    #[test]
    fn fewer_than_two_samples_report_zero() {
        let empty = FrameTimestampRing::new();
        assert_eq!(compute_render_fps(&empty, at(5.0)), RenderSample::default());

        let single = ring_of([5.0]);
        let sample = compute_render_fps(&single, at(5.0));
        assert_eq!(sample.fps, 0);
        assert_eq!(sample.frame_time_ms, None);

        // Two samples, but only one inside the census window.
        let stale = ring_of([3.5, 5.0]);
        let sample = compute_render_fps(&stale, at(5.0));
        assert_eq!(sample.fps, 0);
        assert_eq!(sample.frame_time_ms, None);
    }

    #[test]
    fn sixty_samples_at_sixty_hertz_count_as_sixty_fps() {
        let now = 10.0;
        let ring = ring_of((0..60).rev().map(|k| now - k as f64 * 0.016667));
        let sample = compute_render_fps(&ring, at(now));

        assert!((59..=61).contains(&sample.fps), "fps = {}", sample.fps);
        let frame_time = sample.frame_time_ms.unwrap_or_default();
        assert!((frame_time - 16.667).abs() < 0.01, "frame time = {frame_time}");
    }

    #[test]
    fn census_ignores_samples_outside_the_window() {
        let mut times: Vec<f64> = (0..30).map(|k| 8.0 + k as f64 * 0.02).collect();
        times.extend((0..10).map(|k| 9.5 + k as f64 * 0.05));
        let ring = ring_of(times);
        let sample = compute_render_fps(&ring, at(10.0));
        assert_eq!(sample.fps, 10);
        assert!(sample.frame_time_ms.is_some_and(|ms| (ms - 50.0).abs() < 1e-6));
    }

    #[test]
    fn smoothed_value_changes_at_most_once_per_interval() {
        let interval = Duration::from_millis(200);
        let mut estimator = RenderRateEstimator::new(interval, SmoothingPolicy::Latest);
        let mut ring = FrameTimestampRing::new();
        let mut emissions = Vec::new();
        let mut previous = estimator.smoothed();

        // Ramp the frame rate so raw values change on every call.
        let mut t = 0.0;
        for frame in 0..240 {
            t += 0.004 + frame as f64 * 0.00005;
            ring.record(at(t));
            let raw = compute_render_fps(&ring, at(t));
            let emitted = estimator.observe(raw, at(t));
            if estimator.smoothed() != previous {
                assert!(emitted);
            }
            if emitted {
                emissions.push(t);
            }
            previous = estimator.smoothed();
        }

        assert!(emissions.len() > 3);
        for pair in emissions.windows(2) {
            assert!(pair[1] - pair[0] >= 0.2 - 1e-6, "emissions {pair:?}");
        }
    }

    #[test]
    fn first_observation_is_emitted_immediately() {
        let mut estimator = RenderRateEstimator::default();
        let raw = RenderSample {
            fps: 42,
            frame_time_ms: Some(23.8),
        };
        assert!(estimator.observe(raw, at(1.0)));
        assert_eq!(estimator.smoothed().fps, 42.0);
        assert!(!estimator.observe(RenderSample::default(), at(1.1)));
        assert_eq!(estimator.smoothed().fps, 42.0);
        assert_eq!(estimator.raw(), RenderSample::default());
    }

    #[test]
    fn mean_policy_averages_samples_between_emissions() {
        let mut estimator =
            RenderRateEstimator::new(Duration::from_millis(100), SmoothingPolicy::Mean);
        estimator.observe(RenderSample { fps: 10, frame_time_ms: Some(100.0) }, at(0.0));
        estimator.observe(RenderSample { fps: 20, frame_time_ms: Some(50.0) }, at(0.05));
        estimator.observe(RenderSample { fps: 30, frame_time_ms: None }, at(0.08));
        assert!(estimator.observe(RenderSample { fps: 40, frame_time_ms: Some(25.0) }, at(0.1)));

        let smoothed = estimator.smoothed();
        assert_eq!(smoothed.fps, 30.0);
        assert!((smoothed.frame_time_ms - 37.5).abs() < 1e-4);
    }

    #[test]
    fn update_interval_is_clamped() {
        let fast = RenderRateEstimator::new(Duration::from_millis(5), SmoothingPolicy::Latest);
        let slow = RenderRateEstimator::new(Duration::from_secs(3), SmoothingPolicy::Latest);
        assert_eq!(fast.interval(), MIN_UPDATE_INTERVAL);
        assert_eq!(slow.interval(), MAX_UPDATE_INTERVAL);
    }

    #[test]
    fn vsync_inference_clamps_only_when_enabled() {
        assert_eq!(infer_display_fps(144, 1, 60), 60);
        assert_eq!(infer_display_fps(45, 1, 60), 45);
        assert_eq!(infer_display_fps(144, 0, 60), 144);
        assert_eq!(infer_display_fps(144, 2, 144), 144);
    }

    #[test]
    fn refresh_rate_falls_back_to_sixty() {
        assert_eq!(normalize_refresh_rate(None), 60);
        assert_eq!(normalize_refresh_rate(Some(0)), 60);
        assert_eq!(normalize_refresh_rate(Some(1)), 60);
        assert_eq!(normalize_refresh_rate(Some(165)), 165);
    }

    #[test]
    fn inference_is_used_until_the_present_counter_answers() {
        let mut display = DisplayRateEstimator::new(Some(60));
        let estimate = display.update(144, 1, None, at(0.0));
        assert_eq!(estimate, DisplayRateEstimate { fps: 60, is_measured: false });
        assert_eq!(display.strategy(), DisplayStrategy::Probing);
        assert!(display.wants_native_sample(at(0.01)));
    }

    #[test]
    fn present_counter_baseline_then_measurement() {
        let mut display = DisplayRateEstimator::new(Some(144));

        // First success only stores the baseline.
        let estimate = display.update(90, 0, Some(1_000), at(1.0));
        assert_eq!(estimate, DisplayRateEstimate { fps: 90, is_measured: false });
        assert_eq!(display.strategy(), DisplayStrategy::Native);
        assert!(!display.wants_native_sample(at(1.5)));

        // Too early to measure.
        let estimate = display.update(90, 0, Some(1_045), at(1.5));
        assert!(!estimate.is_measured);

        let estimate = display.update(90, 0, Some(1_120), at(2.0));
        assert_eq!(estimate, DisplayRateEstimate { fps: 120, is_measured: true });

        // Retained between samples.
        let estimate = display.update(30, 1, None, at(2.3));
        assert_eq!(estimate, DisplayRateEstimate { fps: 120, is_measured: true });
        assert!(display.wants_native_sample(at(3.0)));
    }

    #[test]
    fn present_counter_wraparound_is_handled() {
        let mut display = DisplayRateEstimator::new(Some(60));
        display.update(60, 1, Some(u32::MAX - 29), at(0.0));
        let estimate = display.update(60, 1, Some(30), at(1.0));
        assert_eq!(estimate.fps, 60);
    }

    #[test]
    fn frame_counter_combines_ring_and_estimators() {
        let mut counter = FrameCounter::new(
            RenderRateEstimator::new(Duration::from_millis(100), SmoothingPolicy::Latest),
            DisplayRateEstimator::new(Some(60)),
        );

        let mut readout = FrameReadout::default();
        for k in 0..=144 {
            readout = counter.record_present(at(k as f64 / 144.0), 1, None);
        }

        assert!(readout.vsync);
        assert_eq!(readout.raw.fps, 145);
        // Smoothed value lags the raw census by up to one interval.
        assert!(readout.render.fps >= 130.0);
        assert_eq!(readout.display, DisplayRateEstimate { fps: 60, is_measured: false });

        // Samples stop arriving; the background sample drains the window.
        let drained = counter.sample(at(3.5));
        assert_eq!(drained.raw.fps, 0);
        assert!(counter.ring().is_empty());
    }
}
