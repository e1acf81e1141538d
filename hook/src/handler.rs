//! Per-call logic of the presentation hooks, independent of any graphics API.
//!
//! The `extern "system"` shims in `present` borrow the host's COM object and
//! call [`PresentHandler::on_present`] or [`PresentHandler::on_resize`] with a
//! closure that forwards to the trampoline. Everything between entry and
//! forwarding runs inside [`fault_barrier`]; a fault flips the shared
//! [`RenderSwitch`] off and the host call proceeds untouched.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared::config::DisplaySettings;
use shared::frame::{
    DisplayRateEstimator, FrameCounter, FrameReadout, RenderRateEstimator, SmoothingPolicy,
};
use shared::time::Clock;
use thiserror::Error;
use tracing::{error, info};

use crate::config::ConfigSource;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("failed to bind renderer: {0}")]
    Bind(String),
    #[error("failed to create {0}: {1}")]
    Resource(&'static str, String),
    #[error("draw failed: {0}")]
    Draw(String),
    #[error("panicked: {0}")]
    Panic(String),
}

impl OverlayError {
    pub fn resource(what: &'static str, err: impl ToString) -> Self {
        Self::Resource(what, err.to_string())
    }
}

/// Process-wide kill switch for all overlay work. Redirections stay in place
/// when it is off; the shims only forward.
#[derive(Clone, Debug)]
pub struct RenderSwitch {
    enabled: Arc<AtomicBool>,
}

impl RenderSwitch {
    pub fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn rendering off for good. Only the first caller's reason is logged.
    pub fn disable(&self, reason: &dyn std::fmt::Display) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            error!(%reason, "Overlay rendering disabled");
        }
    }

    /// Turn rendering off without treating it as a fault.
    pub fn stop(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            info!("Overlay rendering stopped");
        }
    }
}

impl Default for RenderSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f`, converting a panic into [`OverlayError::Panic`].
///
/// Hardware exceptions (access violations) are not Rust panics and are not
/// caught here.
pub fn fault_barrier<T>(f: impl FnOnce() -> Result<T, OverlayError>) -> Result<T, OverlayError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(OverlayError::Panic(panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What the hooks need from an API-specific overlay.
pub trait OverlayRenderer: Send {
    /// The host object passed to the hooked call (swap chain or device).
    type Target;

    fn is_bound(&self) -> bool;

    /// Create device resources from the host's own object. Called once,
    /// on the first presentation.
    fn bind(&mut self, target: &Self::Target) -> Result<(), OverlayError>;

    /// Monitor refresh rate, queried once after binding.
    fn refresh_rate(&mut self, _target: &Self::Target) -> Option<u32> {
        None
    }

    /// Native present counter, if the API exposes one right now.
    fn present_count(&mut self, _target: &Self::Target) -> Option<u32> {
        None
    }

    /// Effective VSync interval. APIs whose presentation call does not carry
    /// one report it from cached device state.
    fn sync_interval(&mut self, _target: &Self::Target, reported: u32) -> u32 {
        reported
    }

    fn draw(
        &mut self,
        target: &Self::Target,
        readout: &FrameReadout,
        settings: &DisplaySettings,
    ) -> Result<(), OverlayError>;

    /// Drop every reference to the host's back buffers.
    fn release_targets(&mut self);

    /// Rebuild back-buffer views after the host recreated its buffers.
    fn recreate_targets(&mut self, target: &Self::Target) -> Result<(), OverlayError>;
}

/// Shared per-hook state: the renderer, the frame counter and the switch.
pub struct PresentHandler<R: OverlayRenderer> {
    renderer: Mutex<R>,
    counter: Mutex<FrameCounter>,
    last_readout: Mutex<FrameReadout>,
    update_interval: Duration,
    switch: RenderSwitch,
    clock: Arc<dyn Clock>,
    config: Arc<dyn ConfigSource>,
}

impl<R: OverlayRenderer> PresentHandler<R> {
    pub fn new(
        renderer: R,
        switch: RenderSwitch,
        clock: Arc<dyn Clock>,
        config: Arc<dyn ConfigSource>,
        update_interval: Duration,
    ) -> Self {
        Self {
            renderer: Mutex::new(renderer),
            counter: Mutex::new(FrameCounter::new(
                RenderRateEstimator::new(update_interval, SmoothingPolicy::Latest),
                DisplayRateEstimator::new(None),
            )),
            last_readout: Mutex::new(FrameReadout::default()),
            update_interval,
            switch,
            clock,
            config,
        }
    }

    pub fn switch(&self) -> &RenderSwitch {
        &self.switch
    }

    /// Estimates produced by the most recent presentation.
    pub fn last_readout(&self) -> FrameReadout {
        *self.last_readout.lock()
    }

    /// Handle one presentation call, then forward it.
    ///
    /// `forward` always runs exactly once and its result is returned as is.
    pub fn on_present<T>(&self, target: &R::Target, sync_interval: u32, forward: impl FnOnce() -> T) -> T {
        if self.switch.is_enabled() {
            if let Err(e) = fault_barrier(|| self.frame(target, sync_interval)) {
                self.switch.disable(&e);
            }
        }
        forward()
    }

    /// Straddle a buffer-recreation call: release views, forward, recreate.
    ///
    /// Views are released even when rendering is disabled so the host's
    /// resize never fails on our references.
    pub fn on_resize<T>(&self, target: &R::Target, forward: impl FnOnce() -> T) -> T {
        let mut renderer = self.renderer.lock();
        if let Err(e) = fault_barrier(|| {
            renderer.release_targets();
            Ok(())
        }) {
            self.switch.disable(&e);
        }

        let result = forward();

        if self.switch.is_enabled() && renderer.is_bound() {
            if let Err(e) = fault_barrier(|| renderer.recreate_targets(target)) {
                self.switch.disable(&e);
            }
        }
        result
    }

    fn frame(&self, target: &R::Target, reported_sync: u32) -> Result<(), OverlayError> {
        // A resize in progress owns the renderer; skip this frame entirely.
        let Some(mut renderer) = self.renderer.try_lock() else {
            return Ok(());
        };

        if !renderer.is_bound() {
            renderer.bind(target)?;
            let refresh_rate = renderer.refresh_rate(target);
            info!(?refresh_rate, "Overlay renderer bound");
            *self.counter.lock() = FrameCounter::new(
                RenderRateEstimator::new(self.update_interval, SmoothingPolicy::Latest),
                DisplayRateEstimator::new(refresh_rate),
            );
        }

        let now = self.clock.now();
        let sync_interval = renderer.sync_interval(target, reported_sync);
        let wants_native = self.counter.lock().wants_native_sample(now);
        let present_count = if wants_native {
            renderer.present_count(target)
        } else {
            None
        };
        let readout = self
            .counter
            .lock()
            .record_present(now, sync_interval, present_count);
        *self.last_readout.lock() = readout;

        let settings = self.config.display();
        if settings.enabled && settings.visible {
            renderer.draw(target, &readout, &settings)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use shared::time::ManualClock;

    const HZ: i64 = 10_000_000;

    /// Stand-in for a host swap chain.
    struct FakeSwapChain;

    #[derive(Default)]
    struct FakeRenderer {
        log: Arc<Mutex<Vec<String>>>,
        bound: bool,
        view: Option<u32>,
        generation: u32,
        panic_on_draw: bool,
        fail_draw: bool,
        present_count: Option<u32>,
    }

    impl FakeRenderer {
        fn push(&self, entry: impl Into<String>) {
            self.log.lock().push(entry.into());
        }
    }

    impl OverlayRenderer for FakeRenderer {
        type Target = FakeSwapChain;

        fn is_bound(&self) -> bool {
            self.bound
        }

        fn bind(&mut self, _target: &FakeSwapChain) -> Result<(), OverlayError> {
            self.bound = true;
            self.generation += 1;
            self.view = Some(self.generation);
            self.push("bind");
            Ok(())
        }

        fn refresh_rate(&mut self, _target: &FakeSwapChain) -> Option<u32> {
            Some(60)
        }

        fn present_count(&mut self, _target: &FakeSwapChain) -> Option<u32> {
            self.present_count
        }

        fn draw(
            &mut self,
            _target: &FakeSwapChain,
            readout: &FrameReadout,
            _settings: &DisplaySettings,
        ) -> Result<(), OverlayError> {
            if self.panic_on_draw {
                panic!("device removed");
            }
            if self.fail_draw {
                return Err(OverlayError::Draw("map failed".into()));
            }
            let view = self.view.ok_or_else(|| OverlayError::Draw("stale view".into()))?;
            self.push(format!("draw view={view} fps={}", readout.raw.fps));
            Ok(())
        }

        fn release_targets(&mut self) {
            self.view = None;
            self.push("release");
        }

        fn recreate_targets(&mut self, _target: &FakeSwapChain) -> Result<(), OverlayError> {
            self.generation += 1;
            self.view = Some(self.generation);
            self.push(format!("recreate view={}", self.generation));
            Ok(())
        }
    }

    struct Harness {
        handler: PresentHandler<FakeRenderer>,
        clock: Arc<ManualClock>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn harness(renderer: FakeRenderer) -> Harness {
        let log = renderer.log.clone();
        let clock = Arc::new(ManualClock::new(HZ));
        let handler = PresentHandler::new(
            renderer,
            RenderSwitch::new(),
            clock.clone(),
            Arc::new(StaticConfig::default()),
            Duration::from_millis(200),
        );
        Harness { handler, clock, log }
    }

    impl Harness {
        /// One presentation; returns the forwarded result.
        fn present(&self, args: (u32, u32)) -> (u32, u32) {
            self.clock.advance(Duration::from_micros(16_667));
            let forwarded = Mutex::new(Vec::new());
            let result = self.handler.on_present(&FakeSwapChain, args.0, || {
                forwarded.lock().push(args);
                args
            });
            assert_eq!(*forwarded.lock(), [args], "forwarded exactly once");
            result
        }
    }

    #[test]
    fn binds_once_and_draws_every_frame() {
        let h = harness(FakeRenderer::default());
        for _ in 0..3 {
            h.present((1, 0));
        }
        let log = h.log.lock();
        assert_eq!(log.iter().filter(|l| *l == "bind").count(), 1);
        assert_eq!(log.iter().filter(|l| l.starts_with("draw")).count(), 3);
    }

    #[test]
    fn panic_in_draw_still_forwards_and_silences_the_overlay() {
        let h = harness(FakeRenderer {
            panic_on_draw: true,
            ..FakeRenderer::default()
        });

        assert_eq!(h.present((1, 7)), (1, 7));
        assert!(!h.handler.switch().is_enabled());
        let after_fault = h.log.lock().len();

        for k in 0..5 {
            assert_eq!(h.present((0, k)), (0, k));
        }
        assert_eq!(h.log.lock().len(), after_fault, "no overlay work after a fault");
    }

    #[test]
    fn draw_error_disables_rendering() {
        let h = harness(FakeRenderer {
            fail_draw: true,
            ..FakeRenderer::default()
        });
        h.present((1, 0));
        assert!(!h.handler.switch().is_enabled());
    }

    #[test]
    fn resize_releases_forwards_then_recreates() {
        let h = harness(FakeRenderer::default());
        h.present((1, 0));

        let log = h.log.clone();
        let result = h.handler.on_resize(&FakeSwapChain, || {
            log.lock().push("forward".into());
            0x8876_017C_u32
        });
        assert_eq!(result, 0x8876_017C);
        h.present((1, 0));

        let log = h.log.lock();
        let tail: Vec<&str> = log.iter().skip(2).map(String::as_str).collect();
        assert_eq!(tail[..3], ["release", "forward", "recreate view=2"]);
        assert!(tail[3].starts_with("draw view=2"), "drew with {}", tail[3]);
    }

    #[test]
    fn resize_after_a_fault_releases_but_does_not_recreate() {
        let h = harness(FakeRenderer::default());
        h.present((1, 0));
        h.handler.switch().disable(&"test");

        let log = h.log.clone();
        h.handler.on_resize(&FakeSwapChain, || log.lock().push("forward".into()));

        let log = h.log.lock();
        assert_eq!(log[log.len() - 2..], ["release", "forward"]);
    }

    #[test]
    fn readout_reflects_recorded_frames() {
        let h = harness(FakeRenderer::default());
        for _ in 0..120 {
            h.present((1, 0));
        }
        let readout = h.handler.last_readout();
        assert!((59..=61).contains(&readout.raw.fps), "fps = {}", readout.raw.fps);
        assert!(readout.vsync);
        assert_eq!(readout.display.fps, 60);
        assert!(!readout.display.is_measured);
    }

    #[test]
    fn native_present_count_is_requested_until_it_answers() {
        let h = harness(FakeRenderer {
            present_count: Some(500),
            ..FakeRenderer::default()
        });
        h.present((0, 0));
        let counter = h.handler.counter.lock();
        assert_eq!(
            counter.display().strategy(),
            shared::frame::DisplayStrategy::Native
        );
    }

    #[test]
    fn fault_barrier_reports_panic_messages() {
        let result: Result<(), _> = fault_barrier(|| panic!("boom {}", 7));
        match result {
            Err(OverlayError::Panic(message)) => assert_eq!(message, "boom 7"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fault_barrier(|| Ok(3)).unwrap(), 3);
    }
}
