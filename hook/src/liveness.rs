//! Watches the launcher's heartbeat and silences the overlay once it is gone.

use std::ops::ControlFlow;
use std::time::Duration;

use shared::schedule::{Ticker, Timer};
use tracing::{debug, warn};

use crate::handler::RenderSwitch;

pub const PROBE_PERIOD: Duration = Duration::from_secs(3);
pub const PROBE_WAIT: Duration = Duration::from_millis(100);

/// One check of whether the launcher is still running.
pub trait HeartbeatProbe: Send {
    fn is_alive(&mut self) -> bool;
}

/// Probe on every tick until the heartbeat is lost, the switch is already
/// off, or the ticker is cancelled. Returns the number of probes made.
pub fn monitor<T: Timer>(ticker: Ticker<T>, mut probe: impl HeartbeatProbe, switch: RenderSwitch) -> usize {
    ticker.run(|| {
        if !switch.is_enabled() {
            debug!("Rendering already off, liveness monitor exiting");
            return ControlFlow::Break(());
        }
        if probe.is_alive() {
            return ControlFlow::Continue(());
        }
        warn!("Launcher heartbeat lost");
        switch.stop();
        ControlFlow::Break(())
    })
}

#[cfg(windows)]
pub use event::HeartbeatEvent;

#[cfg(windows)]
mod event {
    use super::{HeartbeatProbe, PROBE_WAIT};
    use shared::HEARTBEAT_EVENT_NAME;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Threading::*;

    /// The launcher's named manual-reset event. Reopened on every probe: a
    /// handle held here would keep the event alive after the launcher exits.
    pub struct HeartbeatEvent {
        name: Vec<u16>,
    }

    impl HeartbeatEvent {
        pub fn new() -> Self {
            Self {
                name: shared::wide(HEARTBEAT_EVENT_NAME),
            }
        }
    }

    impl Default for HeartbeatEvent {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HeartbeatProbe for HeartbeatEvent {
        fn is_alive(&mut self) -> bool {
            unsafe {
                let Ok(handle) = OpenEventW(SYNCHRONIZATION_SYNCHRONIZE, false, PCWSTR(self.name.as_ptr())) else {
                    return false;
                };
                let signalled = WaitForSingleObject(handle, PROBE_WAIT.as_millis() as u32) == WAIT_OBJECT_0;
                let _ = CloseHandle(handle);
                signalled
            }
        }
    }
}
