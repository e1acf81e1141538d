//! Global toggle hotkey. Each press flips the overlay's visibility in the
//! shared record; a changed binding in the config is picked up on the fly.

use std::ops::ControlFlow;
use std::time::Duration;

use shared::config::Hotkey;
use shared::schedule::{Ticker, Timer};
use tracing::{info, warn};

use crate::config_region::{toggle_visible, RecordStore};

pub const POLL_PERIOD: Duration = Duration::from_millis(50);

const MOD_ALT: u32 = 0x0001;
const MOD_CONTROL: u32 = 0x0002;
const MOD_SHIFT: u32 = 0x0004;
const MOD_NOREPEAT: u32 = 0x4000;

/// `RegisterHotKey` modifier flags for `hotkey`. Auto-repeat is suppressed
/// so holding the key toggles once.
pub fn modifier_bits(hotkey: &Hotkey) -> u32 {
    let mut bits = MOD_NOREPEAT;
    if hotkey.alt {
        bits |= MOD_ALT;
    }
    if hotkey.ctrl {
        bits |= MOD_CONTROL;
    }
    if hotkey.shift {
        bits |= MOD_SHIFT;
    }
    bits
}

/// System side of the hotkey, bound to the thread that polls it.
pub trait HotkeyBinding {
    fn register(&mut self, hotkey: &Hotkey) -> bool;
    fn unregister(&mut self);
    /// Presses since the last call.
    fn take_presses(&mut self) -> usize;
}

/// Poll presses once per tick until cancelled. Returns the number of ticks.
pub fn run<T: Timer>(ticker: Ticker<T>, binding: &mut dyn HotkeyBinding, store: &dyn RecordStore) -> usize {
    let mut bound: Option<Hotkey> = None;
    let ticks = ticker.run(|| {
        let wanted = store.read().hotkey();
        if bound != Some(wanted) {
            binding.unregister();
            if binding.register(&wanted) {
                info!(hotkey = %wanted, "Toggle hotkey registered");
            } else {
                warn!(hotkey = %wanted, "Toggle hotkey unavailable, another program may own it");
            }
            // A failed binding is not retried until the config changes.
            bound = Some(wanted);
        }

        for _ in 0..binding.take_presses() {
            let visible = toggle_visible(store);
            info!(visible, "Overlay toggled");
        }
        ControlFlow::Continue(())
    });
    binding.unregister();
    ticks
}

#[cfg(windows)]
pub use system::SystemHotkey;

#[cfg(windows)]
mod system {
    use super::{modifier_bits, HotkeyBinding};
    use shared::config::Hotkey;
    use windows::Win32::UI::Input::KeyboardAndMouse::{RegisterHotKey, UnregisterHotKey, HOT_KEY_MODIFIERS};
    use windows::Win32::UI::WindowsAndMessaging::{PeekMessageW, MSG, PM_REMOVE, WM_HOTKEY};

    const HOTKEY_ID: i32 = 1;

    /// Thread-bound registration: `WM_HOTKEY` lands in the registering
    /// thread's queue, so create and poll this on the same worker.
    #[derive(Default)]
    pub struct SystemHotkey {
        registered: bool,
    }

    impl HotkeyBinding for SystemHotkey {
        fn register(&mut self, hotkey: &Hotkey) -> bool {
            let modifiers = HOT_KEY_MODIFIERS(modifier_bits(hotkey));
            self.registered = unsafe { RegisterHotKey(None, HOTKEY_ID, modifiers, hotkey.key) }.is_ok();
            self.registered
        }

        fn unregister(&mut self) {
            if std::mem::take(&mut self.registered) {
                let _ = unsafe { UnregisterHotKey(None, HOTKEY_ID) };
            }
        }

        fn take_presses(&mut self) -> usize {
            let mut presses = 0;
            let mut msg = MSG::default();
            while unsafe { PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE) }.as_bool() {
                if msg.message == WM_HOTKEY && msg.wParam.0 == HOTKEY_ID as usize {
                    presses += 1;
                }
            }
            presses
        }
    }
}
