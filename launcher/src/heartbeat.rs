//! Liveness signal for hooked processes: a named event that stays signalled
//! while the launcher is running.

use shared::ring::IpcError;
use shared::HEARTBEAT_EVENT_NAME;
use tracing::debug;
use windows::core::PCWSTR;
use windows::Win32::Foundation::*;
use windows::Win32::System::Threading::CreateEventW;

/// Hooks see the event vanish when the last handle closes, which happens
/// when this value drops or the launcher dies.
pub struct Heartbeat {
    handle: HANDLE,
}

impl Heartbeat {
    /// Create the event manual-reset and already signalled, so probes never
    /// consume it.
    pub fn start() -> Result<Self, IpcError> {
        let name = shared::wide(HEARTBEAT_EVENT_NAME);
        let handle = unsafe { CreateEventW(None, true, true, PCWSTR(name.as_ptr())) }
            .map_err(|e| IpcError::open(HEARTBEAT_EVENT_NAME, e))?;
        debug!(name = HEARTBEAT_EVENT_NAME, "Heartbeat event created");
        Ok(Self { handle })
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}
