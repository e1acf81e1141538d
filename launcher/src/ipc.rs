//! Consumer side of the log region: trace events written by every hooked
//! process are replayed into the launcher's own subscriber.

use std::ops::ControlFlow;
use std::time::Duration;

use shared::ring::{IpcError, LogRing};
use shared::schedule::{Ticker, Timer};
use shared::{LOG_SHM_NAME, LOG_SHM_SIZE, LOG_WRITER_MUTEX_NAME, RING_BUFFER_SIZE};
use tracing::{debug, error, warn};
use tracing_tunnel::{TracingEvent, TracingEventReceiver};
use windows::core::PCWSTR;
use windows::Win32::Foundation::*;
use windows::Win32::System::Memory::*;
use windows::Win32::System::Threading::CreateMutexW;

pub const POLL_PERIOD: Duration = Duration::from_millis(20);

/// Owns the log region and the lock hooked processes take to write to it.
pub struct IpcConsumer {
    ring: LogRing,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    mapping: HANDLE,
    writer_lock: HANDLE,
}

// SAFETY: moved once into the replay worker; the view and handles are owned
// by this value and usable from any thread.
unsafe impl Send for IpcConsumer {}

impl IpcConsumer {
    /// Create the region and its writer lock, and reset the ring.
    ///
    /// # Safety
    /// Only one consumer may exist per region; the single-instance mutex
    /// guarantees that.
    pub unsafe fn new() -> Result<Self, IpcError> {
        debug!(name = LOG_SHM_NAME, size = LOG_SHM_SIZE, "Creating log region");

        let mutex_name = shared::wide(LOG_WRITER_MUTEX_NAME);
        let writer_lock = CreateMutexW(None, false, PCWSTR(mutex_name.as_ptr()))
            .map_err(|e| IpcError::open(LOG_WRITER_MUTEX_NAME, e))?;

        let region_name = shared::wide(LOG_SHM_NAME);
        let mapping = match CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            None,
            PAGE_READWRITE,
            0,
            LOG_SHM_SIZE as u32,
            PCWSTR(region_name.as_ptr()),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = CloseHandle(writer_lock);
                return Err(IpcError::open(LOG_SHM_NAME, e));
            }
        };

        let view = MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, LOG_SHM_SIZE);
        if view.Value.is_null() {
            let error = windows::core::Error::from_win32();
            let _ = CloseHandle(mapping);
            let _ = CloseHandle(writer_lock);
            return Err(IpcError::open(LOG_SHM_NAME, error));
        }

        Ok(Self {
            ring: LogRing::initialize(view.Value as *mut u8, RING_BUFFER_SIZE as u32),
            view,
            mapping,
            writer_lock,
        })
    }

    /// Take one event. Undecodable records are logged and skipped.
    pub fn poll_event(&mut self) -> Option<TracingEvent> {
        loop {
            match self.ring.pop()? {
                Ok(bytes) => match serde_json::from_slice::<TracingEvent>(&bytes) {
                    Ok(event) => return Some(event),
                    Err(e) => error!(error = %e, len = bytes.len(), "Failed to deserialize event"),
                },
                Err(e) => {
                    error!(error = %e, "Log region corrupt, buffered events discarded");
                    return None;
                }
            }
        }
    }

    pub fn poll_all_events(&mut self) -> Vec<TracingEvent> {
        std::iter::from_fn(|| self.poll_event()).collect()
    }
}

impl Drop for IpcConsumer {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.mapping);
            let _ = CloseHandle(self.writer_lock);
        }
    }
}

/// Replay everything buffered into the local subscriber.
pub fn process_events(consumer: &mut IpcConsumer, receiver: &mut TracingEventReceiver) -> usize {
    let events = consumer.poll_all_events();
    let count = events.len();
    for event in events {
        if let Err(err) = receiver.try_receive(event) {
            warn!(%err, "Received invalid tracing event from hook");
        }
    }
    count
}

/// Replay loop for the log worker. Drains once more after cancellation so
/// a hook's last words are not lost.
pub fn run<T: Timer>(ticker: Ticker<T>, mut consumer: IpcConsumer) -> usize {
    let mut receiver = TracingEventReceiver::default();
    let ticks = ticker.run(|| {
        process_events(&mut consumer, &mut receiver);
        ControlFlow::Continue(())
    });
    process_events(&mut consumer, &mut receiver);
    ticks
}
