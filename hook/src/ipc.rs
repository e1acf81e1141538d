//! Producer side of the log region: the hook's trace events go to the
//! launcher through shared memory.

use shared::ring::{IpcError, LogRing};
use shared::{LOG_SHM_NAME, LOG_SHM_SIZE, LOG_WRITER_MUTEX_NAME};
use tracing_tunnel::TracingEvent;
use windows::core::PCWSTR;
use windows::Win32::Foundation::*;
use windows::Win32::System::Memory::*;
use windows::Win32::System::Threading::*;

/// Longest a render thread may wait for another hooked process to finish
/// writing.
const WRITER_LOCK_TIMEOUT_MS: u32 = 5;

pub struct IpcProducer {
    ring: LogRing,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    mapping: HANDLE,
    /// Every hooked process writes into the same region.
    writer_lock: HANDLE,
}

// SAFETY: moved once into the tracing sender's mutex. The view and handles
// are owned by this value and usable from any thread.
unsafe impl Send for IpcProducer {}

impl IpcProducer {
    /// Open the region and writer lock the launcher created.
    ///
    /// # Safety
    /// The launcher must have initialized the ring header.
    pub unsafe fn open() -> Result<Self, IpcError> {
        let mutex_name = shared::wide(LOG_WRITER_MUTEX_NAME);
        let writer_lock = OpenMutexW(SYNCHRONIZATION_SYNCHRONIZE, false, PCWSTR(mutex_name.as_ptr()))
            .map_err(|e| IpcError::open(LOG_WRITER_MUTEX_NAME, e))?;

        let region_name = shared::wide(LOG_SHM_NAME);
        let mapping = match OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(region_name.as_ptr())) {
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
            ring: LogRing::from_raw(view.Value as *mut u8),
            view,
            mapping,
            writer_lock,
        })
    }

    /// Serialize and append one event. Dropped, not blocked on, when the
    /// ring is full or another writer holds the lock.
    pub fn write_event(&mut self, event: &TracingEvent) -> Result<(), IpcError> {
        let bytes = serde_json::to_vec(event).map_err(|e| IpcError::Serialize(e.to_string()))?;

        unsafe {
            let wait = WaitForSingleObject(self.writer_lock, WRITER_LOCK_TIMEOUT_MS);
            // An abandoned lock still hands over ownership.
            if wait != WAIT_OBJECT_0 && wait != WAIT_ABANDONED {
                return Err(IpcError::Busy);
            }
            let result = self.ring.push(&bytes);
            let _ = ReleaseMutex(self.writer_lock);
            result
        }
    }
}

impl Drop for IpcProducer {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.mapping);
            let _ = CloseHandle(self.writer_lock);
        }
    }
}
