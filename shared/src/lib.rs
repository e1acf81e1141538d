//! Shared definitions for the FPS overlay hook and launcher.
//!
//! Everything the injected module and the controlling process must agree on
//! lives here: kernel object names, the log ring-buffer header, the fixed
//! layout configuration record, and the frame timing primitives both sides
//! feed from their own timestamp sources.

pub mod config;
pub mod filter;
pub mod frame;
pub mod ini;
pub mod ring;
pub mod schedule;
pub mod time;
pub mod watch;

use std::sync::atomic::AtomicU32;

/// Shared memory region carrying the hook's trace events to the launcher.
/// Using Local\ namespace to avoid requiring administrator privileges.
pub const LOG_SHM_NAME: &str = "Local\\FpsOverlayLog";

/// Named mutex serializing hook instances that write into the log region.
pub const LOG_WRITER_MUTEX_NAME: &str = "Local\\FpsOverlayLogWriter";

/// Shared memory region holding the [`config::SharedConfigRecord`].
pub const CONFIG_SHM_NAME: &str = "Local\\FpsOverlayConfig";

/// Manual-reset event the launcher holds open while it is alive.
pub const HEARTBEAT_EVENT_NAME: &str = "Local\\FpsOverlayHeartbeat";

/// Single-instance guard for the launcher.
pub const INSTANCE_MUTEX_NAME: &str = "Local\\FpsOverlayLauncher";

/// Size of the log shared memory region (64KB).
pub const LOG_SHM_SIZE: usize = 64 * 1024;

/// Size of the ring buffer header with alignment padding.
/// RingBufferHeader is 12 bytes but aligned to 16 bytes in practice.
pub const HEADER_SIZE: usize = 16;

/// Size of the ring buffer within shared memory (after header).
pub const RING_BUFFER_SIZE: usize = LOG_SHM_SIZE - HEADER_SIZE;

/// Largest serialized trace event accepted by either side of the ring.
pub const MAX_EVENT_SIZE: usize = 8 * 1024;

/// File name of the injected module, expected next to the launcher.
pub const HOOK_DLL_NAME: &str = "fps_hook.dll";

/// Durable overlay configuration, next to the launcher.
pub const CONFIG_FILE_NAME: &str = "fps_overlay.ini";

/// Process list the launcher injects into, next to the launcher.
pub const PROCESS_LIST_FILE_NAME: &str = "games.txt";

/// Side log written by the hook when the launcher's log region is absent.
pub const HOOK_LOG_FILE_NAME: &str = "fps_overlay.log";

/// Ring buffer header at the start of the log region; see [`ring::LogRing`].
#[repr(C)]
pub struct RingBufferHeader {
    pub write_pos: AtomicU32,
    pub read_pos: AtomicU32,
    pub capacity: u32,
}

const _: () = assert!(std::mem::size_of::<RingBufferHeader>() <= HEADER_SIZE);

/// Encode a string as a NUL-terminated UTF-16 buffer for wide Win32 APIs.
pub fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Decode a NUL-terminated (or full) UTF-16 buffer.
pub fn from_wide(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}
