//! Routes the hook's `tracing` output: to the launcher over the log region
//! when it is there, otherwise to a file beside the host executable.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use shared::ring::IpcError;
use shared::HOOK_LOG_FILE_NAME;
use tracing::Subscriber;
use tracing_tunnel::TracingEventSender;

use crate::ipc::IpcProducer;
use crate::log_file;

/// Events that could not be written to the log region. Never reported
/// through the host's own output.
static DROPPED_EVENTS: AtomicU64 = AtomicU64::new(0);

pub fn dropped_events() -> u64 {
    DROPPED_EVENTS.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Launcher,
    File(PathBuf),
    Disabled,
}

/// Subscriber that forwards events to the launcher through shared memory.
///
/// # Safety
/// The launcher must have created and initialized the log region.
pub unsafe fn create_ipc_subscriber() -> Result<impl Subscriber, IpcError> {
    let producer = Mutex::new(IpcProducer::open()?);

    Ok(TracingEventSender::new(move |event| {
        if producer.lock().write_event(&event).is_err() {
            DROPPED_EVENTS.fetch_add(1, Ordering::Relaxed);
        }
    }))
}

fn log_file_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.with_file_name(HOOK_LOG_FILE_NAME))
}

/// Install the process-wide subscriber for the hook. Only the first call has
/// any effect.
pub fn init() -> LogSink {
    if let Ok(subscriber) = unsafe { create_ipc_subscriber() } {
        return match tracing::subscriber::set_global_default(subscriber) {
            Ok(()) => LogSink::Launcher,
            Err(_) => LogSink::Disabled,
        };
    }

    let Some(path) = log_file_path() else {
        return LogSink::Disabled;
    };
    if log_file::install(&path) {
        LogSink::File(path)
    } else {
        LogSink::Disabled
    }
}
