//! Fallback log file for a hook running without a launcher.
//!
//! Events are handed to a background writer thread, so a render thread that
//! logs never waits on the disk. When the writer falls behind, events are
//! dropped.

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Keeps the writer thread running for the life of the process.
static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Debug-level subscriber writing to `writer` from its own thread. Pending
/// events are flushed when the guard drops.
pub fn subscriber<W>(writer: W) -> (impl Subscriber + Send + Sync, WorkerGuard)
where
    W: Write + Send + 'static,
{
    let (writer, guard) = tracing_appender::non_blocking(writer);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .finish();
    (subscriber, guard)
}

/// Install a global subscriber appending to `path`. False when `path` has no
/// file name or a subscriber is already installed.
pub fn install(path: &Path) -> bool {
    let (Some(directory), Some(file_name)) = (path.parent(), path.file_name()) else {
        return false;
    };
    let (subscriber, guard) = subscriber(tracing_appender::rolling::never(directory, file_name));
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }
    let _ = WRITER_GUARD.set(guard);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::thread::{self, ThreadId};

    use parking_lot::Mutex;

    /// Remembers which thread performed each write.
    #[derive(Clone, Default)]
    struct WritingThreads(Arc<Mutex<Vec<ThreadId>>>);

    impl Write for WritingThreads {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().push(thread::current().id());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn events_are_written_off_the_logging_thread() {
        let threads = WritingThreads::default();
        let (subscriber, guard) = subscriber(threads.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Overlay bound");
            tracing::debug!("Present counter baseline stored");
        });
        drop(guard);

        let caller = thread::current().id();
        let writes = threads.0.lock();
        assert!(!writes.is_empty());
        assert!(writes.iter().all(|id| *id != caller));
    }
}
