//! Frame rate of another process without injecting into it: a real-time
//! kernel trace session subscribed to the DXGI provider's present events.
//!
//! The session needs administrator rights. Events are stamped with
//! [`QpcClock`] as the callback receives them, the same clock the sampler
//! reads.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use shared::frame::FrameReadout;
use shared::schedule::{CancellationToken, Ticker, Worker};
use shared::time::{Clock, QpcClock};
use thiserror::Error;
use tracing::{debug, info, warn};
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::ERROR_SUCCESS;
use windows::Win32::System::Diagnostics::Etw::*;

use crate::trace::{run_sampler, TraceSampler, SAMPLE_PERIOD};

const SESSION_NAME: &str = "FpsOverlayTrace";

/// Microsoft-Windows-DXGI.
const DXGI_PROVIDER: GUID = GUID::from_u128(0xCA11C036_0102_4A2D_A6AD_F03CFDACC517);

/// `IDXGISwapChain::Present` start.
const DXGI_PRESENT_EVENT: u16 = 42;

/// Room after the properties block for the session name the system copies
/// back.
const PROPERTIES_TAIL: usize = 512;

/// Raw QPC timestamps in event headers. Flush lag is bounded by the
/// session's one-second flush timer.
const CLIENT_CONTEXT_QPC: u32 = 1;

const FLUSH_TIMER_SECONDS: u32 = 1;

const ENABLE_PROVIDER: u32 = 1;
const LEVEL_INFORMATION: u8 = 4;

/// What `OpenTraceW` returns on failure.
const INVALID_TRACE: u64 = u64::MAX;

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("no high-resolution performance counter")]
    NoCounter,
    #[error("trace session could not start (error {0}); administrator rights are required")]
    Session(u32),
    #[error("DXGI provider could not be enabled (error {0})")]
    Provider(u32),
    #[error("trace session could not be opened for reading")]
    Open,
    #[error("failed to spawn trace thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// `EVENT_TRACE_PROPERTIES` with the trailing name space the API expects,
/// kept 8-byte aligned.
struct Properties {
    buffer: Vec<u64>,
}

impl Properties {
    fn new() -> Self {
        let size = std::mem::size_of::<EVENT_TRACE_PROPERTIES>() + PROPERTIES_TAIL;
        let mut properties = Self {
            buffer: vec![0u64; size.div_ceil(8)],
        };
        let header = properties.as_mut_ptr();
        unsafe {
            (*header).Wnode.BufferSize = size as u32;
            (*header).Wnode.Flags = WNODE_FLAG_TRACED_GUID;
            (*header).Wnode.ClientContext = CLIENT_CONTEXT_QPC;
            (*header).LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
            (*header).FlushTimer = FLUSH_TIMER_SECONDS;
            (*header).LoggerNameOffset = std::mem::size_of::<EVENT_TRACE_PROPERTIES>() as u32;
        }
        properties
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.buffer.as_mut_ptr().cast()
    }
}

/// Controller side: the named real-time session.
struct Session {
    handle: CONTROLTRACE_HANDLE,
}

impl Session {
    fn start(name: &[u16]) -> Result<Self, TraceError> {
        // A session left behind by a crashed run blocks the name.
        let mut stale = Properties::new();
        let _ = unsafe {
            ControlTraceW(
                CONTROLTRACE_HANDLE::default(),
                PCWSTR(name.as_ptr()),
                stale.as_mut_ptr(),
                EVENT_TRACE_CONTROL_STOP,
            )
        };

        let mut properties = Properties::new();
        let mut handle = CONTROLTRACE_HANDLE::default();
        let status = unsafe { StartTraceW(&mut handle, PCWSTR(name.as_ptr()), properties.as_mut_ptr()) };
        if status != ERROR_SUCCESS {
            return Err(TraceError::Session(status.0));
        }

        let session = Self { handle };
        let status = unsafe {
            EnableTraceEx2(
                handle,
                &DXGI_PROVIDER,
                ENABLE_PROVIDER,
                LEVEL_INFORMATION,
                0,
                0,
                0,
                None,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(TraceError::Provider(status.0));
        }

        debug!(session = SESSION_NAME, "Trace session started");
        Ok(session)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut properties = Properties::new();
        let status =
            unsafe { ControlTraceW(self.handle, PCWSTR::null(), properties.as_mut_ptr(), EVENT_TRACE_CONTROL_STOP) };
        if status != ERROR_SUCCESS {
            warn!(status = status.0, "Trace session did not stop cleanly");
        }
    }
}

/// Handed to the event callback through the log file context.
struct Target {
    pid: u32,
    clock: QpcClock,
    sampler: Arc<TraceSampler>,
}

unsafe extern "system" fn on_event(record: *mut EVENT_RECORD) {
    let Some(record) = record.as_ref() else {
        return;
    };
    let Some(target) = (record.UserContext as *const Target).as_ref() else {
        return;
    };
    let header = &record.EventHeader;
    if header.ProcessId != target.pid
        || header.ProviderId != DXGI_PROVIDER
        || header.EventDescriptor.Id != DXGI_PRESENT_EVENT
    {
        return;
    }
    target.sampler.record(&target.clock);
}

/// A running trace of one process. Readings go to the callback given to
/// [`EtwMonitor::start`] until [`EtwMonitor::stop`].
pub struct EtwMonitor {
    session: Session,
    consumer: PROCESSTRACE_HANDLE,
    token: CancellationToken,
    workers: Vec<Worker>,
    sampler: Arc<TraceSampler>,
}

impl EtwMonitor {
    pub fn start<R>(pid: u32, report: R) -> Result<Self, TraceError>
    where
        R: FnMut(&FrameReadout) + Send + 'static,
    {
        let clock = QpcClock::new().ok_or(TraceError::NoCounter)?;
        let sampler = Arc::new(TraceSampler::new(None));
        let mut name = shared::wide(SESSION_NAME);
        let session = Session::start(&name)?;

        // Freed by the consumer thread once ProcessTrace returns.
        let target = Box::into_raw(Box::new(Target {
            pid,
            clock,
            sampler: Arc::clone(&sampler),
        }));

        let mut logfile = EVENT_TRACE_LOGFILEW {
            LoggerName: PWSTR(name.as_mut_ptr()),
            Context: target.cast::<c_void>(),
            ..Default::default()
        };
        logfile.Anonymous1.ProcessTraceMode = PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(on_event);

        let consumer = unsafe { OpenTraceW(&mut logfile) };
        if consumer.Value == INVALID_TRACE {
            drop(unsafe { Box::from_raw(target) });
            return Err(TraceError::Open);
        }

        let token = CancellationToken::new();
        let mut monitor = Self {
            session,
            consumer,
            token: token.clone(),
            workers: Vec::new(),
            sampler: Arc::clone(&sampler),
        };

        let context = target as usize;
        monitor.workers.push(Worker::spawn("fps-trace-consumer", token.clone(), move |_| {
            let status = unsafe { ProcessTrace(&[consumer], None, None) };
            debug!(status = status.0, "Trace consumer finished");
            drop(unsafe { Box::from_raw(context as *mut Target) });
        })?);

        monitor.workers.push(Worker::spawn("fps-trace-sampler", token, move |token| {
            let mut report = report;
            run_sampler(Ticker::new(SAMPLE_PERIOD, token), &sampler, &clock, &mut report);
        })?);

        info!(pid, "Tracing presents");
        Ok(monitor)
    }

    /// Present events matched so far.
    pub fn events(&self) -> u64 {
        self.sampler.events()
    }

    pub fn stop(mut self) {
        self.token.cancel();
        let _ = unsafe { CloseTrace(self.consumer) };
        for worker in std::mem::take(&mut self.workers) {
            worker.shutdown(WORKER_SHUTDOWN_TIMEOUT);
        }
        info!(events = self.events(), "Trace stopped");
        // Dropping the session stops it.
        drop(self.session);
    }
}
