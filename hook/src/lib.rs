//! Injected module that intercepts frame presentation and draws a live FPS
//! readout into the host's back buffer.
//!
//! Loading the module starts a setup thread that checks the host, resolves
//! the presentation entry points and redirects them. From then on every
//! present is timed and annotated until the launcher goes away or something
//! fails, after which the hooks only forward.

pub mod config;
pub mod engine;
pub mod handler;
pub mod liveness;
pub mod locator;
pub mod log_file;
pub mod overlay;
pub mod process;

#[cfg(windows)]
pub mod detour;
#[cfg(windows)]
pub mod ipc;
#[cfg(windows)]
pub mod present;
#[cfg(windows)]
pub mod tracing_layer;

#[cfg(windows)]
pub use entry::{DllMain, FpsOverlayInitialize, FpsOverlayShutdown};

#[cfg(windows)]
mod entry {
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    use parking_lot::Mutex;
    use shared::filter::{split_game_list, ProcessFilter};
    use shared::schedule::{CancellationToken, Ticker, Worker};
    use shared::time::system_clock;
    use tracing::{debug, error, info, warn};
    use windows::core::*;
    use windows::Win32::Foundation::*;
    use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    use crate::config::{self, ConfigSource, SharedConfigView, Supervision};
    use crate::liveness::{self, HeartbeatEvent, PROBE_PERIOD};
    use crate::locator::{attach_first, locate_present_address, module_loaded};
    use crate::present::{self, HookContext};
    use crate::process::{self, Eligibility, RETRY_ATTEMPTS, RETRY_PERIOD};
    use crate::tracing_layer;

    const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

    static STARTED: AtomicBool = AtomicBool::new(false);
    static SHUTDOWN: OnceLock<CancellationToken> = OnceLock::new();
    static WORKERS: Mutex<Vec<Worker>> = Mutex::new(Vec::new());

    fn shutdown_token() -> &'static CancellationToken {
        SHUTDOWN.get_or_init(CancellationToken::new)
    }

    /// # Safety
    /// Called by the Windows loader.
    #[no_mangle]
    pub unsafe extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
        match reason {
            DLL_PROCESS_ATTACH => {
                let _ = DisableThreadLibraryCalls(HMODULE(module.0));
                start();
            }
            // Joining threads here would deadlock on the loader lock.
            DLL_PROCESS_DETACH => stop(false),
            _ => {}
        }
        true.into()
    }

    /// Start the overlay in a host that loaded the module itself. Repeated
    /// calls, and calls after an injection, do nothing.
    #[no_mangle]
    pub extern "system" fn FpsOverlayInitialize() -> BOOL {
        start();
        true.into()
    }

    /// Silence the overlay and stop its threads. The redirections stay in
    /// place and keep forwarding.
    #[no_mangle]
    pub extern "system" fn FpsOverlayShutdown() {
        stop(true);
    }

    fn start() {
        if STARTED.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(worker) = Worker::spawn("fps-overlay-setup", shutdown_token().clone(), setup) {
            WORKERS.lock().push(worker);
        }
    }

    fn stop(join: bool) {
        shutdown_token().cancel();
        if let Some(context) = present::context() {
            context.switch().stop();
        }
        if join {
            let workers = std::mem::take(&mut *WORKERS.lock());
            for worker in workers {
                worker.shutdown(WORKER_SHUTDOWN_TIMEOUT);
            }
        }
    }

    fn open_config() -> (Arc<dyn ConfigSource>, Supervision) {
        config::resolve(unsafe { SharedConfigView::open() }.map(|view| Arc::new(view) as Arc<dyn ConfigSource>))
    }

    fn setup(token: CancellationToken) {
        let sink = tracing_layer::init();
        info!(pid = std::process::id(), ?sink, "Hook loaded");

        let (config, supervision) = open_config();
        let record = config.record();
        let filter = ProcessFilter::new(record.filter_mode(), split_game_list(&record.game_list()));

        let exe = std::env::current_exe()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        let verdict = process::wait_for_eligibility(
            Ticker::new(RETRY_PERIOD, token.clone()),
            RETRY_ATTEMPTS,
            || process::check(&exe, &filter, module_loaded),
        );
        if verdict != Eligibility::Eligible {
            info!(%exe, ?verdict, "Host not eligible, staying dormant");
            return;
        }
        if token.is_cancelled() {
            return;
        }

        let context = present::init_context(|| HookContext::new(config, Arc::from(system_clock())));
        let (attached, errors) = attach_first(locate_present_address, |points| unsafe { context.install(points) });
        for e in &errors {
            debug!(error = %e, "Generation skipped");
        }
        let Some(points) = attached else {
            error!(failures = errors.len(), "No presentation hook could be installed");
            return;
        };
        info!(generation = ?points.generation, "Presentation hooks active");

        if supervision == Supervision::Standalone {
            info!("No launcher, liveness not monitored");
            return;
        }

        let switch = context.switch().clone();
        match Worker::spawn("fps-overlay-liveness", token, move |token| {
            liveness::monitor(Ticker::new(PROBE_PERIOD, token), HeartbeatEvent::new(), switch);
        }) {
            Ok(worker) => WORKERS.lock().push(worker),
            Err(e) => warn!(error = %e, "Liveness monitor not started"),
        }
    }
}
