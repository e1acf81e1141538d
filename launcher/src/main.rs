//! Launcher for the FPS overlay: publishes the overlay configuration, injects
//! the hook into listed games and relays the hook's logs.

#![cfg_attr(not(windows), allow(dead_code))]

mod config_region;
mod hotkey;
mod trace;
mod tracker;

#[cfg(windows)]
mod etw;
#[cfg(windows)]
mod heartbeat;
#[cfg(windows)]
mod inject;
#[cfg(windows)]
mod ipc;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use shared::ini::ConfigError;
use shared::ring::IpcError;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fps-overlay", version, about = "In-game FPS overlay launcher")]
struct Cli {
    /// Directory holding fps_overlay.ini and games.txt. Defaults to the
    /// launcher's own directory.
    #[arg(long, env = "FPS_OVERLAY_DIR")]
    config_dir: Option<PathBuf>,

    /// Hook module to inject. Defaults to fps_hook.dll beside the launcher.
    #[arg(long)]
    hook_dll: Option<PathBuf>,

    /// Milliseconds between process scans.
    #[arg(long, default_value_t = 1000)]
    scan_interval_ms: u64,

    /// Milliseconds a listed process must have run before injection.
    #[arg(long, default_value_t = 3000)]
    settle_ms: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch for listed games and inject the overlay (default).
    Run,
    /// Print the frame rate of a running process from kernel trace events.
    Trace {
        #[arg(long)]
        pid: u32,
    },
    /// Move the overlay of a running launcher to custom coordinates.
    Move {
        #[arg(long, allow_hyphen_values = true)]
        x: i32,
        #[arg(long, allow_hyphen_values = true)]
        y: i32,
    },
    /// Show or hide the overlay of a running launcher.
    Toggle,
}

#[derive(Debug, Error)]
enum LaunchError {
    #[error("another launcher is already running")]
    AlreadyRunning,
    #[error("hook module not found at {0}")]
    HookMissing(PathBuf),
    #[error("cannot locate the launcher directory: {0}")]
    Directory(std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[cfg(windows)]
    #[error(transparent)]
    Trace(#[from] etw::TraceError),
    #[error("failed to start worker: {0}")]
    Spawn(std::io::Error),
    #[cfg(not(windows))]
    #[error("the overlay only runs on Windows")]
    Unsupported,
}

fn init_logging() {
    let default_level = if cfg!(debug_assertions) { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().compact().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        built = env!("BUILD_TIMESTAMP"),
        "FPS Overlay"
    );

    match platform::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Launcher failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use super::{Cli, LaunchError};

    pub fn run(_cli: Cli) -> Result<(), LaunchError> {
        Err(LaunchError::Unsupported)
    }
}

#[cfg(windows)]
mod platform {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::RwLock;
    use shared::config::SharedConfigRecord;
    use shared::ring::IpcError;
    use shared::schedule::{CancellationToken, Ticker, Worker};
    use shared::time::{system_clock, Clock};
    use shared::{CONFIG_FILE_NAME, HOOK_DLL_NAME, INSTANCE_MUTEX_NAME, PROCESS_LIST_FILE_NAME};
    use tracing::{debug, info, warn};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex};

    use super::{Cli, Command, LaunchError};
    use crate::config_region::{self, ConfigRegion, ConfigSync, RecordStore};
    use crate::etw::EtwMonitor;
    use crate::heartbeat::Heartbeat;
    use crate::hotkey::{self, SystemHotkey};
    use crate::inject;
    use crate::ipc::{self, IpcConsumer};
    use crate::tracker::{listed, InjectionTracker};

    const CONFIG_POLL_PERIOD: Duration = Duration::from_secs(1);
    const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

    fn wait_for_enter(prompt: &str) {
        println!("\n{prompt}");
        let mut input = String::new();
        let _ = std::io::stdin().read_line(&mut input);
    }

    pub fn run(cli: Cli) -> Result<(), LaunchError> {
        match cli.command {
            Some(Command::Trace { pid }) => trace(pid),
            Some(Command::Move { x, y }) => {
                let region = unsafe { ConfigRegion::open_existing() }?;
                config_region::set_position(&region, x, y);
                info!(x, y, "Overlay moved");
                Ok(())
            }
            Some(Command::Toggle) => {
                let region = unsafe { ConfigRegion::open_existing() }?;
                let visible = config_region::toggle_visible(&region);
                info!(visible, "Overlay toggled");
                Ok(())
            }
            Some(Command::Run) | None => supervise(&cli),
        }
    }

    fn launcher_dir() -> Result<PathBuf, LaunchError> {
        let exe = std::env::current_exe().map_err(LaunchError::Directory)?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| LaunchError::Directory(std::io::ErrorKind::NotFound.into()))
    }

    /// Named mutex held for the launcher's lifetime.
    struct InstanceLock(HANDLE);

    impl InstanceLock {
        fn acquire() -> Result<Self, LaunchError> {
            let name = shared::wide(INSTANCE_MUTEX_NAME);
            let handle = unsafe { CreateMutexW(None, true, PCWSTR(name.as_ptr())) }
                .map_err(|e| IpcError::open(INSTANCE_MUTEX_NAME, e))?;
            if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
                let _ = unsafe { CloseHandle(handle) };
                return Err(LaunchError::AlreadyRunning);
            }
            Ok(Self(handle))
        }
    }

    impl Drop for InstanceLock {
        fn drop(&mut self) {
            unsafe {
                let _ = ReleaseMutex(self.0);
                let _ = CloseHandle(self.0);
            }
        }
    }

    fn trace(pid: u32) -> Result<(), LaunchError> {
        let monitor = EtwMonitor::start(pid, |readout| {
            println!(
                "{:>6.1} FPS  {:>6.2} ms{}",
                readout.render.fps,
                readout.render.frame_time_ms,
                if readout.vsync { "  [V]" } else { "" }
            );
        })?;
        wait_for_enter("Press Enter to stop tracing...");
        monitor.stop();
        Ok(())
    }

    fn supervise(cli: &Cli) -> Result<(), LaunchError> {
        let _instance = InstanceLock::acquire()?;

        let base = launcher_dir()?;
        let config_dir = cli.config_dir.clone().unwrap_or_else(|| base.clone());
        let dll = cli.hook_dll.clone().unwrap_or_else(|| base.join(HOOK_DLL_NAME));
        if !dll.is_file() {
            return Err(LaunchError::HookMissing(dll));
        }

        // Both regions exist before anything is injected.
        let consumer = unsafe { IpcConsumer::new() }?;
        let region: Arc<dyn RecordStore> = Arc::new(unsafe { ConfigRegion::create(&SharedConfigRecord::default()) }?);
        let mut sync = ConfigSync::load(
            &config_dir.join(CONFIG_FILE_NAME),
            &config_dir.join(PROCESS_LIST_FILE_NAME),
            Arc::clone(&region),
        )?;
        let heartbeat = Heartbeat::start()?;
        let games = sync.games();
        info!(
            config = %config_dir.display(),
            dll = %dll.display(),
            games = games.read().len(),
            "Launcher ready"
        );

        let token = CancellationToken::new();
        let mut workers = Vec::new();
        let mut spawn = |name: &str, body: Box<dyn FnOnce(CancellationToken) + Send>| -> Result<(), LaunchError> {
            let worker = Worker::spawn(name, token.clone(), body).map_err(LaunchError::Spawn)?;
            workers.push(worker);
            Ok(())
        };

        spawn(
            "fps-log-replay",
            Box::new(move |token| {
                ipc::run(Ticker::new(ipc::POLL_PERIOD, token), consumer);
            }),
        )?;

        spawn(
            "fps-config-watch",
            Box::new(move |token| {
                Ticker::new(CONFIG_POLL_PERIOD, token).run(|| {
                    sync.poll();
                    std::ops::ControlFlow::Continue(())
                });
            }),
        )?;

        let store = Arc::clone(&region);
        spawn(
            "fps-hotkey",
            Box::new(move |token| {
                let mut binding = SystemHotkey::default();
                hotkey::run(Ticker::new(hotkey::POLL_PERIOD, token), &mut binding, store.as_ref());
            }),
        )?;

        let scan_period = Duration::from_millis(cli.scan_interval_ms);
        let mut tracker = InjectionTracker::new(Duration::from_millis(cli.settle_ms));
        spawn(
            "fps-injector",
            Box::new(move |token| {
                let clock = system_clock();
                Ticker::new(scan_period, token).run(|| {
                    scan(&mut tracker, &games, &dll, clock.as_ref());
                    std::ops::ControlFlow::Continue(())
                });
            }),
        )?;

        wait_for_enter("Overlay active. Press Enter to exit...");

        info!("Shutting down");
        token.cancel();
        for worker in workers {
            worker.shutdown(WORKER_SHUTDOWN_TIMEOUT);
        }
        // Hooked processes notice on their next probe and go quiet.
        drop(heartbeat);
        info!("Shutdown complete");
        Ok(())
    }

    /// One discovery pass: inject every listed process that has settled.
    fn scan(tracker: &mut InjectionTracker, games: &RwLock<Vec<String>>, dll: &Path, clock: &dyn Clock) {
        let processes = match inject::list_processes() {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "Process scan failed");
                return;
            }
        };

        let due = {
            let games = games.read();
            tracker.observe(&processes, clock.now(), |name| listed(&games, name))
        };

        let module = dll
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| HOOK_DLL_NAME.to_string());
        for process in due {
            if inject::has_module(process.pid, &module) {
                debug!(pid = process.pid, name = %process.name, "Hook already loaded");
            } else if let Err(e) = inject::inject(process.pid, dll) {
                warn!(pid = process.pid, name = %process.name, error = %e, "Injection failed");
            } else {
                info!(pid = process.pid, name = %process.name, "Overlay attached");
            }
            tracker.finish(process.pid);
        }
    }
}
