//! Whether this host process should get the overlay at all.

use std::ops::ControlFlow;
use std::time::Duration;

use shared::config::FilterMode;
use shared::filter::{exe_name, is_system_process, ProcessFilter};
use shared::schedule::{Ticker, Timer};
use tracing::debug;

/// Modules whose presence means the host renders with a supported API.
pub const GRAPHICS_MODULES: [&str; 3] = ["d3d11.dll", "dxgi.dll", "d3d9.dll"];

pub const RETRY_PERIOD: Duration = Duration::from_secs(1);
pub const RETRY_ATTEMPTS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    SystemProcess,
    Filtered(FilterMode),
    /// No graphics module loaded yet; the only verdict worth retrying.
    NoGraphicsApi,
}

impl Eligibility {
    pub fn is_final(&self) -> bool {
        !matches!(self, Eligibility::NoGraphicsApi)
    }
}

pub fn check(exe_path: &str, filter: &ProcessFilter, module_loaded: impl Fn(&str) -> bool) -> Eligibility {
    if is_system_process(exe_path) {
        return Eligibility::SystemProcess;
    }
    if !filter.allows(exe_name(exe_path)) {
        return Eligibility::Filtered(filter.mode());
    }
    if !GRAPHICS_MODULES.iter().any(|module| module_loaded(module)) {
        return Eligibility::NoGraphicsApi;
    }
    Eligibility::Eligible
}

/// Check now, then once per tick while the host may still load its graphics
/// API, giving up after `max_retries` ticks.
pub fn wait_for_eligibility<T: Timer>(
    ticker: Ticker<T>,
    max_retries: usize,
    mut check: impl FnMut() -> Eligibility,
) -> Eligibility {
    let mut verdict = check();
    if verdict.is_final() {
        return verdict;
    }

    let mut retries = 0;
    ticker.run(|| {
        retries += 1;
        verdict = check();
        debug!(retries, ?verdict, "Eligibility rechecked");
        if verdict.is_final() || retries >= max_retries {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::schedule::{CancellationToken, ManualTimer};

    const GAME: &str = "D:\\Games\\Hollow Knight\\hollow_knight.exe";

    fn all() -> ProcessFilter {
        ProcessFilter::default()
    }

    #[test]
    fn system_processes_are_rejected_first() {
        let verdict = check("C:\\Windows\\System32\\notepad.exe", &all(), |_| true);
        assert_eq!(verdict, Eligibility::SystemProcess);
        assert!(verdict.is_final());
    }

    #[test]
    fn filter_is_applied_to_the_executable_name() {
        let whitelist = ProcessFilter::new(FilterMode::Whitelist, vec!["HOLLOW_KNIGHT.EXE".into()]);
        assert_eq!(check(GAME, &whitelist, |_| true), Eligibility::Eligible);

        let blacklist = ProcessFilter::new(FilterMode::Blacklist, vec!["hollow_knight.exe".into()]);
        assert_eq!(
            check(GAME, &blacklist, |_| true),
            Eligibility::Filtered(FilterMode::Blacklist)
        );
    }

    #[test]
    fn a_graphics_module_must_be_loaded() {
        assert_eq!(check(GAME, &all(), |_| false), Eligibility::NoGraphicsApi);
        assert_eq!(check(GAME, &all(), |m| m == "d3d9.dll"), Eligibility::Eligible);
    }

    #[test]
    fn late_api_loading_is_waited_for() {
        let mut calls = 0;
        let ticker = Ticker::with_timer(ManualTimer::new(100), CancellationToken::new());
        let verdict = wait_for_eligibility(ticker, RETRY_ATTEMPTS, || {
            calls += 1;
            check(GAME, &all(), |_| calls >= 4)
        });

        assert_eq!(verdict, Eligibility::Eligible);
        assert_eq!(calls, 4);
    }

    #[test]
    fn retries_are_bounded() {
        let mut calls = 0;
        let ticker = Ticker::with_timer(ManualTimer::new(100), CancellationToken::new());
        let verdict = wait_for_eligibility(ticker, RETRY_ATTEMPTS, || {
            calls += 1;
            Eligibility::NoGraphicsApi
        });

        assert_eq!(verdict, Eligibility::NoGraphicsApi);
        assert_eq!(calls, 1 + RETRY_ATTEMPTS);
    }

    #[test]
    fn final_verdicts_are_not_retried() {
        let mut calls = 0;
        let ticker = Ticker::with_timer(ManualTimer::new(100), CancellationToken::new());
        let verdict = wait_for_eligibility(ticker, RETRY_ATTEMPTS, || {
            calls += 1;
            Eligibility::SystemProcess
        });

        assert_eq!(verdict, Eligibility::SystemProcess);
        assert_eq!(calls, 1);
    }
}
