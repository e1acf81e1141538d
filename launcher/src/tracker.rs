//! Decides which running processes get the hook, and when.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use shared::time::Timestamp;
use tracing::debug;

/// Default time a process must have been running before injection, so the
/// loader and the game's own startup are out of the way.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Per-PID injection bookkeeping across scans.
#[derive(Debug)]
pub struct InjectionTracker {
    settle: Duration,
    /// Matching processes waiting out the settle delay, by first sighting.
    pending: HashMap<u32, Timestamp>,
    /// Injected, or failed and not retried while they live.
    done: HashSet<u32>,
}

impl InjectionTracker {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            pending: HashMap::new(),
            done: HashSet::new(),
        }
    }

    /// Feed one scan. Returns the processes due for injection now.
    ///
    /// PIDs missing from the scan are forgotten, so a reused PID is treated
    /// as a new process.
    pub fn observe(
        &mut self,
        processes: &[ProcessEntry],
        now: Timestamp,
        wanted: impl Fn(&str) -> bool,
    ) -> Vec<ProcessEntry> {
        let alive: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        self.pending.retain(|pid, _| alive.contains(pid));
        self.done.retain(|pid| {
            let keep = alive.contains(pid);
            if !keep {
                debug!(pid, "Tracked process exited");
            }
            keep
        });

        let mut due = Vec::new();
        for process in processes {
            if self.done.contains(&process.pid) || !wanted(&process.name) {
                continue;
            }
            let first_seen = *self.pending.entry(process.pid).or_insert(now);
            if now.has_elapsed(first_seen, self.settle) {
                due.push(process.clone());
            }
        }
        due
    }

    /// Record the outcome of an injection attempt; either way the PID is not
    /// attempted again while it lives.
    pub fn finish(&mut self, pid: u32) {
        self.pending.remove(&pid);
        self.done.insert(pid);
    }

    pub fn is_done(&self, pid: u32) -> bool {
        self.done.contains(&pid)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Default for InjectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_DELAY)
    }
}

/// Case-insensitive membership in the process list.
pub fn listed(list: &[String], name: &str) -> bool {
    list.iter().any(|entry| entry.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HZ: i64 = 1_000;

    fn at(seconds: f64) -> Timestamp {
        Timestamp::from_secs_f64(seconds, HZ)
    }

    fn process(pid: u32, name: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            name: name.to_string(),
        }
    }

    fn games() -> Vec<String> {
        vec!["Cuphead.exe".to_string()]
    }

    #[test]
    fn processes_are_injected_after_settling() {
        let mut tracker = InjectionTracker::new(Duration::from_secs(3));
        let scan = [process(10, "cuphead.exe"), process(11, "notepad.exe")];
        let list = games();
        let wanted = |name: &str| listed(&list, name);

        assert!(tracker.observe(&scan, at(0.0), wanted).is_empty());
        assert!(tracker.observe(&scan, at(2.0), wanted).is_empty());
        assert_eq!(tracker.observe(&scan, at(3.0), wanted), [process(10, "cuphead.exe")]);
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn finished_processes_are_not_attempted_again() {
        let mut tracker = InjectionTracker::new(Duration::ZERO);
        let scan = [process(10, "Cuphead.exe")];
        let list = games();

        assert_eq!(tracker.observe(&scan, at(0.0), |n| listed(&list, n)).len(), 1);
        tracker.finish(10);
        assert!(tracker.is_done(10));
        assert!(tracker.observe(&scan, at(1.0), |n| listed(&list, n)).is_empty());
    }

    #[test]
    fn exited_pids_are_forgotten() {
        let mut tracker = InjectionTracker::new(Duration::ZERO);
        let list = games();
        tracker.observe(&[process(10, "Cuphead.exe")], at(0.0), |n| listed(&list, n));
        tracker.finish(10);

        tracker.observe(&[], at(1.0), |n| listed(&list, n));
        assert!(!tracker.is_done(10));

        // Same PID reused by a new instance.
        let due = tracker.observe(&[process(10, "Cuphead.exe")], at(2.0), |n| listed(&list, n));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn settle_clock_restarts_for_a_process_that_left() {
        let mut tracker = InjectionTracker::new(Duration::from_secs(3));
        let list = games();
        let scan = [process(7, "Cuphead.exe")];

        tracker.observe(&scan, at(0.0), |n| listed(&list, n));
        tracker.observe(&[], at(1.0), |n| listed(&list, n));
        assert!(tracker.observe(&scan, at(3.5), |n| listed(&list, n)).is_empty());
        assert_eq!(tracker.observe(&scan, at(6.5), |n| listed(&list, n)).len(), 1);
    }
}
