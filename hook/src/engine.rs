//! Interception engine: owns every installed redirection and enforces the
//! install/enable/disable/teardown order.
//!
//! The patching itself sits behind [`DetourBackend`] so the state machine can
//! be exercised without touching executable memory.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is {0:?}, expected {1:?}")]
    InvalidState(EngineState, EngineState),
    #[error("{name} at {target:#x} is already installed")]
    AlreadyInstalled { name: &'static str, target: usize },
    #[error("no hook installed for {0}")]
    UnknownHook(&'static str),
    #[error("failed to create detour for {name}: {reason}")]
    Create { name: &'static str, reason: String },
    #[error("failed to {action} {name}: {reason}")]
    Toggle {
        name: &'static str,
        action: &'static str,
        reason: String,
    },
}

/// Lifecycle of the engine as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    /// At least one hook is enabled.
    Installed,
    /// Every hook has been disabled; redirections remain allocated.
    Disabled,
    TornDown,
}

/// One platform-level redirection.
pub trait Detour: Send {
    /// Address that calls the original code.
    fn trampoline(&self) -> usize;

    /// # Safety
    /// Rewrites executable code in the running process.
    unsafe fn enable(&mut self) -> Result<(), String>;

    /// # Safety
    /// Rewrites executable code in the running process.
    unsafe fn disable(&mut self) -> Result<(), String>;
}

/// Factory for redirections.
pub trait DetourBackend: Send {
    type Detour: Detour;

    /// # Safety
    /// `target` and `replacement` must be functions with identical ABIs.
    unsafe fn create(&mut self, target: usize, replacement: usize) -> Result<Self::Detour, String>;
}

/// Public state of one entry point's redirection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HookState {
    pub name: &'static str,
    pub target: usize,
    pub trampoline: usize,
    pub installed: bool,
    pub enabled: bool,
}

impl fmt::Debug for HookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookState")
            .field("name", &self.name)
            .field("target", &format_args!("{:#x}", self.target))
            .field("trampoline", &format_args!("{:#x}", self.trampoline))
            .field("installed", &self.installed)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// One redirection to make: the function, its replacement, and the slot the
/// replacement reads its trampoline from.
pub struct Redirect<'a> {
    pub name: &'static str,
    pub target: usize,
    pub replacement: usize,
    pub trampoline: &'a AtomicUsize,
}

struct Entry<D> {
    state: HookState,
    detour: D,
}

pub struct InterceptionEngine<B: DetourBackend> {
    backend: B,
    state: EngineState,
    hooks: Vec<Entry<B::Detour>>,
}

impl<B: DetourBackend> InterceptionEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: EngineState::Uninitialized,
            hooks: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn initialize(&mut self) -> Result<(), EngineError> {
        self.expect_state(&[EngineState::Uninitialized])?;
        self.state = EngineState::Initialized;
        debug!("Interception engine initialized");
        Ok(())
    }

    /// Create a redirection from `target` to `replacement` without enabling
    /// it, and return the trampoline.
    ///
    /// `publish` runs with the trampoline before the function is patched so
    /// the replacement can forward from its very first call.
    ///
    /// # Safety
    /// `target` and `replacement` must be functions with identical ABIs, and
    /// `replacement` must forward to the published trampoline.
    pub unsafe fn install(
        &mut self,
        name: &'static str,
        target: usize,
        replacement: usize,
        publish: impl FnOnce(usize),
    ) -> Result<usize, EngineError> {
        self.expect_state(&[
            EngineState::Initialized,
            EngineState::Installed,
            EngineState::Disabled,
        ])?;
        if self.hooks.iter().any(|entry| entry.state.target == target) {
            return Err(EngineError::AlreadyInstalled { name, target });
        }

        let detour = self
            .backend
            .create(target, replacement)
            .map_err(|reason| EngineError::Create { name, reason })?;
        let trampoline = detour.trampoline();
        publish(trampoline);

        self.hooks.push(Entry {
            state: HookState {
                name,
                target,
                trampoline,
                installed: true,
                enabled: false,
            },
            detour,
        });
        info!(name, target = format_args!("{target:#x}"), "Hook installed");
        Ok(trampoline)
    }

    /// # Safety
    /// Patches live code; the replacement must be ready to run.
    pub unsafe fn enable(&mut self, name: &'static str) -> Result<(), EngineError> {
        let entry = self.entry_mut(name)?;
        if entry.state.enabled {
            return Ok(());
        }
        entry.detour.enable().map_err(|reason| EngineError::Toggle {
            name,
            action: "enable",
            reason,
        })?;
        entry.state.enabled = true;
        self.state = EngineState::Installed;
        debug!(name, "Hook enabled");
        Ok(())
    }

    /// # Safety
    /// Patches live code.
    pub unsafe fn disable(&mut self, name: &'static str) -> Result<(), EngineError> {
        let entry = self.entry_mut(name)?;
        if !entry.state.enabled {
            return Ok(());
        }
        entry.detour.disable().map_err(|reason| EngineError::Toggle {
            name,
            action: "disable",
            reason,
        })?;
        entry.state.enabled = false;
        if self.hooks.iter().all(|entry| !entry.state.enabled) {
            self.state = EngineState::Disabled;
        }
        debug!(name, "Hook disabled");
        Ok(())
    }

    /// Disable every hook, then release them. Hooks that refuse to disable
    /// are leaked rather than freed under a live jump.
    ///
    /// # Safety
    /// No thread may be executing inside a trampoline.
    pub unsafe fn teardown(&mut self) {
        if self.state == EngineState::TornDown {
            return;
        }
        for mut entry in self.hooks.drain(..) {
            if entry.state.enabled {
                if let Err(reason) = entry.detour.disable() {
                    warn!(name = entry.state.name, %reason, "Hook refused to disable, leaking");
                    std::mem::forget(entry.detour);
                    continue;
                }
            }
            drop(entry.detour);
        }
        self.state = EngineState::TornDown;
        info!("Interception engine torn down");
    }

    /// Install and enable a presentation hook together with its
    /// buffer-recreation companion, initializing the engine if needed.
    ///
    /// The companion goes first so a resize never meets a drawing overlay
    /// without its straddle. A companion that cannot be installed is logged
    /// and the presentation hook goes in regardless. When the presentation
    /// hook fails, the companion is disabled again so nothing of the pair
    /// stays live.
    ///
    /// # Safety
    /// Both targets must be live functions whose ABIs match their
    /// replacements, and each replacement must forward through its slot.
    pub unsafe fn install_pair(&mut self, present: Redirect<'_>, companion: Redirect<'_>) -> Result<(), EngineError> {
        if self.state == EngineState::Uninitialized {
            self.initialize()?;
        }

        let companion_result = self
            .install(companion.name, companion.target, companion.replacement, |trampoline| {
                companion.trampoline.store(trampoline, Ordering::Release)
            })
            .and_then(|_| self.enable(companion.name));
        if let Err(e) = &companion_result {
            warn!(error = %e, "Companion hook unavailable, buffer recreation is not straddled");
        }

        let present_result = self
            .install(present.name, present.target, present.replacement, |trampoline| {
                present.trampoline.store(trampoline, Ordering::Release)
            })
            .and_then(|_| self.enable(present.name));
        if present_result.is_err() && companion_result.is_ok() {
            if let Err(e) = self.disable(companion.name) {
                warn!(error = %e, name = companion.name, "Companion left enabled");
            }
        }
        present_result
    }

    pub fn hook(&self, name: &str) -> Option<HookState> {
        self.hooks
            .iter()
            .find(|entry| entry.state.name == name)
            .map(|entry| entry.state)
    }

    pub fn hooks(&self) -> impl Iterator<Item = HookState> + '_ {
        self.hooks.iter().map(|entry| entry.state)
    }

    fn entry_mut(&mut self, name: &'static str) -> Result<&mut Entry<B::Detour>, EngineError> {
        if self.state == EngineState::TornDown {
            return Err(EngineError::InvalidState(self.state, EngineState::Installed));
        }
        self.hooks
            .iter_mut()
            .find(|entry| entry.state.name == name)
            .ok_or(EngineError::UnknownHook(name))
    }

    fn expect_state(&self, allowed: &[EngineState]) -> Result<(), EngineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::InvalidState(self.state, allowed[0]))
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Records every patch operation instead of touching code.
    #[derive(Clone, Default)]
    pub struct FakeBackend {
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_create_for: Option<usize>,
        pub fail_disable: bool,
    }

    pub struct FakeDetour {
        target: usize,
        log: Arc<Mutex<Vec<String>>>,
        fail_disable: bool,
    }

    impl Detour for FakeDetour {
        fn trampoline(&self) -> usize {
            self.target + 0x1000
        }

        unsafe fn enable(&mut self) -> Result<(), String> {
            self.log.lock().push(format!("enable {:#x}", self.target));
            Ok(())
        }

        unsafe fn disable(&mut self) -> Result<(), String> {
            if self.fail_disable {
                return Err("busy".into());
            }
            self.log.lock().push(format!("disable {:#x}", self.target));
            Ok(())
        }
    }

    impl Drop for FakeDetour {
        fn drop(&mut self) {
            self.log.lock().push(format!("free {:#x}", self.target));
        }
    }

    impl DetourBackend for FakeBackend {
        type Detour = FakeDetour;

        unsafe fn create(&mut self, target: usize, _replacement: usize) -> Result<FakeDetour, String> {
            if self.fail_create_for == Some(target) {
                return Err("not patchable".into());
            }
            self.log.lock().push(format!("create {target:#x}"));
            Ok(FakeDetour {
                target,
                log: self.log.clone(),
                fail_disable: self.fail_disable,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeBackend;
    use super::*;

    fn engine(backend: FakeBackend) -> InterceptionEngine<FakeBackend> {
        let mut engine = InterceptionEngine::new(backend);
        engine.initialize().unwrap();
        engine
    }

    #[test]
    fn install_requires_initialization() {
        let mut engine = InterceptionEngine::new(FakeBackend::default());
        let result = unsafe { engine.install("Present", 0x10, 0x20, |_| {}) };
        assert!(matches!(result, Err(EngineError::InvalidState(EngineState::Uninitialized, _))));
    }

    #[test]
    fn trampoline_is_published_before_enable() {
        let backend = FakeBackend::default();
        let log = backend.log.clone();
        let mut engine = engine(backend);

        let mut published = 0;
        let trampoline = unsafe {
            engine.install("Present", 0x10, 0x20, |t| {
                log.lock().push("publish".into());
                published = t;
            })
        }
        .unwrap();
        unsafe { engine.enable("Present") }.unwrap();

        assert_eq!(trampoline, published);
        assert_eq!(*log.lock(), ["create 0x10", "publish", "enable 0x10"]);
        assert_eq!(engine.state(), EngineState::Installed);
        let hook = engine.hook("Present").unwrap();
        assert!(hook.installed && hook.enabled);
    }

    #[test]
    fn installing_the_same_target_twice_patches_once() {
        let backend = FakeBackend::default();
        let log = backend.log.clone();
        let mut engine = engine(backend);

        unsafe { engine.install("Present", 0x10, 0x20, |_| {}) }.unwrap();
        let second = unsafe { engine.install("Present", 0x10, 0x20, |_| {}) };

        assert!(matches!(second, Err(EngineError::AlreadyInstalled { target: 0x10, .. })));
        assert_eq!(log.lock().iter().filter(|l| l.starts_with("create")).count(), 1);
        assert_eq!(engine.hooks().count(), 1);
    }

    #[test]
    fn a_failed_entry_point_leaves_others_alone() {
        let backend = FakeBackend {
            fail_create_for: Some(0x30),
            ..FakeBackend::default()
        };
        let mut engine = engine(backend);

        unsafe { engine.install("Present", 0x10, 0x20, |_| {}) }.unwrap();
        let resize = unsafe { engine.install("ResizeBuffers", 0x30, 0x40, |_| {}) };
        assert!(matches!(resize, Err(EngineError::Create { name: "ResizeBuffers", .. })));

        unsafe { engine.enable("Present") }.unwrap();
        assert!(engine.hook("Present").unwrap().enabled);
        assert!(engine.hook("ResizeBuffers").is_none());
    }

    #[test]
    fn disabling_every_hook_moves_to_disabled() {
        let mut engine = engine(FakeBackend::default());
        unsafe {
            engine.install("Present", 0x10, 0x20, |_| {}).unwrap();
            engine.install("ResizeBuffers", 0x30, 0x40, |_| {}).unwrap();
            engine.enable("Present").unwrap();
            engine.enable("ResizeBuffers").unwrap();
            engine.disable("Present").unwrap();
        }
        assert_eq!(engine.state(), EngineState::Installed);
        unsafe { engine.disable("ResizeBuffers") }.unwrap();
        assert_eq!(engine.state(), EngineState::Disabled);
    }

    #[test]
    fn teardown_disables_before_freeing() {
        let backend = FakeBackend::default();
        let log = backend.log.clone();
        let mut engine = engine(backend);
        unsafe {
            engine.install("Present", 0x10, 0x20, |_| {}).unwrap();
            engine.enable("Present").unwrap();
            engine.teardown();
        }

        assert_eq!(
            *log.lock(),
            ["create 0x10", "enable 0x10", "disable 0x10", "free 0x10"]
        );
        assert_eq!(engine.state(), EngineState::TornDown);
        assert!(matches!(
            unsafe { engine.enable("Present") },
            Err(EngineError::InvalidState(EngineState::TornDown, _))
        ));
    }

    #[test]
    fn pair_installs_companion_first_and_publishes_both() {
        let backend = FakeBackend::default();
        let log = backend.log.clone();
        let mut engine = InterceptionEngine::new(backend);
        let (present_slot, companion_slot) = (AtomicUsize::new(0), AtomicUsize::new(0));

        unsafe {
            engine.install_pair(
                Redirect { name: "Present", target: 0x10, replacement: 0x20, trampoline: &present_slot },
                Redirect { name: "ResizeBuffers", target: 0x30, replacement: 0x40, trampoline: &companion_slot },
            )
        }
        .unwrap();

        assert_eq!(*log.lock(), ["create 0x30", "enable 0x30", "create 0x10", "enable 0x10"]);
        assert_eq!(present_slot.load(Ordering::Acquire), 0x1010);
        assert_eq!(companion_slot.load(Ordering::Acquire), 0x1030);
        assert_eq!(engine.state(), EngineState::Installed);
    }

    #[test]
    fn failed_presentation_hook_disables_its_companion() {
        let backend = FakeBackend {
            fail_create_for: Some(0x10),
            ..FakeBackend::default()
        };
        let mut engine = InterceptionEngine::new(backend);
        let (present_slot, companion_slot) = (AtomicUsize::new(0), AtomicUsize::new(0));

        let result = unsafe {
            engine.install_pair(
                Redirect { name: "Present", target: 0x10, replacement: 0x20, trampoline: &present_slot },
                Redirect { name: "ResizeBuffers", target: 0x30, replacement: 0x40, trampoline: &companion_slot },
            )
        };

        assert!(matches!(result, Err(EngineError::Create { name: "Present", .. })));
        assert_eq!(present_slot.load(Ordering::Acquire), 0);
        assert!(!engine.hook("ResizeBuffers").unwrap().enabled);
        assert_eq!(engine.state(), EngineState::Disabled);
    }

    #[test]
    fn teardown_leaks_hooks_that_refuse_to_disable() {
        let backend = FakeBackend {
            fail_disable: true,
            ..FakeBackend::default()
        };
        let log = backend.log.clone();
        let mut engine = engine(backend);
        unsafe {
            engine.install("Present", 0x10, 0x20, |_| {}).unwrap();
            engine.enable("Present").unwrap();
            engine.teardown();
        }
        assert!(!log.lock().iter().any(|l| l.starts_with("free")));
    }
}
