//! `extern "system"` replacements for the presentation entry points and the
//! context they reach.
//!
//! The shims can only find state through a global, so everything lives in
//! one address-stable [`HookContext`] behind a `OnceLock`. The trampolines are
//! published into the context before the target function is patched, each
//! generation into its own slots.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use shared::frame::DEFAULT_UPDATE_INTERVAL;
use shared::time::Clock;
use windows::core::{Interface, HRESULT};
use windows::Win32::Foundation::E_UNEXPECTED;
use windows::Win32::Graphics::Direct3D9::{IDirect3DDevice9, D3DPRESENT_PARAMETERS};
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT;
use windows::Win32::Graphics::Dxgi::{IDXGISwapChain, DXGI_PRESENT_TEST};

use crate::config::ConfigSource;
use crate::detour::RetourBackend;
use crate::engine::{EngineError, EngineState, InterceptionEngine, Redirect};
use crate::handler::{PresentHandler, RenderSwitch};
use crate::locator::{ApiGeneration, EntryPoints};
use crate::overlay::d3d9::D3d9Overlay;
use crate::overlay::dxgi::DxgiOverlay;

type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT;
type ResizeBuffersFn = unsafe extern "system" fn(*mut c_void, u32, u32, u32, DXGI_FORMAT, u32) -> HRESULT;
type EndSceneFn = unsafe extern "system" fn(*mut c_void) -> HRESULT;
type ResetFn = unsafe extern "system" fn(*mut c_void, *mut D3DPRESENT_PARAMETERS) -> HRESULT;

static CONTEXT: OnceLock<HookContext> = OnceLock::new();

/// Trampoline addresses for one generation's pair of hooks.
#[derive(Default)]
struct Trampolines {
    present: AtomicUsize,
    companion: AtomicUsize,
}

impl Trampolines {
    fn present<F: Copy>(&self) -> F {
        load_fn(&self.present)
    }

    fn companion<F: Copy>(&self) -> F {
        load_fn(&self.companion)
    }
}

/// Everything the installed hooks need, owned in one place.
pub struct HookContext {
    engine: Mutex<InterceptionEngine<RetourBackend>>,
    dxgi: PresentHandler<DxgiOverlay>,
    d3d9: PresentHandler<D3d9Overlay>,
    dxgi_trampolines: Trampolines,
    d3d9_trampolines: Trampolines,
    switch: RenderSwitch,
}

impl HookContext {
    pub fn new(config: Arc<dyn ConfigSource>, clock: Arc<dyn Clock>) -> Self {
        let switch = RenderSwitch::new();
        Self {
            engine: Mutex::new(InterceptionEngine::new(RetourBackend)),
            dxgi: PresentHandler::new(
                DxgiOverlay::default(),
                switch.clone(),
                clock.clone(),
                config.clone(),
                DEFAULT_UPDATE_INTERVAL,
            ),
            d3d9: PresentHandler::new(
                D3d9Overlay::default(),
                switch.clone(),
                clock,
                config,
                DEFAULT_UPDATE_INTERVAL,
            ),
            dxgi_trampolines: Trampolines::default(),
            d3d9_trampolines: Trampolines::default(),
            switch,
        }
    }

    pub fn switch(&self) -> &RenderSwitch {
        &self.switch
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.lock().state()
    }

    /// Redirect one generation's entry points to the shims. On failure
    /// nothing of the generation is left enabled, so another may be tried.
    ///
    /// # Safety
    /// `points` must hold the live addresses of `points.generation`'s
    /// functions in this process.
    pub unsafe fn install(&self, points: EntryPoints) -> Result<(), EngineError> {
        let (present, companion) = points.generation.capabilities();
        let (trampolines, present_shim, companion_shim) = match points.generation {
            ApiGeneration::Dxgi => (
                &self.dxgi_trampolines,
                dxgi_present as PresentFn as usize,
                dxgi_resize_buffers as ResizeBuffersFn as usize,
            ),
            ApiGeneration::D3d9 => (
                &self.d3d9_trampolines,
                d3d9_end_scene as EndSceneFn as usize,
                d3d9_reset as ResetFn as usize,
            ),
        };

        self.engine.lock().install_pair(
            Redirect {
                name: present.name(),
                target: points.present,
                replacement: present_shim,
                trampoline: &trampolines.present,
            },
            Redirect {
                name: companion.name(),
                target: points.companion,
                replacement: companion_shim,
                trampoline: &trampolines.companion,
            },
        )
    }
}

fn load_fn<F: Copy>(slot: &AtomicUsize) -> F {
    let address = slot.load(Ordering::Acquire);
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
    // SAFETY: slots hold trampolines published before their hook was enabled,
    // and each shim reads its own slot with its own signature.
    unsafe { std::mem::transmute_copy(&address) }
}

/// Build the process-wide context on first call; later calls return it.
pub fn init_context(build: impl FnOnce() -> HookContext) -> &'static HookContext {
    CONTEXT.get_or_init(build)
}

pub fn context() -> Option<&'static HookContext> {
    CONTEXT.get()
}

unsafe extern "system" fn dxgi_present(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT {
    let Some(context) = CONTEXT.get() else {
        return E_UNEXPECTED;
    };
    let original: PresentFn = context.dxgi_trampolines.present();
    let forward = || original(this, sync_interval, flags);

    // Test presents show nothing and must not count as frames.
    if flags & DXGI_PRESENT_TEST.0 != 0 {
        return forward();
    }
    match IDXGISwapChain::from_raw_borrowed(&this) {
        Some(swap_chain) => context.dxgi.on_present(swap_chain, sync_interval, forward),
        None => forward(),
    }
}

unsafe extern "system" fn dxgi_resize_buffers(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: DXGI_FORMAT,
    flags: u32,
) -> HRESULT {
    let Some(context) = CONTEXT.get() else {
        return E_UNEXPECTED;
    };
    let original: ResizeBuffersFn = context.dxgi_trampolines.companion();
    let forward = || original(this, buffer_count, width, height, format, flags);

    match IDXGISwapChain::from_raw_borrowed(&this) {
        Some(swap_chain) => context.dxgi.on_resize(swap_chain, forward),
        None => forward(),
    }
}

unsafe extern "system" fn d3d9_end_scene(this: *mut c_void) -> HRESULT {
    let Some(context) = CONTEXT.get() else {
        return E_UNEXPECTED;
    };
    let original: EndSceneFn = context.d3d9_trampolines.present();
    let forward = || original(this);

    match IDirect3DDevice9::from_raw_borrowed(&this) {
        Some(device) => context.d3d9.on_present(device, 0, forward),
        None => forward(),
    }
}

unsafe extern "system" fn d3d9_reset(this: *mut c_void, params: *mut D3DPRESENT_PARAMETERS) -> HRESULT {
    let Some(context) = CONTEXT.get() else {
        return E_UNEXPECTED;
    };
    let original: ResetFn = context.d3d9_trampolines.companion();
    let forward = || original(this, params);

    match IDirect3DDevice9::from_raw_borrowed(&this) {
        Some(device) => context.d3d9.on_resize(device, forward),
        None => forward(),
    }
}
