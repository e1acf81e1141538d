//! Resolves the address of the host's presentation entry points.
//!
//! The functions live in system modules at addresses that are only reachable
//! through a COM object's function table, so the locator builds a throwaway
//! device on a hidden window, reads the table slots it needs and releases
//! everything again before returning.

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("{generation:?}: module {module} is not loaded")]
    ModuleNotLoaded {
        generation: ApiGeneration,
        module: &'static str,
    },
    #[error("{generation:?}: {stage} failed: {reason}")]
    NotFound {
        generation: ApiGeneration,
        stage: &'static str,
        reason: String,
    },
}

/// Why one generation was passed over during setup.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error("{generation:?}: hook installation failed: {source}")]
    Install {
        generation: ApiGeneration,
        #[source]
        source: EngineError,
    },
}

/// Graphics API generations the locator knows, newest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiGeneration {
    /// DXGI swap chains (D3D10/11/12 hosts).
    Dxgi,
    D3d9,
}

impl ApiGeneration {
    /// Order generations are attempted in.
    pub const PRIORITY: [ApiGeneration; 2] = [ApiGeneration::Dxgi, ApiGeneration::D3d9];

    /// Any of these being loaded makes the generation worth probing.
    pub fn modules(self) -> &'static [&'static str] {
        match self {
            ApiGeneration::Dxgi => &["d3d11.dll", "dxgi.dll"],
            ApiGeneration::D3d9 => &["d3d9.dll"],
        }
    }

    /// (presentation, companion) entry points this generation hooks.
    pub fn capabilities(self) -> (Capability, Capability) {
        match self {
            ApiGeneration::Dxgi => (Capability::Present, Capability::ResizeBuffers),
            ApiGeneration::D3d9 => (Capability::EndScene, Capability::Reset),
        }
    }
}

/// A function-table entry, named by the method it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// `IDXGISwapChain::Present`
    Present,
    /// `IDXGISwapChain::ResizeBuffers`
    ResizeBuffers,
    /// `IDirect3DDevice9::EndScene`
    EndScene,
    /// `IDirect3DDevice9::Reset`
    Reset,
}

impl Capability {
    /// Index into the interface's function table.
    pub const fn slot(self) -> usize {
        match self {
            Capability::Present => 8,
            Capability::ResizeBuffers => 13,
            Capability::EndScene => 42,
            Capability::Reset => 16,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Capability::Present => "Present",
            Capability::ResizeBuffers => "ResizeBuffers",
            Capability::EndScene => "EndScene",
            Capability::Reset => "Reset",
        }
    }
}

/// Read one function-table slot of a COM object.
///
/// # Safety
/// `object` must point to a live COM object whose table has more than
/// `capability.slot()` entries.
pub unsafe fn read_slot(object: *const std::ffi::c_void, capability: Capability) -> usize {
    let vtable = *(object as *const *const usize);
    *vtable.add(capability.slot())
}

/// Resolved addresses for one generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPoints {
    pub generation: ApiGeneration,
    /// Presentation function: `Present` or `EndScene`.
    pub present: usize,
    /// Buffer-recreation function: `ResizeBuffers` or `Reset`.
    pub companion: usize,
}

/// Try every generation in priority order, locating its entry points and
/// then installing on them, and stop at the first that succeeds. A
/// generation that fails at either step is passed over. Returns the
/// attached generation's entry points with every error seen on the way.
pub fn attach_first(
    mut locate: impl FnMut(ApiGeneration) -> Result<EntryPoints, LocateError>,
    mut install: impl FnMut(EntryPoints) -> Result<(), EngineError>,
) -> (Option<EntryPoints>, Vec<AttachError>) {
    let mut errors = Vec::new();
    for generation in ApiGeneration::PRIORITY {
        let points = match locate(generation) {
            Ok(points) => points,
            Err(e) => {
                errors.push(e.into());
                continue;
            }
        };
        match install(points) {
            Ok(()) => return (Some(points), errors),
            Err(source) => errors.push(AttachError::Install { generation, source }),
        }
    }
    (None, errors)
}

#[cfg(windows)]
pub use probe::{locate_present_address, module_loaded};

#[cfg(windows)]
mod probe {
    use super::{read_slot, ApiGeneration, EntryPoints, LocateError};
    use tracing::debug;
    use windows::core::{Interface, PCWSTR};
    use windows::Win32::Foundation::*;
    use windows::Win32::Graphics::Direct3D::*;
    use windows::Win32::Graphics::Direct3D11::*;
    use windows::Win32::Graphics::Direct3D9::*;
    use windows::Win32::Graphics::Dxgi::Common::*;
    use windows::Win32::Graphics::Dxgi::*;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::*;

    pub fn module_loaded(name: &str) -> bool {
        let wide = shared::wide(name);
        unsafe { GetModuleHandleW(PCWSTR(wide.as_ptr())) }.is_ok()
    }

    /// Resolve the presentation entry points of one generation.
    pub fn locate_present_address(generation: ApiGeneration) -> Result<EntryPoints, LocateError> {
        let modules = generation.modules();
        if !modules.iter().any(|m| module_loaded(m)) {
            return Err(LocateError::ModuleNotLoaded {
                generation,
                module: modules[0],
            });
        }

        let window = ProbeWindow::create(generation)?;
        let points = match generation {
            ApiGeneration::Dxgi => unsafe { probe_dxgi(&window) },
            ApiGeneration::D3d9 => unsafe { probe_d3d9(&window) },
        }?;

        debug!(
            ?generation,
            present = format_args!("{:#x}", points.present),
            companion = format_args!("{:#x}", points.companion),
            "Entry points resolved"
        );
        Ok(points)
    }

    fn not_found(generation: ApiGeneration, stage: &'static str, reason: impl ToString) -> LocateError {
        LocateError::NotFound {
            generation,
            stage,
            reason: reason.to_string(),
        }
    }

    unsafe extern "system" fn probe_wnd_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        DefWindowProcW(hwnd, msg, wparam, lparam)
    }

    /// Hidden window that unregisters its class when dropped.
    struct ProbeWindow {
        hwnd: HWND,
        instance: HINSTANCE,
        class_name: Vec<u16>,
    }

    impl ProbeWindow {
        fn create(generation: ApiGeneration) -> Result<Self, LocateError> {
            let class_name = shared::wide(&format!("FpsOverlayProbe{:x}", std::process::id()));
            unsafe {
                let instance: HINSTANCE = GetModuleHandleW(None)
                    .map_err(|e| not_found(generation, "GetModuleHandleW", e))?
                    .into();

                let class = WNDCLASSEXW {
                    cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
                    style: CS_HREDRAW | CS_VREDRAW,
                    lpfnWndProc: Some(probe_wnd_proc),
                    hInstance: instance,
                    lpszClassName: PCWSTR(class_name.as_ptr()),
                    ..Default::default()
                };
                // Zero means a stale registration from an earlier probe, which
                // CreateWindowExW can still use.
                let _ = RegisterClassExW(&class);

                let hwnd = CreateWindowExW(
                    WINDOW_EX_STYLE::default(),
                    PCWSTR(class_name.as_ptr()),
                    PCWSTR(class_name.as_ptr()),
                    WS_OVERLAPPEDWINDOW,
                    0,
                    0,
                    100,
                    100,
                    None,
                    None,
                    Some(instance),
                    None,
                );
                match hwnd {
                    Ok(hwnd) => Ok(Self {
                        hwnd,
                        instance,
                        class_name,
                    }),
                    Err(e) => {
                        let _ = UnregisterClassW(PCWSTR(class_name.as_ptr()), Some(instance));
                        Err(not_found(generation, "CreateWindowExW", e))
                    }
                }
            }
        }
    }

    impl Drop for ProbeWindow {
        fn drop(&mut self) {
            unsafe {
                let _ = DestroyWindow(self.hwnd);
                let _ = UnregisterClassW(PCWSTR(self.class_name.as_ptr()), Some(self.instance));
            }
        }
    }

    unsafe fn probe_dxgi(window: &ProbeWindow) -> Result<EntryPoints, LocateError> {
        let generation = ApiGeneration::Dxgi;
        let desc = DXGI_SWAP_CHAIN_DESC {
            BufferDesc: DXGI_MODE_DESC {
                Width: 100,
                Height: 100,
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ..Default::default()
            },
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 1,
            OutputWindow: window.hwnd,
            Windowed: true.into(),
            SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
            ..Default::default()
        };

        let levels = [D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_10_0];
        let mut last_error = None;
        for driver in [D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP] {
            let mut swap_chain: Option<IDXGISwapChain> = None;
            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;
            let created = D3D11CreateDeviceAndSwapChain(
                None,
                driver,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_FLAG(0),
                Some(levels.as_slice()),
                D3D11_SDK_VERSION,
                Some(&desc),
                Some(&mut swap_chain),
                Some(&mut device),
                None,
                Some(&mut context),
            );
            match (created, swap_chain) {
                (Ok(()), Some(swap_chain)) => {
                    let (present, companion) = generation.capabilities();
                    // swap_chain, device and context release on scope exit.
                    return Ok(EntryPoints {
                        generation,
                        present: read_slot(swap_chain.as_raw(), present),
                        companion: read_slot(swap_chain.as_raw(), companion),
                    });
                }
                (Err(e), _) => last_error = Some(e.to_string()),
                (Ok(()), None) => last_error = Some("no swap chain returned".to_string()),
            }
        }

        Err(not_found(
            generation,
            "D3D11CreateDeviceAndSwapChain",
            last_error.unwrap_or_default(),
        ))
    }

    unsafe fn probe_d3d9(window: &ProbeWindow) -> Result<EntryPoints, LocateError> {
        let generation = ApiGeneration::D3d9;
        let d3d = Direct3DCreate9(D3D_SDK_VERSION)
            .ok_or_else(|| not_found(generation, "Direct3DCreate9", "returned null"))?;

        let mut params = D3DPRESENT_PARAMETERS {
            Windowed: true.into(),
            SwapEffect: D3DSWAPEFFECT_DISCARD,
            hDeviceWindow: window.hwnd,
            BackBufferFormat: D3DFMT_UNKNOWN,
            ..Default::default()
        };

        let mut last_error = String::new();
        for device_type in [D3DDEVTYPE_HAL, D3DDEVTYPE_NULLREF] {
            let mut device: Option<IDirect3DDevice9> = None;
            match d3d.CreateDevice(
                D3DADAPTER_DEFAULT,
                device_type,
                window.hwnd,
                D3DCREATE_SOFTWARE_VERTEXPROCESSING as u32 | D3DCREATE_DISABLE_DRIVER_MANAGEMENT as u32,
                &mut params,
                &mut device,
            ) {
                Ok(()) => {
                    if let Some(device) = device {
                        let (present, companion) = generation.capabilities();
                        return Ok(EntryPoints {
                            generation,
                            present: read_slot(device.as_raw(), present),
                            companion: read_slot(device.as_raw(), companion),
                        });
                    }
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(not_found(generation, "IDirect3D9::CreateDevice", last_error))
    }
}
