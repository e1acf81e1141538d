//! Renderer behind the DXGI `Present` hook.

use std::mem::size_of;

use shared::config::DisplaySettings;
use shared::frame::FrameReadout;
use tracing::info;
use windows::core::PCWSTR;
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Graphics::Direct3D12::ID3D12Device;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::Graphics::Gdi::*;
use windows::Win32::UI::WindowsAndMessaging::GetClientRect;

use super::d3d11::D3d11Overlay;
use super::gdi::GdiText;
use super::{Layout, OverlayText};
use crate::handler::{OverlayError, OverlayRenderer};

/// Which device the host's swap chain turned out to belong to.
#[derive(Default)]
pub enum DxgiOverlay {
    #[default]
    Unbound,
    D3d11(D3d11Overlay),
    /// Direct3D 12 hosts: GDI on the output window.
    Gdi(GdiText),
}

unsafe fn output_refresh_rate(swap_chain: &IDXGISwapChain) -> Option<u32> {
    let device_name = swap_chain
        .GetContainingOutput()
        .and_then(|output| output.GetDesc())
        .map(|desc| desc.DeviceName)
        .ok();
    let name = device_name
        .as_ref()
        .map_or(PCWSTR::null(), |name| PCWSTR(name.as_ptr()));

    let mut mode = DEVMODEW {
        dmSize: size_of::<DEVMODEW>() as u16,
        ..Default::default()
    };
    EnumDisplaySettingsW(name, ENUM_CURRENT_SETTINGS, &mut mode)
        .as_bool()
        .then_some(mode.dmDisplayFrequency)
}

unsafe fn draw_on_window(
    swap_chain: &IDXGISwapChain,
    gdi: &mut GdiText,
    readout: &FrameReadout,
    settings: &DisplaySettings,
) -> Result<(), OverlayError> {
    let desc = swap_chain
        .GetDesc()
        .map_err(|e| OverlayError::Draw(format!("swap chain description: {e}")))?;
    let hwnd = desc.OutputWindow;

    let mut client = RECT::default();
    GetClientRect(hwnd, &mut client).map_err(|e| OverlayError::Draw(format!("client rect: {e}")))?;
    let size = (
        (client.right - client.left) as f32,
        (client.bottom - client.top) as f32,
    );
    if size.0 < 1.0 || size.1 < 1.0 {
        return Ok(());
    }

    let hdc = GetDC(Some(hwnd));
    if hdc.is_invalid() {
        return Ok(());
    }
    let text = OverlayText::compose(readout, settings.show_frame_time);
    let layout = Layout::compute(settings, &text, size);
    let result = gdi.draw(hdc, &layout, &text, settings);
    ReleaseDC(Some(hwnd), hdc);
    result
}

impl OverlayRenderer for DxgiOverlay {
    type Target = IDXGISwapChain;

    fn is_bound(&self) -> bool {
        !matches!(self, DxgiOverlay::Unbound)
    }

    fn bind(&mut self, swap_chain: &IDXGISwapChain) -> Result<(), OverlayError> {
        unsafe {
            match swap_chain.GetDevice::<ID3D11Device>() {
                Ok(device) => {
                    *self = DxgiOverlay::D3d11(D3d11Overlay::new(device, swap_chain)?);
                    info!("Rendering with Direct3D 11");
                }
                Err(e) if swap_chain.GetDevice::<ID3D12Device>().is_ok() => {
                    info!(reason = %e, "Direct3D 12 host, rendering with GDI");
                    *self = DxgiOverlay::Gdi(GdiText::default());
                }
                Err(e) => return Err(OverlayError::Bind(e.to_string())),
            }
        }
        Ok(())
    }

    fn refresh_rate(&mut self, swap_chain: &IDXGISwapChain) -> Option<u32> {
        unsafe { output_refresh_rate(swap_chain) }
    }

    fn present_count(&mut self, swap_chain: &IDXGISwapChain) -> Option<u32> {
        let mut stats = DXGI_FRAME_STATISTICS::default();
        unsafe { swap_chain.GetFrameStatistics(&mut stats) }.ok()?;
        Some(stats.PresentCount)
    }

    fn draw(
        &mut self,
        swap_chain: &IDXGISwapChain,
        readout: &FrameReadout,
        settings: &DisplaySettings,
    ) -> Result<(), OverlayError> {
        match self {
            DxgiOverlay::Unbound => Ok(()),
            DxgiOverlay::D3d11(overlay) => unsafe { overlay.draw(readout, settings) },
            DxgiOverlay::Gdi(gdi) => unsafe { draw_on_window(swap_chain, gdi, readout, settings) },
        }
    }

    fn release_targets(&mut self) {
        if let DxgiOverlay::D3d11(overlay) = self {
            overlay.release_back_buffer();
        }
    }

    fn recreate_targets(&mut self, swap_chain: &IDXGISwapChain) -> Result<(), OverlayError> {
        match self {
            DxgiOverlay::D3d11(overlay) => unsafe { overlay.create_back_buffer(swap_chain) },
            _ => Ok(()),
        }
    }
}
