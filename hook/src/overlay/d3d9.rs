//! Renderer behind the D3D9 `EndScene` hook: GDI on the back buffer surface.

use shared::config::DisplaySettings;
use shared::frame::FrameReadout;
use tracing::{debug, info};
use windows::Win32::Graphics::Direct3D9::*;

use super::gdi::GdiText;
use super::{Layout, OverlayText};
use crate::handler::{OverlayError, OverlayRenderer};

#[derive(Default)]
pub struct D3d9Overlay {
    bound: bool,
    /// VSync interval from the device's presentation parameters; EndScene
    /// does not carry one.
    sync_interval: u32,
    /// Logged once; surfaces in non-GDI formats refuse `GetDC` every frame.
    dc_refused: bool,
    gdi: GdiText,
}

unsafe fn presentation_interval(device: &IDirect3DDevice9) -> Result<u32, OverlayError> {
    let swap_chain = device
        .GetSwapChain(0)
        .map_err(|e| OverlayError::resource("D3D9 swap chain", e))?;
    let mut params = D3DPRESENT_PARAMETERS::default();
    swap_chain
        .GetPresentParameters(&mut params)
        .map_err(|e| OverlayError::resource("D3D9 present parameters", e))?;
    Ok(if params.PresentationInterval == D3DPRESENT_INTERVAL_IMMEDIATE as u32 {
        0
    } else {
        1
    })
}

impl OverlayRenderer for D3d9Overlay {
    type Target = IDirect3DDevice9;

    fn is_bound(&self) -> bool {
        self.bound
    }

    fn bind(&mut self, device: &IDirect3DDevice9) -> Result<(), OverlayError> {
        self.sync_interval = unsafe { presentation_interval(device) }?;
        self.bound = true;
        info!(sync_interval = self.sync_interval, "Rendering with GDI on the D3D9 back buffer");
        Ok(())
    }

    fn refresh_rate(&mut self, device: &IDirect3DDevice9) -> Option<u32> {
        let mut mode = D3DDISPLAYMODE::default();
        unsafe { device.GetDisplayMode(0, &mut mode) }.ok()?;
        Some(mode.RefreshRate)
    }

    fn sync_interval(&mut self, _device: &IDirect3DDevice9, _reported: u32) -> u32 {
        self.sync_interval
    }

    fn draw(
        &mut self,
        device: &IDirect3DDevice9,
        readout: &FrameReadout,
        settings: &DisplaySettings,
    ) -> Result<(), OverlayError> {
        unsafe {
            let surface = device
                .GetBackBuffer(0, 0, D3DBACKBUFFER_TYPE_MONO)
                .map_err(|e| OverlayError::Draw(format!("back buffer: {e}")))?;
            let mut desc = D3DSURFACE_DESC::default();
            surface
                .GetDesc(&mut desc)
                .map_err(|e| OverlayError::Draw(format!("surface description: {e}")))?;

            let hdc = match surface.GetDC() {
                Ok(hdc) => hdc,
                Err(e) => {
                    if !self.dc_refused {
                        self.dc_refused = true;
                        debug!(format = desc.Format.0, reason = %e, "Back buffer refuses GDI, skipping");
                    }
                    return Ok(());
                }
            };

            let text = OverlayText::compose(readout, settings.show_frame_time);
            let layout = Layout::compute(settings, &text, (desc.Width as f32, desc.Height as f32));
            let result = self.gdi.draw(hdc, &layout, &text, settings);
            let _ = surface.ReleaseDC(hdc);
            result
        }
    }

    /// Nothing is held across frames; the back buffer is fetched per draw.
    fn release_targets(&mut self) {}

    fn recreate_targets(&mut self, device: &IDirect3DDevice9) -> Result<(), OverlayError> {
        self.sync_interval = unsafe { presentation_interval(device) }?;
        Ok(())
    }
}
