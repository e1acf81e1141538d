//! GDI rendition of the readout, for surfaces that hand out a device context:
//! D3D9 back buffers and the window of a swap chain whose device we cannot
//! drive directly.

use shared::config::{Argb, DisplaySettings};
use windows::core::w;
use windows::Win32::Foundation::*;
use windows::Win32::Graphics::Gdi::*;

use super::{border_strips, Layout, OverlayText, Rect, SizedResource, BORDER_COLOR, TEXT_COLOR};
use crate::handler::OverlayError;

fn to_rect(rect: Rect) -> RECT {
    RECT {
        left: rect.left.round() as i32,
        top: rect.top.round() as i32,
        right: rect.right.round() as i32,
        bottom: rect.bottom.round() as i32,
    }
}

fn colorref(color: Argb) -> COLORREF {
    COLORREF(color.to_colorref())
}

fn border_colorref() -> COLORREF {
    let [r, g, b, _] = BORDER_COLOR.map(|c| (c * 255.0).round() as u32);
    COLORREF(b << 16 | g << 8 | r)
}

unsafe fn fill(hdc: HDC, rect: Rect, color: COLORREF) {
    let brush = CreateSolidBrush(color);
    let _ = FillRect(hdc, &to_rect(rect), brush);
    let _ = DeleteObject(brush.into());
}

unsafe fn create_font(height: i32) -> Result<HFONT, OverlayError> {
    let font = CreateFontW(
        -height,
        0,
        0,
        0,
        FW_BOLD.0 as i32,
        0,
        0,
        0,
        DEFAULT_CHARSET,
        OUT_DEFAULT_PRECIS,
        CLIP_DEFAULT_PRECIS,
        NONANTIALIASED_QUALITY,
        0,
        w!("Consolas"),
    );
    if font.is_invalid() {
        return Err(OverlayError::resource("GDI font", windows::core::Error::from_win32()));
    }
    Ok(font)
}

/// GDI drawing state kept across frames.
#[derive(Default)]
pub struct GdiText {
    font: SizedResource<HFONT>,
}

// SAFETY: GDI font handles are process-wide objects, usable from any thread.
unsafe impl Send for GdiText {}

impl GdiText {
    /// Draw the readout onto `hdc`. GDI has no alpha: colours are drawn
    /// opaque and a fully transparent background is skipped.
    ///
    /// # Safety
    /// `hdc` must be a valid device context for the duration of the call.
    pub unsafe fn draw(
        &mut self,
        hdc: HDC,
        layout: &Layout,
        text: &OverlayText,
        settings: &DisplaySettings,
    ) -> Result<(), OverlayError> {
        if settings.show_background && settings.color_background.alpha() > 0 {
            fill(hdc, layout.background, colorref(settings.color_background));
            let border = border_colorref();
            for strip in border_strips(&layout.background) {
                fill(hdc, strip, border);
            }
        }

        let height = (layout.glyph.height * 7.0 / 6.0).round() as i32;
        let font = self.font.get(height, |h| create_font(h), |old| {
            let _ = DeleteObject(old.into());
        })?;

        let previous = SelectObject(hdc, font.into());
        let _ = SetBkMode(hdc, TRANSPARENT);

        let number_color = colorref(settings.color_for_fps(text.fps));
        for (index, line) in text.lines.iter().enumerate() {
            let (x, y) = layout.glyph_origin(0, index);
            let (x, y) = (x.round() as i32, y.round() as i32);
            let wide: Vec<u16> = line.encode_utf16().collect();

            if index == 0 && text.number_len > 0 {
                let (number, rest) = wide.split_at(text.number_len.min(wide.len()));
                let _ = SetTextColor(hdc, number_color);
                let _ = TextOutW(hdc, x, y, number);

                let mut extent = SIZE::default();
                let _ = GetTextExtentPoint32W(hdc, number, &mut extent);
                let _ = SetTextColor(hdc, colorref(TEXT_COLOR));
                let _ = TextOutW(hdc, x + extent.cx, y, rest);
            } else {
                let _ = SetTextColor(hdc, colorref(TEXT_COLOR));
                let _ = TextOutW(hdc, x, y, &wide);
            }
        }

        SelectObject(hdc, previous);
        Ok(())
    }
}

impl Drop for GdiText {
    fn drop(&mut self) {
        if let Some(font) = self.font.take() {
            let _ = unsafe { DeleteObject(font.into()) };
        }
    }
}
