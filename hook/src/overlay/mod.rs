//! The FPS readout: text, placement and geometry, plus the API-specific
//! renderers that put it on screen.
//!
//! Everything in this file is plain arithmetic shared by the Direct3D 11
//! path (vertex quads over the bitmap font) and the GDI paths (rectangles
//! and `TextOutW` on a device context).

pub mod font;

#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d9;
#[cfg(windows)]
pub mod dxgi;
#[cfg(windows)]
pub mod gdi;

use std::fmt::Write as _;

use arrayvec::{ArrayString, ArrayVec};
use shared::config::{Argb, Corner, DisplaySettings};
use shared::frame::FrameReadout;

pub const MAX_LINE_LEN: usize = 24;
pub const MAX_LINES: usize = 2;

/// Horizontal padding around the text; vertical padding is half of it.
pub const PADDING: f32 = 6.0;
pub const BORDER_WIDTH: f32 = 1.5;
pub const LINE_GAP: f32 = 2.0;

pub const BORDER_COLOR: [f32; 4] = [0.3, 0.3, 0.35, 0.95];
pub const TEXT_COLOR: Argb = Argb::WHITE;

/// Solid quads carry a negative u so the shader skips the font texture.
pub const SOLID_UV: [f32; 2] = [-1.0, -1.0];

/// Room for the background, the border and two full lines of text.
pub const MAX_VERTICES: usize = 6 * (1 + 4 + MAX_LINES * MAX_LINE_LEN);

pub type Line = ArrayString<MAX_LINE_LEN>;

/// Lines of text to draw and how many leading characters of the first line
/// take the FPS colour.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayText {
    pub lines: ArrayVec<Line, MAX_LINES>,
    pub number_len: usize,
    pub fps: u32,
}

impl OverlayText {
    pub fn compose(readout: &FrameReadout, show_frame_time: bool) -> Self {
        let fps = readout.display.fps;
        let mut first = Line::new();
        // Cannot overflow: u32 digits plus the suffix fit in a line.
        let _ = write!(first, "{fps}");
        let number_len = first.len();
        let _ = first.try_push_str(if readout.vsync { " FPS [V]" } else { " FPS" });

        let mut lines = ArrayVec::new();
        lines.push(first);

        if show_frame_time && readout.render.frame_time_ms > 0.0 {
            let mut second = Line::new();
            let _ = write!(second, "{:.1} ms", readout.render.frame_time_ms.min(99_999.0));
            lines.push(second);
        }

        Self {
            lines,
            number_len,
            fps,
        }
    }

    pub fn columns(&self) -> usize {
        self.lines.iter().map(|line| line.len()).max().unwrap_or(0)
    }
}

/// Size of one glyph cell on screen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlyphMetrics {
    pub width: f32,
    pub height: f32,
}

impl GlyphMetrics {
    /// A 14 px font gives 10x12 cells.
    pub fn from_settings(settings: &DisplaySettings) -> Self {
        let height = settings.font_size as f32 * settings.font_scale * 6.0 / 7.0;
        Self {
            width: height * 10.0 / 12.0,
            height,
        }
    }
}

/// Axis-aligned rectangle in back-buffer pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn inset(&self, by: f32) -> Rect {
        Rect {
            left: self.left + by,
            top: self.top + by,
            right: self.right - by,
            bottom: self.bottom - by,
        }
    }
}

/// Where the readout goes on a back buffer of a given size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Layout {
    pub glyph: GlyphMetrics,
    /// Top-left of the first glyph.
    pub origin: (f32, f32),
    pub text: Rect,
    pub background: Rect,
    pub viewport: (f32, f32),
}

impl Layout {
    pub fn compute(settings: &DisplaySettings, text: &OverlayText, viewport: (f32, f32)) -> Self {
        let glyph = GlyphMetrics::from_settings(settings);
        let lines = text.lines.len().max(1) as f32;
        let width = text.columns() as f32 * glyph.width;
        let height = lines * glyph.height + (lines - 1.0) * LINE_GAP;
        let (view_w, view_h) = viewport;

        let (offset_x, offset_y) = (settings.offset_x as f32, settings.offset_y as f32);
        let (x, y) = match settings.corner {
            Corner::TopLeft => (offset_x, offset_y),
            Corner::TopRight => (view_w - offset_x - width, offset_y),
            Corner::BottomLeft => (offset_x, view_h - offset_y - height),
            Corner::BottomRight => (view_w - offset_x - width, view_h - offset_y - height),
            Corner::Custom => (settings.custom_x as f32, settings.custom_y as f32),
        };

        // Keep the whole background on screen; on a buffer too small for it,
        // pin to the top-left.
        let x = x.min(view_w - width - PADDING).max(PADDING);
        let y = y.min(view_h - height - PADDING / 2.0).max(PADDING / 2.0);

        let text_rect = Rect {
            left: x,
            top: y,
            right: x + width,
            bottom: y + height,
        };
        Self {
            glyph,
            origin: (x, y),
            text: text_rect,
            background: Rect {
                left: x - PADDING,
                top: y - PADDING / 2.0,
                right: x + width + PADDING,
                bottom: y + height + PADDING / 2.0,
            },
            viewport,
        }
    }

    /// Top-left of the glyph at (`column`, `line`).
    pub fn glyph_origin(&self, column: usize, line: usize) -> (f32, f32) {
        (
            self.origin.0 + column as f32 * self.glyph.width,
            self.origin.1 + line as f32 * (self.glyph.height + LINE_GAP),
        )
    }

    fn to_ndc(&self, x: f32, y: f32) -> [f32; 2] {
        [
            x / self.viewport.0 * 2.0 - 1.0,
            1.0 - y / self.viewport.1 * 2.0,
        ]
    }
}

/// Vertex layout consumed by the overlay shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

pub type Vertices = ArrayVec<Vertex, MAX_VERTICES>;

fn with_opacity(mut color: [f32; 4], opacity: f32) -> [f32; 4] {
    color[3] *= opacity;
    color
}

fn push_quad(out: &mut Vertices, layout: &Layout, rect: Rect, uv: [f32; 4], color: [f32; 4]) {
    let [l, t] = layout.to_ndc(rect.left, rect.top);
    let [r, b] = layout.to_ndc(rect.right, rect.bottom);
    let [u0, v0, u1, v1] = uv;
    let corners = [
        ([l, t], [u0, v0]),
        ([r, t], [u1, v0]),
        ([l, b], [u0, v1]),
        ([r, t], [u1, v0]),
        ([r, b], [u1, v1]),
        ([l, b], [u0, v1]),
    ];
    for (pos, uv) in corners {
        // Capacity covers the largest possible readout.
        let _ = out.try_push(Vertex { pos, uv, color });
    }
}

/// Top, bottom, left and right edges of `rect`, `BORDER_WIDTH` thick.
pub fn border_strips(rect: &Rect) -> [Rect; 4] {
    [
        Rect { bottom: rect.top + BORDER_WIDTH, ..*rect },
        Rect { top: rect.bottom - BORDER_WIDTH, ..*rect },
        Rect { right: rect.left + BORDER_WIDTH, ..*rect },
        Rect { left: rect.right - BORDER_WIDTH, ..*rect },
    ]
}

/// Two triangles per quad: background, four border strips, then one quad per
/// glyph.
pub fn build_vertices(layout: &Layout, text: &OverlayText, settings: &DisplaySettings) -> Vertices {
    let mut out = Vertices::new();
    let opacity = settings.opacity;
    let solid = [SOLID_UV[0], SOLID_UV[1], SOLID_UV[0], SOLID_UV[1]];

    if settings.show_background {
        let bg = layout.background;
        push_quad(
            &mut out,
            layout,
            bg,
            solid,
            with_opacity(settings.color_background.to_rgba_f32(), opacity),
        );

        let border = with_opacity(BORDER_COLOR, opacity);
        for strip in border_strips(&bg) {
            push_quad(&mut out, layout, strip, solid, border);
        }
    }

    let number = with_opacity(settings.color_for_fps(text.fps).to_rgba_f32(), opacity);
    let plain = with_opacity(TEXT_COLOR.to_rgba_f32(), opacity);
    for (line_index, line) in text.lines.iter().enumerate() {
        for (column, c) in line.chars().enumerate() {
            if c == ' ' {
                continue;
            }
            let (x, y) = layout.glyph_origin(column, line_index);
            let rect = Rect {
                left: x,
                top: y,
                right: x + layout.glyph.width,
                bottom: y + layout.glyph.height,
            };
            let color = if line_index == 0 && column < text.number_len {
                number
            } else {
                plain
            };
            push_quad(&mut out, layout, rect, font::glyph_uv(c), color);
        }
    }

    out
}

/// A device object built for one glyph height and rebuilt only when the
/// height changes.
#[derive(Debug)]
pub struct SizedResource<T> {
    current: Option<(i32, T)>,
}

impl<T> Default for SizedResource<T> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<T: Copy> SizedResource<T> {
    /// The object for `height`, creating it if the cached one is for another
    /// height. The replaced object goes to `release` only once its successor
    /// exists.
    pub fn get<E>(
        &mut self,
        height: i32,
        create: impl FnOnce(i32) -> Result<T, E>,
        release: impl FnOnce(T),
    ) -> Result<T, E> {
        if let Some((cached_height, value)) = self.current {
            if cached_height == height {
                return Ok(value);
            }
        }
        let value = create(height)?;
        if let Some((_, previous)) = self.current.replace((height, value)) {
            release(previous);
        }
        Ok(value)
    }

    pub fn take(&mut self) -> Option<T> {
        self.current.take().map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::frame::{DisplayRateEstimate, RenderRateEstimate};

    fn readout(fps: u32, vsync: bool, frame_time_ms: f32) -> FrameReadout {
        FrameReadout {
            render: RenderRateEstimate {
                fps: fps as f32,
                frame_time_ms,
            },
            display: DisplayRateEstimate {
                fps,
                is_measured: false,
            },
            vsync,
            ..FrameReadout::default()
        }
    }

    const FULL_HD: (f32, f32) = (1920.0, 1080.0);

    fn lines(text: &OverlayText) -> Vec<&str> {
        text.lines.iter().map(|line| line.as_str()).collect()
    }

    #[test]
    fn text_marks_vsync_and_colours_only_the_number() {
        let text = OverlayText::compose(&readout(144, false, 6.9), false);
        assert_eq!(lines(&text), ["144 FPS"]);
        assert_eq!(text.number_len, 3);

        let text = OverlayText::compose(&readout(60, true, 16.7), true);
        assert_eq!(lines(&text), ["60 FPS [V]", "16.7 ms"]);
        assert_eq!(text.number_len, 2);
        assert_eq!(text.columns(), 10);
    }

    #[test]
    fn frame_time_line_needs_a_sample() {
        let text = OverlayText::compose(&readout(0, false, 0.0), true);
        assert_eq!(lines(&text), ["0 FPS"]);
    }

    #[test]
    fn default_font_gives_ten_by_twelve_cells() {
        let glyph = GlyphMetrics::from_settings(&DisplaySettings::default());
        assert!((glyph.width - 10.0).abs() < 1e-4);
        assert!((glyph.height - 12.0).abs() < 1e-4);
    }

    #[test]
    fn corners_anchor_with_margins() {
        let text = OverlayText::compose(&readout(60, false, 0.0), false);
        let mut settings = DisplaySettings::default();
        let width = 6.0 * 10.0;

        settings.corner = Corner::TopLeft;
        let layout = Layout::compute(&settings, &text, FULL_HD);
        assert_eq!(layout.origin, (10.0, 10.0));

        settings.corner = Corner::BottomRight;
        let layout = Layout::compute(&settings, &text, FULL_HD);
        assert!((layout.text.right - (1920.0 - 10.0)).abs() < 1e-3);
        assert!((layout.text.bottom - (1080.0 - 10.0)).abs() < 1e-3);
        assert!((layout.text.width() - width).abs() < 1e-3);

        settings.corner = Corner::Custom;
        settings.custom_x = 400;
        settings.custom_y = 300;
        let layout = Layout::compute(&settings, &text, FULL_HD);
        assert_eq!(layout.origin, (400.0, 300.0));
    }

    #[test]
    fn readout_is_clamped_onto_the_back_buffer() {
        let text = OverlayText::compose(&readout(60, true, 0.0), false);
        let mut settings = DisplaySettings::default();
        settings.corner = Corner::Custom;
        settings.custom_x = 5000;
        settings.custom_y = -200;

        let layout = Layout::compute(&settings, &text, (800.0, 600.0));
        assert!(layout.background.right <= 800.0);
        assert!(layout.background.top >= 0.0);
        assert!(layout.background.left >= 0.0);
    }

    #[test]
    fn vertices_cover_background_border_and_visible_glyphs() {
        let text = OverlayText::compose(&readout(60, true, 0.0), false);
        let settings = DisplaySettings::default();
        let layout = Layout::compute(&settings, &text, FULL_HD);
        let vertices = build_vertices(&layout, &text, &settings);

        // "60 FPS [V]" has 8 non-space glyphs.
        assert_eq!(vertices.len(), 6 * (1 + 4 + 8));
        assert!(vertices
            .iter()
            .all(|v| v.pos.iter().all(|c| (-1.0..=1.0).contains(c))));

        let number = settings.color_for_fps(60).to_rgba_f32();
        let first_glyph = &vertices[6 * 5];
        assert_eq!(first_glyph.color, number);
        assert!(first_glyph.uv[0] >= 0.0);
        assert_eq!(vertices[0].uv, SOLID_UV);
    }

    #[test]
    fn hidden_background_and_opacity() {
        let text = OverlayText::compose(&readout(25, false, 0.0), false);
        let settings = DisplaySettings {
            show_background: false,
            opacity: 0.5,
            ..DisplaySettings::default()
        };
        let layout = Layout::compute(&settings, &text, FULL_HD);
        let vertices = build_vertices(&layout, &text, &settings);

        assert_eq!(vertices.len(), 6 * 5);
        let low = settings.color_low.to_rgba_f32();
        assert_eq!(vertices[0].color[3], low[3] * 0.5);
    }

    #[test]
    fn largest_readout_fits_the_vertex_budget() {
        let text = OverlayText::compose(&readout(u32::MAX, true, 99_999.0), true);
        let settings = DisplaySettings {
            show_frame_time: true,
            ..DisplaySettings::default()
        };
        let layout = Layout::compute(&settings, &text, FULL_HD);
        let glyphs: usize = text
            .lines
            .iter()
            .map(|l| l.chars().filter(|c| *c != ' ').count())
            .sum();
        assert_eq!(build_vertices(&layout, &text, &settings).len(), 6 * (5 + glyphs));
    }

    #[test]
    fn sized_resource_is_built_once_per_height() {
        let mut font = SizedResource::default();
        let mut created = Vec::new();
        let mut released = Vec::new();

        for height in [14, 14, 14, 21, 21] {
            let handle = font
                .get::<()>(
                    height,
                    |h| {
                        created.push(h);
                        Ok(h * 100)
                    },
                    |old| released.push(old),
                )
                .unwrap();
            assert_eq!(handle, height * 100);
        }

        assert_eq!(created, [14, 21]);
        assert_eq!(released, [1400]);
        assert_eq!(font.take(), Some(2100));
        assert_eq!(font.take(), None);
    }

    #[test]
    fn failed_rebuild_keeps_the_previous_resource() {
        let mut font = SizedResource::default();
        font.get::<&str>(14, |h| Ok(h), |_| {}).unwrap();

        let rebuilt = font.get(21, |_| Err("out of handles"), |_| panic!("released"));
        assert_eq!(rebuilt, Err("out of handles"));
        assert_eq!(font.get::<&str>(14, |_| Err("rebuilt"), |_| {}), Ok(14));
    }
}
