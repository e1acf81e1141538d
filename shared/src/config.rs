//! Overlay configuration model and its fixed-layout shared-memory form.
//!
//! [`OverlayConfig`] is the owned, validated configuration the launcher loads
//! from disk. [`SharedConfigRecord`] is the byte-stable record it writes into
//! the shared region for every hooked process to snapshot.

use std::fmt;

/// Virtual-key code of F1; F1..F12 are contiguous.
pub const VK_F1: u32 = 0x70;

pub const GAME_LIST_CAPACITY: usize = 4096;

pub const DEFAULT_HIGH_THRESHOLD: u32 = 60;
pub const DEFAULT_MEDIUM_THRESHOLD: u32 = 30;

pub const MIN_FONT_SIZE: i32 = 8;
pub const MAX_FONT_SIZE: i32 = 72;

/// Screen corner the readout is anchored to, or absolute placement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Corner {
    #[default]
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Custom,
}

impl Corner {
    pub const ALL: [Corner; 5] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
        Corner::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Corner::TopLeft => "TopLeft",
            Corner::TopRight => "TopRight",
            Corner::BottomLeft => "BottomLeft",
            Corner::BottomRight => "BottomRight",
            Corner::Custom => "Custom",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|corner| corner.as_str().eq_ignore_ascii_case(text.trim()))
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Corner::TopLeft => 0,
            Corner::TopRight => 1,
            Corner::BottomLeft => 2,
            Corner::BottomRight => 3,
            Corner::Custom => 4,
        }
    }

    fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Corner::TopRight,
            2 => Corner::BottomLeft,
            3 => Corner::BottomRight,
            4 => Corner::Custom,
            _ => Corner::TopLeft,
        }
    }
}

/// Which processes the overlay attaches to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    All,
    /// Only processes named in the game list.
    Whitelist,
    /// Every process except those named in the game list.
    Blacklist,
}

impl FilterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterMode::All => "All",
            FilterMode::Whitelist => "Whitelist",
            FilterMode::Blacklist => "Blacklist",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        [FilterMode::All, FilterMode::Whitelist, FilterMode::Blacklist]
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(text.trim()))
    }

    fn to_raw(self) -> i32 {
        match self {
            FilterMode::All => 0,
            FilterMode::Whitelist => 1,
            FilterMode::Blacklist => 2,
        }
    }

    fn from_raw(raw: i32) -> Self {
        match raw {
            1 => FilterMode::Whitelist,
            2 => FilterMode::Blacklist,
            _ => FilterMode::All,
        }
    }
}

/// Colour packed as 0xAARRGGBB.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Argb(pub u32);

impl Argb {
    pub const WHITE: Argb = Argb(0xFFFF_FFFF);

    /// Parse `AARRGGBB` or `RRGGBB` hex, with an optional `#` or `0x`.
    /// Six digits are taken as fully opaque.
    pub fn parse_hex(text: &str) -> Option<Self> {
        let text = text.trim();
        let digits = text
            .strip_prefix('#')
            .or_else(|| text.strip_prefix("0x"))
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if digits.is_empty() || digits.len() > 8 {
            return None;
        }
        let value = u32::from_str_radix(digits, 16).ok()?;
        Some(if digits.len() <= 6 {
            Argb(0xFF00_0000 | value)
        } else {
            Argb(value)
        })
    }

    pub fn alpha(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn red(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn green(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn blue(self) -> u8 {
        self.0 as u8
    }

    /// Normalized `[r, g, b, a]` for shader vertex colours.
    pub fn to_rgba_f32(self) -> [f32; 4] {
        [
            self.red() as f32 / 255.0,
            self.green() as f32 / 255.0,
            self.blue() as f32 / 255.0,
            self.alpha() as f32 / 255.0,
        ]
    }

    /// GDI `COLORREF` layout, 0x00BBGGRR. Alpha is dropped.
    pub fn to_colorref(self) -> u32 {
        (self.blue() as u32) << 16 | (self.green() as u32) << 8 | self.red() as u32
    }

    pub fn with_alpha_scaled(self, factor: f32) -> Self {
        let alpha = (self.alpha() as f32 * factor.clamp(0.0, 1.0)).round() as u32;
        Argb(alpha << 24 | (self.0 & 0x00FF_FFFF))
    }
}

impl fmt::Debug for Argb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Argb({:08X})", self.0)
    }
}

impl fmt::Display for Argb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Toggle hotkey: a virtual-key code plus modifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hotkey {
    pub key: u32,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

impl Default for Hotkey {
    fn default() -> Self {
        Self {
            key: VK_F1,
            ctrl: false,
            alt: false,
            shift: false,
        }
    }
}

impl Hotkey {
    /// Parse a key name: `F1`..`F24`, a letter or digit, or a numeric
    /// virtual-key code (`0x70` or `112`).
    pub fn parse_key(text: &str) -> Option<u32> {
        let text = text.trim();
        if let Some(n) = text
            .strip_prefix(['F', 'f'])
            .and_then(|n| n.parse::<u32>().ok())
        {
            return (1..=24).contains(&n).then_some(VK_F1 + n - 1);
        }
        if let [c] = text.as_bytes() {
            if c.is_ascii_alphanumeric() {
                return Some(c.to_ascii_uppercase() as u32);
            }
        }
        let code = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => text.parse().ok()?,
        };
        (1..=0xFE).contains(&code).then_some(code)
    }

    /// Inverse of [`Hotkey::parse_key`], preferring symbolic names.
    pub fn key_name(key: u32) -> String {
        match key {
            k if (VK_F1..VK_F1 + 24).contains(&k) => format!("F{}", k - VK_F1 + 1),
            k if (b'A' as u32..=b'Z' as u32).contains(&k)
                || (b'0' as u32..=b'9' as u32).contains(&k) =>
            {
                char::from(k as u8).to_string()
            }
            k => format!("0x{k:02X}"),
        }
    }
}

impl fmt::Display for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (held, name) in [(self.ctrl, "Ctrl+"), (self.alt, "Alt+"), (self.shift, "Shift+")] {
            if held {
                f.write_str(name)?;
            }
        }
        f.write_str(&Hotkey::key_name(self.key))
    }
}

/// Everything the hook needs per frame to place and colour the readout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplaySettings {
    pub corner: Corner,
    /// Margin from the anchored corner, in pixels.
    pub offset_x: i32,
    pub offset_y: i32,
    /// Absolute top-left position when `corner` is [`Corner::Custom`].
    pub custom_x: i32,
    pub custom_y: i32,
    pub font_size: i32,
    pub font_scale: f32,
    pub show_background: bool,
    /// Multiplier on every alpha the overlay draws, 0.0..=1.0.
    pub opacity: f32,
    pub color_high: Argb,
    pub color_medium: Argb,
    pub color_low: Argb,
    pub color_background: Argb,
    pub high_threshold: u32,
    pub medium_threshold: u32,
    pub show_frame_time: bool,
    pub visible: bool,
    pub enabled: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            corner: Corner::TopLeft,
            offset_x: 10,
            offset_y: 10,
            custom_x: 10,
            custom_y: 10,
            font_size: 14,
            font_scale: 1.0,
            show_background: true,
            opacity: 1.0,
            color_high: Argb(0xFF00_E070),
            color_medium: Argb(0xFFFF_CC00),
            color_low: Argb(0xFFFF_4040),
            color_background: Argb(0xB020_2020),
            high_threshold: DEFAULT_HIGH_THRESHOLD,
            medium_threshold: DEFAULT_MEDIUM_THRESHOLD,
            show_frame_time: false,
            visible: true,
            enabled: true,
        }
    }
}

impl DisplaySettings {
    /// Colour of the FPS number: at or above the high threshold, at or above
    /// the medium threshold, or below both.
    pub fn color_for_fps(&self, fps: u32) -> Argb {
        if fps >= self.high_threshold {
            self.color_high
        } else if fps >= self.medium_threshold {
            self.color_medium
        } else {
            self.color_low
        }
    }

    /// Clamp out-of-range values into something drawable.
    pub fn normalized(mut self) -> Self {
        self.font_size = self.font_size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE);
        self.font_scale = if self.font_scale.is_finite() {
            self.font_scale.clamp(0.5, 4.0)
        } else {
            1.0
        };
        self.opacity = if self.opacity.is_finite() {
            self.opacity.clamp(0.0, 1.0)
        } else {
            1.0
        };
        if self.medium_threshold > self.high_threshold {
            self.medium_threshold = self.high_threshold;
        }
        self
    }
}

/// Full overlay configuration as loaded from disk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverlayConfig {
    pub display: DisplaySettings,
    pub hotkey: Hotkey,
    pub filter_mode: FilterMode,
    pub game_list: Vec<String>,
}

impl OverlayConfig {
    pub fn normalized(mut self) -> Self {
        self.display = self.display.normalized();
        self.game_list.retain(|name| !name.trim().is_empty());
        self
    }

    /// Game list in its wire form, `a.exe;b.exe`.
    pub fn joined_game_list(&self) -> String {
        self.game_list.join(";")
    }
}

/// Fixed-layout record shared between the launcher and every hooked process.
///
/// Booleans are bytes so any bit pattern is a valid value; readers take whole
/// copies with [`std::ptr::read_volatile`] and never hold references into the
/// mapping.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SharedConfigRecord {
    pub position: i32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub font_size: i32,
    pub show_background: u8,
    pub custom_x: i32,
    pub custom_y: i32,
    /// Set when custom coordinates changed and should be written to disk.
    pub position_dirty: u8,
    pub color_high: u32,
    pub color_medium: u32,
    pub color_low: u32,
    pub color_background: u32,
    pub toggle_key: u32,
    pub use_ctrl: u8,
    pub use_alt: u8,
    pub use_shift: u8,
    pub filter_mode: i32,
    /// Semicolon-separated, NUL-terminated.
    pub game_list: [u8; GAME_LIST_CAPACITY],
    pub visible: u8,
    pub enabled: u8,
    pub high_threshold: u32,
    pub medium_threshold: u32,
    pub opacity: f32,
    pub font_scale: f32,
    pub show_frame_time: u8,
}

pub const SHARED_CONFIG_SIZE: usize = std::mem::size_of::<SharedConfigRecord>();

impl SharedConfigRecord {
    pub fn from_config(config: &OverlayConfig) -> Self {
        let display = &config.display;
        let mut game_list = [0u8; GAME_LIST_CAPACITY];
        let joined = config.joined_game_list();
        // Truncate on a char boundary, always leaving the terminator.
        let mut len = joined.len().min(GAME_LIST_CAPACITY - 1);
        while !joined.is_char_boundary(len) {
            len -= 1;
        }
        game_list[..len].copy_from_slice(&joined.as_bytes()[..len]);

        Self {
            position: display.corner.to_raw(),
            offset_x: display.offset_x,
            offset_y: display.offset_y,
            font_size: display.font_size,
            show_background: display.show_background as u8,
            custom_x: display.custom_x,
            custom_y: display.custom_y,
            position_dirty: 0,
            color_high: display.color_high.0,
            color_medium: display.color_medium.0,
            color_low: display.color_low.0,
            color_background: display.color_background.0,
            toggle_key: config.hotkey.key,
            use_ctrl: config.hotkey.ctrl as u8,
            use_alt: config.hotkey.alt as u8,
            use_shift: config.hotkey.shift as u8,
            filter_mode: config.filter_mode.to_raw(),
            game_list,
            visible: display.visible as u8,
            enabled: display.enabled as u8,
            high_threshold: display.high_threshold,
            medium_threshold: display.medium_threshold,
            opacity: display.opacity,
            font_scale: display.font_scale,
            show_frame_time: display.show_frame_time as u8,
        }
    }

    /// Per-frame view. Validates everything a torn or hostile write could
    /// have left out of range.
    pub fn display(&self) -> DisplaySettings {
        DisplaySettings {
            corner: Corner::from_raw(self.position),
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            custom_x: self.custom_x,
            custom_y: self.custom_y,
            font_size: self.font_size,
            font_scale: self.font_scale,
            show_background: self.show_background != 0,
            opacity: self.opacity,
            color_high: Argb(self.color_high),
            color_medium: Argb(self.color_medium),
            color_low: Argb(self.color_low),
            color_background: Argb(self.color_background),
            high_threshold: self.high_threshold,
            medium_threshold: self.medium_threshold,
            show_frame_time: self.show_frame_time != 0,
            visible: self.visible != 0,
            enabled: self.enabled != 0,
        }
        .normalized()
    }

    pub fn hotkey(&self) -> Hotkey {
        Hotkey {
            key: self.toggle_key,
            ctrl: self.use_ctrl != 0,
            alt: self.use_alt != 0,
            shift: self.use_shift != 0,
        }
    }

    pub fn filter_mode(&self) -> FilterMode {
        FilterMode::from_raw(self.filter_mode)
    }

    pub fn game_list(&self) -> String {
        let bytes = self.game_list;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }

    pub fn to_config(&self) -> OverlayConfig {
        OverlayConfig {
            display: self.display(),
            hotkey: self.hotkey(),
            filter_mode: self.filter_mode(),
            game_list: crate::filter::split_game_list(&self.game_list()),
        }
    }
}

impl Default for SharedConfigRecord {
    fn default() -> Self {
        Self::from_config(&OverlayConfig::default())
    }
}

impl fmt::Debug for SharedConfigRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (position, visible, enabled, dirty) =
            (self.position, self.visible, self.enabled, self.position_dirty);
        f.debug_struct("SharedConfigRecord")
            .field("position", &position)
            .field("visible", &visible)
            .field("enabled", &enabled)
            .field("position_dirty", &dirty)
            .field("game_list", &self.game_list())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colours_parse_with_and_without_alpha() {
        assert_eq!(Argb::parse_hex("FF00E070"), Some(Argb(0xFF00_E070)));
        assert_eq!(Argb::parse_hex("#00E070"), Some(Argb(0xFF00_E070)));
        assert_eq!(Argb::parse_hex("0xB0202020"), Some(Argb(0xB020_2020)));
        assert_eq!(Argb::parse_hex("green"), None);
        assert_eq!(Argb::parse_hex("123456789"), None);
    }

    #[test]
    fn colour_channel_conversions() {
        let colour = Argb(0x80FF_4020);
        assert_eq!(colour.to_colorref(), 0x0020_40FF);
        let [r, g, b, a] = colour.to_rgba_f32();
        assert_eq!((r, b), (1.0, 32.0 / 255.0));
        assert!((g - 64.0 / 255.0).abs() < f32::EPSILON);
        assert!((a - 128.0 / 255.0).abs() < f32::EPSILON);
        assert_eq!(colour.with_alpha_scaled(0.5).alpha(), 64);
    }

    #[test]
    fn hotkeys_parse_names_and_codes() {
        assert_eq!(Hotkey::parse_key("F1"), Some(0x70));
        assert_eq!(Hotkey::parse_key("f12"), Some(0x7B));
        assert_eq!(Hotkey::parse_key("k"), Some(b'K' as u32));
        assert_eq!(Hotkey::parse_key("0x2D"), Some(0x2D));
        assert_eq!(Hotkey::parse_key("45"), Some(45));
        assert_eq!(Hotkey::parse_key("F99"), None);
        assert_eq!(Hotkey::parse_key(""), None);
        assert_eq!(Hotkey::key_name(0x7B), "F12");
        assert_eq!(Hotkey::key_name(0x2D), "0x2D");

        let hotkey = Hotkey {
            key: VK_F1 + 2,
            ctrl: true,
            alt: false,
            shift: true,
        };
        assert_eq!(hotkey.to_string(), "Ctrl+Shift+F3");
    }

    #[test]
    fn fps_colour_follows_thresholds() {
        let display = DisplaySettings::default();
        assert_eq!(display.color_for_fps(144), display.color_high);
        assert_eq!(display.color_for_fps(60), display.color_high);
        assert_eq!(display.color_for_fps(59), display.color_medium);
        assert_eq!(display.color_for_fps(30), display.color_medium);
        assert_eq!(display.color_for_fps(29), display.color_low);
    }

    #[test]
    fn record_round_trips_config() {
        let config = OverlayConfig {
            display: DisplaySettings {
                corner: Corner::BottomRight,
                offset_x: 24,
                show_frame_time: true,
                ..DisplaySettings::default()
            },
            hotkey: Hotkey {
                key: VK_F1 + 7,
                alt: true,
                ..Hotkey::default()
            },
            filter_mode: FilterMode::Blacklist,
            game_list: vec!["obs64.exe".into(), "discord.exe".into()],
        };

        let record = SharedConfigRecord::from_config(&config);
        assert_eq!(record.game_list(), "obs64.exe;discord.exe");
        assert_eq!(record.to_config(), config);
    }

    #[test]
    fn oversized_game_list_is_truncated_and_terminated() {
        let config = OverlayConfig {
            game_list: vec!["é".repeat(GAME_LIST_CAPACITY)],
            ..OverlayConfig::default()
        };
        let record = SharedConfigRecord::from_config(&config);
        assert_eq!(record.game_list[GAME_LIST_CAPACITY - 1], 0);
        assert!(record.game_list().chars().all(|c| c == 'é'));
    }

    #[test]
    fn garbage_record_values_are_normalized() {
        let mut record = SharedConfigRecord::default();
        record.position = 77;
        record.font_size = -3;
        record.opacity = f32::NAN;
        record.visible = 0xAB;
        record.filter_mode = -1;

        let display = record.display();
        assert_eq!(display.corner, Corner::TopLeft);
        assert_eq!(display.font_size, MIN_FONT_SIZE);
        assert_eq!(display.opacity, 1.0);
        assert!(display.visible);
        assert_eq!(record.filter_mode(), FilterMode::All);
    }
}
