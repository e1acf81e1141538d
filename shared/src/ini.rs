//! `fps_overlay.ini`: a lenient INI reader/writer and the mapping between
//! its keys and [`OverlayConfig`].
//!
//! Parsing never fails. Unknown sections and keys are kept so a rewrite
//! preserves them; malformed values fall back to the default for that key
//! alone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Argb, Corner, DisplaySettings, FilterMode, Hotkey, OverlayConfig};
use crate::filter::split_game_list;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

/// Ordered INI document. Section and key lookups ignore ASCII case.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<Section>,
}

impl IniDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `[Section]` headers and `Key=Value` lines. `;` and `#` start a
    /// comment line; anything else unparseable is skipped.
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::new();
        let mut current = String::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                doc.section_mut(&current);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            doc.set(&current, key, value.trim());
        }

        doc
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(section))?
            .entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace, keeping the position of an existing key.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let section = self.section_mut(section);
        match section
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, existing)) => *existing = value,
            None => section.entries.push((key.to_string(), value)),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !section.name.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push('[');
                out.push_str(&section.name);
                out.push_str("]\n");
            }
            for (key, value) in &section.entries {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }
        out
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        let index = match self
            .sections
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Typed lookup with per-key fallback.
struct Reader<'a> {
    doc: &'a IniDocument,
}

impl Reader<'_> {
    fn value<T>(
        &self,
        section: &str,
        key: &str,
        default: T,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> T {
        match self.doc.get(section, key) {
            None => default,
            Some(raw) => parse(raw).unwrap_or_else(|| {
                warn!(section, key, value = raw, "Invalid config value, using default");
                default
            }),
        }
    }

    fn number<T: FromStr>(&self, section: &str, key: &str, default: T) -> T {
        self.value(section, key, default, |raw| raw.trim().parse().ok())
    }

    fn flag(&self, section: &str, key: &str, default: bool) -> bool {
        self.value(section, key, default, parse_bool)
    }

    fn color(&self, section: &str, key: &str, default: Argb) -> Argb {
        self.value(section, key, default, Argb::parse_hex)
    }
}

/// Map a parsed document onto the overlay configuration.
pub fn overlay_config_from(doc: &IniDocument) -> OverlayConfig {
    let r = Reader { doc };
    let d = DisplaySettings::default();
    let h = Hotkey::default();

    let display = DisplaySettings {
        corner: r.value("Display", "Position", d.corner, Corner::parse),
        offset_x: r.number("Display", "OffsetX", d.offset_x),
        offset_y: r.number("Display", "OffsetY", d.offset_y),
        custom_x: r.number("Display", "CustomX", d.custom_x),
        custom_y: r.number("Display", "CustomY", d.custom_y),
        font_size: r.number("Display", "FontSize", d.font_size),
        font_scale: r.number("Display", "FontScale", d.font_scale),
        show_background: r.flag("Display", "ShowBackground", d.show_background),
        opacity: r.number("Display", "Opacity", d.opacity),
        show_frame_time: r.flag("Display", "ShowFrameTime", d.show_frame_time),
        visible: r.flag("Display", "Visible", d.visible),
        enabled: d.enabled,
        color_high: r.color("Colors", "HighFPS", d.color_high),
        color_medium: r.color("Colors", "MediumFPS", d.color_medium),
        color_low: r.color("Colors", "LowFPS", d.color_low),
        color_background: r.color("Colors", "Background", d.color_background),
        high_threshold: r.number("Colors", "HighThreshold", d.high_threshold),
        medium_threshold: r.number("Colors", "MediumThreshold", d.medium_threshold),
    };

    let hotkey = Hotkey {
        key: r.value("Hotkey", "Toggle", h.key, Hotkey::parse_key),
        ctrl: r.flag("Hotkey", "Ctrl", h.ctrl),
        alt: r.flag("Hotkey", "Alt", h.alt),
        shift: r.flag("Hotkey", "Shift", h.shift),
    };

    OverlayConfig {
        display,
        hotkey,
        filter_mode: r.value("Filter", "Mode", FilterMode::All, FilterMode::parse),
        game_list: split_game_list(doc.get("Filter", "Games").unwrap_or_default()),
    }
    .normalized()
}

/// Write every known key of `config` into `doc`, leaving other keys alone.
pub fn apply_overlay_config(doc: &mut IniDocument, config: &OverlayConfig) {
    let d = &config.display;
    doc.set("Display", "Position", d.corner.as_str());
    doc.set("Display", "OffsetX", d.offset_x.to_string());
    doc.set("Display", "OffsetY", d.offset_y.to_string());
    doc.set("Display", "CustomX", d.custom_x.to_string());
    doc.set("Display", "CustomY", d.custom_y.to_string());
    doc.set("Display", "FontSize", d.font_size.to_string());
    doc.set("Display", "FontScale", d.font_scale.to_string());
    doc.set("Display", "ShowBackground", bool_str(d.show_background));
    doc.set("Display", "Opacity", d.opacity.to_string());
    doc.set("Display", "ShowFrameTime", bool_str(d.show_frame_time));
    doc.set("Display", "Visible", bool_str(d.visible));

    doc.set("Colors", "HighFPS", d.color_high.to_string());
    doc.set("Colors", "MediumFPS", d.color_medium.to_string());
    doc.set("Colors", "LowFPS", d.color_low.to_string());
    doc.set("Colors", "Background", d.color_background.to_string());
    doc.set("Colors", "HighThreshold", d.high_threshold.to_string());
    doc.set("Colors", "MediumThreshold", d.medium_threshold.to_string());

    doc.set("Hotkey", "Toggle", Hotkey::key_name(config.hotkey.key));
    doc.set("Hotkey", "Ctrl", bool_str(config.hotkey.ctrl));
    doc.set("Hotkey", "Alt", bool_str(config.hotkey.alt));
    doc.set("Hotkey", "Shift", bool_str(config.hotkey.shift));

    doc.set("Filter", "Mode", config.filter_mode.as_str());
    doc.set("Filter", "Games", config.joined_game_list());
}

pub fn overlay_config_document(config: &OverlayConfig) -> IniDocument {
    let mut doc = IniDocument::new();
    apply_overlay_config(&mut doc, config);
    doc
}

fn read_document(path: &Path) -> Result<Option<IniDocument>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(IniDocument::parse(&text))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_document(path: &Path, doc: &IniDocument) -> Result<(), ConfigError> {
    fs::write(path, doc.render()).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the config file, writing one with every default on first run.
pub fn load_or_create(path: &Path) -> Result<OverlayConfig, ConfigError> {
    match read_document(path)? {
        Some(doc) => {
            debug!(path = %path.display(), "Loaded overlay config");
            Ok(overlay_config_from(&doc))
        }
        None => {
            let config = OverlayConfig::default();
            write_document(path, &overlay_config_document(&config))?;
            info!(path = %path.display(), "Created default overlay config");
            Ok(config)
        }
    }
}

/// Persist custom coordinates, switching the anchor to `Custom`.
pub fn persist_position(path: &Path, x: i32, y: i32) -> Result<(), ConfigError> {
    let mut doc = read_document(path)?.unwrap_or_default();
    doc.set("Display", "Position", Corner::Custom.as_str());
    doc.set("Display", "CustomX", x.to_string());
    doc.set("Display", "CustomY", y.to_string());
    write_document(path, &doc)?;
    info!(x, y, "Persisted overlay position");
    Ok(())
}

/// Load `games.txt`, creating it from the template when missing.
pub fn load_or_create_process_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(crate::filter::parse_process_list(&text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::write(path, crate::filter::PROCESS_LIST_TEMPLATE).map_err(|source| {
                ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            info!(path = %path.display(), "Created process list template");
            Ok(Vec::new())
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_comments_and_case_insensitive_keys() {
        let doc = IniDocument::parse(
            "; leading comment\n\
             [display]\n\
             POSITION = BottomRight\n\
             # another\n\
             garbage line\n\
             =no key\n\
             [Filter]\n\
             Games=a.exe;b.exe\n",
        );
        assert_eq!(doc.get("Display", "Position"), Some("BottomRight"));
        assert_eq!(doc.get("filter", "games"), Some("a.exe;b.exe"));
        assert_eq!(doc.get("Display", "garbage line"), None);
    }

    #[test]
    fn malformed_values_fall_back_per_key() {
        let doc = IniDocument::parse(
            "[Display]\nPosition=Sideways\nOffsetX=abc\nOffsetY=42\nShowBackground=nope\n\
             [Colors]\nHighFPS=zzz\nLowFPS=FF112233\n\
             [Hotkey]\nToggle=F5\nCtrl=yes\n\
             [Filter]\nMode=whitelist\nGames=game.exe",
        );
        let config = overlay_config_from(&doc);
        let defaults = DisplaySettings::default();

        assert_eq!(config.display.corner, defaults.corner);
        assert_eq!(config.display.offset_x, defaults.offset_x);
        assert_eq!(config.display.offset_y, 42);
        assert_eq!(config.display.show_background, defaults.show_background);
        assert_eq!(config.display.color_high, defaults.color_high);
        assert_eq!(config.display.color_low, Argb(0xFF11_2233));
        assert_eq!(config.hotkey.key, 0x74);
        assert!(config.hotkey.ctrl);
        assert_eq!(config.filter_mode, FilterMode::Whitelist);
        assert_eq!(config.game_list, ["game.exe"]);
    }

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(
            overlay_config_from(&IniDocument::parse("")),
            OverlayConfig::default()
        );
    }

    #[test]
    fn written_config_reads_back() {
        let mut config = OverlayConfig::default();
        config.display.corner = Corner::Custom;
        config.display.custom_x = 640;
        config.display.opacity = 0.75;
        config.hotkey.shift = true;
        config.filter_mode = FilterMode::Blacklist;
        config.game_list = vec!["x.exe".into()];

        let text = overlay_config_document(&config).render();
        assert_eq!(overlay_config_from(&IniDocument::parse(&text)), config);
    }

    #[test]
    fn set_preserves_unknown_keys_and_order() {
        let mut doc = IniDocument::parse("[Display]\nA=1\nPosition=TopLeft\nB=2\n[Extra]\nKeep=me\n");
        doc.set("display", "position", "Custom");
        assert_eq!(
            doc.render(),
            "[Display]\nA=1\nPosition=Custom\nB=2\n\n[Extra]\nKeep=me\n"
        );
    }

    #[test]
    fn first_load_creates_defaults_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fps_overlay.ini");

        let config = load_or_create(&path).unwrap();
        assert_eq!(config, OverlayConfig::default());
        assert!(path.exists());
        assert_eq!(load_or_create(&path).unwrap(), config);
    }

    #[test]
    fn position_is_persisted_as_custom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fps_overlay.ini");
        fs::write(&path, "[Display]\nFontSize=18\n").unwrap();

        persist_position(&path, 300, 120).unwrap();
        let config = load_or_create(&path).unwrap();
        assert_eq!(config.display.corner, Corner::Custom);
        assert_eq!((config.display.custom_x, config.display.custom_y), (300, 120));
        assert_eq!(config.display.font_size, 18);
    }

    #[test]
    fn process_list_template_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.txt");

        assert!(load_or_create_process_list(&path).unwrap().is_empty());
        fs::write(&path, "game.exe\n").unwrap();
        assert_eq!(load_or_create_process_list(&path).unwrap(), ["game.exe"]);
    }
}
