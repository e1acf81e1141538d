//! Process selection: the `games.txt` list and the per-process filter.

use crate::config::FilterMode;

/// Written when `games.txt` does not exist yet.
pub const PROCESS_LIST_TEMPLATE: &str = "\
# FPS Overlay - game list
# One process name per line, for example:
# HollowKnight.exe
# Cuphead.exe
";

/// Executables never worth hooking: shell, system services, terminals and
/// our own launcher.
const EXCLUDED_EXECUTABLES: &[&str] = &[
    "fps-overlay.exe",
    "conhost.exe",
    "explorer.exe",
    "dwm.exe",
    "csrss.exe",
    "svchost.exe",
    "SearchHost.exe",
    "ShellExperienceHost.exe",
    "StartMenuExperienceHost.exe",
    "RuntimeBroker.exe",
    "TextInputHost.exe",
    "taskhostw.exe",
    "ctfmon.exe",
    "cleanmgr.exe",
    "taskmgr.exe",
    "cmd.exe",
    "powershell.exe",
    "WindowsTerminal.exe",
    "OneDrive.exe",
    "OneDriveStandaloneUpdater.exe",
    "BackgroundDownload.exe",
    "ApplicationFrameHost.exe",
    "SystemSettings.exe",
    "SettingsHelper.exe",
    "sihost.exe",
    "fontdrvhost.exe",
    "WmiPrvSE.exe",
    "dllhost.exe",
    "CompPkgSrv.exe",
    "SearchIndexer.exe",
    "SecurityHealthService.exe",
    "MsMpEng.exe",
    "NisSrv.exe",
    "smartscreen.exe",
    "spoolsv.exe",
    "services.exe",
    "lsass.exe",
    "wininit.exe",
    "winlogon.exe",
];

/// Lowercase path fragments marking OS and tooling installs.
const EXCLUDED_PATH_FRAGMENTS: &[&str] = &[
    "\\windows\\",
    "\\microsoft\\",
    "\\onedrive\\",
    "\\system32\\",
    "\\syswow64\\",
    "program files",
    "visual studio",
    "\\appdata\\",
];

/// Parse `games.txt`: one name per line, trimmed, `#` comments skipped.
pub fn parse_process_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Split the semicolon-separated game list from the config record.
pub fn split_game_list(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// File name component of a Windows or POSIX path.
pub fn exe_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// True for shell and service executables, and anything installed under
/// an OS or tooling directory.
pub fn is_system_process(path: &str) -> bool {
    let name = exe_name(path);
    if EXCLUDED_EXECUTABLES
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(name))
    {
        return true;
    }

    let lower = path.to_ascii_lowercase();
    EXCLUDED_PATH_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

/// Applies the configured filter mode to executable names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessFilter {
    mode: FilterMode,
    names: Vec<String>,
}

impl ProcessFilter {
    pub fn new(mode: FilterMode, names: Vec<String>) -> Self {
        Self { mode, names }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn contains(&self, exe: &str) -> bool {
        self.names.iter().any(|name| name.eq_ignore_ascii_case(exe))
    }

    pub fn allows(&self, exe: &str) -> bool {
        match self.mode {
            FilterMode::All => true,
            FilterMode::Whitelist => self.contains(exe),
            FilterMode::Blacklist => !self.contains(exe),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_list_skips_comments_and_blank_lines() {
        let text = "# header\r\n  Brawlhalla.exe  \r\n\r\n#Cuphead.exe\nhl2.exe";
        assert_eq!(parse_process_list(text), ["Brawlhalla.exe", "hl2.exe"]);
        assert!(parse_process_list(PROCESS_LIST_TEMPLATE).is_empty());
    }

    #[test]
    fn game_list_splits_on_semicolons() {
        assert_eq!(split_game_list(" a.exe ;;b.exe;"), ["a.exe", "b.exe"]);
        assert!(split_game_list("").is_empty());
    }

    #[test]
    fn exe_name_handles_both_separators() {
        assert_eq!(exe_name("C:\\Games\\Foo\\foo.exe"), "foo.exe");
        assert_eq!(exe_name("/opt/games/bar"), "bar");
        assert_eq!(exe_name("plain.exe"), "plain.exe");
    }

    #[test]
    fn system_processes_are_excluded() {
        assert!(is_system_process("C:\\Windows\\explorer.exe"));
        assert!(is_system_process("D:\\anything\\DWM.EXE"));
        assert!(is_system_process("C:\\Program Files\\Vendor\\tool.exe"));
        assert!(is_system_process("C:\\Users\\me\\AppData\\Local\\app.exe"));
        assert!(!is_system_process("D:\\Games\\Hollow Knight\\hollow_knight.exe"));
    }

    #[test]
    fn filter_modes() {
        let names = vec!["Game.exe".to_string()];
        let all = ProcessFilter::new(FilterMode::All, names.clone());
        let white = ProcessFilter::new(FilterMode::Whitelist, names.clone());
        let black = ProcessFilter::new(FilterMode::Blacklist, names);

        assert!(all.allows("other.exe"));
        assert!(white.allows("game.EXE"));
        assert!(!white.allows("other.exe"));
        assert!(!black.allows("GAME.exe"));
        assert!(black.allows("other.exe"));
    }
}
