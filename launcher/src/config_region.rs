//! The launcher's side of the shared configuration: the record every hooked
//! process reads, and the files it is loaded from and persisted to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use shared::config::{Corner, OverlayConfig, SharedConfigRecord};
use shared::ini::{self, ConfigError};
use shared::watch::FileWatcher;
use tracing::{debug, info, warn};

/// Where the current record lives: the named mapping, or an in-process
/// record under test.
pub trait RecordStore: Send + Sync {
    fn read(&self) -> SharedConfigRecord;
    fn write(&self, record: &SharedConfigRecord);
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct LocalRecord(parking_lot::Mutex<SharedConfigRecord>);

#[cfg(test)]
impl RecordStore for LocalRecord {
    fn read(&self) -> SharedConfigRecord {
        *self.0.lock()
    }

    fn write(&self, record: &SharedConfigRecord) {
        *self.0.lock() = *record;
    }
}

/// Record for a freshly loaded config. Visibility and the enabled flag are
/// runtime state owned by the hotkey, so they survive the reload.
pub fn reloaded(current: &SharedConfigRecord, loaded: &OverlayConfig) -> SharedConfigRecord {
    let mut record = SharedConfigRecord::from_config(loaded);
    record.visible = current.visible;
    record.enabled = current.enabled;
    record
}

/// Flip visibility. Returns the new state.
pub fn toggle_visible(store: &dyn RecordStore) -> bool {
    let mut record = store.read();
    record.visible = u8::from(record.visible == 0);
    store.write(&record);
    record.visible != 0
}

/// Anchor the overlay at custom coordinates and mark them for persistence.
pub fn set_position(store: &dyn RecordStore, x: i32, y: i32) {
    let mut record = store.read();
    record.position = Corner::Custom.to_raw();
    record.custom_x = x;
    record.custom_y = y;
    record.position_dirty = 1;
    store.write(&record);
}

/// Coordinates waiting to be written to disk, clearing the mark.
pub fn take_position(store: &dyn RecordStore) -> Option<(i32, i32)> {
    let mut record = store.read();
    if record.position_dirty == 0 {
        return None;
    }
    record.position_dirty = 0;
    store.write(&record);
    Some((record.custom_x, record.custom_y))
}

/// Keeps the shared record and the process list in step with the files on
/// disk, and writes dragged positions back.
pub struct ConfigSync {
    config_path: PathBuf,
    config_watcher: FileWatcher,
    list_watcher: FileWatcher,
    store: Arc<dyn RecordStore>,
    games: Arc<RwLock<Vec<String>>>,
}

impl ConfigSync {
    /// Load both files, creating them on first run, and publish the result.
    pub fn load(
        config_path: &Path,
        list_path: &Path,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, ConfigError> {
        let config = ini::load_or_create(config_path)?;
        store.write(&SharedConfigRecord::from_config(&config));

        let games = ini::load_or_create_process_list(list_path)?;
        info!(count = games.len(), path = %list_path.display(), "Loaded process list");

        Ok(Self {
            config_path: config_path.to_path_buf(),
            config_watcher: FileWatcher::new(config_path),
            list_watcher: FileWatcher::new(list_path),
            store,
            games: Arc::new(RwLock::new(games)),
        })
    }

    /// Process list shared with the injector.
    pub fn games(&self) -> Arc<RwLock<Vec<String>>> {
        Arc::clone(&self.games)
    }

    /// One polling pass. Errors are logged and retried on the next pass.
    pub fn poll(&mut self) {
        if let Some((x, y)) = take_position(self.store.as_ref()) {
            if let Err(e) = ini::persist_position(&self.config_path, x, y) {
                warn!(error = %e, "Could not persist overlay position");
            }
        }

        if self.config_watcher.poll() {
            match ini::load_or_create(&self.config_path) {
                Ok(config) => {
                    let record = reloaded(&self.store.read(), &config);
                    self.store.write(&record);
                    info!(corner = ?config.display.corner, "Reloaded overlay config");
                }
                Err(e) => warn!(error = %e, "Config reload failed, keeping previous settings"),
            }
        }

        if let Some(text) = self.list_watcher.read_if_changed() {
            let games = shared::filter::parse_process_list(&text);
            debug!(count = games.len(), "Reloaded process list");
            *self.games.write() = games;
        }
    }
}

#[cfg(windows)]
pub use region::ConfigRegion;

#[cfg(windows)]
mod region {
    use super::RecordStore;
    use shared::config::{SharedConfigRecord, SHARED_CONFIG_SIZE};
    use shared::ring::IpcError;
    use shared::CONFIG_SHM_NAME;
    use tracing::debug;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Memory::*;

    /// Named mapping holding the record. Lives for the launcher's lifetime;
    /// hooked processes keep their own views open.
    pub struct ConfigRegion {
        ptr: *mut SharedConfigRecord,
        handle: HANDLE,
    }

    // SAFETY: every access is a whole-record volatile copy; the mapping is
    // owned by this value.
    unsafe impl Send for ConfigRegion {}
    unsafe impl Sync for ConfigRegion {}

    impl ConfigRegion {
        /// Create the region and fill it with `initial`.
        ///
        /// # Safety
        /// Must not race another launcher creating the same region; the
        /// single-instance mutex guarantees that.
        pub unsafe fn create(initial: &SharedConfigRecord) -> Result<Self, IpcError> {
            let name = shared::wide(CONFIG_SHM_NAME);
            let handle = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                SHARED_CONFIG_SIZE as u32,
                PCWSTR(name.as_ptr()),
            )
            .map_err(|e| IpcError::open(CONFIG_SHM_NAME, e))?;

            let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, SHARED_CONFIG_SIZE);
            if view.Value.is_null() {
                let error = windows::core::Error::from_win32();
                let _ = CloseHandle(handle);
                return Err(IpcError::open(CONFIG_SHM_NAME, error));
            }

            let region = Self {
                ptr: view.Value as *mut SharedConfigRecord,
                handle,
            };
            region.write(initial);
            debug!(size = SHARED_CONFIG_SIZE, "Shared config region created");
            Ok(region)
        }

        /// Open the region of a running launcher, for one-shot commands.
        ///
        /// # Safety
        /// The region must have been created by [`ConfigRegion::create`].
        pub unsafe fn open_existing() -> Result<Self, IpcError> {
            let name = shared::wide(CONFIG_SHM_NAME);
            let handle = OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(name.as_ptr()))
                .map_err(|e| IpcError::open(CONFIG_SHM_NAME, e))?;

            let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, SHARED_CONFIG_SIZE);
            if view.Value.is_null() {
                let error = windows::core::Error::from_win32();
                let _ = CloseHandle(handle);
                return Err(IpcError::open(CONFIG_SHM_NAME, error));
            }

            Ok(Self {
                ptr: view.Value as *mut SharedConfigRecord,
                handle,
            })
        }
    }

    impl RecordStore for ConfigRegion {
        fn read(&self) -> SharedConfigRecord {
            unsafe { std::ptr::read_volatile(self.ptr) }
        }

        fn write(&self, record: &SharedConfigRecord) {
            unsafe { std::ptr::write_volatile(self.ptr, *record) }
        }
    }

    impl Drop for ConfigRegion {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.ptr as *mut _,
                });
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::{Duration, SystemTime};

    fn touch(path: &Path, at: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(at)
            .unwrap();
    }

    #[test]
    fn reload_keeps_runtime_visibility() {
        let mut current = SharedConfigRecord::default();
        current.visible = 0;

        let mut loaded = OverlayConfig::default();
        loaded.display.font_size = 20;
        let record = reloaded(&current, &loaded);

        assert_eq!(record.visible, 0);
        assert_eq!(record.enabled, 1);
        assert_eq!(record.display().font_size, 20);
    }

    #[test]
    fn toggle_flips_and_reports_visibility() {
        let store = LocalRecord::default();
        assert!(!toggle_visible(&store));
        assert!(!store.read().display().visible);
        assert!(toggle_visible(&store));
    }

    #[test]
    fn position_is_taken_once() {
        let store = LocalRecord::default();
        assert_eq!(take_position(&store), None);

        set_position(&store, 300, 40);
        assert_eq!(store.read().display().corner, Corner::Custom);
        assert_eq!(take_position(&store), Some((300, 40)));
        assert_eq!(take_position(&store), None);
    }

    #[test]
    fn first_load_creates_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fps_overlay.ini");
        let list_path = dir.path().join("games.txt");

        let store: Arc<dyn RecordStore> = Arc::new(LocalRecord::default());
        let sync = ConfigSync::load(&config_path, &list_path, Arc::clone(&store)).unwrap();

        assert!(config_path.exists());
        assert!(list_path.exists());
        assert!(sync.games().read().is_empty());
        assert_eq!(store.read().display(), OverlayConfig::default().display);
    }

    #[test]
    fn poll_persists_position_and_reloads_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fps_overlay.ini");
        let list_path = dir.path().join("games.txt");
        let store: Arc<dyn RecordStore> = Arc::new(LocalRecord::default());
        let mut sync = ConfigSync::load(&config_path, &list_path, Arc::clone(&store)).unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        touch(&config_path, base);
        touch(&list_path, base);
        sync.poll();

        toggle_visible(store.as_ref());
        set_position(store.as_ref(), 120, 80);
        fs::write(&list_path, "# games\nCuphead.exe\n").unwrap();
        touch(&list_path, base + Duration::from_secs(5));
        sync.poll();

        let text = fs::read_to_string(&config_path).unwrap();
        assert!(text.contains("CustomX=120"));
        assert!(text.contains("CustomY=80"));
        assert_eq!(*sync.games().read(), ["Cuphead.exe"]);

        let display = store.read().display();
        assert_eq!(display.corner, Corner::Custom);
        assert_eq!((display.custom_x, display.custom_y), (120, 80));
        assert!(!display.visible);
        assert_eq!(store.read().position_dirty, 0);
    }
}
