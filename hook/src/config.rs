//! Read side of the shared configuration region.

use std::fmt::Display;
use std::sync::Arc;

use shared::config::{DisplaySettings, SharedConfigRecord};
use tracing::warn;

/// Where the hook gets its per-frame settings from.
pub trait ConfigSource: Send + Sync {
    fn display(&self) -> DisplaySettings;

    /// Whole-record snapshot, for the settings read outside the frame path.
    fn record(&self) -> SharedConfigRecord;
}

/// Fixed configuration, used when the launcher's region is missing.
#[derive(Default)]
pub struct StaticConfig {
    record: SharedConfigRecord,
}

impl StaticConfig {
    pub fn new(record: SharedConfigRecord) -> Self {
        Self { record }
    }
}

impl ConfigSource for StaticConfig {
    fn display(&self) -> DisplaySettings {
        self.record.display()
    }

    fn record(&self) -> SharedConfigRecord {
        self.record
    }
}

/// Whether a launcher holds the configuration region and heartbeat open.
/// A host that loaded the module itself runs standalone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Supervision {
    Launcher,
    Standalone,
}

/// Settings from the launcher's region if it could be opened, defaults
/// otherwise.
pub fn resolve<E: Display>(opened: Result<Arc<dyn ConfigSource>, E>) -> (Arc<dyn ConfigSource>, Supervision) {
    match opened {
        Ok(source) => (source, Supervision::Launcher),
        Err(e) => {
            warn!(error = %e, "Launcher configuration unavailable, using defaults");
            (Arc::new(StaticConfig::default()), Supervision::Standalone)
        }
    }
}

#[cfg(windows)]
pub use view::SharedConfigView;

#[cfg(windows)]
mod view {
    use super::ConfigSource;
    use shared::config::{DisplaySettings, SharedConfigRecord, SHARED_CONFIG_SIZE};
    use shared::CONFIG_SHM_NAME;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Memory::*;

    /// Read-only mapping of the launcher's configuration record.
    pub struct SharedConfigView {
        ptr: *const SharedConfigRecord,
        handle: HANDLE,
    }

    // SAFETY: the view is only ever read through read_volatile copies, and the
    // mapping outlives every reader because the view owns it.
    unsafe impl Send for SharedConfigView {}
    unsafe impl Sync for SharedConfigView {}

    impl SharedConfigView {
        /// Open the region created by the launcher.
        ///
        /// # Safety
        /// The region must have been created with at least
        /// `SHARED_CONFIG_SIZE` bytes.
        pub unsafe fn open() -> windows::core::Result<Self> {
            let name = shared::wide(CONFIG_SHM_NAME);
            let handle = OpenFileMappingW(FILE_MAP_READ.0, false, PCWSTR(name.as_ptr()))?;

            let view = MapViewOfFile(handle, FILE_MAP_READ, 0, 0, SHARED_CONFIG_SIZE);
            if view.Value.is_null() {
                let error = windows::core::Error::from_win32();
                let _ = CloseHandle(handle);
                return Err(error);
            }

            Ok(Self {
                ptr: view.Value as *const SharedConfigRecord,
                handle,
            })
        }
    }

    impl ConfigSource for SharedConfigView {
        fn display(&self) -> DisplaySettings {
            self.record().display()
        }

        fn record(&self) -> SharedConfigRecord {
            // Packed record: alignment 1, so any mapped address is valid.
            unsafe { std::ptr::read_volatile(self.ptr) }
        }
    }

    impl Drop for SharedConfigView {
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
    use shared::config::{Corner, OverlayConfig};

    #[test]
    fn static_config_serves_the_record_it_was_given() {
        let mut config = OverlayConfig::default();
        config.display.corner = Corner::BottomLeft;
        config.display.visible = false;

        let source = StaticConfig::new(SharedConfigRecord::from_config(&config));
        assert_eq!(source.display().corner, Corner::BottomLeft);
        assert!(!source.display().visible);
        assert_eq!(source.record().to_config(), config);
    }

    #[test]
    fn missing_region_runs_standalone_on_defaults() {
        let (source, supervision) = resolve(Err("region not found"));
        assert_eq!(supervision, Supervision::Standalone);
        assert_eq!(source.display(), SharedConfigRecord::default().display());
    }

    #[test]
    fn opened_region_is_supervised() {
        let mut record = SharedConfigRecord::default();
        record.visible = 0;
        let opened: Result<Arc<dyn ConfigSource>, &str> = Ok(Arc::new(StaticConfig::new(record)));

        let (source, supervision) = resolve(opened);
        assert_eq!(supervision, Supervision::Launcher);
        assert!(!source.display().visible);
    }
}
