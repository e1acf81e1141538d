//! Production detour backend on top of `retour`.

use retour::RawDetour;

use crate::engine::{Detour, DetourBackend};

pub struct RetourBackend;

pub struct RetourDetour {
    inner: RawDetour,
}

// SAFETY: RetourDetour is only reached through the engine's mutex. The detour
// owns its trampoline allocation and patch bookkeeping, none of which is tied
// to the creating thread.
unsafe impl Send for RetourDetour {}

impl Detour for RetourDetour {
    fn trampoline(&self) -> usize {
        self.inner.trampoline() as *const () as usize
    }

    unsafe fn enable(&mut self) -> Result<(), String> {
        self.inner.enable().map_err(|e| e.to_string())
    }

    unsafe fn disable(&mut self) -> Result<(), String> {
        self.inner.disable().map_err(|e| e.to_string())
    }
}

impl DetourBackend for RetourBackend {
    type Detour = RetourDetour;

    unsafe fn create(&mut self, target: usize, replacement: usize) -> Result<RetourDetour, String> {
        // Trampoline is built here; nothing is patched until enable.
        let inner = RawDetour::new(target as *const (), replacement as *const ())
            .map_err(|e| e.to_string())?;
        Ok(RetourDetour { inner })
    }
}
