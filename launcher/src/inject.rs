//! Process discovery and hook injection through a remote `LoadLibraryW`.

use std::ffi::c_void;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};
use windows::core::{s, w};
use windows::Win32::Foundation::*;
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::Diagnostics::ToolHelp::*;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::*;
use windows::Win32::System::Threading::*;

use crate::tracker::ProcessEntry;

const LOADER_TIMEOUT_MS: u32 = 5_000;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("process snapshot failed: {0}")]
    Snapshot(windows::core::Error),
    #[error("cannot open process {pid}: {source}")]
    Open {
        pid: u32,
        source: windows::core::Error,
    },
    #[error("remote allocation failed in process {0}")]
    Alloc(u32),
    #[error("writing the module path into process {pid} failed: {source}")]
    Write {
        pid: u32,
        source: windows::core::Error,
    },
    #[error("LoadLibraryW not found in kernel32")]
    NoLoader,
    #[error("remote thread creation failed in process {pid}: {source}")]
    Thread {
        pid: u32,
        source: windows::core::Error,
    },
    #[error("loader thread in process {0} did not finish in time")]
    Timeout(u32),
    #[error("LoadLibraryW returned null in process {0}")]
    LoadFailed(u32),
}

/// Every running process.
pub fn list_processes() -> Result<Vec<ProcessEntry>, InjectError> {
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0).map_err(InjectError::Snapshot)?;
        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        let mut processes = Vec::new();
        let mut more = Process32FirstW(snapshot, &mut entry).is_ok();
        while more {
            processes.push(ProcessEntry {
                pid: entry.th32ProcessID,
                name: shared::from_wide(&entry.szExeFile),
            });
            more = Process32NextW(snapshot, &mut entry).is_ok();
        }

        let _ = CloseHandle(snapshot);
        Ok(processes)
    }
}

/// True when `pid` already has a module named `module` loaded. A process we
/// cannot inspect reports false.
pub fn has_module(pid: u32, module: &str) -> bool {
    unsafe {
        let Ok(snapshot) = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) else {
            return false;
        };
        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        let mut found = false;
        let mut more = Module32FirstW(snapshot, &mut entry).is_ok();
        while more && !found {
            found = shared::from_wide(&entry.szModule).eq_ignore_ascii_case(module);
            more = Module32NextW(snapshot, &mut entry).is_ok();
        }

        let _ = CloseHandle(snapshot);
        found
    }
}

/// Owned process handle plus the remote buffer holding the module path.
struct RemoteBuffer {
    process: HANDLE,
    address: *mut c_void,
}

impl Drop for RemoteBuffer {
    fn drop(&mut self) {
        unsafe {
            if !self.address.is_null() {
                let _ = VirtualFreeEx(self.process, self.address, 0, MEM_RELEASE);
            }
            let _ = CloseHandle(self.process);
        }
    }
}

/// Load `dll` into `pid` and wait for the loader thread to return.
pub fn inject(pid: u32, dll: &Path) -> Result<(), InjectError> {
    let path = shared::wide(&dll.to_string_lossy());
    let size = path.len() * std::mem::size_of::<u16>();

    unsafe {
        let process = OpenProcess(
            PROCESS_CREATE_THREAD
                | PROCESS_QUERY_INFORMATION
                | PROCESS_VM_OPERATION
                | PROCESS_VM_WRITE
                | PROCESS_VM_READ,
            false,
            pid,
        )
        .map_err(|source| InjectError::Open { pid, source })?;

        let mut buffer = RemoteBuffer {
            process,
            address: std::ptr::null_mut(),
        };
        buffer.address = VirtualAllocEx(process, None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
        if buffer.address.is_null() {
            return Err(InjectError::Alloc(pid));
        }

        WriteProcessMemory(process, buffer.address, path.as_ptr().cast(), size, None)
            .map_err(|source| InjectError::Write { pid, source })?;

        // kernel32 sits at the same address in every process of a session.
        let kernel32 = GetModuleHandleW(w!("kernel32.dll")).map_err(|_| InjectError::NoLoader)?;
        let load_library = GetProcAddress(kernel32, s!("LoadLibraryW")).ok_or(InjectError::NoLoader)?;
        let start: LPTHREAD_START_ROUTINE = Some(std::mem::transmute::<
            unsafe extern "system" fn() -> isize,
            unsafe extern "system" fn(*mut c_void) -> u32,
        >(load_library));

        let thread = CreateRemoteThread(process, None, 0, start, Some(buffer.address.cast_const()), 0, None)
            .map_err(|source| InjectError::Thread { pid, source })?;
        debug!(pid, "Loader thread started");

        let wait = WaitForSingleObject(thread, LOADER_TIMEOUT_MS);
        let mut exit_code = 0u32;
        let exited = GetExitCodeThread(thread, &mut exit_code).is_ok();
        let _ = CloseHandle(thread);

        if wait != WAIT_OBJECT_0 {
            // The thread may still read the path; leak the buffer.
            buffer.address = std::ptr::null_mut();
            return Err(InjectError::Timeout(pid));
        }
        // The exit code is the low half of the module handle.
        if !exited || exit_code == 0 {
            return Err(InjectError::LoadFailed(pid));
        }
    }

    info!(pid, dll = %dll.display(), "Hook injected");
    Ok(())
}
