//! User-mode Memory I/O backend
//!
//! Implements the memory seam over the plain user-mode process APIs for an
//! already-opened target handle. Embedders that go through a driver channel
//! supply their own implementation; the engine does not care which one it
//! gets.

use crate::traits::MemoryIo;
use shade_common::{Error, Protection, Result, WaitStatus, WorkerHandle};
use std::ffi::c_void;
use std::time::Duration;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Diagnostics::Debug::{
    FlushInstructionCache, ReadProcessMemory, WriteProcessMemory,
};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, PAGE_READONLY,
    PAGE_READWRITE,
};
use windows::Win32::System::Threading::{CreateRemoteThread, WaitForSingleObject};

fn to_native(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        Protection::ReadOnly => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::ExecuteRead => PAGE_EXECUTE_READ,
        Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
    }
}

fn from_native(protection: PAGE_PROTECTION_FLAGS) -> Protection {
    if protection == PAGE_READONLY {
        Protection::ReadOnly
    } else if protection == PAGE_EXECUTE_READ {
        Protection::ExecuteRead
    } else if protection == PAGE_EXECUTE_READWRITE {
        Protection::ExecuteReadWrite
    } else {
        Protection::ReadWrite
    }
}

/// Memory I/O over an open process handle
pub struct UserModeMemory {
    process: HANDLE,
}

// HANDLE is a plain kernel object reference; the seam serializes use
unsafe impl Send for UserModeMemory {}
unsafe impl Sync for UserModeMemory {}

impl UserModeMemory {
    /// Wrap an already-opened process handle. The caller keeps ownership;
    /// the handle must stay valid for the lifetime of the session.
    pub fn new(process: HANDLE) -> Self {
        Self { process }
    }
}

impl MemoryIo for UserModeMemory {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut read = 0usize;
        unsafe {
            ReadProcessMemory(
                self.process,
                addr as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                len,
                Some(&mut read),
            )
        }
        .map_err(|e| Error::RemoteRead {
            address: addr,
            len,
            message: e.message(),
        })?;
        if read != len {
            return Err(Error::RemoteRead {
                address: addr,
                len,
                message: format!("short read: {} of {} bytes", read, len),
            });
        }
        Ok(buffer)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        unsafe {
            WriteProcessMemory(
                self.process,
                addr as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut written),
            )
        }
        .map_err(|e| Error::RemoteWrite {
            address: addr,
            len: data.len(),
            message: e.message(),
        })?;
        // Written bytes may be executed immediately afterwards
        unsafe {
            let _ = FlushInstructionCache(self.process, Some(addr as *const c_void), data.len());
        }
        Ok(())
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u64> {
        let addr = unsafe {
            VirtualAllocEx(
                self.process,
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                to_native(protection),
            )
        };
        if addr.is_null() {
            return Err(Error::RemoteAllocation {
                size,
                message: "VirtualAllocEx returned null".to_string(),
            });
        }
        Ok(addr as u64)
    }

    fn free(&self, addr: u64) -> Result<()> {
        unsafe { VirtualFreeEx(self.process, addr as *mut c_void, 0, MEM_RELEASE) }.map_err(
            |e| Error::RemoteWrite {
                address: addr,
                len: 0,
                message: e.message(),
            },
        )
    }

    fn protect(&self, addr: u64, len: usize, protection: Protection) -> Result<Protection> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        unsafe {
            VirtualProtectEx(
                self.process,
                addr as *const c_void,
                len,
                to_native(protection),
                &mut old,
            )
        }
        .map_err(|e| Error::RemoteWrite {
            address: addr,
            len,
            message: e.message(),
        })?;
        Ok(from_native(old))
    }

    fn create_worker(&self, entry: u64, arg: u64) -> Result<WorkerHandle> {
        let start: unsafe extern "system" fn(*mut c_void) -> u32 =
            unsafe { std::mem::transmute(entry as *const c_void) };
        let handle = unsafe {
            CreateRemoteThread(
                self.process,
                None,
                0,
                Some(start),
                Some(arg as *const c_void),
                0,
                None,
            )
        }
        .map_err(|e| Error::WorkerFailed(e.message()))?;
        Ok(WorkerHandle(handle.0 as u64))
    }

    fn wait_one(&self, handle: WorkerHandle, timeout: Duration) -> Result<WaitStatus> {
        let raw = HANDLE(handle.0 as *mut c_void);
        let result = unsafe { WaitForSingleObject(raw, timeout.as_millis() as u32) };
        if result == WAIT_OBJECT_0 {
            // Nobody waits on a signaled worker again
            unsafe {
                let _ = CloseHandle(raw);
            }
            Ok(WaitStatus::Signaled)
        } else if result == WAIT_TIMEOUT {
            Ok(WaitStatus::TimedOut)
        } else {
            Err(Error::WorkerFailed(format!("wait failed: {:#x}", result.0)))
        }
    }
}
