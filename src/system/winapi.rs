//! Windows backend for the lock scan:
//! - System handle table and object type table (NtQuerySystemInformation / NtQueryObject)
//! - Remote handle duplication (OpenProcess + DuplicateHandle)
//! - Object name queries on duplicated handles (NtQueryObject)
//! - Drive letter to volume device mapping (GetLogicalDrives + QueryDosDeviceW)

use std::ffi::c_void;
use std::ptr;

use log::trace;
use ntapi::ntexapi::{NtQuerySystemInformation, SystemExtendedHandleInformation};
use ntapi::ntobapi::{NtQueryObject, ObjectNameInformation, ObjectTypesInformation};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, GetLastError, DUPLICATE_HANDLE_OPTIONS, HANDLE,
};
use windows::Win32::Storage::FileSystem::{GetLogicalDrives, QueryDosDeviceW};
use windows::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, PROCESS_DUP_HANDLE, PROCESS_QUERY_LIMITED_INFORMATION,
};

use crate::config::ScanConfig;
use crate::error::{HandleFailure, ResolveError, ScanError, Stage};
use crate::system::buffer::{BufferGrower, QueryStatus};
use crate::system::correlate::SysinfoProcesses;
use crate::system::devices::VolumeSource;
use crate::system::resolver::{HandleBroker, NamedObject};
use crate::system::scan::{HandleSource, LockScanner};
use crate::system::table::{read_utf16, HandleTableEntry, POINTER_SIZE};

/// Scanner wired to the live system.
pub type NativeScanner = LockScanner<NtHandleSource, NtHandleBroker, DosDevices, SysinfoProcesses>;

impl NativeScanner {
    pub fn native(config: ScanConfig) -> Self {
        LockScanner::new(
            NtHandleSource,
            NtHandleBroker,
            DosDevices,
            SysinfoProcesses::new(),
            config,
        )
    }
}

// ─── Owned handles ───────────────────────────────────────────────────────────

/// A handle owned by this process, closed on drop.
pub struct OwnedHandle(HANDLE);

// A kernel handle value is usable from any thread of the owning process
unsafe impl Send for OwnedHandle {}

impl OwnedHandle {
    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() && !self.0 .0.is_null() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

// ─── System tables ───────────────────────────────────────────────────────────

pub struct NtHandleSource;

fn buffer_ptr(buffer: &mut [u8]) -> *mut c_void {
    if buffer.is_empty() {
        ptr::null_mut()
    } else {
        buffer.as_mut_ptr() as *mut c_void
    }
}

impl HandleSource for NtHandleSource {
    fn query_handles(&self, buffer: &mut [u8]) -> QueryStatus {
        let mut return_length: u32 = 0;
        let status = unsafe {
            NtQuerySystemInformation(
                SystemExtendedHandleInformation,
                buffer_ptr(buffer) as _,
                buffer.len() as u32,
                &mut return_length,
            )
        };
        QueryStatus::from_ntstatus(status, return_length, buffer.len())
    }

    fn query_types(&self, buffer: &mut [u8]) -> QueryStatus {
        let mut return_length: u32 = 0;
        let status = unsafe {
            NtQueryObject(
                ptr::null_mut(),
                ObjectTypesInformation,
                buffer_ptr(buffer) as _,
                buffer.len() as u32,
                &mut return_length,
            )
        };
        QueryStatus::from_ntstatus(status, return_length, buffer.len())
    }
}

// ─── Remote handles ──────────────────────────────────────────────────────────

pub struct NtHandleBroker;

impl HandleBroker for NtHandleBroker {
    type Process = OwnedHandle;
    type Duplicate = DuplicatedHandle;

    fn open_process(&self, pid: u32) -> Result<OwnedHandle, ResolveError> {
        // System Idle Process never holds file handles
        if pid == 0 {
            return Err(ResolveError::ProcessUnavailable { pid });
        }
        unsafe {
            OpenProcess(PROCESS_DUP_HANDLE | PROCESS_QUERY_LIMITED_INFORMATION, false, pid)
                .map(OwnedHandle)
                .map_err(|_| ResolveError::ProcessUnavailable { pid })
        }
    }

    fn duplicate(
        &self,
        process: &OwnedHandle,
        entry: &HandleTableEntry,
    ) -> Result<DuplicatedHandle, ResolveError> {
        let mut local = HANDLE::default();
        let result = unsafe {
            DuplicateHandle(
                process.raw(),
                HANDLE(entry.handle as *mut c_void),
                GetCurrentProcess(),
                &mut local,
                0,
                false,
                DUPLICATE_HANDLE_OPTIONS(0),
            )
        };
        match result {
            Ok(()) => Ok(DuplicatedHandle(OwnedHandle(local))),
            Err(err) => {
                trace!(
                    "DuplicateHandle failed, pid: {}, handle: {:#x}, error: {:?}",
                    entry.pid,
                    entry.handle,
                    err
                );
                Err(ResolveError::HandleUnavailable {
                    pid: entry.pid,
                    handle: entry.handle,
                    reason: HandleFailure::DuplicateFailed,
                })
            }
        }
    }
}

/// Local copy of another process's handle, opened with no access rights.
pub struct DuplicatedHandle(OwnedHandle);

impl NamedObject for DuplicatedHandle {
    fn query_name(&self) -> Result<String, HandleFailure> {
        let handle = self.0.raw();
        let buffer = BufferGrower::for_object_name()
            .acquire(Stage::ObjectName, |buf| {
                let mut return_length: u32 = 0;
                let status = unsafe {
                    NtQueryObject(
                        handle.0 as _,
                        ObjectNameInformation,
                        buffer_ptr(buf) as _,
                        buf.len() as u32,
                        &mut return_length,
                    )
                };
                QueryStatus::from_ntstatus(status, return_length, buf.len())
            })
            .map_err(|_| HandleFailure::QueryFailed)?;

        parse_object_name(&buffer)
    }
}

/// Decode an OBJECT_NAME_INFORMATION (a UNICODE_STRING whose characters
/// follow it in the same buffer).
fn parse_object_name(buffer: &[u8]) -> Result<String, HandleFailure> {
    let header = buffer.get(..2 * POINTER_SIZE).ok_or(HandleFailure::QueryFailed)?;
    let length = u16::from_ne_bytes([header[0], header[1]]) as usize;
    let mut raw_ptr = [0u8; POINTER_SIZE];
    raw_ptr.copy_from_slice(&header[POINTER_SIZE..]);
    let name_ptr = usize::from_ne_bytes(raw_ptr);

    if length == 0 || name_ptr == 0 {
        return Err(HandleFailure::Unnamed);
    }
    let offset = name_ptr
        .checked_sub(buffer.as_ptr() as usize)
        .ok_or(HandleFailure::QueryFailed)?;
    read_utf16(buffer, offset, length).ok_or(HandleFailure::QueryFailed)
}

// ─── Drive letters ───────────────────────────────────────────────────────────

pub struct DosDevices;

impl VolumeSource for DosDevices {
    fn mounted_drives(&self) -> Result<Vec<(String, String)>, ScanError> {
        let mask = unsafe { GetLogicalDrives() };
        if mask == 0 {
            let status = unsafe { GetLastError() }.0;
            return Err(ScanError::QueryFailed {
                stage: Stage::DeviceMap,
                status,
            });
        }
        let mut drives = Vec::new();

        for index in 0..26u8 {
            if mask & (1 << index) == 0 {
                continue;
            }
            let drive = format!("{}:", (b'A' + index) as char);
            let wide: Vec<u16> = drive.encode_utf16().chain(std::iter::once(0)).collect();
            let mut target = vec![0u16; 1024];
            let len = unsafe { QueryDosDeviceW(PCWSTR(wide.as_ptr()), Some(target.as_mut_slice())) } as usize;
            if len == 0 {
                continue;
            }
            // The result is a NUL-separated list; the first entry is current
            let first = target[..len.min(target.len())]
                .split(|&c| c == 0)
                .next()
                .unwrap_or(&[]);
            if !first.is_empty() {
                drives.push((drive, String::from_utf16_lossy(first)));
            }
        }

        Ok(drives)
    }
}
