#![cfg(windows)]

//! Windows probes go through `ReadProcessMemory`/`WriteProcessMemory` on the
//! current process. The kernel validates the whole range, reports the number
//! of bytes it managed to copy, and fails with `ERROR_PARTIAL_COPY` or
//! `ERROR_NOACCESS` instead of raising an access violation.

use std::ffi::c_void;

use windows::Win32::{
    Foundation::{ERROR_INVALID_ADDRESS, ERROR_NOACCESS, ERROR_PARTIAL_COPY},
    System::{
        Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory},
        Memory::{
            MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE, PAGE_EXECUTE_READ,
            PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_PROTECTION_FLAGS,
            PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY, VirtualQuery,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
        Threading::GetCurrentProcess,
    },
};

use super::{FaultRecord, MemoryOperation, ProbeError, Protection, RegionInfo};
use crate::addr::Address;

fn is_access_failure(error: &windows::core::Error) -> bool {
    [ERROR_PARTIAL_COPY, ERROR_NOACCESS, ERROR_INVALID_ADDRESS]
        .iter()
        .any(|code| error.code() == code.to_hresult())
}

fn probe_failure(
    api: &'static str,
    error: windows::core::Error,
    operation: MemoryOperation,
    addr: Address,
    copied: usize,
    size: usize,
) -> ProbeError {
    if is_access_failure(&error) {
        ProbeError::Fault(FaultRecord {
            operation,
            // The copied count stops at the first inaccessible byte.
            address: addr + copied,
            size,
            code: error.code().0 as u32,
        })
    } else {
        ProbeError::Api {
            api,
            code: error.code().0 as u32,
            message: error.message(),
        }
    }
}

pub(super) fn probe_read(addr: Address, out: &mut [u8]) -> Result<(), ProbeError> {
    let mut copied = 0usize;

    // SAFETY: out is writable for out.len() bytes; the source range is
    // validated by the kernel rather than dereferenced here.
    let result = unsafe {
        ReadProcessMemory(
            GetCurrentProcess(),
            addr.as_ptr(),
            out.as_mut_ptr().cast::<c_void>(),
            out.len(),
            Some(&mut copied),
        )
    };

    result.map_err(|e| {
        probe_failure(
            "ReadProcessMemory",
            e,
            MemoryOperation::Read,
            addr,
            copied,
            out.len(),
        )
    })
}

pub(super) fn probe_write(addr: Address, data: &[u8]) -> Result<(), ProbeError> {
    let mut copied = 0usize;

    // SAFETY: data is readable for data.len() bytes; the destination range
    // is validated by the kernel rather than dereferenced here.
    let result = unsafe {
        WriteProcessMemory(
            GetCurrentProcess(),
            addr.as_mut_ptr(),
            data.as_ptr().cast::<c_void>(),
            data.len(),
            Some(&mut copied),
        )
    };

    result.map_err(|e| {
        probe_failure(
            "WriteProcessMemory",
            e,
            MemoryOperation::Write,
            addr,
            copied,
            data.len(),
        )
    })
}

fn protection_of(protect: PAGE_PROTECTION_FLAGS) -> Protection {
    // Guard pages fault on first touch regardless of the base protection.
    if protect.contains(PAGE_GUARD) {
        return Protection::NONE;
    }

    let base = PAGE_PROTECTION_FLAGS(protect.0 & 0xff);
    let (read, write, execute) = if base == PAGE_READONLY {
        (true, false, false)
    } else if base == PAGE_READWRITE || base == PAGE_WRITECOPY {
        (true, true, false)
    } else if base == PAGE_EXECUTE {
        (false, false, true)
    } else if base == PAGE_EXECUTE_READ {
        (true, false, true)
    } else if base == PAGE_EXECUTE_READWRITE || base == PAGE_EXECUTE_WRITECOPY {
        (true, true, true)
    } else {
        (false, false, false)
    };

    Protection {
        read,
        write,
        execute,
    }
}

pub(super) fn page_size() -> usize {
    let mut info = SYSTEM_INFO::default();
    // SAFETY: info is a writable out-parameter.
    unsafe { GetSystemInfo(&mut info) };

    let page = info.dwPageSize as usize;
    if page.is_power_of_two() { page } else { 4096 }
}

pub(super) fn query_region(addr: Address) -> Option<RegionInfo> {
    let mut info = MEMORY_BASIC_INFORMATION::default();

    // SAFETY: info is a writable out-parameter of the size passed.
    let len = unsafe {
        VirtualQuery(
            Some(addr.as_ptr()),
            &mut info,
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if len == 0 {
        return None;
    }

    Some(RegionInfo {
        base: Address::from(info.BaseAddress),
        size: info.RegionSize,
        protection: protection_of(info.Protect),
        mapped: info.State == MEM_COMMIT,
    })
}

#[cfg(test)]
mod test {
    use windows::Win32::System::Memory::{
        MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, VirtualAlloc, VirtualFree,
    };

    use super::{probe_read, probe_write, query_region};
    use crate::{
        addr::Address,
        fault::{MemoryOperation, ProbeError},
    };

    struct ReservedPages {
        base: Address,
    }

    impl ReservedPages {
        /// Reserved but never committed; any access faults.
        fn reserve() -> ReservedPages {
            // SAFETY: fresh reservation, released on drop.
            let base = unsafe { VirtualAlloc(None, 0x2000, MEM_RESERVE, PAGE_NOACCESS) };
            assert!(!base.is_null());
            ReservedPages {
                base: Address::from(base),
            }
        }
    }

    impl Drop for ReservedPages {
        fn drop(&mut self) {
            // SAFETY: releases the reservation made in reserve().
            let _ = unsafe { VirtualFree(self.base.as_mut_ptr(), 0, MEM_RELEASE) };
        }
    }

    #[test]
    fn uncommitted_reservation_faults() {
        let pages = ReservedPages::reserve();
        let mut out = [0u8; 16];

        let err = probe_read(pages.base, &mut out).unwrap_err();
        let ProbeError::Fault(fault) = err else {
            panic!("expected a fault, got {err:?}");
        };
        assert_eq!(fault.operation, MemoryOperation::Read);
        assert_eq!(fault.address, pages.base);
        assert_eq!(fault.size, 16);

        let err = probe_write(pages.base, &[1u8; 16]).unwrap_err();
        assert!(matches!(err, ProbeError::Fault(_)));
    }

    #[test]
    fn region_query_distinguishes_reserved_from_committed() {
        let pages = ReservedPages::reserve();

        let reserved = query_region(pages.base).unwrap();
        assert!(!reserved.mapped);

        let local = 5u64;
        let committed = query_region(Address::of(&local)).unwrap();
        assert!(committed.mapped);
        assert!(committed.protection.read);
        assert!(committed.protection.write);
    }
}
