//! Fault-intercepting memory probes.
//!
//! The accessor never dereferences an untrusted address directly. It asks
//! this module to attempt the copy through a kernel-mediated path that
//! reports an invalid access as a value instead of raising it, so a bad
//! pointer costs an error, not the process. Each platform implements the
//! same narrow surface: probe one read, probe one write, snapshot the
//! region around an address.

use std::{cell::RefCell, fmt};

use crate::addr::Address;

mod unix;
mod windows;

#[cfg(unix)]
use self::unix as imp;
#[cfg(windows)]
use self::windows as imp;

/// Kind of access attempted when a fault was intercepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MemoryOperation {
    Read,
    Write,
    Execute,
}

/// Protection bits of a mapped region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const NONE: Self = Self {
        read: false,
        write: false,
        execute: false,
    };

    pub fn allows(self, operation: MemoryOperation) -> bool {
        match operation {
            MemoryOperation::Read => self.read,
            MemoryOperation::Write => self.write,
            MemoryOperation::Execute => self.execute,
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on, c| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read, 'r'),
            flag(self.write, 'w'),
            flag(self.execute, 'x')
        )
    }
}

/// Snapshot of the region containing a probed address, captured when an
/// access violation is raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: Address,
    pub size: usize,
    pub protection: Protection,
    pub mapped: bool,
}

/// One intercepted invalid access. `address` is the first inaccessible
/// sub-address of the attempted range, `size` the size of the whole attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    pub operation: MemoryOperation,
    pub address: Address,
    pub size: usize,
    /// Platform code reported for the fault (errno on unix, the probe API's
    /// error code on windows).
    pub code: u32,
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fault at {} ({} bytes attempted, code {:#x})",
            self.operation, self.address, self.size, self.code
        )
    }
}

/// Probe failure. Invalid accesses are the expected case; anything else is
/// the probe machinery itself failing and is reported as a platform-API
/// error, never swallowed.
#[derive(Debug)]
pub enum ProbeError {
    Fault(FaultRecord),
    Api {
        api: &'static str,
        code: u32,
        message: String,
    },
}

const FAULT_LOG_CAP: usize = 16;

thread_local! {
    static FAULT_LOG: RefCell<Vec<FaultRecord>> = const { RefCell::new(Vec::new()) };
}

fn record(fault: FaultRecord) {
    let _ = FAULT_LOG.try_with(|log| {
        let mut log = log.borrow_mut();
        if log.len() == FAULT_LOG_CAP {
            log.remove(0);
        }
        log.push(fault);
    });
}

/// Most recent intercepted fault on the calling thread, if any.
pub fn last_fault() -> Option<FaultRecord> {
    FAULT_LOG
        .try_with(|log| log.borrow().last().copied())
        .ok()
        .flatten()
}

/// Drains the calling thread's fault log, newest first.
pub(crate) fn drain_faults() -> Vec<FaultRecord> {
    FAULT_LOG
        .try_with(|log| {
            let mut drained: Vec<_> = log.borrow_mut().drain(..).collect();
            drained.reverse();
            drained
        })
        .unwrap_or_default()
}

/// Attempts to copy `out.len()` bytes from `addr` into `out`. An
/// inaccessible source range is reported as a [`FaultRecord`] naming the
/// first bad sub-address and is appended to the thread's fault log.
pub fn probe_read(addr: Address, out: &mut [u8]) -> Result<(), ProbeError> {
    imp::probe_read(addr, out).inspect_err(|e| {
        if let ProbeError::Fault(fault) = e {
            record(*fault);
        }
    })
}

/// Attempts to copy `data` to `addr`. An unwritable destination range is
/// reported as a [`FaultRecord`] naming the first bad sub-address and is
/// appended to the thread's fault log.
pub fn probe_write(addr: Address, data: &[u8]) -> Result<(), ProbeError> {
    imp::probe_write(addr, data).inspect_err(|e| {
        if let ProbeError::Fault(fault) = e {
            record(*fault);
        }
    })
}

/// Region snapshot for the address, or `None` when the platform cannot
/// answer the query at all.
pub fn query_region(addr: Address) -> Option<RegionInfo> {
    imp::query_region(addr)
}

/// Granularity at which probed ranges can start faulting.
pub(crate) fn page_size() -> usize {
    imp::page_size()
}

/// Registers of the capturing thread at the capture site, recorded into
/// system errors for post-mortem correlation with the fault log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterContext {
    pub stack_pointer: usize,
    pub frame_pointer: usize,
}

impl RegisterContext {
    #[inline(never)]
    pub fn capture() -> Self {
        let stack_pointer: usize;
        let frame_pointer: usize;

        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::asm!(
                "mov {sp}, rsp",
                "mov {fp}, rbp",
                sp = out(reg) stack_pointer,
                fp = out(reg) frame_pointer,
                options(nomem, nostack, preserves_flags),
            );
        }

        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!(
                "mov {sp}, sp",
                "mov {fp}, x29",
                sp = out(reg) stack_pointer,
                fp = out(reg) frame_pointer,
                options(nomem, nostack, preserves_flags),
            );
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            stack_pointer = 0;
            frame_pointer = 0;
        }

        RegisterContext {
            stack_pointer,
            frame_pointer,
        }
    }
}

impl fmt::Display for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sp={:#x} fp={:#x}",
            self.stack_pointer, self.frame_pointer
        )
    }
}

#[cfg(test)]
mod test {
    use super::{
        FaultRecord, MemoryOperation, ProbeError, Protection, drain_faults, last_fault,
        probe_read, probe_write, query_region,
    };
    use crate::addr::Address;

    #[test]
    fn probe_round_trip() {
        let source = [0xa5u8; 64];
        let mut sink = [0u8; 64];

        probe_read(Address::of(&source), &mut sink).unwrap();
        assert_eq!(sink, source);

        let mut target = [0u8; 16];
        probe_write(Address::of(&target), &[7u8; 16]).unwrap();
        assert_eq!(target, [7u8; 16]);
    }

    #[test]
    fn faults_are_logged_per_thread() {
        drain_faults();

        let mut sink = [0u8; 8];
        let bad = Address::new(0x8);
        let err = probe_read(bad, &mut sink).unwrap_err();

        let fault = match err {
            ProbeError::Fault(fault) => fault,
            ProbeError::Api { api, code, .. } => panic!("probe api failure: {api} ({code})"),
        };
        assert_eq!(fault.operation, MemoryOperation::Read);
        assert_eq!(fault.size, 8);
        assert_eq!(last_fault(), Some(fault));

        let drained = drain_faults();
        assert_eq!(drained[0], fault);
        assert_eq!(last_fault(), None);
    }

    #[test]
    fn region_query_sees_own_stack() {
        let local = 3u32;
        let region = query_region(Address::of(&local)).expect("no region info for a live local");

        assert!(region.mapped);
        assert!(region.protection.read);
        assert!(region.protection.write);
        assert!(region.size > 0);
        assert!(Address::of(&local).offset_in(region.base) < region.size);
    }

    #[test]
    fn protection_renders_like_maps() {
        assert_eq!(Protection::NONE.to_string(), "---");
        assert_eq!(
            Protection {
                read: true,
                write: false,
                execute: true
            }
            .to_string(),
            "r-x"
        );
        assert!(
            Protection {
                read: true,
                write: true,
                execute: false
            }
            .allows(MemoryOperation::Write)
        );
        assert!(!Protection::NONE.allows(MemoryOperation::Read));
    }

    #[test]
    fn registers_capture_without_faulting() {
        let context = super::RegisterContext::capture();

        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        assert_ne!(context.stack_pointer, 0);

        let _ = context;
    }

    #[test]
    fn fault_display_names_the_operation() {
        let fault = FaultRecord {
            operation: MemoryOperation::Write,
            address: Address::new(0x2000),
            size: 4,
            code: 14,
        };
        let rendered = fault.to_string();

        assert!(rendered.contains("write fault at 0x2000"));
        assert!(rendered.contains("4 bytes"));
    }
}
