#![cfg(unix)]

//! Unix probes route every copy through a per-thread pipe. The kernel
//! validates the user-space range on both ends: `write(2)` from an
//! unreadable source and `read(2)` into an unwritable destination report
//! `EFAULT` (or a short transfer) instead of delivering a signal, and the
//! transfer count pins the first inaccessible sub-address.

use std::{cell::RefCell, fs, io};

use libc::{c_int, c_void};

use super::{FaultRecord, MemoryOperation, ProbeError, Protection, RegionInfo};
use crate::addr::Address;

// Far below the default pipe capacity, so a staged chunk always fits.
const CHUNK: usize = 4096;

struct ProbePipe {
    read_fd: c_int,
    write_fd: c_int,
}

impl ProbePipe {
    fn new() -> io::Result<ProbePipe> {
        let mut fds = [0 as c_int; 2];

        // SAFETY: fds points at two writable file descriptor slots.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let pipe = ProbePipe {
            read_fd: fds[0],
            write_fd: fds[1],
        };

        // Non-blocking read end lets drain() stop at "empty".
        // SAFETY: the fd is owned by this pipe.
        let flags = unsafe { libc::fcntl(pipe.read_fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(pipe.read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(pipe)
    }

    /// Empties the pipe after a failed probe so the next one starts clean.
    fn drain(&self) {
        let mut scratch = [0u8; CHUNK];
        loop {
            // SAFETY: scratch is writable for CHUNK bytes.
            let n = unsafe { libc::read(self.read_fd, scratch.as_mut_ptr().cast(), CHUNK) };
            if n > 0 || (n < 0 && errno() == libc::EINTR) {
                continue;
            }
            break;
        }
    }
}

impl Drop for ProbePipe {
    fn drop(&mut self) {
        // SAFETY: both fds are owned and open.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

thread_local! {
    static PROBE_PIPE: RefCell<Option<ProbePipe>> = const { RefCell::new(None) };
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn api_error(api: &'static str, code: i32) -> ProbeError {
    ProbeError::Api {
        api,
        code: code as u32,
        message: io::Error::from_raw_os_error(code).to_string(),
    }
}

fn with_pipe<R>(f: impl FnOnce(&ProbePipe) -> Result<R, ProbeError>) -> Result<R, ProbeError> {
    PROBE_PIPE
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                let pipe = ProbePipe::new()
                    .map_err(|e| api_error("pipe", e.raw_os_error().unwrap_or(0)))?;
                *slot = Some(pipe);
            }
            f(slot.as_ref().unwrap())
        })
        .unwrap_or_else(|_| {
            Err(ProbeError::Api {
                api: "thread_local",
                code: 0,
                message: "probe state unavailable during thread teardown".into(),
            })
        })
}

pub(super) fn probe_read(addr: Address, out: &mut [u8]) -> Result<(), ProbeError> {
    with_pipe(|pipe| {
        let mut done = 0;
        while done < out.len() {
            let len = CHUNK.min(out.len() - done);

            // SAFETY: the kernel validates the source range; an unreadable
            // byte surfaces as EFAULT or a short count, never a signal.
            let n = unsafe { libc::write(pipe.write_fd, (addr + done).as_ptr::<c_void>(), len) };
            if n < 0 {
                let code = errno();
                if code == libc::EINTR {
                    continue;
                }
                pipe.drain();
                if code == libc::EFAULT {
                    return Err(ProbeError::Fault(FaultRecord {
                        operation: MemoryOperation::Read,
                        address: addr + done,
                        size: out.len(),
                        code: code as u32,
                    }));
                }
                return Err(api_error("write", code));
            }
            let n = n as usize;

            // Pull the validated bytes back out into the destination slice.
            let mut pulled = 0;
            while pulled < n {
                // SAFETY: out is writable for n - pulled bytes past done + pulled.
                let got = unsafe {
                    libc::read(
                        pipe.read_fd,
                        out.as_mut_ptr().add(done + pulled).cast(),
                        n - pulled,
                    )
                };
                if got > 0 {
                    pulled += got as usize;
                    continue;
                }
                let code = if got < 0 { errno() } else { 0 };
                if code == libc::EINTR {
                    continue;
                }
                pipe.drain();
                return Err(api_error("read", code));
            }

            if n < len {
                // Short write: the first inaccessible byte is right past it.
                pipe.drain();
                return Err(ProbeError::Fault(FaultRecord {
                    operation: MemoryOperation::Read,
                    address: addr + done + n,
                    size: out.len(),
                    code: libc::EFAULT as u32,
                }));
            }
            done += n;
        }
        Ok(())
    })
}

pub(super) fn probe_write(addr: Address, data: &[u8]) -> Result<(), ProbeError> {
    with_pipe(|pipe| {
        let mut done = 0;
        while done < data.len() {
            let len = CHUNK.min(data.len() - done);

            // Stage the chunk; the source slice is ours and always valid.
            let mut staged = 0;
            while staged < len {
                // SAFETY: data is readable for len - staged bytes past done + staged.
                let n = unsafe {
                    libc::write(
                        pipe.write_fd,
                        data.as_ptr().add(done + staged).cast(),
                        len - staged,
                    )
                };
                if n < 0 {
                    let code = errno();
                    if code == libc::EINTR {
                        continue;
                    }
                    pipe.drain();
                    return Err(api_error("write", code));
                }
                staged += n as usize;
            }

            // Land the chunk at the destination. A fault mid-copy yields a
            // short count first; the retry then hits the bad byte head-on
            // and reports EFAULT at exactly that sub-address.
            let mut landed = 0;
            while landed < len {
                // SAFETY: the kernel validates the destination range.
                let n = unsafe {
                    libc::read(
                        pipe.read_fd,
                        (addr + done + landed).as_mut_ptr::<c_void>(),
                        len - landed,
                    )
                };
                if n > 0 {
                    landed += n as usize;
                    continue;
                }
                let code = if n < 0 { errno() } else { 0 };
                if code == libc::EINTR {
                    continue;
                }
                pipe.drain();
                if code == libc::EFAULT {
                    return Err(ProbeError::Fault(FaultRecord {
                        operation: MemoryOperation::Write,
                        address: addr + done + landed,
                        size: data.len(),
                        code: code as u32,
                    }));
                }
                return Err(api_error("read", code));
            }
            done += len;
        }
        Ok(())
    })
}

pub(super) fn page_size() -> usize {
    // SAFETY: queries a constant.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 && (n as usize).is_power_of_two() {
        n as usize
    } else {
        4096
    }
}

pub(super) fn query_region(addr: Address) -> Option<RegionInfo> {
    let maps = fs::read_to_string("/proc/self/maps").ok()?;
    let target = addr.get();
    let mut gap_start = 0usize;

    for line in maps.lines() {
        let Some((range, rest)) = line.split_once(' ') else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            continue;
        };

        if target < start {
            // The address sits in the hole before this mapping.
            return Some(RegionInfo {
                base: Address::new(gap_start),
                size: start - gap_start,
                protection: Protection::NONE,
                mapped: false,
            });
        }
        if target < end {
            let perms = rest.as_bytes();
            return Some(RegionInfo {
                base: Address::new(start),
                size: end - start,
                protection: Protection {
                    read: perms.first() == Some(&b'r'),
                    write: perms.get(1) == Some(&b'w'),
                    execute: perms.get(2) == Some(&b'x'),
                },
                mapped: true,
            });
        }
        gap_start = end;
    }

    // Past the last mapping; open-ended hole.
    Some(RegionInfo {
        base: Address::new(gap_start),
        size: 0,
        protection: Protection::NONE,
        mapped: false,
    })
}
