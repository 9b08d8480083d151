//! Typed memory accessor.
//!
//! All checked entry points route through the fault-intercepting probes in
//! [`crate::fault`], so a bad address costs an [`ErrorKind::AccessViolation`]
//! carrying the exact faulting sub-address instead of terminating the
//! process. Raw reinterpretation is confined to this module behind the
//! [`Pod`] marker.

use std::{ffi::CString, mem::MaybeUninit, slice};

use tracing::debug;

use crate::{
    addr::{Address, Offset},
    error::{Error, Result},
    fault::{self, ProbeError},
};

/// Marker for types that can be copied raw out of (and into) target memory.
///
/// # Safety
///
/// Implementors must be valid for every bit pattern of their size and must
/// contain no padding bytes; the accessor materializes values from untrusted
/// bytes and serializes them back byte-for-byte.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! impl_pod {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: primitive numeric types admit every bit pattern and
            // carry no padding.
            unsafe impl Pod for $ty {}
        )*
    };
}

impl_pod!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

// SAFETY: arrays of Pod elements are stored contiguously with no padding.
unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

// SAFETY: raw pointers are plain addresses to the accessor; no bit pattern
// is invalid and dereferencing is a separate, checked step.
unsafe impl<T: 'static> Pod for *const T {}
// SAFETY: as above.
unsafe impl<T: 'static> Pod for *mut T {}

fn ensure_addr(addr: Address, name: &'static str) -> Result<()> {
    if addr.is_null() {
        return Err(Error::argument(name, "address is null"));
    }
    Ok(())
}

fn ensure_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::argument("size", "must be non-zero"));
    }
    Ok(())
}

fn probed(result: std::result::Result<(), ProbeError>) -> Result<()> {
    result.map_err(|e| match e {
        ProbeError::Fault(fault) => {
            debug!(%fault, "intercepted invalid access");
            Error::access_violation(fault)
        }
        ProbeError::Api { api, code, message } => Error::api(api, code, message),
    })
}

/// Reads a `T` from `addr`. Unaligned addresses are fine; foreign structures
/// owe us no alignment.
pub fn read<T: Pod>(addr: Address) -> Result<T> {
    crate::frame!();
    ensure_addr(addr, "addr")?;
    ensure_size(size_of::<T>())?;

    let mut value = MaybeUninit::<T>::uninit();
    // SAFETY: the uninit payload is writable for size_of::<T>() bytes.
    let bytes =
        unsafe { slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), size_of::<T>()) };
    probed(fault::probe_read(addr, bytes))?;

    // SAFETY: the probe filled every byte and Pod admits any bit pattern.
    Ok(unsafe { value.assume_init() })
}

/// Fills `out` from consecutive `T`s starting at `addr`.
pub fn read_slice<T: Pod>(addr: Address, out: &mut [T]) -> Result<()> {
    crate::frame!();
    ensure_addr(addr, "addr")?;
    if out.is_empty() {
        return Err(Error::argument("out", "must not be empty"));
    }

    let size = size_of_val(out);
    // SAFETY: out is writable for its full byte size; Pod admits any pattern.
    let bytes = unsafe { slice::from_raw_parts_mut(out.as_mut_ptr().cast::<u8>(), size) };
    probed(fault::probe_read(addr, bytes))
}

pub fn read_bytes(addr: Address, out: &mut [u8]) -> Result<()> {
    crate::frame!();
    read_slice(addr, out)
}

/// Writes `value` to `addr`.
pub fn write<T: Pod>(addr: Address, value: T) -> Result<()> {
    crate::frame!();
    ensure_addr(addr, "addr")?;
    ensure_size(size_of::<T>())?;

    // SAFETY: value lives for the duration of the call and Pod carries no
    // padding, so every byte is initialized.
    let bytes = unsafe { slice::from_raw_parts((&raw const value).cast::<u8>(), size_of::<T>()) };
    probed(fault::probe_write(addr, bytes))
}

/// Writes all of `data` to consecutive `T`s starting at `addr`.
pub fn write_slice<T: Pod>(addr: Address, data: &[T]) -> Result<()> {
    crate::frame!();
    ensure_addr(addr, "addr")?;
    if data.is_empty() {
        return Err(Error::argument("data", "must not be empty"));
    }

    let size = size_of_val(data);
    // SAFETY: data is readable for its full byte size and contains no
    // padding bytes.
    let bytes = unsafe { slice::from_raw_parts(data.as_ptr().cast::<u8>(), size) };
    probed(fault::probe_write(addr, bytes))
}

pub fn write_bytes(addr: Address, data: &[u8]) -> Result<()> {
    crate::frame!();
    write_slice(addr, data)
}

/// Reads a NUL-terminated byte string of at most `max_len` bytes, truncating
/// there if no terminator shows up.
///
/// Probes page by page so a string ending near an unmapped boundary is read
/// successfully up to its terminator.
pub fn read_cstring(addr: Address, max_len: usize) -> Result<CString> {
    crate::frame!();
    ensure_addr(addr, "addr")?;
    if max_len == 0 {
        return Err(Error::argument("max_len", "must be non-zero"));
    }

    let page = fault::page_size();
    let mut out = Vec::new();
    let mut cursor = addr;
    let mut chunk = [0u8; 512];

    while out.len() < max_len {
        let page_room = page - (cursor.get() & (page - 1));
        let want = (max_len - out.len()).min(page_room).min(chunk.len());

        probed(fault::probe_read(cursor, &mut chunk[..want]))?;

        if let Some(nul) = chunk[..want].iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            // SAFETY: out stops before the first NUL seen.
            return Ok(unsafe { CString::from_vec_unchecked(out) });
        }

        out.extend_from_slice(&chunk[..want]);
        cursor += want;
    }

    // SAFETY: no NUL was seen in any byte kept.
    Ok(unsafe { CString::from_vec_unchecked(out) })
}

/// Walks a pointer chain: each step reads the address-sized value stored at
/// the current address, then adds the offset to the value read. The empty
/// chain resolves to `base` itself.
pub fn resolve(base: Address, offsets: &[Offset]) -> Result<Address> {
    crate::frame!();
    ensure_addr(base, "base")?;

    let mut current = base;
    for &offset in offsets {
        let value: usize = read(current)?;
        current = Address::new(value.wrapping_add(offset));
    }
    Ok(current)
}

/// Resolves `offsets` from `base`, then reads a `T` at the final address.
pub fn read_ptr<T: Pod>(base: Address, offsets: &[Offset]) -> Result<T> {
    crate::frame!();
    let addr = resolve(base, offsets)?;
    read(addr)
}

/// Resolves `offsets` from `base`, then writes `value` at the final address.
pub fn write_ptr<T: Pod>(base: Address, offsets: &[Offset], value: T) -> Result<()> {
    crate::frame!();
    let addr = resolve(base, offsets)?;
    write(addr, value)
}

/// Raw unchecked read, bypassing fault interception.
///
/// # Safety
///
/// `addr` must be valid for reads of `size_of::<T>()` bytes for the duration
/// of the call.
pub unsafe fn read_unchecked<T: Pod>(addr: Address) -> T {
    // SAFETY: validity is the caller's contract; alignment is not assumed.
    unsafe { addr.as_ptr::<T>().read_unaligned() }
}

/// Raw unchecked write, bypassing fault interception.
///
/// # Safety
///
/// `addr` must be valid for writes of `size_of::<T>()` bytes for the
/// duration of the call.
pub unsafe fn write_unchecked<T: Pod>(addr: Address, value: T) {
    // SAFETY: as for [`read_unchecked`].
    unsafe { addr.as_mut_ptr::<T>().write_unaligned(value) }
}
