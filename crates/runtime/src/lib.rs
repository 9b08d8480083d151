//! In-process runtime for instrumenting a host process: typed access to its
//! memory with fault interception, pointer-chain resolution, detour
//! installation with scoped lifetimes, and thread-owned resource locking.
//! Every fallible operation reports through [`Error`], which snapshots the
//! instrumented call stack at the point of detection.

pub mod addr;
pub mod detour;
pub mod error;
pub mod fault;
pub mod memory;
pub mod stack;
pub mod sync;

pub use crate::{
    addr::{Address, Offset},
    detour::{Hook, HookStatus, UntypedHook},
    error::{Error, ErrorKind, Result},
    fault::{FaultRecord, MemoryOperation, Protection, RegionInfo},
    stack::CallTrace,
    sync::ResourceLock,
};
