//! Error hierarchy with call-trace capture.
//!
//! Every fallible operation in the crate constructs its error at the point
//! of detection, snapshotting the thread's live call stack into it. Errors
//! propagate with `?`; each traced frame unwinds as the error passes
//! through, while the snapshot stays fixed.

use crate::{
    addr::Address,
    detour::HookStatus,
    fault::{self, FaultRecord, MemoryOperation, RegionInfo, RegisterContext},
    stack::CallTrace,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy shared by every operation in the crate.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ErrorKind {
    /// A caller-supplied value failed a precondition.
    #[error("argument `{name}` is invalid: {reason}")]
    Argument {
        name: &'static str,
        reason: &'static str,
    },

    /// The operation is not valid for the object's current state.
    #[error("invalid state: {message}")]
    InvalidState { message: &'static str },

    /// An intercepted invalid memory access. `address` is the exact faulting
    /// sub-address, `size` the size of the whole attempted access.
    #[error("access violation on {operation} of {size} bytes at {address}")]
    AccessViolation {
        address: Address,
        size: usize,
        operation: MemoryOperation,
        region: Option<RegionInfo>,
    },

    /// Fault state collected from the interception layer: the newest record,
    /// the registers at capture, and any earlier undrained records.
    #[error("system fault: {record}")]
    System {
        record: FaultRecord,
        context: RegisterContext,
        nested: Vec<FaultRecord>,
    },

    /// A platform API call failed for a reason other than an invalid access.
    #[error("{api} failed with code {code:#x}: {message}")]
    Api {
        api: &'static str,
        code: u32,
        message: String,
    },

    /// The detour engine reported a non-success status.
    #[error("{status}")]
    Detour { status: HookStatus },

    /// A resource-lock protocol violation.
    #[error("{message}")]
    Lock { message: &'static str },

    /// Value access without holding the resource lock.
    #[error("the calling thread does not hold the resource lock")]
    LockAccess,
}

/// An error carrying the call-trace snapshot captured where it was detected
/// and, optionally, the error that caused it.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    trace: CallTrace,
    #[source]
    cause: Option<Box<Error>>,
}

impl Error {
    /// Wraps `kind` with a snapshot of the calling thread's live stack.
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            trace: CallTrace::capture(),
            cause: None,
        }
    }

    /// Takes exclusive ownership of the error this one supersedes.
    #[must_use]
    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The stack snapshot from the point of detection. Immutable; later
    /// pushes and pops on the detecting thread do not shift it.
    pub fn trace(&self) -> &CallTrace {
        &self.trace
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    pub fn argument(name: &'static str, reason: &'static str) -> Self {
        Error::new(ErrorKind::Argument { name, reason })
    }

    pub fn invalid_state(message: &'static str) -> Self {
        Error::new(ErrorKind::InvalidState { message })
    }

    pub fn api(api: &'static str, code: u32, message: String) -> Self {
        Error::new(ErrorKind::Api { api, code, message })
    }

    pub fn lock(message: &'static str) -> Self {
        Error::new(ErrorKind::Lock { message })
    }

    pub fn lock_access() -> Self {
        Error::new(ErrorKind::LockAccess)
    }

    pub(crate) fn detour(status: HookStatus) -> Self {
        Error::new(ErrorKind::Detour { status })
    }

    /// Builds an access violation around an intercepted fault, snapshotting
    /// the protection of the region containing the faulting address.
    pub(crate) fn access_violation(fault: FaultRecord) -> Self {
        Error::new(ErrorKind::AccessViolation {
            address: fault.address,
            size: fault.size,
            operation: fault.operation,
            region: fault::query_region(fault.address),
        })
    }

    /// Drains the calling thread's fault log into a system error, or `None`
    /// when no fault has been intercepted since the last drain.
    pub fn system() -> Option<Self> {
        let mut nested = fault::drain_faults();
        if nested.is_empty() {
            return None;
        }
        let record = nested.remove(0);

        Some(Error::new(ErrorKind::System {
            record,
            context: RegisterContext::capture(),
            nested,
        }))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

#[cfg(test)]
mod test {
    use std::error::Error as _;

    use super::{Error, ErrorKind, Result};
    use crate::{addr::Address, fault, stack};

    fn faulting_op() -> Result<u8> {
        crate::frame!();
        Err(Error::invalid_state("always fails"))
    }

    fn outer_op() -> Result<u8> {
        crate::frame!();
        let value = faulting_op()?;
        Ok(value)
    }

    #[test]
    fn trace_is_snapshotted_at_detection() {
        let err = outer_op().unwrap_err();

        // Both frames had unwound by the time the error reached us, but the
        // snapshot still holds them in push order.
        assert_eq!(stack::depth(), 0);
        assert_eq!(err.trace().len(), 2);
        assert!(err.trace().frames()[0].function.ends_with("::outer_op"));
        assert!(err.trace().frames()[1].function.ends_with("::faulting_op"));
    }

    #[test]
    fn snapshot_ignores_later_stack_activity() {
        let err = faulting_op().unwrap_err();

        let _noise = stack::enter("noise", "error.rs", 1);
        assert_eq!(err.trace().len(), 1);
        assert!(err.trace().frames()[0].function.ends_with("::faulting_op"));
    }

    #[test]
    fn cause_chain_is_owned_and_visible() {
        let root = Error::argument("addr", "address is null");
        let err = Error::invalid_state("resolve failed").with_cause(root);

        assert!(matches!(err.kind(), ErrorKind::InvalidState { .. }));
        let cause = err.cause().expect("cause lost");
        assert!(matches!(
            cause.kind(),
            ErrorKind::Argument { name: "addr", .. }
        ));

        // std sources walk the same chain.
        let source = err.source().expect("source lost");
        assert_eq!(source.to_string(), cause.to_string());
    }

    #[test]
    fn kind_messages() {
        assert_eq!(
            Error::argument("count", "must be non-zero").to_string(),
            "argument `count` is invalid: must be non-zero"
        );
        assert_eq!(
            Error::lock_access().to_string(),
            "the calling thread does not hold the resource lock"
        );
        assert_eq!(
            Error::api("VirtualQuery", 0x57, "bad parameter".into()).to_string(),
            "VirtualQuery failed with code 0x57: bad parameter"
        );
    }

    #[test]
    fn system_error_drains_the_fault_log() {
        fault::drain_faults();
        assert!(Error::system().is_none());

        let mut sink = [0u8; 4];
        let first = Address::new(0x10);
        let second = Address::new(0x20);
        assert!(fault::probe_read(first, &mut sink).is_err());
        assert!(fault::probe_read(second, &mut sink).is_err());

        let err = Error::system().expect("faults were logged");
        let ErrorKind::System {
            record,
            context,
            nested,
        } = err.kind()
        else {
            panic!("expected a system error");
        };

        // Newest first; the earlier fault lands in the nested list.
        assert_eq!(record.address, second);
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].address, first);
        let _ = context;

        // Drained: a second collection has nothing to report.
        assert!(Error::system().is_none());
    }
}
