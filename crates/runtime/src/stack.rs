//! Per-thread call-stack diagnostics.
//!
//! Traced operations record a logical frame for the duration of their scope.
//! The live stack is thread-local; a frame pushed by [`enter`] is popped when
//! its [`FrameGuard`] drops, so the success path and `?` propagation unwind
//! identically. Errors capture an immutable [`CallTrace`] snapshot at the
//! point of detection, decoupled from all later stack mutation.

use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    thread::{self, ThreadId},
};

/// One logical frame of a traced operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {} ({}:{})", self.function, self.file, self.line)
    }
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pushes a frame onto the calling thread's live stack, returning the guard
/// that pops it. Prefer [`frame!`](crate::frame) at the top of a traced
/// function over calling this directly.
pub fn enter(function: &'static str, file: &'static str, line: u32) -> FrameGuard {
    let _ = FRAMES.try_with(|frames| {
        frames.borrow_mut().push(Frame {
            function,
            file,
            line,
        });
    });

    FrameGuard {
        _not_send: PhantomData,
    }
}

/// Number of frames currently live on the calling thread.
pub fn depth() -> usize {
    FRAMES.try_with(|frames| frames.borrow().len()).unwrap_or(0)
}

/// Pops the frame pushed by [`enter`] when dropped. Not `Send`; the frame
/// belongs to the thread that entered it.
#[must_use = "dropping the guard immediately would end the frame here"]
pub struct FrameGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // try_with: the guard may outlive thread-local storage during
        // thread teardown.
        let _ = FRAMES.try_with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Immutable snapshot of one thread's live stack at capture time.
#[derive(Clone, Debug)]
pub struct CallTrace {
    frames: Box<[Frame]>,
    thread: ThreadId,
}

impl CallTrace {
    /// Deep-copies the calling thread's live stack. Later pushes and pops on
    /// that thread leave the snapshot untouched.
    pub fn capture() -> Self {
        let frames = FRAMES
            .try_with(|frames| frames.borrow().clone())
            .unwrap_or_default();

        CallTrace {
            frames: frames.into_boxed_slice(),
            thread: thread::current().id(),
        }
    }

    /// Frames in push order; the last entry is the innermost operation.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Thread the snapshot was captured on.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Renders innermost frame first, one per line, for post-mortem logs.
impl fmt::Display for CallTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, frame) in self.frames.iter().rev().enumerate() {
            if position > 0 {
                writeln!(f)?;
            }
            write!(f, "    {frame}")?;
        }

        Ok(())
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __function_name {
    () => {{
        fn f() {}
        fn name_of<T>(_: T) -> &'static str {
            ::core::any::type_name::<T>()
        }
        let name = name_of(f);
        &name[..name.len() - 3]
    }};
}

/// Records the enclosing function as a traced frame until the end of the
/// current scope.
#[macro_export]
macro_rules! frame {
    () => {
        let _frame_guard =
            $crate::stack::enter($crate::__function_name!(), ::core::file!(), ::core::line!());
    };
}
