//! Hook lifetime manager over the detour engine.
//!
//! A [`Hook`] owns one installed detour: creating it patches the target and
//! enables the redirect, dropping it restores the original entry. Ownership
//! transfers by move; there is no separate "owns this patch" flag to keep in
//! sync. A process-wide registry refuses second hooks on the same target.

use std::{
    collections::HashSet,
    fmt,
    marker::PhantomData,
    mem::ManuallyDrop,
    ptr,
    sync::{LazyLock, Mutex, MutexGuard, PoisonError},
};

use retour::{Function, RawDetour};
use tracing::debug;

use crate::{
    addr::Address,
    error::{Error, Result},
};

/// Engine status set. Every non-success outcome of the engine and of the
/// registry maps onto one of these; [`HookStatus::message`] is the fixed
/// status text table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookStatus {
    Ok,
    AlreadyInitialized,
    AlreadyCreated,
    NotCreated,
    AlreadyEnabled,
    AlreadyDisabled,
    NotExecutable,
    UnsupportedFunction,
    AllocFailed,
    ProtectFailed,
    ModuleNotFound,
    FunctionNotFound,
}

impl HookStatus {
    pub fn message(self) -> &'static str {
        match self {
            HookStatus::Ok => "Successful.",
            HookStatus::AlreadyInitialized => "The hook engine is already initialized.",
            HookStatus::AlreadyCreated => {
                "The hook for the specified target function is already created."
            }
            HookStatus::NotCreated => {
                "The hook for the specified target function is not created yet."
            }
            HookStatus::AlreadyEnabled => {
                "The hook for the specified target function is already enabled."
            }
            HookStatus::AlreadyDisabled => {
                "The hook for the specified target function is not enabled yet, or already disabled."
            }
            HookStatus::NotExecutable => {
                "The specified pointer is invalid. It points the address of non-allocated and/or non-executable region."
            }
            HookStatus::UnsupportedFunction => "The specified target function cannot be hooked.",
            HookStatus::AllocFailed => "Failed to allocate memory.",
            HookStatus::ProtectFailed => "Failed to change the memory protection.",
            HookStatus::ModuleNotFound => "The specified module is not loaded.",
            HookStatus::FunctionNotFound => "The specified function is not found.",
        }
    }
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Wraps an engine failure: the mapped status up front, the engine's own
/// diagnosis retained as the cause.
fn engine_failure(api: &'static str, status: HookStatus, error: retour::Error) -> Error {
    Error::detour(status).with_cause(Error::api(api, 0, error.to_string()))
}

/// Targets with a live hook, keyed by entry address.
static HOOKED_TARGETS: LazyLock<Mutex<HashSet<usize>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

fn registry() -> MutexGuard<'static, HashSet<usize>> {
    HOOKED_TARGETS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Signature-erased hook, for heterogeneous retention. Calling through its
/// trampoline is meaningless; it only keeps the patch alive.
pub type UntypedHook = Hook<fn()>;

/// An installed detour. Dropping it restores the original entry.
#[derive(Debug)]
pub struct Hook<F: Function> {
    detour: RawDetour,
    target: Address,
    enabled: bool,
    ty: PhantomData<F>,
}

impl<F: Function> Hook<F> {
    /// Patches `target` to redirect into `detour` and enables the hook.
    pub fn install(target: F, detour: F) -> Result<Self> {
        crate::frame!();
        // SAFETY: both pointers name functions of signature F.
        unsafe { Self::install_at(Address::from(target.to_ptr()), detour) }
    }

    /// Installs over a raw entry address.
    ///
    /// # Safety
    ///
    /// `target` must be the entry of a function with signature `F`, and no
    /// other thread may be executing through its first instructions while
    /// the patch is written.
    pub unsafe fn install_at(target: Address, detour: F) -> Result<Self> {
        crate::frame!();
        if target.is_null() {
            return Err(Error::argument("target", "address is null"));
        }

        // Held across create + enable so a concurrent install on the same
        // target sees either no hook or a fully installed one.
        let mut installed = registry();
        if !installed.insert(target.get()) {
            return Err(Error::detour(HookStatus::AlreadyCreated));
        }

        // SAFETY: per this function's contract.
        let raw = match unsafe { RawDetour::new(target.as_ptr(), detour.to_ptr()) } {
            Ok(raw) => raw,
            Err(e) => {
                installed.remove(&target.get());
                return Err(engine_failure(
                    "RawDetour::new",
                    HookStatus::UnsupportedFunction,
                    e,
                ));
            }
        };

        // The engine creates hooks disabled; installation means live.
        // SAFETY: as above.
        if let Err(e) = unsafe { raw.enable() } {
            installed.remove(&target.get());
            return Err(engine_failure(
                "RawDetour::enable",
                HookStatus::ProtectFailed,
                e,
            ));
        }
        drop(installed);

        debug!(%target, "installed detour");
        Ok(Hook {
            detour: raw,
            target,
            enabled: true,
            ty: PhantomData,
        })
    }

    /// Installs over `symbol` exported by `module` (an already-loaded module
    /// name, or `None` for the process's own lookup scope).
    ///
    /// # Safety
    ///
    /// The named symbol must be a function with signature `F`; see
    /// [`Hook::install_at`].
    pub unsafe fn install_named(module: Option<&str>, symbol: &str, detour: F) -> Result<Self> {
        crate::frame!();
        let target = named_symbol(module, symbol)?;
        // SAFETY: per this function's contract.
        unsafe { Self::install_at(target, detour) }
    }

    /// Re-enables a disabled hook.
    ///
    /// # Safety
    ///
    /// The detour function must still be sound to enter; see
    /// [`Hook::install_at`] for the patching constraint.
    pub unsafe fn enable(&mut self) -> Result<()> {
        crate::frame!();
        if self.enabled {
            return Err(Error::detour(HookStatus::AlreadyEnabled));
        }

        // SAFETY: per this function's contract.
        unsafe { self.detour.enable() }
            .map_err(|e| engine_failure("RawDetour::enable", HookStatus::ProtectFailed, e))?;
        self.enabled = true;
        Ok(())
    }

    /// Disables the redirect, leaving the hook installed.
    ///
    /// # Safety
    ///
    /// No thread may be executing through the target's patched prologue
    /// while it is restored.
    pub unsafe fn disable(&mut self) -> Result<()> {
        crate::frame!();
        if !self.enabled {
            return Err(Error::detour(HookStatus::AlreadyDisabled));
        }

        // SAFETY: per this function's contract.
        unsafe { self.detour.disable() }
            .map_err(|e| engine_failure("RawDetour::disable", HookStatus::ProtectFailed, e))?;
        self.enabled = false;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn target(&self) -> Address {
        self.target
    }

    /// The original entry, callable while the hook is enabled.
    pub fn trampoline(&self) -> F {
        // SAFETY: the trampoline preserves the target's signature.
        unsafe { F::from_ptr(self.detour.trampoline() as *const _) }
    }

    /// Erases the signature, keeping the patch alive for storage alongside
    /// hooks of other signatures.
    pub fn erase(self) -> UntypedHook {
        let this = ManuallyDrop::new(self);

        UntypedHook {
            // SAFETY: moved field-by-field out of ManuallyDrop; the source
            // is never dropped, so nothing is read twice.
            detour: unsafe { ptr::read(&this.detour) },
            target: this.target,
            enabled: this.enabled,
            ty: PhantomData,
        }
    }
}

impl<F: Function> Drop for Hook<F> {
    fn drop(&mut self) {
        if self.enabled {
            // SAFETY: restoring the original bytes; the engine serializes
            // the patch write.
            let _ = unsafe { self.detour.disable() };
        }
        registry().remove(&self.target.get());
        debug!(target = %self.target, "removed detour");
    }
}

#[cfg(windows)]
fn named_symbol(module: Option<&str>, symbol: &str) -> Result<Address> {
    use std::ffi::CString;

    use windows::{
        Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress},
        core::PCSTR,
    };

    let csym =
        CString::new(symbol).map_err(|_| Error::argument("symbol", "contains a NUL byte"))?;

    let handle = match module {
        Some(name) => {
            let cname =
                CString::new(name).map_err(|_| Error::argument("module", "contains a NUL byte"))?;
            // SAFETY: cname outlives the call.
            unsafe { GetModuleHandleA(PCSTR(cname.as_ptr().cast())) }
                .map_err(|_| Error::detour(HookStatus::ModuleNotFound))?
        }
        // SAFETY: a null name yields the process image's own module.
        None => unsafe { GetModuleHandleA(PCSTR::null()) }
            .map_err(|_| Error::detour(HookStatus::ModuleNotFound))?,
    };

    // SAFETY: handle is a live module; csym outlives the call.
    match unsafe { GetProcAddress(handle, PCSTR(csym.as_ptr().cast())) } {
        Some(entry) => Ok(Address::new(entry as usize)),
        None => Err(Error::detour(HookStatus::FunctionNotFound)),
    }
}

#[cfg(unix)]
fn named_symbol(module: Option<&str>, symbol: &str) -> Result<Address> {
    use std::ffi::CString;

    let csym =
        CString::new(symbol).map_err(|_| Error::argument("symbol", "contains a NUL byte"))?;

    let (handle, close_after) = match module {
        Some(name) => {
            let cname =
                CString::new(name).map_err(|_| Error::argument("module", "contains a NUL byte"))?;
            // SAFETY: RTLD_NOLOAD only looks up modules that are already
            // mapped; nothing new is loaded.
            let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
            if handle.is_null() {
                return Err(Error::detour(HookStatus::ModuleNotFound));
            }
            (handle, true)
        }
        None => (libc::RTLD_DEFAULT, false),
    };

    // SAFETY: handle is valid; csym outlives the call.
    let entry = unsafe { libc::dlsym(handle, csym.as_ptr()) };
    if close_after {
        // SAFETY: balances the dlopen above; the module was already loaded,
        // so its refcount stays positive.
        unsafe { libc::dlclose(handle) };
    }

    if entry.is_null() {
        return Err(Error::detour(HookStatus::FunctionNotFound));
    }
    Ok(Address::from(entry))
}

#[cfg(test)]
mod test {
    use super::{Hook, HookStatus};
    use crate::{addr::Address, error::ErrorKind};

    fn detour_status(err: &crate::error::Error) -> HookStatus {
        match err.kind() {
            ErrorKind::Detour { status } => *status,
            other => panic!("expected a detour error, got {other}"),
        }
    }

    #[inline(never)]
    extern "system" fn base_value() -> i32 {
        20
    }

    #[inline(never)]
    extern "system" fn patched_value() -> i32 {
        42
    }

    #[test]
    fn install_patches_and_drop_restores() {
        type Target = extern "system" fn() -> i32;
        let mut hook =
            Hook::<Target>::install(base_value, patched_value).expect("failed to install");

        // Installation enables the redirect; the trampoline still reaches
        // the original body.
        assert_eq!(42, base_value());
        assert_eq!(20, hook.trampoline()());
        assert!(hook.is_enabled());
        assert_eq!(hook.target(), Address::new(base_value as usize));

        unsafe { hook.disable().expect("failed to disable") };
        assert_eq!(20, base_value());

        unsafe { hook.enable().expect("failed to enable") };
        assert_eq!(42, base_value());

        drop(hook);
        assert_eq!(20, base_value());
    }

    #[inline(never)]
    extern "system" fn contended_target() -> i32 {
        7
    }

    #[inline(never)]
    extern "system" fn first_detour() -> i32 {
        8
    }

    #[inline(never)]
    extern "system" fn second_detour() -> i32 {
        9
    }

    #[test]
    fn second_install_on_the_same_target_is_refused() {
        type Target = extern "system" fn() -> i32;
        let hook = Hook::<Target>::install(contended_target, first_detour).unwrap();

        let err = Hook::<Target>::install(contended_target, second_detour).unwrap_err();
        assert_eq!(detour_status(&err), HookStatus::AlreadyCreated);

        // Dropping the first hook frees the target for a new install.
        drop(hook);
        let hook = Hook::<Target>::install(contended_target, second_detour).unwrap();
        assert_eq!(9, contended_target());
        drop(hook);
        assert_eq!(7, contended_target());
    }

    #[inline(never)]
    extern "system" fn toggle_target() -> i32 {
        1
    }

    #[inline(never)]
    extern "system" fn toggle_detour() -> i32 {
        2
    }

    #[test]
    fn redundant_toggles_report_engine_statuses() {
        type Target = extern "system" fn() -> i32;
        let mut hook = Hook::<Target>::install(toggle_target, toggle_detour).unwrap();

        let err = unsafe { hook.enable() }.unwrap_err();
        assert_eq!(detour_status(&err), HookStatus::AlreadyEnabled);

        unsafe { hook.disable() }.unwrap();
        let err = unsafe { hook.disable() }.unwrap_err();
        assert_eq!(detour_status(&err), HookStatus::AlreadyDisabled);
    }

    fn unused_detour() {}

    #[test]
    fn engine_rejections_surface_with_their_diagnosis() {
        // Detouring a function onto itself is the one rejection every
        // engine build reports deterministically.
        let addr = Address::new(unused_detour as fn() as usize);
        let err = unsafe { Hook::<fn()>::install_at(addr, unused_detour as fn()) }.unwrap_err();
        assert_eq!(detour_status(&err), HookStatus::UnsupportedFunction);

        // The engine's own diagnosis rides along as the cause.
        let cause = err.cause().expect("engine detail lost");
        assert!(matches!(
            cause.kind(),
            ErrorKind::Api {
                api: "RawDetour::new",
                ..
            }
        ));

        // The failed install released its registry slot: retrying reports
        // the engine's complaint again, not "already created".
        let err = unsafe { Hook::<fn()>::install_at(addr, unused_detour as fn()) }.unwrap_err();
        assert_ne!(detour_status(&err), HookStatus::AlreadyCreated);

        let err =
            unsafe { Hook::<fn()>::install_at(Address::NULL, unused_detour as fn()) }.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Argument { .. }));
    }

    #[test]
    fn named_lookup_reports_missing_modules_and_symbols() {
        let err = unsafe {
            Hook::<fn()>::install_named(
                Some("marrow_no_such_module_5605"),
                "irrelevant",
                unused_detour as fn(),
            )
        }
        .unwrap_err();
        assert_eq!(detour_status(&err), HookStatus::ModuleNotFound);

        let err = unsafe {
            Hook::<fn()>::install_named(None, "marrow_no_such_symbol_5605", unused_detour as fn())
        }
        .unwrap_err();
        assert_eq!(detour_status(&err), HookStatus::FunctionNotFound);
    }

    #[inline(never)]
    extern "system" fn erased_target() -> i32 {
        100
    }

    #[inline(never)]
    extern "system" fn erased_detour() -> i32 {
        200
    }

    #[test]
    fn erased_hooks_keep_the_patch_alive() {
        type Target = extern "system" fn() -> i32;
        let hook = Hook::<Target>::install(erased_target, erased_detour).unwrap();

        let untyped = hook.erase();
        assert_eq!(200, erased_target());
        assert!(untyped.is_enabled());

        drop(untyped);
        assert_eq!(100, erased_target());
    }

    #[test]
    fn status_messages_follow_the_table() {
        assert_eq!(HookStatus::Ok.to_string(), "Successful.");
        assert_eq!(
            HookStatus::AlreadyCreated.to_string(),
            "The hook for the specified target function is already created."
        );
        assert_eq!(
            HookStatus::ModuleNotFound.to_string(),
            "The specified module is not loaded."
        );
        assert_eq!(HookStatus::AllocFailed.to_string(), "Failed to allocate memory.");
    }
}
