use std::{
    fmt::Debug,
    sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use marrow_runtime::UntypedHook;
use marrow_telemetry::TelemetryGuard;

use crate::config::HostVars;

static ATTACHED_INSTANCE: OnceLock<RwLock<Host>> = OnceLock::new();

/// Process-lifetime attachment state: configuration, the telemetry worker,
/// and every hook whose patch should outlive its installation site.
pub struct Host {
    hooks: Vec<UntypedHook>,
    vars: HostVars,
    telemetry: Option<TelemetryGuard>,
}

impl Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("hooks", &self.hooks)
            .field("vars", &self.vars)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

#[allow(unused)]
impl Host {
    pub fn new(vars: HostVars, telemetry: Option<TelemetryGuard>) -> Self {
        Self {
            hooks: vec![],
            vars,
            telemetry,
        }
    }

    pub fn is_attached() -> bool {
        ATTACHED_INSTANCE.get().is_some()
    }

    pub fn get_attached() -> RwLockReadGuard<'static, Host> {
        let lock = ATTACHED_INSTANCE.get().expect("not attached");

        match lock.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_attached_mut() -> RwLockWriteGuard<'static, Host> {
        let lock = ATTACHED_INSTANCE.get().expect("not attached");

        match lock.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn attach(self) {
        ATTACHED_INSTANCE
            .set(RwLock::new(self))
            .expect("already attached");
    }

    pub fn vars(&self) -> &HostVars {
        &self.vars
    }

    /// Parks an erased hook so its patch stays applied until detach.
    pub fn retain(&mut self, hook: UntypedHook) {
        self.hooks.push(hook);
    }

    /// Drops every retained hook, reverting their patches. Returns how many
    /// were dropped.
    pub fn drop_hooks(&mut self) -> usize {
        let dropped = self.hooks.len();
        self.hooks.clear();
        dropped
    }
}

#[cfg(test)]
mod test {
    use marrow_runtime::Hook;

    use super::Host;
    use crate::config::HostVars;

    #[inline(never)]
    extern "system" fn stock_answer() -> u32 {
        std::hint::black_box(5)
    }

    #[inline(never)]
    extern "system" fn patched_answer() -> u32 {
        std::hint::black_box(55)
    }

    #[test]
    fn attachment_is_process_global_and_parks_hooks() {
        assert!(!Host::is_attached());
        Host::new(HostVars::default(), None).attach();
        assert!(Host::is_attached());

        let hook = Hook::install(
            stock_answer as extern "system" fn() -> u32,
            patched_answer as extern "system" fn() -> u32,
        )
        .unwrap();
        assert_eq!(stock_answer(), 55);

        Host::get_attached_mut().retain(hook.erase());
        assert_eq!(stock_answer(), 55, "parked hook must keep the patch");

        let dropped = Host::get_attached_mut().drop_hooks();
        assert_eq!(dropped, 1);
        assert_eq!(stock_answer(), 5, "dropping the parked hook reverts it");
    }
}
