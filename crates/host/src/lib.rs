//! Injectable shell around the marrow runtime: reads `MARROW_*`
//! configuration from the process environment, installs telemetry, and
//! holds the attachment state for the life of the process.

use std::panic;

use marrow_telemetry::TelemetryConfig;
use tracing::{error, info, instrument, warn};

use crate::{config::HostVars, host::Host};

mod config;
mod host;

#[cfg(windows)]
static INSTANCE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
/// https://learn.microsoft.com/en-us/windows/win32/dlls/dllmain#parameters
#[cfg(windows)]
const DLL_PROCESS_ATTACH: u32 = 1;

/// Attaches the runtime to the current process. Later calls log and report
/// success without re-attaching. Returns 0 on success, -1 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn marrow_attach() -> i32 {
    match panic::catch_unwind(attach_impl) {
        Ok(Ok(())) => 0,
        Ok(Err(error)) => {
            error!("attach failed: {error:?}");
            -1
        }
        Err(_) => {
            error!("attach panicked");
            -1
        }
    }
}

/// Reverts every retained hook. Returns 0 on success, -1 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn marrow_detach() -> i32 {
    match panic::catch_unwind(detach_impl) {
        Ok(Ok(())) => 0,
        Ok(Err(error)) => {
            error!("detach failed: {error:?}");
            -1
        }
        Err(_) => {
            error!("detach panicked");
            -1
        }
    }
}

#[instrument(skip_all)]
fn attach_impl() -> eyre::Result<()> {
    if Host::is_attached() {
        warn!("marrow is already attached");
        return Ok(());
    }

    let _ = color_eyre::install();

    let (vars, config_error) = match config::deserialize_from_env::<HostVars>() {
        Ok(vars) => (vars, None),
        Err(error) => (HostVars::default(), Some(error)),
    };

    let telemetry = match marrow_telemetry::install(TelemetryConfig {
        console: vars.console,
        log_file: vars.log_file.clone(),
    }) {
        Ok(guard) => Some(guard),
        Err(error) => {
            // No subscriber to speak through yet.
            eprintln!("marrow: telemetry unavailable: {error}");
            None
        }
    };

    if let Some(error) = config_error {
        warn!("invalid MARROW_* configuration, using defaults: {error}");
    }

    let config = serde_json::to_string(&vars)?;
    info!(config = %config, "marrow attached");
    Host::new(vars, telemetry).attach();

    Ok(())
}

#[instrument(skip_all)]
fn detach_impl() -> eyre::Result<()> {
    if !Host::is_attached() {
        warn!("detach requested before attach");
        return Ok(());
    }

    let dropped = Host::get_attached_mut().drop_hooks();
    info!(dropped, "marrow detached");
    Ok(())
}

#[cfg(windows)]
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(instance: usize, reason: u32, _: *mut usize) -> i32 {
    if reason == DLL_PROCESS_ATTACH {
        let _ = INSTANCE.set(instance);
    }

    1
}
