//! Subprocess spawning for the hypervisor binary.

use std::{
    fs::OpenOptions,
    path::Path,
    process::{Child, Command, Stdio},
};

use scratchvm_shared::errors::{ScratchError, ScratchResult};

/// Spawn `binary` with `args`, stdout and stderr appended to `log_path`.
///
/// stdin is null so the hypervisor never competes with the caller's
/// terminal.
pub(crate) fn spawn_subprocess(
    binary: &Path,
    args: &[String],
    log_path: &Path,
) -> ScratchResult<Child> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| {
            ScratchError::Launch(format!(
                "Failed to open hypervisor log {}: {}",
                log_path.display(),
                e
            ))
        })?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(binary);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(log));
    cmd.stderr(Stdio::from(log_err));

    cmd.spawn().map_err(|e| {
        let err_msg = format!(
            "Failed to spawn hypervisor {}: {}",
            binary.display(),
            e
        );
        tracing::error!("{}", err_msg);
        ScratchError::Launch(err_msg)
    })
}
