use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

/// Signal the entire process group of `child`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. No-op if the child has already been reaped or the PID
/// cannot be represented as `i32`.
pub(crate) fn signal_process_group(child: &tokio::process::Child, signal: Signal) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let _ = killpg(Pid::from_raw(pid), signal);
    }
}
