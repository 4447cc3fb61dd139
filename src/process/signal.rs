//! Signal delivery behind a small OS-abstraction interface.
//!
//! Kept as a trait (rather than reached via bare global `libc`/`windows`
//! calls scattered through `supervisor.rs`) so tests can swap in a fake
//! backend and stay hermetic, per the design notes on global signal
//! handling.

use std::io;

/// Sends termination signals to a process group, and renders POSIX signal
/// numbers as names.
pub trait SignalBackend: Send + Sync {
    /// Ask the process group led by `pid` to terminate (SIGTERM on POSIX, a
    /// polite `taskkill` on Windows).
    fn terminate_group(&self, pid: u32) -> io::Result<()>;

    /// Force-kill the process group led by `pid` (SIGKILL on POSIX,
    /// `taskkill /F` on Windows).
    fn kill_group(&self, pid: u32) -> io::Result<()>;
}

/// The real, OS-backed implementation used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSignalBackend;

#[cfg(unix)]
impl SignalBackend for NativeSignalBackend {
    fn terminate_group(&self, pid: u32) -> io::Result<()> {
        send_group_signal(pid, libc::SIGTERM)
    }

    fn kill_group(&self, pid: u32) -> io::Result<()> {
        send_group_signal(pid, libc::SIGKILL)
    }
}

#[cfg(unix)]
fn send_group_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // A negative pid targets the whole process group; this relies on the
    // child having been spawned as its own group leader (see
    // `supervisor::spawn_pipe`/`process::pty::spawn_pty`).
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // ESRCH: the group is already gone. That's the outcome we wanted.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
impl SignalBackend for NativeSignalBackend {
    fn terminate_group(&self, pid: u32) -> io::Result<()> {
        run_taskkill(pid, false)
    }

    fn kill_group(&self, pid: u32) -> io::Result<()> {
        run_taskkill(pid, true)
    }
}

#[cfg(windows)]
fn run_taskkill(pid: u32, force: bool) -> io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/T", "/PID", &pid.to_string()]);
    if force {
        cmd.arg("/F");
    }
    let status = cmd.status()?;
    // taskkill exits 128 when the target process no longer exists; treat
    // that as success, same as the ESRCH tolerance on POSIX.
    if status.success() || status.code() == Some(128) {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "taskkill exited with status {status}"
        )))
    }
}

/// Render a POSIX signal number as its canonical name, e.g. `15` → `"TERM"`.
/// Numbers outside the known table fall back to their decimal form.
///
/// Carried over from `process/signal.go:SignalString`.
pub fn signal_name(signum: i32) -> String {
    const NAMES: &[&str] = &[
        "HUP", "INT", "QUIT", "ILL", "TRAP", "ABRT", "BUS", "FPE", "KILL", "USR1", "SEGV", "USR2",
        "PIPE", "ALRM", "TERM", "STKFLT", "CHLD", "CONT", "STOP", "TSTP", "TTIN", "TTOU", "URG",
        "XCPU", "XFSZ", "VTALRM", "PROF", "WINCH", "IO", "PWR", "SYS",
    ];
    match usize::try_from(signum).ok().and_then(|n| n.checked_sub(1)).and_then(|i| NAMES.get(i)) {
        Some(name) => name.to_string(),
        None => signum.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signals_render_as_names() {
        assert_eq!(signal_name(1), "HUP");
        assert_eq!(signal_name(15), "TERM");
        assert_eq!(signal_name(9), "KILL");
        assert_eq!(signal_name(31), "SYS");
    }

    #[test]
    fn unknown_signal_numbers_render_as_decimal() {
        assert_eq!(signal_name(0), "0");
        assert_eq!(signal_name(32), "32");
        assert_eq!(signal_name(99), "99");
    }
}
