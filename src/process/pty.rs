//! PTY allocation for the supervisor's PTY spawn mode.
//!
//! Thin wrapper over `portable-pty`. The child becomes the session leader of
//! a new session when attached to the PTY slave, which also makes it its own
//! process group leader — so `signal::NativeSignalBackend`'s group-kill works
//! unmodified for PTY-spawned children, same as pipe-spawned ones.

use std::io::{self, Read};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};

/// A spawned child attached to a PTY, plus a reader for its combined
/// stdout+stderr stream.
pub struct PtyChild {
    pub child: Box<dyn portable_pty::Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub pid: Option<u32>,
}

pub fn spawn_pty(command: &[String], cwd: Option<&str>, env: &[(String, String)]) -> io::Result<PtyChild> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(to_io_error)?;

    let mut cmd = CommandBuilder::new(&command[0]);
    cmd.args(&command[1..]);
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }

    let child = pair.slave.spawn_command(cmd).map_err(to_io_error)?;
    // The slave end is only needed to spawn the child; drop it so the master
    // side sees EOF once the child's last fd referencing the slave closes.
    drop(pair.slave);

    let pid = child.process_id();
    let reader = pair.master.try_clone_reader().map_err(to_io_error)?;

    Ok(PtyChild { child, reader, pid })
}

fn to_io_error(e: anyhow::Error) -> io::Error {
    io::Error::other(e.to_string())
}

/// Whether `err` is the benign "I/O closed" error a PTY master read produces
/// once its child has exited and the slave side is gone — EIO on Unix.
/// Grounded in `process/process.go`'s `*os.PathError{Err: syscall.EIO}`
/// squelch (buildkite/agent#34).
pub fn is_benign_pty_close(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::EIO) {
            return true;
        }
    }
    err.kind() == io::ErrorKind::UnexpectedEof
}
