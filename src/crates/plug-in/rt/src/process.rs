//! Child process creation with the pipe pair the protocol runs over.

use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use plug_in_error::{PlugInError, Result};
use plug_in_protocol::PlugInArgs;
use plug_in_types::CallMode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::environ::Environ;
use crate::interpreter::Interpreter;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A running child and the host's ends of its pipes
pub struct Spawned {
    pub child: Child,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

pub struct SpawnRequest<'a> {
    pub path: &'a Path,
    pub mode: CallMode,
    pub interpreter: Option<Interpreter>,
    pub environ: &'a Environ,
    pub stack_trace_mode: &'a str,
}

/// Start `request.path` with the plug-in command line.
///
/// All four pipe ends are created close-on-exec; the child's two ends are
/// made inheritable between fork and exec so no other concurrently spawned
/// process picks them up. The host's copies of the child's ends are closed
/// before this returns.
pub fn spawn(request: SpawnRequest<'_>) -> Result<Spawned> {
    let spawn_err = |source: std::io::Error| PlugInError::Spawn {
        path: request.path.to_path_buf(),
        source,
    };

    let (host_read, child_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| spawn_err(e.into()))?;
    let (child_read, host_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| spawn_err(e.into()))?;

    let args = PlugInArgs {
        program: request.path.display().to_string(),
        read_fd: child_read.as_raw_fd(),
        write_fd: child_write.as_raw_fd(),
        mode: request.mode,
        stack_trace_mode: request.stack_trace_mode.to_string(),
    };

    let mut cmd = match &request.interpreter {
        Some(interp) => {
            let mut cmd = Command::new(&interp.program);
            if let Some(arg) = &interp.arg {
                cmd.arg(arg);
            }
            cmd.arg(request.path);
            cmd
        }
        None => Command::new(request.path),
    };

    cmd.args(args.to_args())
        .env_clear()
        .envs(request.environ.iter())
        .stdin(Stdio::null())
        .kill_on_drop(false);

    let inherit = [args.read_fd, args.write_fd];
    // SAFETY: the closure only calls fcntl, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            for fd in inherit {
                clear_cloexec(fd)?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(spawn_err)?;
    debug!(
        path = %request.path.display(),
        pid = child.id(),
        mode = %request.mode,
        "spawned plug-in"
    );

    drop(child_read);
    drop(child_write);

    let reader = pipe::Receiver::from_owned_fd(host_read).map_err(spawn_err)?;
    let writer = pipe::Sender::from_owned_fd(host_write).map_err(spawn_err)?;

    Ok(Spawned {
        child,
        reader: Box::pin(reader),
        writer: Box::pin(writer),
    })
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: plain fcntl calls on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
