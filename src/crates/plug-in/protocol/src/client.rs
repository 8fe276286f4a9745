//! Plug-in side of the connection: command line parsing and pipe setup.

use plug_in_error::{PlugInError, Result};
use plug_in_types::CallMode;

/// Marker argument that precedes the pipe descriptors
pub const PLUG_IN_FLAG: &str = "-plug-in";

/// Arguments the host passes to every plug-in process:
/// `<program> -plug-in <read-fd> <write-fd> <-query|-init|-run> <stack-trace-mode>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugInArgs {
    pub program: String,
    pub read_fd: i32,
    pub write_fd: i32,
    pub mode: CallMode,
    pub stack_trace_mode: String,
}

impl PlugInArgs {
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        let [program, flag, read_fd, write_fd, mode, rest @ ..] = args.as_slice() else {
            return Err(usage(&args));
        };
        if flag != PLUG_IN_FLAG {
            return Err(usage(&args));
        }

        let fd = |s: &str| {
            s.parse::<i32>()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| PlugInError::malformed(format!("invalid descriptor {s:?}")))
        };

        let mode = CallMode::from_flag(mode)
            .ok_or_else(|| PlugInError::malformed(format!("invalid call mode {mode:?}")))?;

        Ok(Self {
            program: program.clone(),
            read_fd: fd(read_fd.as_str())?,
            write_fd: fd(write_fd.as_str())?,
            mode,
            stack_trace_mode: rest.first().cloned().unwrap_or_else(|| "never".to_string()),
        })
    }

    /// Build the argument vector for a child, without the program name
    pub fn to_args(&self) -> Vec<String> {
        vec![
            PLUG_IN_FLAG.to_string(),
            self.read_fd.to_string(),
            self.write_fd.to_string(),
            self.mode.flag().to_string(),
            self.stack_trace_mode.clone(),
        ]
    }
}

fn usage(args: &[String]) -> PlugInError {
    let program = args.first().map(String::as_str).unwrap_or("plug-in");
    PlugInError::malformed(format!(
        "{program} is a plug-in and must be run by the host (expected \
         {PLUG_IN_FLAG} <read-fd> <write-fd> <-query|-init|-run> <stack-trace-mode>)"
    ))
}

#[cfg(unix)]
mod unix {
    use std::os::fd::{FromRawFd, OwnedFd};

    use plug_in_error::Result;
    use tokio::net::unix::pipe;

    use super::PlugInArgs;
    use crate::transport::Transport;

    pub type PipeTransport = Transport<pipe::Receiver, pipe::Sender>;

    /// Take ownership of the pipe descriptors named in `args`.
    ///
    /// Must be called at most once per process, from within a tokio
    /// runtime.
    pub fn connect(args: &PlugInArgs) -> Result<PipeTransport> {
        // SAFETY: the host opened these descriptors for us and nothing else
        // in this process refers to them.
        let (read, write) = unsafe {
            (
                OwnedFd::from_raw_fd(args.read_fd),
                OwnedFd::from_raw_fd(args.write_fd),
            )
        };

        let reader = pipe::Receiver::from_owned_fd(read)?;
        let writer = pipe::Sender::from_owned_fd(write)?;
        Ok(Transport::new_with_streams(reader, writer))
    }
}

#[cfg(unix)]
pub use unix::{PipeTransport, connect};
