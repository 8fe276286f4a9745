use plug_in_types::{ArgType, CallMode, FileHandlerKind, ProcType};
use thiserror::Error;

/// Reasons a `proc-install` request is refused. The connection stays
/// open; only the one installation is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstallError {
    #[error("procedure name {0:?} is not a canonical identifier")]
    InvalidName(String),

    #[error("procedure \"{procedure}\": {field} is not valid UTF-8")]
    InvalidUtf8 {
        procedure: String,
        field: String,
    },

    #[error("procedure \"{procedure}\": {what} {index} has no name")]
    NullArgName {
        procedure: String,
        what: &'static str,
        index: usize,
    },

    #[error(
        "procedure \"{procedure}\": {what} {index} is of type {arg_type} \
         but is not preceded by an int32 length {what}"
    )]
    ArrayWithoutLength {
        procedure: String,
        what: &'static str,
        index: usize,
        arg_type: ArgType,
    },

    #[error("procedure \"{procedure}\": type {proc_type:?} cannot be installed in {mode} mode")]
    WrongProcType {
        procedure: String,
        proc_type: ProcType,
        mode: CallMode,
    },

    #[error("procedure \"{procedure}\" is registered as a {kind} and must take ({expected}) as its first arguments")]
    HandlerSignature {
        procedure: String,
        kind: FileHandlerKind,
        expected: String,
    },
}
