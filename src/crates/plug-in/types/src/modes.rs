use plug_in_error::PlugInError;
use std::fmt;

/// Generates the i32 wire conversions for a C-like enum.
macro_rules! wire_enum {
    ($ty:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl $ty {
            /// The value used on the wire
            pub fn as_i32(self) -> i32 {
                self as i32
            }
        }

        impl TryFrom<i32> for $ty {
            type Error = PlugInError;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($ty::$variant),)+
                    other => Err(PlugInError::malformed(format!(
                        "invalid {} value {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

/// Status carried as the first element of every return-value array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PdbStatus {
    ExecutionError = 0,
    CallingError = 1,
    PassThrough = 2,
    Success = 3,
    Cancel = 4,
}

wire_enum!(PdbStatus {
    ExecutionError = 0,
    CallingError = 1,
    PassThrough = 2,
    Success = 3,
    Cancel = 4,
});

impl fmt::Display for PdbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PdbStatus::ExecutionError => "execution error",
            PdbStatus::CallingError => "calling error",
            PdbStatus::PassThrough => "pass through",
            PdbStatus::Success => "success",
            PdbStatus::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// How interactive a procedure invocation is allowed to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RunMode {
    Interactive = 0,
    NonInteractive = 1,
    WithLastVals = 2,
}

wire_enum!(RunMode {
    Interactive = 0,
    NonInteractive = 1,
    WithLastVals = 2,
});

/// Kind of a procedure in the procedure database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProcType {
    Internal = 0,
    PlugIn = 1,
    Extension = 2,
    Temporary = 3,
}

wire_enum!(ProcType {
    Internal = 0,
    PlugIn = 1,
    Extension = 2,
    Temporary = 3,
});

/// Special procedure categories whose argument signature is checked at
/// installation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum FileHandlerKind {
    #[default]
    None = 0,
    Load = 1,
    Save = 2,
    Batch = 3,
}

wire_enum!(FileHandlerKind {
    None = 0,
    Load = 1,
    Save = 2,
    Batch = 3,
});

impl fmt::Display for FileHandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileHandlerKind::None => "procedure",
            FileHandlerKind::Load => "load handler",
            FileHandlerKind::Save => "save handler",
            FileHandlerKind::Batch => "batch interpreter",
        };
        f.write_str(s)
    }
}

/// Phase a plug-in process is started in. Fixed for the life of the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMode {
    Query,
    Init,
    Run,
}

impl CallMode {
    /// Command line flag handed to the child
    pub fn flag(self) -> &'static str {
        match self {
            CallMode::Query => "-query",
            CallMode::Init => "-init",
            CallMode::Run => "-run",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "-query" => Some(CallMode::Query),
            "-init" => Some(CallMode::Init),
            "-run" => Some(CallMode::Run),
            _ => None,
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flag()[1..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_values() {
        assert_eq!(PdbStatus::Success.as_i32(), 3);
        assert_eq!(PdbStatus::try_from(4).unwrap(), PdbStatus::Cancel);
        assert!(PdbStatus::try_from(9).is_err());
    }

    #[test]
    fn test_call_mode_flags() {
        for mode in [CallMode::Query, CallMode::Init, CallMode::Run] {
            assert_eq!(CallMode::from_flag(mode.flag()), Some(mode));
        }
        assert_eq!(CallMode::from_flag("-quit"), None);
        assert_eq!(CallMode::Init.to_string(), "init");
    }
}
