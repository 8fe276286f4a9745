mod args;
mod modes;
mod values;

pub use args::{ArgDef, ArgType};
pub use modes::{CallMode, FileHandlerKind, PdbStatus, ProcType, RunMode};
pub use values::{Parasite, ParamValue, ReturnValues, Rgba};
