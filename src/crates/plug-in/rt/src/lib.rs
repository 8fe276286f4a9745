//! Host runtime for out-of-process plug-ins.
//!
//! [`PlugInManager`] spawns plug-in executables, speaks the wire protocol
//! with them over a pipe pair and keeps the procedure database they
//! install into. Procedures are run through
//! [`PlugInManager::execute_by_name`], which always yields a
//! [`ReturnValues`](plug_in_types::ReturnValues) array.

mod builtins;
pub mod config;
mod context;
mod def;
mod dispatch;
mod environ;
pub mod error;
mod frame;
mod interpreter;
mod manager;
mod pdb;
mod plug_in;
mod procedure;
mod process;
mod progress;
pub mod tile;
pub mod tracing_config;

pub use config::{EnvironmentConfig, HostConfig, InterpreterConfig, StackTraceMode};
pub use context::Context;
pub use def::PlugInDef;
pub use environ::Environ;
pub use error::InstallError;
pub use frame::{FrameWaiter, ProcFrame};
pub use interpreter::{Interpreter, InterpreterDb};
pub use manager::{Caller, PlugInManager, PlugInReader, search_paths};
pub use pdb::ProcedureDb;
pub use plug_in::PlugIn;
pub use procedure::{InternalProc, ProcInfo, ProcLocation, Procedure, is_canonical_identifier};
pub use progress::{Progress, ProgressEvent, RecordingProgress};
pub use tile::{MemoryTileStore, TileError, TileGeometry, TileStore};
pub use tracing_config::{TracingConfig, initialize_tracing};
