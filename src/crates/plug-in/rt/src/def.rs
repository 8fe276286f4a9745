use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::procedure::Procedure;

/// What the host knows about one plug-in executable: the procedures it
/// installed during its last query and whether it wants an init call.
#[derive(Debug, Clone)]
pub struct PlugInDef {
    pub path: PathBuf,
    pub mtime: Option<SystemTime>,
    pub procedures: Vec<Arc<Procedure>>,
    pub has_init: bool,
    pub from_cache: bool,
}

impl PlugInDef {
    pub fn new(path: impl Into<PathBuf>, mtime: Option<SystemTime>) -> Self {
        Self {
            path: path.into(),
            mtime,
            procedures: Vec::new(),
            has_init: false,
            from_cache: false,
        }
    }

    /// A definition restored from the procedure cache instead of a live
    /// query
    pub fn from_cache(
        path: impl Into<PathBuf>,
        mtime: SystemTime,
        procedures: Vec<Arc<Procedure>>,
        has_init: bool,
    ) -> Self {
        Self {
            path: path.into(),
            mtime: Some(mtime),
            procedures,
            has_init,
            from_cache: true,
        }
    }

    /// Current modification time of `path`, if it can be read
    pub fn mtime_of(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    /// The executable must be queried again when it changed since the
    /// definition was made or when either timestamp is unknown.
    pub fn needs_query(&self, current: Option<SystemTime>) -> bool {
        match (self.mtime, current) {
            (Some(known), Some(current)) => known != current,
            _ => true,
        }
    }

    /// Add a procedure, replacing any of the same name
    pub fn add_procedure(&mut self, procedure: Arc<Procedure>) -> Option<Arc<Procedure>> {
        match self.procedures.iter_mut().find(|p| p.name == procedure.name) {
            Some(slot) => Some(std::mem::replace(slot, procedure)),
            None => {
                self.procedures.push(procedure);
                None
            }
        }
    }

    pub fn procedure(&self, name: &str) -> Option<&Arc<Procedure>> {
        self.procedures.iter().find(|p| p.name == name)
    }

    pub fn display_name(&self) -> String {
        display_name(&self.path)
    }
}

/// File name of a plug-in path, used in messages
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
