use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::procedure::Procedure;

/// Old procedure names still accepted from plug-ins, and their
/// replacements
const DEFAULT_COMPAT_NAMES: &[(&str, &str)] = &[
    ("gimp-progress-init", "plug-in-progress-init"),
    ("gimp-progress-update", "plug-in-progress-update"),
    ("gimp-progress-end", "plug-in-progress-end"),
    ("gimp-context-push", "plug-in-context-push"),
    ("gimp-context-pop", "plug-in-context-pop"),
    ("gimp-temp-PDB-name", "plug-in-temp-procedures"),
];

#[derive(Default)]
struct PdbInner {
    procedures: HashMap<String, Arc<Procedure>>,
    compat: HashMap<String, String>,
}

/// Procedure database shared by the whole host.
///
/// Names are unique: registering a name that is already present replaces
/// the previous procedure.
pub struct ProcedureDb {
    inner: RwLock<PdbInner>,
}

impl ProcedureDb {
    pub fn new() -> Self {
        let db = Self {
            inner: RwLock::new(PdbInner::default()),
        };
        for (old, new) in DEFAULT_COMPAT_NAMES {
            db.add_compat_name(old, new);
        }
        db
    }

    /// Register a procedure, returning the one it replaced
    pub fn register(&self, procedure: Arc<Procedure>) -> Option<Arc<Procedure>> {
        let name = procedure.name.clone();
        let previous = self.inner.write().procedures.insert(name.clone(), procedure);

        debug!(procedure = %name, replaced = previous.is_some(), "registered procedure");
        previous
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<Procedure>> {
        let removed = self.inner.write().procedures.remove(name);
        if removed.is_some() {
            debug!(procedure = %name, "unregistered procedure");
        }
        removed
    }

    /// Unregister `procedure` only if it is still the registered instance
    /// of its name
    pub fn unregister_if_same(&self, procedure: &Arc<Procedure>) -> bool {
        let mut inner = self.inner.write();
        let same = inner
            .procedures
            .get(&procedure.name)
            .is_some_and(|current| Arc::ptr_eq(current, procedure));

        if same {
            inner.procedures.remove(&procedure.name);
            debug!(procedure = %procedure.name, "unregistered procedure");
        }
        same
    }

    pub fn add_compat_name(&self, old: &str, new: &str) {
        self.inner
            .write()
            .compat
            .insert(old.to_string(), new.to_string());
    }

    /// Look up a procedure, following the compat table for names that are
    /// not registered themselves
    pub fn lookup(&self, name: &str) -> Option<Arc<Procedure>> {
        let inner = self.inner.read();
        if let Some(procedure) = inner.procedures.get(name) {
            return Some(procedure.clone());
        }

        let new = inner.compat.get(name)?;
        debug!("procedure {} is deprecated, using {}", name, new);
        inner.procedures.get(new).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().procedures.contains_key(name)
    }

    /// All registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().procedures.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn procedures(&self) -> Vec<Arc<Procedure>> {
        let mut procedures: Vec<_> = self.inner.read().procedures.values().cloned().collect();
        procedures.sort_by(|a, b| a.name.cmp(&b.name));
        procedures
    }

    pub fn len(&self) -> usize {
        self.inner.read().procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().procedures.is_empty()
    }
}

impl Default for ProcedureDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::ProcLocation;
    use plug_in_types::{FileHandlerKind, ProcType};
    use std::path::PathBuf;

    fn proc(name: &str) -> Arc<Procedure> {
        Arc::new(Procedure {
            name: name.to_string(),
            info: Default::default(),
            proc_type: ProcType::PlugIn,
            handler: FileHandlerKind::None,
            handler_extensions: Vec::new(),
            params: Vec::new(),
            return_vals: Vec::new(),
            location: ProcLocation::File(PathBuf::from("/bin/true")),
        })
    }

    #[test]
    fn test_register_replaces() {
        let pdb = ProcedureDb::new();
        let first = proc("plug-in-a");
        assert!(pdb.register(first.clone()).is_none());

        let replaced = pdb.register(proc("plug-in-a")).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(pdb.len(), 1);
    }

    #[test]
    fn test_unregister_if_same_keeps_newer() {
        let pdb = ProcedureDb::new();
        let old = proc("temp");
        pdb.register(old.clone());
        let new = proc("temp");
        pdb.register(new.clone());

        assert!(!pdb.unregister_if_same(&old));
        assert!(pdb.contains("temp"));
        assert!(pdb.unregister_if_same(&new));
        assert!(pdb.is_empty());
    }

    #[test]
    fn test_compat_lookup() {
        let pdb = ProcedureDb::new();
        pdb.register(proc("plug-in-progress-init"));
        let found = pdb.lookup("gimp-progress-init").unwrap();
        assert_eq!(found.name, "plug-in-progress-init");

        // a registered name shadows its compat entry
        pdb.register(proc("gimp-progress-init"));
        assert_eq!(pdb.lookup("gimp-progress-init").unwrap().name, "gimp-progress-init");

        assert!(pdb.lookup("gimp-context-push").is_none());
        assert_eq!(pdb.names(), vec!["gimp-progress-init", "plug-in-progress-init"]);
    }
}
