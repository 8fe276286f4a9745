use std::fmt;
use std::sync::Arc;

/// Scope a procedure runs in.
///
/// Plug-ins may push sub-contexts for the duration of a call; each one
/// remembers the context it was derived from.
#[derive(Clone, PartialEq, Eq)]
pub struct Context {
    name: Arc<str>,
    parent: Option<Arc<Context>>,
}

impl Context {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            parent: None,
        }
    }

    /// The context used for calls that originate in the host itself
    pub fn user() -> Self {
        Self::new("user")
    }

    pub fn child(&self) -> Self {
        let name = format!("{}/{}", self.name, self.depth() + 1);
        Self {
            name: Arc::from(name.as_str()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Context> {
        self.parent.as_deref()
    }

    pub fn depth(&self) -> usize {
        self.parent.as_ref().map_or(0, |p| p.depth() + 1)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context").field(&self.name).finish()
    }
}
