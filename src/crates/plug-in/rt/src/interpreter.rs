use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::InterpreterConfig;

/// Program and optional argument placed in front of a script on the
/// child command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: PathBuf,
    pub arg: Option<String>,
}

/// Resolves which interpreter, if any, runs a plug-in file.
///
/// Lookup goes by file extension first, then by the `#!` line.
#[derive(Debug, Clone, Default)]
pub struct InterpreterDb {
    by_extension: HashMap<String, Interpreter>,
}

impl InterpreterDb {
    pub fn new(configs: &[InterpreterConfig]) -> Self {
        let mut by_extension = HashMap::new();
        for config in configs {
            let interp = Interpreter {
                program: config.program.clone(),
                arg: config.arg.clone(),
            };
            for ext in &config.extensions {
                by_extension.insert(ext.trim_start_matches('.').to_ascii_lowercase(), interp.clone());
            }
        }
        Self { by_extension }
    }

    /// True when files with this extension are runnable through an
    /// interpreter even without the executable bit
    pub fn handles_extension(&self, path: &Path) -> bool {
        self.by_extension(path).is_some()
    }

    fn by_extension(&self, path: &Path) -> Option<&Interpreter> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(&ext)
    }

    pub fn resolve(&self, path: &Path) -> Option<Interpreter> {
        if let Some(interp) = self.by_extension(path) {
            return Some(interp.clone());
        }
        read_shebang(path)
    }
}

fn read_shebang(path: &Path) -> Option<Interpreter> {
    let mut buf = [0u8; 256];
    let n = File::open(path).and_then(|mut f| f.read(&mut buf)).ok()?;
    parse_shebang(&buf[..n])
}

/// Split a `#!program [arg]` line. Like the kernel, everything after the
/// first run of whitespace is a single argument.
fn parse_shebang(head: &[u8]) -> Option<Interpreter> {
    let rest = head.strip_prefix(b"#!")?;
    let line = rest.split(|b| *b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?.trim();

    let (program, arg) = match line.split_once(char::is_whitespace) {
        Some((program, arg)) => (program, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (line, None),
    };

    if program.is_empty() {
        return None;
    }

    Some(Interpreter {
        program: PathBuf::from(program),
        arg: arg.map(str::to_string),
    })
}
