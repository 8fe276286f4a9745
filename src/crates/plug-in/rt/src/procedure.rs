use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use plug_in_protocol::{ProcInstall, WireParamDef, WireString};
use plug_in_types::{ArgDef, ArgType, CallMode, FileHandlerKind, ParamValue, ProcType, ReturnValues};

use crate::error::InstallError;
use crate::manager::{Caller, PlugInManager};
use crate::plug_in::PlugIn;

/// Procedure implemented inside the host
#[async_trait]
pub trait InternalProc: Send + Sync {
    async fn call(
        &self,
        manager: &Arc<PlugInManager>,
        caller: &Caller,
        args: Vec<ParamValue>,
    ) -> ReturnValues;
}

/// Where a procedure's implementation lives
#[derive(Clone)]
pub enum ProcLocation {
    Internal(Arc<dyn InternalProc>),
    /// Executable started in Run mode on every call
    File(PathBuf),
    /// Handled by an already running plug-in process
    Temporary(Weak<PlugIn>),
}

impl fmt::Debug for ProcLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcLocation::Internal(_) => f.write_str("Internal"),
            ProcLocation::File(path) => f.debug_tuple("File").field(path).finish(),
            ProcLocation::Temporary(owner) => match owner.upgrade() {
                Some(plug_in) => f.debug_tuple("Temporary").field(&plug_in.name()).finish(),
                None => f.write_str("Temporary(<closed>)"),
            },
        }
    }
}

/// Documentation strings attached to a procedure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcInfo {
    pub blurb: Option<String>,
    pub help: Option<String>,
    pub authors: Option<String>,
    pub copyright: Option<String>,
    pub date: Option<String>,
    pub menu_label: Option<String>,
    pub image_types: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub info: ProcInfo,
    pub proc_type: ProcType,
    pub handler: FileHandlerKind,
    pub handler_extensions: Vec<String>,
    pub params: Vec<ArgDef>,
    pub return_vals: Vec<ArgDef>,
    pub location: ProcLocation,
}

impl Procedure {
    pub fn internal(
        name: &str,
        blurb: &str,
        params: Vec<ArgDef>,
        return_vals: Vec<ArgDef>,
        handler: Arc<dyn InternalProc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            info: ProcInfo {
                blurb: Some(blurb.to_string()),
                ..ProcInfo::default()
            },
            proc_type: ProcType::Internal,
            handler: FileHandlerKind::None,
            handler_extensions: Vec::new(),
            params,
            return_vals,
            location: ProcLocation::Internal(handler),
        }
    }

    /// Validate an installation request received from a plug-in running
    /// in `mode`. Nothing is registered here.
    pub fn from_install(
        install: &ProcInstall,
        mode: CallMode,
        location: ProcLocation,
    ) -> Result<Self, InstallError> {
        let name = match install.name.to_str() {
            Ok(Some(name)) if is_canonical_identifier(name) => name.to_string(),
            Ok(Some(name)) => return Err(InstallError::InvalidName(name.to_string())),
            Ok(None) => return Err(InstallError::InvalidName(String::new())),
            Err(_) => return Err(InstallError::InvalidName(install.name.display())),
        };

        let allowed = match mode {
            CallMode::Query | CallMode::Init => {
                matches!(install.proc_type, ProcType::PlugIn | ProcType::Extension)
            }
            CallMode::Run => install.proc_type == ProcType::Temporary,
        };
        if !allowed {
            return Err(InstallError::WrongProcType {
                procedure: name,
                proc_type: install.proc_type,
                mode,
            });
        }

        let text = |field: &str, value: &WireString| -> Result<Option<String>, InstallError> {
            value
                .to_str()
                .map(|s| s.map(str::to_string))
                .map_err(|_| InstallError::InvalidUtf8 {
                    procedure: name.clone(),
                    field: field.to_string(),
                })
        };

        let info = ProcInfo {
            blurb: text("blurb", &install.blurb)?,
            help: text("help", &install.help)?,
            authors: text("authors", &install.authors)?,
            copyright: text("copyright", &install.copyright)?,
            date: text("date", &install.date)?,
            menu_label: text("menu label", &install.menu_label)?,
            image_types: text("image types", &install.image_types)?,
        };

        let handler_extensions = text("handler extensions", &install.handler_extensions)?
            .map(|s| split_extensions(&s))
            .unwrap_or_default();

        let params = arg_defs(&name, "argument", &install.params)?;
        let return_vals = arg_defs(&name, "return value", &install.return_vals)?;

        check_handler_signature(&name, install.handler, &params)?;

        Ok(Self {
            name,
            info,
            proc_type: install.proc_type,
            handler: install.handler,
            handler_extensions,
            params,
            return_vals,
            location,
        })
    }

    pub fn is_temporary(&self) -> bool {
        self.proc_type == ProcType::Temporary
    }

    /// Check arity and argument types of a call. The error names the
    /// first offending argument.
    pub fn check_args(&self, args: &[ParamValue]) -> Result<(), String> {
        if args.len() != self.params.len() {
            return Err(format!(
                "procedure \"{}\" takes {} arguments, {} given",
                self.name,
                self.params.len(),
                args.len()
            ));
        }

        for (idx, (def, value)) in self.params.iter().zip(args).enumerate() {
            if def.arg_type != value.arg_type() {
                return Err(format!(
                    "procedure \"{}\": argument {} ({}) must be {}, got {}",
                    self.name,
                    idx + 1,
                    def.name,
                    def.arg_type,
                    value.arg_type()
                ));
            }

            if let Some(len) = value.array_len() {
                let declared = idx
                    .checked_sub(1)
                    .and_then(|prev| args[prev].as_i32())
                    .unwrap_or(-1);
                if usize::try_from(declared).ok() != Some(len) {
                    return Err(format!(
                        "procedure \"{}\": argument {} ({}) has {} elements but its length argument says {}",
                        self.name,
                        idx + 1,
                        def.name,
                        len,
                        declared
                    ));
                }
            }
        }

        Ok(())
    }
}

/// First character an ASCII letter, the rest ASCII letters, digits, `-`
/// or `_`.
pub fn is_canonical_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn split_extensions(s: &str) -> Vec<String> {
    s.split(',')
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn arg_defs(
    procedure: &str,
    what: &'static str,
    defs: &[WireParamDef],
) -> Result<Vec<ArgDef>, InstallError> {
    let mut out = Vec::with_capacity(defs.len());

    for (index, def) in defs.iter().enumerate() {
        let utf8_err = |field: &str| InstallError::InvalidUtf8 {
            procedure: procedure.to_string(),
            field: format!("{} {} {}", what, index + 1, field),
        };

        let name = def
            .name
            .to_str()
            .map_err(|_| utf8_err("name"))?
            .ok_or_else(|| InstallError::NullArgName {
                procedure: procedure.to_string(),
                what,
                index: index + 1,
            })?;
        let description = def
            .description
            .to_str()
            .map_err(|_| utf8_err("description"))?
            .unwrap_or_default();

        if def.arg_type.is_array() {
            let has_length = index > 0 && defs[index - 1].arg_type == ArgType::Int32;
            if !has_length {
                return Err(InstallError::ArrayWithoutLength {
                    procedure: procedure.to_string(),
                    what,
                    index: index + 1,
                    arg_type: def.arg_type,
                });
            }
        }

        out.push(ArgDef::new(def.arg_type, name, description));
    }

    Ok(out)
}

fn check_handler_signature(
    procedure: &str,
    kind: FileHandlerKind,
    params: &[ArgDef],
) -> Result<(), InstallError> {
    let expected: &[ArgType] = match kind {
        FileHandlerKind::None => return Ok(()),
        FileHandlerKind::Load => &[ArgType::RunMode, ArgType::File],
        FileHandlerKind::Save => &[
            ArgType::RunMode,
            ArgType::Image,
            ArgType::Int32,
            ArgType::DrawableArray,
            ArgType::File,
        ],
        FileHandlerKind::Batch => &[ArgType::RunMode, ArgType::String],
    };

    let matches = params.len() >= expected.len()
        && params.iter().zip(expected).all(|(p, t)| p.arg_type == *t);

    if !matches {
        return Err(InstallError::HandlerSignature {
            procedure: procedure.to_string(),
            kind,
            expected: expected
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }

    Ok(())
}
