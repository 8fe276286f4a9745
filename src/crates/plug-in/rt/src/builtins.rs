//! Procedures the host implements itself for plug-ins to call back into.

use std::sync::Arc;

use async_trait::async_trait;
use plug_in_types::{ArgDef, ArgType, ParamValue, PdbStatus, ReturnValues};
use tracing::debug;

use crate::manager::{Caller, PlugInManager};
use crate::pdb::ProcedureDb;
use crate::procedure::{InternalProc, Procedure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    ProgressInit,
    ProgressUpdate,
    ProgressEnd,
    ContextPush,
    ContextPop,
    TempProcedures,
}

impl Builtin {
    const ALL: [Builtin; 6] = [
        Builtin::ProgressInit,
        Builtin::ProgressUpdate,
        Builtin::ProgressEnd,
        Builtin::ContextPush,
        Builtin::ContextPop,
        Builtin::TempProcedures,
    ];

    fn name(self) -> &'static str {
        match self {
            Builtin::ProgressInit => "plug-in-progress-init",
            Builtin::ProgressUpdate => "plug-in-progress-update",
            Builtin::ProgressEnd => "plug-in-progress-end",
            Builtin::ContextPush => "plug-in-context-push",
            Builtin::ContextPop => "plug-in-context-pop",
            Builtin::TempProcedures => "plug-in-temp-procedures",
        }
    }

    fn procedure(self) -> Procedure {
        let (blurb, params, return_vals) = match self {
            Builtin::ProgressInit => (
                "Start a progress report for the calling plug-in",
                vec![ArgDef::new(ArgType::String, "message", "Text shown with the progress")],
                vec![],
            ),
            Builtin::ProgressUpdate => (
                "Update the calling plug-in's progress",
                vec![ArgDef::new(ArgType::Float, "percentage", "Fraction done, 0.0 to 1.0")],
                vec![],
            ),
            Builtin::ProgressEnd => ("End the calling plug-in's progress", vec![], vec![]),
            Builtin::ContextPush => ("Push a new context for the calling plug-in", vec![], vec![]),
            Builtin::ContextPop => ("Pop the calling plug-in's context", vec![], vec![]),
            Builtin::TempProcedures => (
                "List the temporary procedures of the calling plug-in",
                vec![],
                vec![
                    ArgDef::new(ArgType::Int32, "num-procedures", "Number of procedures"),
                    ArgDef::new(ArgType::StringArray, "procedures", "Procedure names"),
                ],
            ),
        };
        Procedure::internal(self.name(), blurb, params, return_vals, Arc::new(self))
    }
}

fn calling_error(name: &str, reason: &str) -> ReturnValues {
    ReturnValues::error(PdbStatus::CallingError, format!("{}: {}", name, reason))
}

#[async_trait]
impl InternalProc for Builtin {
    async fn call(
        &self,
        _manager: &Arc<PlugInManager>,
        caller: &Caller,
        args: Vec<ParamValue>,
    ) -> ReturnValues {
        let (Some(plug_in), Some(frame)) = (&caller.plug_in, &caller.frame) else {
            return calling_error(self.name(), "must be called from a running plug-in");
        };

        match self {
            Builtin::ProgressInit => {
                let message = args.first().and_then(ParamValue::as_str).unwrap_or("");
                match frame.progress() {
                    Some(progress) => progress.start(message),
                    None => debug!(plug_in = %plug_in.name(), "no progress to start"),
                }
                ReturnValues::success(vec![])
            }
            Builtin::ProgressUpdate => {
                if let (Some(ParamValue::Float(value)), Some(progress)) =
                    (args.first(), frame.progress())
                {
                    progress.set_value(*value);
                }
                ReturnValues::success(vec![])
            }
            Builtin::ProgressEnd => {
                if let Some(progress) = frame.progress() {
                    progress.end();
                }
                ReturnValues::success(vec![])
            }
            Builtin::ContextPush => {
                let context = frame.push_context();
                debug!(plug_in = %plug_in.name(), context = %context.name(), "pushed context");
                ReturnValues::success(vec![])
            }
            Builtin::ContextPop => match frame.pop_context() {
                Some(_) => ReturnValues::success(vec![]),
                None => calling_error(self.name(), "no context was pushed"),
            },
            Builtin::TempProcedures => {
                let names = plug_in.temp_procedure_names();
                ReturnValues::success(vec![
                    ParamValue::Int32(names.len() as i32),
                    ParamValue::StringArray(names),
                ])
            }
        }
    }
}

/// Add the host's own procedures to `pdb`
pub(crate) fn register(pdb: &ProcedureDb) {
    for builtin in Builtin::ALL {
        pdb.register(Arc::new(builtin.procedure()));
    }
}
