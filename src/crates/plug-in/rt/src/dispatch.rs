//! Per-message handling for an open plug-in connection.
//!
//! Which messages are legal depends on the mode the plug-in was started
//! in. Anything else is a protocol violation and closes the connection by
//! force.

use std::sync::Arc;

use plug_in_error::PlugInError;
use plug_in_protocol::{Message, ProcInstall, ProcReturn, ProcRun};
use plug_in_types::{CallMode, ProcType, ReturnValues};
use tracing::{debug, error, trace, warn};

use crate::manager::{Caller, PlugInManager, PlugInReader};
use crate::plug_in::PlugIn;
use crate::procedure::{ProcLocation, Procedure};
use crate::tile;

/// Whether the reader should keep going after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Closed,
}

pub(crate) async fn handle_message(
    manager: &Arc<PlugInManager>,
    plug_in: &Arc<PlugIn>,
    reader: &mut PlugInReader,
    message: Message,
) -> Flow {
    let kind = message.kind();
    let mode = plug_in.call_mode();
    trace!(plug_in = %plug_in.name(), %kind, "received message");

    match (message, mode) {
        (Message::Quit, _) => {
            manager.close(plug_in, false).await;
            Flow::Closed
        }

        (Message::Config(_), _)
        | (Message::TileAck, _)
        | (Message::TileData(_), _)
        | (Message::TempProcRun(_), _) => {
            violation(
                manager,
                plug_in,
                format!("received a {} message (should not happen)", kind),
            )
            .await
        }

        (Message::TileReq(req), CallMode::Run) => {
            let lease = manager.tile_lease();
            match tile::serve(manager.tiles(), lease, plug_in, reader, req).await {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    error!(
                        plug_in = %plug_in.name(),
                        path = %plug_in.path().display(),
                        "tile transfer failed: {}",
                        e
                    );
                    manager.close(plug_in, true).await;
                    Flow::Closed
                }
            }
        }

        (Message::ProcRun(run), CallMode::Run) => {
            handle_proc_run(manager, plug_in, run);
            Flow::Continue
        }

        (Message::ProcReturn(ret), CallMode::Run) => {
            if let Some(frame) = plug_in.main_frame() {
                frame.complete(ReturnValues::from_wire(ret.params));
            }
            manager.close(plug_in, false).await;
            Flow::Closed
        }

        (Message::TempProcReturn(ret), CallMode::Run) if plug_in.temp_frame_depth() > 0 => {
            handle_temp_proc_return(plug_in, ret);
            Flow::Continue
        }

        (Message::ProcInstall(install), _) => {
            handle_install(manager, plug_in, *install);
            Flow::Continue
        }

        (Message::ProcUninstall(uninstall), CallMode::Run) => {
            match plug_in.remove_temp_procedure(&uninstall.name) {
                Some(old) => {
                    manager.pdb().unregister_if_same(&old);
                }
                None => debug!(
                    plug_in = %plug_in.name(),
                    procedure = %uninstall.name,
                    "ignoring uninstall of a procedure that is not temporary"
                ),
            }
            Flow::Continue
        }

        (Message::ExtensionAck, CallMode::Run) if plug_in.is_extension() => {
            if !plug_in.acknowledge_extension() {
                warn!(plug_in = %plug_in.name(), "duplicate extension acknowledgement");
            }
            Flow::Continue
        }

        (Message::HasInit, CallMode::Query) => {
            plug_in.with_def(|def| def.has_init = true);
            Flow::Continue
        }

        (_, mode) => {
            violation(
                manager,
                plug_in,
                format!("sent a {} message while running in {} mode", kind, mode),
            )
            .await
        }
    }
}

/// Log the violation and close the connection by force
async fn violation(manager: &Arc<PlugInManager>, plug_in: &Arc<PlugIn>, reason: String) -> Flow {
    let err = PlugInError::Violation {
        name: plug_in.name().to_string(),
        path: plug_in.path().to_path_buf(),
        reason,
    };
    error!("{}", err);
    manager.close(plug_in, true).await;
    Flow::Closed
}

/// Run a procedure on behalf of the plug-in and send the result back.
///
/// The call runs on its own task so this connection keeps being read
/// while it is in progress: the procedure may be a temporary one of this
/// same plug-in, or may ask for tiles.
fn handle_proc_run(manager: &Arc<PlugInManager>, plug_in: &Arc<PlugIn>, run: ProcRun) {
    let ProcRun { name, params } = run;
    let caller = Caller::from_plug_in(plug_in);
    let call = manager.execute_by_name(caller, &name, params);
    let manager = manager.clone();
    let plug_in = plug_in.clone();

    tokio::spawn(async move {
        let values = call.await;
        debug!(
            plug_in = %plug_in.name(),
            procedure = %name,
            status = %values.status(),
            "returning to plug-in"
        );

        let reply = Message::ProcReturn(ProcReturn {
            name,
            params: values.into_vec(),
        });
        if let Err(e) = plug_in.send(reply).await {
            if plug_in.is_open() {
                error!(
                    plug_in = %plug_in.name(),
                    path = %plug_in.path().display(),
                    "failed to send procedure return: {}",
                    e
                );
                manager.close(&plug_in, true).await;
            }
        }
    });
}

fn handle_temp_proc_return(plug_in: &PlugIn, ret: ProcReturn) {
    let Some(frame) = plug_in.pop_frame() else {
        return;
    };
    if frame.procedure().name != ret.name {
        warn!(
            plug_in = %plug_in.name(),
            expected = %frame.procedure().name,
            received = %ret.name,
            "temporary procedure return names another procedure"
        );
    }
    frame.complete(ReturnValues::from_wire(ret.params));
}

fn handle_install(manager: &PlugInManager, plug_in: &Arc<PlugIn>, install: ProcInstall) {
    let location = if install.proc_type == ProcType::Temporary {
        ProcLocation::Temporary(Arc::downgrade(plug_in))
    } else {
        ProcLocation::File(plug_in.path().to_path_buf())
    };

    let procedure = match Procedure::from_install(&install, plug_in.call_mode(), location) {
        Ok(procedure) => Arc::new(procedure),
        Err(e) => {
            warn!(
                plug_in = %plug_in.name(),
                path = %plug_in.path().display(),
                "refusing to install procedure: {}",
                e
            );
            return;
        }
    };

    if procedure.is_temporary() {
        if let Some(old) = plug_in.remove_temp_procedure(&procedure.name) {
            manager.pdb().unregister_if_same(&old);
        }
        plug_in.add_temp_procedure(procedure.clone());
        manager.pdb().register(procedure);
        return;
    }

    let name = procedure.name.clone();
    if plug_in.with_def(|def| def.add_procedure(procedure)).is_none() {
        warn!(
            plug_in = %plug_in.name(),
            procedure = %name,
            "no plug-in definition to install into"
        );
    }
}
