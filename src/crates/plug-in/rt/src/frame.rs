use std::sync::Arc;

use parking_lot::Mutex;
use plug_in_types::{PdbStatus, ReturnValues};
use tokio::sync::oneshot;

use crate::context::Context;
use crate::procedure::Procedure;
use crate::progress::Progress;

/// Bookkeeping for one in-flight procedure call on a plug-in.
///
/// The plug-in's frame list owns the frame; whoever waits for the result
/// keeps its own `Arc`, so return values stored by the dispatcher stay
/// readable after the frame has been popped.
pub struct ProcFrame {
    procedure: Arc<Procedure>,
    context: Context,
    context_stack: Mutex<Vec<Context>>,
    progress: Option<Arc<dyn Progress>>,
    reply: Mutex<Option<oneshot::Sender<ReturnValues>>>,
    return_vals: Mutex<Option<ReturnValues>>,
}

/// Receiving side of a frame: resolves once the frame is completed or
/// aborted
pub struct FrameWaiter {
    rx: oneshot::Receiver<ReturnValues>,
}

impl FrameWaiter {
    pub async fn wait(self) -> ReturnValues {
        self.rx.await.unwrap_or_else(|_| {
            ReturnValues::error(PdbStatus::ExecutionError, "plug-in went away")
        })
    }
}

impl ProcFrame {
    pub fn new(
        procedure: Arc<Procedure>,
        context: Context,
        progress: Option<Arc<dyn Progress>>,
    ) -> (Arc<Self>, FrameWaiter) {
        let (tx, rx) = oneshot::channel();
        let frame = Arc::new(Self {
            procedure,
            context,
            context_stack: Mutex::new(Vec::new()),
            progress,
            reply: Mutex::new(Some(tx)),
            return_vals: Mutex::new(None),
        });
        (frame, FrameWaiter { rx })
    }

    pub fn procedure(&self) -> &Arc<Procedure> {
        &self.procedure
    }

    pub fn progress(&self) -> Option<&Arc<dyn Progress>> {
        self.progress.as_ref()
    }

    /// The innermost pushed context, or the one the call started with
    pub fn context(&self) -> Context {
        self.context_stack
            .lock()
            .last()
            .cloned()
            .unwrap_or_else(|| self.context.clone())
    }

    pub fn push_context(&self) -> Context {
        let child = self.context().child();
        self.context_stack.lock().push(child.clone());
        child
    }

    pub fn pop_context(&self) -> Option<Context> {
        self.context_stack.lock().pop()
    }

    /// True until the frame has been completed or aborted
    pub fn is_pending(&self) -> bool {
        self.reply.lock().is_some()
    }

    /// Store the result and wake the waiter. Only the first completion
    /// counts; later ones return false.
    pub fn complete(&self, values: ReturnValues) -> bool {
        let Some(tx) = self.reply.lock().take() else {
            return false;
        };
        *self.return_vals.lock() = Some(values.clone());
        // the waiter may have given up already
        let _ = tx.send(values);
        true
    }

    pub fn abort(&self, message: &str) -> bool {
        self.complete(ReturnValues::error(PdbStatus::ExecutionError, message))
    }

    pub fn return_vals(&self) -> Option<ReturnValues> {
        self.return_vals.lock().clone()
    }
}
