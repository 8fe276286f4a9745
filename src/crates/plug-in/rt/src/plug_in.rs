use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use plug_in_error::{PlugInError, Result};
use plug_in_protocol::{Message, MessageWriter};
use plug_in_shm::BulkChannel;
use plug_in_types::CallMode;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::def::PlugInDef;
use crate::frame::ProcFrame;
use crate::procedure::Procedure;
use crate::process::BoxedWriter;

/// One plug-in process and the host's side of its connection
pub struct PlugIn {
    id: u64,
    name: String,
    path: PathBuf,
    call_mode: CallMode,
    pid: Option<u32>,
    open: AtomicBool,
    extension: AtomicBool,
    bulk: Arc<dyn BulkChannel>,
    writer: tokio::sync::Mutex<Option<MessageWriter<BoxedWriter>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    main_frame: Mutex<Option<Arc<ProcFrame>>>,
    temp_frames: Mutex<Vec<Arc<ProcFrame>>>,
    temp_procedures: Mutex<Vec<Arc<Procedure>>>,
    def: Mutex<Option<PlugInDef>>,
    ext_ack: Mutex<Option<oneshot::Sender<()>>>,
    closed: CancellationToken,
}

impl PlugIn {
    pub(crate) fn new(
        id: u64,
        path: &Path,
        call_mode: CallMode,
        writer: BoxedWriter,
        child: Option<Child>,
        bulk: Arc<dyn BulkChannel>,
    ) -> Self {
        Self {
            id,
            name: crate::def::display_name(path),
            path: path.to_path_buf(),
            call_mode,
            pid: child.as_ref().and_then(Child::id),
            open: AtomicBool::new(true),
            extension: AtomicBool::new(false),
            bulk,
            writer: tokio::sync::Mutex::new(Some(MessageWriter::new(writer))),
            child: tokio::sync::Mutex::new(child),
            main_frame: Mutex::new(None),
            temp_frames: Mutex::new(Vec::new()),
            temp_procedures: Mutex::new(Vec::new()),
            def: Mutex::new(None),
            ext_ack: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display name used in messages
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn call_mode(&self) -> CallMode {
        self.call_mode
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_extension(&self) -> bool {
        self.extension.load(Ordering::Acquire)
    }

    pub fn bulk(&self) -> &Arc<dyn BulkChannel> {
        &self.bulk
    }

    /// Resolves once the connection has been closed
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Queue a message and flush it
    pub async fn send(&self, message: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.send(message).await,
            None => Err(PlugInError::Closed),
        }
    }

    /// Queue several messages and flush once
    pub async fn send_all(&self, messages: Vec<Message>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(PlugInError::Closed)?;
        for message in messages {
            w.feed(message).await?;
        }
        w.flush().await
    }

    pub(crate) fn set_main_frame(&self, frame: Arc<ProcFrame>) {
        *self.main_frame.lock() = Some(frame);
    }

    pub fn main_frame(&self) -> Option<Arc<ProcFrame>> {
        self.main_frame.lock().clone()
    }

    pub(crate) fn push_frame(&self, frame: Arc<ProcFrame>) {
        self.temp_frames.lock().push(frame);
    }

    pub(crate) fn pop_frame(&self) -> Option<Arc<ProcFrame>> {
        self.temp_frames.lock().pop()
    }

    /// The frame incoming calls run in: the top temporary frame, or the
    /// main frame when no temporary call is outstanding
    pub fn current_frame(&self) -> Option<Arc<ProcFrame>> {
        let top = self.temp_frames.lock().last().cloned();
        top.or_else(|| self.main_frame())
    }

    pub fn temp_frame_depth(&self) -> usize {
        self.temp_frames.lock().len()
    }

    pub fn temp_procedure(&self, name: &str) -> Option<Arc<Procedure>> {
        self.temp_procedures
            .lock()
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn temp_procedure_names(&self) -> Vec<String> {
        self.temp_procedures
            .lock()
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub(crate) fn add_temp_procedure(&self, procedure: Arc<Procedure>) {
        self.temp_procedures.lock().push(procedure);
    }

    pub(crate) fn remove_temp_procedure(&self, name: &str) -> Option<Arc<Procedure>> {
        let mut procs = self.temp_procedures.lock();
        let idx = procs.iter().position(|p| p.name == name)?;
        Some(procs.remove(idx))
    }

    pub(crate) fn set_def(&self, def: PlugInDef) {
        *self.def.lock() = Some(def);
    }

    pub(crate) fn take_def(&self) -> Option<PlugInDef> {
        self.def.lock().take()
    }

    /// Apply `f` to the definition being built by a query or init call
    pub(crate) fn with_def<T>(&self, f: impl FnOnce(&mut PlugInDef) -> T) -> Option<T> {
        self.def.lock().as_mut().map(f)
    }

    pub(crate) fn expect_extension_ack(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.extension.store(true, Ordering::Release);
        *self.ext_ack.lock() = Some(tx);
        rx
    }

    /// Returns false when no acknowledgement was outstanding
    pub(crate) fn acknowledge_extension(&self) -> bool {
        match self.ext_ack.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Tear the connection down.
    ///
    /// With `kill_it` the plug-in is asked to quit and killed if it has
    /// not exited after `grace`. The child is always reaped, both pipes are
    /// dropped, every waiting frame is woken with an execution error and
    /// the temporary procedures are handed back for unregistration. Closing
    /// a closed plug-in does nothing and returns no procedures.
    pub async fn close(&self, kill_it: bool, grace: Duration) -> Vec<Arc<Procedure>> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }

        debug!(plug_in = %self.name, kill_it, "closing plug-in");
        self.closed.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if kill_it {
                // best effort, the pipe may already be gone
                let _ = writer.send(Message::Quit).await;
            }
        }

        let child = self.child.lock().await.take();
        if let Some(child) = child {
            self.reap(child, kill_it, grace).await;
        }

        if let Some(frame) = self.main_frame.lock().take() {
            frame.abort("plug-in closed the connection");
        }
        for frame in self.temp_frames.lock().drain(..).rev() {
            frame.abort("plug-in closed the connection");
        }

        self.ext_ack.lock().take();
        std::mem::take(&mut *self.temp_procedures.lock())
    }

    async fn reap(&self, mut child: Child, kill_it: bool, grace: Duration) {
        if kill_it {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                debug!(plug_in = %self.name, "plug-in did not quit, killing it");
                if let Err(e) = child.start_kill() {
                    warn!(plug_in = %self.name, "failed to kill plug-in: {}", e);
                }
            }
        }

        match child.wait().await {
            Ok(status) if !status.success() && !kill_it => {
                warn!(
                    plug_in = %self.name,
                    path = %self.path.display(),
                    "plug-in exited with {}",
                    status
                );
            }
            Ok(_) => {}
            Err(e) => warn!(plug_in = %self.name, "failed to wait for plug-in: {}", e),
        }
    }
}

impl std::fmt::Debug for PlugIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlugIn")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("call_mode", &self.call_mode)
            .field("open", &self.is_open())
            .finish()
    }
}
