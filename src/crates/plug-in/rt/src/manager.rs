//! The plug-in manager: owns every piece of host-wide state and runs the
//! call paths into plug-in processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use plug_in_error::{PlugInError, Result};
use plug_in_protocol::{Config, Message, MessageReader, ProcRun};
use plug_in_shm::BulkChannel;
use plug_in_types::{CallMode, ParamValue, PdbStatus, ProcType, ReturnValues};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::builtins;
use crate::config::HostConfig;
use crate::context::Context;
use crate::def::PlugInDef;
use crate::dispatch::{self, Flow};
use crate::environ::Environ;
use crate::frame::{FrameWaiter, ProcFrame};
use crate::interpreter::InterpreterDb;
use crate::pdb::ProcedureDb;
use crate::plug_in::PlugIn;
use crate::procedure::{ProcLocation, Procedure};
use crate::process::{self, BoxedReader, SpawnRequest};
use crate::progress::Progress;
use crate::tile::TileStore;

/// Read half of a connection as the dispatcher sees it
pub type PlugInReader = MessageReader<BoxedReader>;

/// Who is asking for a procedure to run, and in which scope
#[derive(Clone)]
pub struct Caller {
    pub context: Context,
    pub progress: Option<Arc<dyn Progress>>,
    /// The plug-in that sent the request, for calls coming off a pipe
    pub plug_in: Option<Arc<PlugIn>>,
    pub frame: Option<Arc<ProcFrame>>,
}

impl Caller {
    /// A call made by the host itself
    pub fn host() -> Self {
        Self {
            context: Context::user(),
            progress: None,
            plug_in: None,
            frame: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// A call made by `plug_in`, running in its current frame
    pub(crate) fn from_plug_in(plug_in: &Arc<PlugIn>) -> Self {
        let frame = plug_in.current_frame();
        Self {
            context: frame.as_ref().map_or_else(Context::user, |f| f.context()),
            progress: frame.as_ref().and_then(|f| f.progress().cloned()),
            plug_in: Some(plug_in.clone()),
            frame,
        }
    }
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("context", &self.context)
            .field("plug_in", &self.plug_in.as_ref().map(|p| p.name()))
            .finish()
    }
}

/// Host-side owner of the procedure database, the bulk tile channel and
/// all open plug-in connections.
pub struct PlugInManager {
    config: HostConfig,
    pdb: ProcedureDb,
    tiles: Arc<dyn TileStore>,
    bulk: Arc<dyn BulkChannel>,
    tile_lease: tokio::sync::Mutex<()>,
    interpreters: InterpreterDb,
    environ: Environ,
    defs: Mutex<Vec<PlugInDef>>,
    open: Mutex<HashMap<u64, Arc<PlugIn>>>,
    next_id: AtomicU64,
}

impl PlugInManager {
    /// Create a manager, negotiating the tile channel from the config
    pub fn new(config: HostConfig, tiles: Arc<dyn TileStore>) -> Arc<Self> {
        let bulk = plug_in_shm::negotiate(config.tile_buffer_size(), config.use_shm);
        Self::with_bulk(config, tiles, bulk)
    }

    pub fn with_bulk(
        config: HostConfig,
        tiles: Arc<dyn TileStore>,
        bulk: Arc<dyn BulkChannel>,
    ) -> Arc<Self> {
        let manager = Self {
            interpreters: InterpreterDb::new(&config.interpreters),
            environ: Environ::from_config(&config.environment),
            config,
            pdb: ProcedureDb::new(),
            tiles,
            bulk,
            tile_lease: tokio::sync::Mutex::new(()),
            defs: Mutex::new(Vec::new()),
            open: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        };
        builtins::register(&manager.pdb);
        Arc::new(manager)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn pdb(&self) -> &ProcedureDb {
        &self.pdb
    }

    pub fn tiles(&self) -> &dyn TileStore {
        self.tiles.as_ref()
    }

    pub fn bulk(&self) -> &Arc<dyn BulkChannel> {
        &self.bulk
    }

    /// Held for the length of one tile transfer through the shared segment
    pub(crate) fn tile_lease(&self) -> &tokio::sync::Mutex<()> {
        &self.tile_lease
    }

    /// Known plug-in definitions, in the order they were registered
    pub fn defs(&self) -> Vec<PlugInDef> {
        self.defs.lock().clone()
    }

    pub fn open_plug_ins(&self) -> Vec<Arc<PlugIn>> {
        let mut open: Vec<_> = self.open.lock().values().cloned().collect();
        open.sort_by_key(|p| p.id());
        open
    }

    /// Start the executable at `path` in `mode`
    pub fn open(&self, path: &Path, mode: CallMode) -> Result<(Arc<PlugIn>, PlugInReader)> {
        let spawned = process::spawn(SpawnRequest {
            path,
            mode,
            interpreter: self.interpreters.resolve(path),
            environ: &self.environ,
            stack_trace_mode: self.config.stack_trace_mode.as_arg(),
        })?;

        let plug_in = self.register_open(path, mode, spawned.writer, Some(spawned.child));
        Ok((plug_in, MessageReader::new(spawned.reader)))
    }

    /// Connect to a plug-in over an existing stream pair instead of
    /// spawning a process
    pub fn attach<R, W>(
        &self,
        path: &Path,
        mode: CallMode,
        reader: R,
        writer: W,
    ) -> (Arc<PlugIn>, PlugInReader)
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let plug_in = self.register_open(path, mode, Box::pin(writer), None);
        (plug_in, MessageReader::new(Box::pin(reader)))
    }

    fn register_open(
        &self,
        path: &Path,
        mode: CallMode,
        writer: process::BoxedWriter,
        child: Option<tokio::process::Child>,
    ) -> Arc<PlugIn> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let plug_in = Arc::new(PlugIn::new(id, path, mode, writer, child, self.bulk.clone()));
        self.open.lock().insert(id, plug_in.clone());
        plug_in
    }

    /// Close `plug_in` and unregister the temporary procedures it
    /// installed. Closing a closed plug-in does nothing.
    pub async fn close(&self, plug_in: &Arc<PlugIn>, kill_it: bool) {
        let temps = plug_in.close(kill_it, self.config.quit_grace).await;
        for procedure in &temps {
            self.pdb.unregister_if_same(procedure);
        }
        self.open.lock().remove(&plug_in.id());
    }

    /// Read and dispatch messages from `plug_in` until the connection is
    /// closed. Any read failure closes the connection by force.
    pub(crate) async fn drive(self: Arc<Self>, plug_in: Arc<PlugIn>, mut reader: PlugInReader) {
        let closed = plug_in.closed();

        loop {
            tokio::select! {
                biased;
                _ = closed.cancelled() => break,
                message = reader.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            error!(
                                plug_in = %plug_in.name(),
                                path = %plug_in.path().display(),
                                "failed to read from plug-in: {}",
                                e
                            );
                            self.close(&plug_in, true).await;
                            break;
                        }
                        None => {
                            debug!(plug_in = %plug_in.name(), "plug-in closed its pipe");
                            self.close(&plug_in, true).await;
                            break;
                        }
                    };

                    if let Flow::Closed =
                        dispatch::handle_message(&self, &plug_in, &mut reader, message).await
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Run the executable at `path` in query mode and register what it
    /// installs
    pub async fn query(self: &Arc<Self>, path: &Path) -> Result<PlugInDef> {
        let (plug_in, reader) = self.open(path, CallMode::Query)?;
        let def = PlugInDef::new(path, PlugInDef::mtime_of(path));
        Ok(self.query_on(plug_in, reader, def).await)
    }

    /// Query an already connected plug-in
    pub async fn query_on(
        self: &Arc<Self>,
        plug_in: Arc<PlugIn>,
        reader: PlugInReader,
        def: PlugInDef,
    ) -> PlugInDef {
        let def = self.run_sync(plug_in, reader, def).await;
        info!(
            plug_in = %def.display_name(),
            procedures = def.procedures.len(),
            has_init = def.has_init,
            "queried plug-in"
        );
        self.register_def(def.clone());
        def
    }

    /// Run the init phase of a plug-in that declared one
    pub async fn init(self: &Arc<Self>, def: &PlugInDef) -> Result<PlugInDef> {
        let (plug_in, reader) = self.open(&def.path, CallMode::Init)?;
        let def = self.run_sync(plug_in, reader, def.clone()).await;
        self.register_def(def.clone());
        Ok(def)
    }

    /// Read messages directly on this task until the plug-in goes away
    async fn run_sync(
        self: &Arc<Self>,
        plug_in: Arc<PlugIn>,
        reader: PlugInReader,
        def: PlugInDef,
    ) -> PlugInDef {
        let fallback = PlugInDef::new(&def.path, def.mtime);
        plug_in.set_def(def);
        self.clone().drive(plug_in.clone(), reader).await;
        plug_in.take_def().unwrap_or(fallback)
    }

    /// Replace any definition for the same path and publish the new
    /// one's procedures
    pub fn register_def(&self, def: PlugInDef) {
        let mut defs = self.defs.lock();
        if let Some(idx) = defs.iter().position(|d| d.path == def.path) {
            let old = defs.remove(idx);
            for procedure in &old.procedures {
                self.pdb.unregister_if_same(procedure);
            }
        }
        for procedure in &def.procedures {
            self.pdb.register(procedure.clone());
        }
        defs.push(def);
    }

    /// Look `name` up and run it. Never fails: errors come back as a
    /// non-success status.
    pub fn execute_by_name(
        self: &Arc<Self>,
        caller: Caller,
        name: &str,
        args: Vec<ParamValue>,
    ) -> BoxFuture<'static, ReturnValues> {
        let Some(procedure) = self.pdb.lookup(name) else {
            let values = ReturnValues::error(
                PdbStatus::ExecutionError,
                format!("procedure \"{}\" not found", name),
            );
            return futures::future::ready(values).boxed();
        };

        let manager = self.clone();
        async move { manager.execute(caller, procedure, args).await }.boxed()
    }

    /// Run `procedure` after checking the arguments against its signature
    pub async fn execute(
        self: Arc<Self>,
        caller: Caller,
        procedure: Arc<Procedure>,
        args: Vec<ParamValue>,
    ) -> ReturnValues {
        if let Err(reason) = procedure.check_args(&args) {
            return ReturnValues::error(
                PdbStatus::CallingError,
                format!("procedure \"{}\" called with wrong arguments: {}", procedure.name, reason),
            );
        }

        match procedure.location.clone() {
            ProcLocation::Internal(handler) => handler.call(&self, &caller, args).await,
            ProcLocation::File(path) => self.call_run(&caller, &path, procedure, args).await,
            ProcLocation::Temporary(owner) => match owner.upgrade().filter(|p| p.is_open()) {
                Some(owner) => self.call_temp(&caller, &owner, procedure, args).await,
                None => ReturnValues::error(
                    PdbStatus::ExecutionError,
                    format!(
                        "temporary procedure \"{}\" belongs to a plug-in that is gone",
                        procedure.name
                    ),
                ),
            },
        }
    }

    async fn call_run(
        self: &Arc<Self>,
        caller: &Caller,
        path: &Path,
        procedure: Arc<Procedure>,
        args: Vec<ParamValue>,
    ) -> ReturnValues {
        match self.open(path, CallMode::Run) {
            Ok((plug_in, reader)) => self.run_on(caller, plug_in, reader, procedure, args).await,
            Err(e) => {
                error!(
                    plug_in = %crate::def::display_name(path),
                    path = %path.display(),
                    "{}",
                    e
                );
                ReturnValues::error(
                    PdbStatus::ExecutionError,
                    format!(
                        "failed to run plug-in \"{}\" ({}): {}",
                        crate::def::display_name(path),
                        path.display(),
                        e
                    ),
                )
            }
        }
    }

    /// Send `procedure` to a connected Run-mode plug-in and wait for its
    /// return. The connection's messages are read by a task of its own
    /// while this call is suspended.
    pub async fn run_on(
        self: &Arc<Self>,
        caller: &Caller,
        plug_in: Arc<PlugIn>,
        reader: PlugInReader,
        procedure: Arc<Procedure>,
        args: Vec<ParamValue>,
    ) -> ReturnValues {
        let (frame, waiter) =
            ProcFrame::new(procedure.clone(), caller.context.clone(), caller.progress.clone());
        plug_in.set_main_frame(frame.clone());

        tokio::spawn(self.clone().drive(plug_in.clone(), reader));

        let messages = vec![
            Message::Config(Box::new(self.wire_config())),
            Message::ProcRun(ProcRun {
                name: procedure.name.clone(),
                params: args,
            }),
        ];
        if let Err(e) = plug_in.send_all(messages).await {
            error!(
                plug_in = %plug_in.name(),
                path = %plug_in.path().display(),
                "failed to start procedure {}: {}",
                procedure.name,
                e
            );
            self.close(&plug_in, true).await;
        }

        self.wait_frame(&plug_in, &frame, waiter).await
    }

    async fn call_temp(
        self: &Arc<Self>,
        caller: &Caller,
        owner: &Arc<PlugIn>,
        procedure: Arc<Procedure>,
        args: Vec<ParamValue>,
    ) -> ReturnValues {
        let (frame, waiter) =
            ProcFrame::new(procedure.clone(), caller.context.clone(), caller.progress.clone());
        owner.push_frame(frame.clone());

        let message = Message::TempProcRun(ProcRun {
            name: procedure.name.clone(),
            params: args,
        });
        if let Err(e) = owner.send(message).await {
            error!(
                plug_in = %owner.name(),
                path = %owner.path().display(),
                "failed to run temporary procedure {}: {}",
                procedure.name,
                e
            );
            self.close(owner, true).await;
        }

        self.wait_frame(owner, &frame, waiter).await
    }

    /// Suspend until the frame completes. A cancel from the frame's
    /// progress completes it with a cancel status and kills the plug-in.
    async fn wait_frame(
        &self,
        plug_in: &Arc<PlugIn>,
        frame: &Arc<ProcFrame>,
        waiter: FrameWaiter,
    ) -> ReturnValues {
        let Some(progress) = frame.progress().cloned() else {
            return waiter.wait().await;
        };
        let cancel = progress.cancellation();

        tokio::select! {
            biased;
            values = waiter.wait() => values,
            _ = cancel.cancelled() => {
                info!(
                    plug_in = %plug_in.name(),
                    procedure = %frame.procedure().name,
                    "call cancelled"
                );
                frame.complete(ReturnValues::cancel());
                self.close(plug_in, true).await;
                ReturnValues::cancel()
            }
        }
    }

    /// Start an extension procedure and leave its process running once it
    /// has acknowledged
    pub async fn start_extension(self: &Arc<Self>, procedure: &Arc<Procedure>) -> Result<Arc<PlugIn>> {
        let ProcLocation::File(path) = &procedure.location else {
            return Err(PlugInError::NotExecutable(procedure.name.clone()));
        };
        let (plug_in, reader) = self.open(path, CallMode::Run)?;
        self.start_extension_on(plug_in, reader, procedure).await
    }

    pub async fn start_extension_on(
        self: &Arc<Self>,
        plug_in: Arc<PlugIn>,
        reader: PlugInReader,
        procedure: &Arc<Procedure>,
    ) -> Result<Arc<PlugIn>> {
        let ack = plug_in.expect_extension_ack();
        let (frame, _waiter) = ProcFrame::new(procedure.clone(), Context::user(), None);
        plug_in.set_main_frame(frame);

        tokio::spawn(self.clone().drive(plug_in.clone(), reader));

        let messages = vec![
            Message::Config(Box::new(self.wire_config())),
            Message::ProcRun(ProcRun {
                name: procedure.name.clone(),
                params: Vec::new(),
            }),
        ];
        if let Err(e) = plug_in.send_all(messages).await {
            self.close(&plug_in, true).await;
            return Err(e);
        }

        ack.await.map_err(|_| PlugInError::Closed)?;
        info!(plug_in = %plug_in.name(), procedure = %procedure.name, "extension started");
        Ok(plug_in)
    }

    /// Bring the given definitions live: query the ones that are stale,
    /// register the rest, run init phases, then start extensions
    pub async fn restore(self: &Arc<Self>, defs: Vec<PlugInDef>) {
        let mut ready = Vec::with_capacity(defs.len());
        for def in defs {
            if def.needs_query(PlugInDef::mtime_of(&def.path)) {
                match self.query(&def.path).await {
                    Ok(def) => ready.push(def),
                    Err(e) => warn!(path = %def.path.display(), "query failed: {}", e),
                }
            } else {
                self.register_def(def.clone());
                ready.push(def);
            }
        }

        for def in ready.iter().filter(|d| d.has_init) {
            if let Err(e) = self.init(def).await {
                warn!(path = %def.path.display(), "init failed: {}", e);
            }
        }

        let extensions = self.pdb.procedures().into_iter().filter(|p| {
            p.proc_type == ProcType::Extension
                && p.params.is_empty()
                && matches!(p.location, ProcLocation::File(_))
        });
        for procedure in extensions {
            if let Err(e) = self.start_extension(&procedure).await {
                warn!(procedure = %procedure.name, "failed to start extension: {}", e);
            }
        }
    }

    /// Executables found in the configured plug-in directories
    pub fn search(&self) -> Vec<PathBuf> {
        search_paths(&self.config.plug_in_path, &self.interpreters)
    }

    /// Search the plug-in directories and restore everything found, using
    /// `cached` definitions where they are still current
    pub async fn startup(self: &Arc<Self>, cached: Vec<PlugInDef>) {
        let mut by_path: HashMap<PathBuf, PlugInDef> =
            cached.into_iter().map(|d| (d.path.clone(), d)).collect();

        let defs = self
            .search()
            .into_iter()
            .map(|path| by_path.remove(&path).unwrap_or_else(|| PlugInDef::new(path, None)))
            .collect();

        self.restore(defs).await;
    }

    /// Close every open plug-in
    pub async fn exit(&self) {
        for plug_in in self.open_plug_ins() {
            self.close(&plug_in, true).await;
        }
    }

    /// Snapshot sent ahead of every proc-run
    pub fn wire_config(&self) -> Config {
        let num_processors = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1);

        Config {
            tile_width: self.config.tile_width,
            tile_height: self.config.tile_height,
            shm_id: self.bulk.segment_id(),
            num_processors,
            ..Config::default()
        }
    }
}

impl std::fmt::Debug for PlugInManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlugInManager")
            .field("procedures", &self.pdb.len())
            .field("open", &self.open.lock().len())
            .field("bulk", &self.bulk)
            .finish()
    }
}

/// Plug-in files in `dirs` and their immediate subdirectories.
///
/// A file qualifies when it is executable or when an interpreter handles
/// its extension. Hidden entries are skipped.
pub fn search_paths(dirs: &[PathBuf], interpreters: &InterpreterDb) -> Vec<PathBuf> {
    let mut found = Vec::new();

    for dir in dirs {
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(2)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if is_executable(&entry) || interpreters.handles_extension(path) {
                found.push(path.to_path_buf());
            }
        }
    }

    found.sort();
    found.dedup();
    found
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

#[cfg(unix)]
fn is_executable(entry: &walkdir::DirEntry) -> bool {
    use std::os::unix::fs::PermissionsExt;
    entry
        .metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(entry: &walkdir::DirEntry) -> bool {
    entry
        .path()
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressEvent, RecordingProgress};
    use crate::tile::{MemoryTileStore, TileGeometry};
    use plug_in_protocol::{
        ProcInstall, ProcReturn, TileData, TileReq, Transport, WireParamDef,
    };
    use plug_in_types::{ArgType, FileHandlerKind};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Peer = Transport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn config(use_shm: bool) -> HostConfig {
        HostConfig {
            use_shm,
            quit_grace: Duration::from_millis(1),
            ..HostConfig::default()
        }
    }

    fn manager() -> Arc<PlugInManager> {
        PlugInManager::new(config(false), Arc::new(MemoryTileStore::new(64, 64)))
    }

    fn connect(
        manager: &PlugInManager,
        mode: CallMode,
        path: &str,
    ) -> (Arc<PlugIn>, PlugInReader, Peer) {
        let (host, peer) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let (plug_in, reader) = manager.attach(Path::new(path), mode, host_read, host_write);
        (plug_in, reader, Transport::new_with_streams(peer_read, peer_write))
    }

    fn file_procedure(name: &str, path: &str, proc_type: ProcType) -> Arc<Procedure> {
        Arc::new(Procedure {
            name: name.to_string(),
            info: Default::default(),
            proc_type,
            handler: FileHandlerKind::None,
            handler_extensions: Vec::new(),
            params: Vec::new(),
            return_vals: Vec::new(),
            location: ProcLocation::File(PathBuf::from(path)),
        })
    }

    fn install(name: &str, proc_type: ProcType, params: Vec<WireParamDef>) -> Message {
        let mut install = ProcInstall::new(name, proc_type);
        install.params = params;
        Message::ProcInstall(Box::new(install))
    }

    fn proc_return(name: &str, values: ReturnValues) -> ProcReturn {
        ProcReturn {
            name: name.to_string(),
            params: values.into_vec(),
        }
    }

    /// Read the config and proc-run that start every run
    async fn expect_run(peer: &mut Peer, name: &str) -> Vec<ParamValue> {
        let Message::Config(config) = peer.recv().await.unwrap() else {
            panic!("expected config");
        };
        assert_eq!(config.tile_width, 64);
        let Message::ProcRun(run) = peer.recv().await.unwrap() else {
            panic!("expected proc-run");
        };
        assert_eq!(run.name, name);
        run.params
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_query_installs_procedure() {
        let manager = manager();
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Query, "/plug-ins/test");

        peer.feed(install("plug-in-test", ProcType::PlugIn, vec![]))
            .await
            .unwrap();
        peer.send(Message::Quit).await.unwrap();

        let def = manager
            .query_on(plug_in.clone(), reader, PlugInDef::new("/plug-ins/test", None))
            .await;

        let names: Vec<_> = def.procedures.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["plug-in-test"]);
        assert!(manager.pdb().contains("plug-in-test"));
        assert!(!plug_in.is_open());
        assert!(manager.open_plug_ins().is_empty());
        assert_eq!(manager.defs().len(), 1);
    }

    #[tokio::test]
    async fn test_has_init_is_recorded() {
        let manager = manager();
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Query, "/plug-ins/init");

        peer.feed(Message::HasInit).await.unwrap();
        peer.send(Message::Quit).await.unwrap();

        let def = manager
            .query_on(plug_in, reader, PlugInDef::new("/plug-ins/init", None))
            .await;
        assert!(def.has_init);
    }

    #[tokio::test]
    async fn test_invalid_installs_leave_pdb_unchanged() {
        let manager = manager();
        let before = manager.pdb().names();
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Query, "/plug-ins/bad");

        peer.feed(install("bad name!", ProcType::PlugIn, vec![]))
            .await
            .unwrap();
        // array not preceded by its int32 length
        peer.feed(install(
            "plug-in-float-array",
            ProcType::PlugIn,
            vec![
                WireParamDef::new(ArgType::Float, "x", "not a length"),
                WireParamDef::new(ArgType::FloatArray, "values", "values"),
            ],
        ))
        .await
        .unwrap();
        peer.feed(install(
            "plug-in-leading-array",
            ProcType::PlugIn,
            vec![WireParamDef::new(ArgType::StringArray, "names", "names")],
        ))
        .await
        .unwrap();
        // temporary procedures are only accepted while running
        peer.feed(install("plug-in-temp", ProcType::Temporary, vec![]))
            .await
            .unwrap();
        peer.send(Message::Quit).await.unwrap();

        let def = manager
            .query_on(plug_in, reader, PlugInDef::new("/plug-ins/bad", None))
            .await;

        assert!(def.procedures.is_empty());
        assert_eq!(manager.pdb().names(), before);
    }

    #[tokio::test]
    async fn test_array_with_length_is_accepted() {
        let manager = manager();
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Query, "/plug-ins/arrays");

        peer.feed(install(
            "plug-in-sum",
            ProcType::PlugIn,
            vec![
                WireParamDef::new(ArgType::Int32, "n", "number of values"),
                WireParamDef::new(ArgType::Int32Array, "values", "values"),
            ],
        ))
        .await
        .unwrap();
        peer.send(Message::Quit).await.unwrap();

        manager
            .query_on(plug_in, reader, PlugInDef::new("/plug-ins/arrays", None))
            .await;
        let procedure = manager.pdb().lookup("plug-in-sum").unwrap();
        assert_eq!(procedure.params.len(), 2);
    }

    #[tokio::test]
    async fn test_reinstall_replaces_procedure() {
        let manager = manager();
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Query, "/plug-ins/twice");

        peer.feed(install("plug-in-twice", ProcType::PlugIn, vec![]))
            .await
            .unwrap();
        peer.feed(install(
            "plug-in-twice",
            ProcType::PlugIn,
            vec![WireParamDef::new(ArgType::Int32, "n", "a number")],
        ))
        .await
        .unwrap();
        peer.send(Message::Quit).await.unwrap();

        let def = manager
            .query_on(plug_in, reader, PlugInDef::new("/plug-ins/twice", None))
            .await;
        assert_eq!(def.procedures.len(), 1);
        assert_eq!(manager.pdb().lookup("plug-in-twice").unwrap().params.len(), 1);
    }

    #[tokio::test]
    async fn test_reinstall_temporary_unregisters_old() {
        let manager = manager();
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/temp");
        tokio::spawn(manager.clone().drive(plug_in.clone(), reader));

        peer.send(install("temp-proc", ProcType::Temporary, vec![]))
            .await
            .unwrap();
        wait_until(|| manager.pdb().contains("temp-proc")).await;
        let old = manager.pdb().lookup("temp-proc").unwrap();

        peer.send(install(
            "temp-proc",
            ProcType::Temporary,
            vec![WireParamDef::new(ArgType::Int32, "n", "a number")],
        ))
        .await
        .unwrap();
        wait_until(|| {
            manager
                .pdb()
                .lookup("temp-proc")
                .is_some_and(|p| p.params.len() == 1)
        })
        .await;

        assert!(!manager.pdb().unregister_if_same(&old));
        assert_eq!(plug_in.temp_procedure_names(), ["temp-proc"]);

        peer.send(Message::ProcUninstall(plug_in_protocol::ProcUninstall {
            name: "temp-proc".to_string(),
        }))
        .await
        .unwrap();
        wait_until(|| !manager.pdb().contains("temp-proc")).await;

        peer.send(Message::Quit).await.unwrap();
        wait_until(|| !plug_in.is_open()).await;
    }

    #[tokio::test]
    async fn test_run_returns_values_and_closes() {
        let manager = manager();
        let procedure = file_procedure("plug-in-test", "/plug-ins/test", ProcType::PlugIn);
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/test");

        let peer_task = tokio::spawn(async move {
            assert!(expect_run(&mut peer, "plug-in-test").await.is_empty());
            let values = ReturnValues::success(vec![ParamValue::Int32(42)]);
            peer.send(Message::ProcReturn(proc_return("plug-in-test", values)))
                .await
                .unwrap();
            // closed without a quit request
            assert!(peer.recv().await.is_err());
        });

        let values = manager
            .run_on(&Caller::host(), plug_in.clone(), reader, procedure, vec![])
            .await;
        assert!(values.is_success());
        assert_eq!(values.get(0), Some(&ParamValue::Int32(42)));

        peer_task.await.unwrap();
        assert!(!plug_in.is_open());
        assert!(manager.open_plug_ins().is_empty());
    }

    #[tokio::test]
    async fn test_violation_closes_connection() {
        let manager = manager();
        let procedure = file_procedure("plug-in-test", "/plug-ins/test", ProcType::PlugIn);
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/test");

        let peer_task = tokio::spawn(async move {
            expect_run(&mut peer, "plug-in-test").await;
            // only legal in query mode
            peer.send(Message::HasInit).await.unwrap();
            assert_eq!(peer.recv().await.unwrap(), Message::Quit);
        });

        let values = manager
            .run_on(&Caller::host(), plug_in.clone(), reader, procedure, vec![])
            .await;
        assert_eq!(values.status(), PdbStatus::ExecutionError);

        peer_task.await.unwrap();
        assert!(!plug_in.is_open());
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let manager = manager();
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/test");
        drop(reader);

        manager.close(&plug_in, true).await;
        manager.close(&plug_in, true).await;

        assert_eq!(peer.recv().await.unwrap(), Message::Quit);
        assert!(matches!(peer.recv().await, Err(PlugInError::Closed)));
        assert!(manager.open_plug_ins().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_from_progress() {
        let manager = manager();
        let procedure = file_procedure("plug-in-slow", "/plug-ins/slow", ProcType::PlugIn);
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/slow");
        let progress = Arc::new(RecordingProgress::new());

        let call = tokio::spawn({
            let manager = manager.clone();
            let plug_in = plug_in.clone();
            let caller = Caller::host().with_progress(progress.clone());
            async move { manager.run_on(&caller, plug_in, reader, procedure, vec![]).await }
        });

        expect_run(&mut peer, "plug-in-slow").await;
        progress.cancel();

        let values = call.await.unwrap();
        assert_eq!(values.status(), PdbStatus::Cancel);
        assert_eq!(peer.recv().await.unwrap(), Message::Quit);
        assert!(!plug_in.is_open());
    }

    #[tokio::test]
    async fn test_temp_call_from_other_plug_in() {
        let manager = manager();

        let (a, a_reader, mut a_peer) = connect(&manager, CallMode::Run, "/plug-ins/a");
        let a_call = tokio::spawn({
            let manager = manager.clone();
            let a = a.clone();
            let procedure = file_procedure("a-main", "/plug-ins/a", ProcType::PlugIn);
            async move { manager.run_on(&Caller::host(), a, a_reader, procedure, vec![]).await }
        });
        expect_run(&mut a_peer, "a-main").await;
        a_peer
            .send(install("a-temp", ProcType::Temporary, vec![]))
            .await
            .unwrap();
        wait_until(|| manager.pdb().contains("a-temp")).await;

        let (b, b_reader, mut b_peer) = connect(&manager, CallMode::Run, "/plug-ins/b");
        let b_call = tokio::spawn({
            let manager = manager.clone();
            let b = b.clone();
            let procedure = file_procedure("b-main", "/plug-ins/b", ProcType::PlugIn);
            async move { manager.run_on(&Caller::host(), b, b_reader, procedure, vec![]).await }
        });
        expect_run(&mut b_peer, "b-main").await;

        b_peer
            .send(Message::ProcRun(ProcRun {
                name: "a-temp".to_string(),
                params: Vec::new(),
            }))
            .await
            .unwrap();

        // the request is routed to a, which owns the procedure
        let Message::TempProcRun(run) = a_peer.recv().await.unwrap() else {
            panic!("expected temp-proc-run");
        };
        assert_eq!(run.name, "a-temp");
        assert_eq!(a.temp_frame_depth(), 1);

        let values = ReturnValues::success(vec![ParamValue::Int32(7)]);
        a_peer
            .send(Message::TempProcReturn(proc_return("a-temp", values)))
            .await
            .unwrap();

        let Message::ProcReturn(ret) = b_peer.recv().await.unwrap() else {
            panic!("expected proc-return");
        };
        let ret = ReturnValues::from_wire(ret.params);
        assert_eq!(ret.get(0), Some(&ParamValue::Int32(7)));

        b_peer
            .send(Message::ProcReturn(proc_return("b-main", ReturnValues::success(vec![]))))
            .await
            .unwrap();
        assert!(b_call.await.unwrap().is_success());

        // a's own call is still waiting
        assert!(!a_call.is_finished());
        assert!(a.main_frame().unwrap().is_pending());
        assert_eq!(a.temp_frame_depth(), 0);

        let values = ReturnValues::success(vec![ParamValue::Int32(1)]);
        a_peer
            .send(Message::ProcReturn(proc_return("a-main", values)))
            .await
            .unwrap();
        assert_eq!(a_call.await.unwrap().get(0), Some(&ParamValue::Int32(1)));

        wait_until(|| !manager.pdb().contains("a-temp")).await;
        wait_until(|| !b.is_open()).await;
    }

    /// Call into the host from the plug-in side
    async fn host_call(peer: &mut Peer, name: &str, params: Vec<ParamValue>) -> ReturnValues {
        let run = ProcRun {
            name: name.to_string(),
            params,
        };
        let Message::ProcReturn(ret) = peer.request(Message::ProcRun(run)).await.unwrap() else {
            panic!("expected proc-return");
        };
        ReturnValues::from_wire(ret.params)
    }

    #[tokio::test]
    async fn test_builtins_from_plug_in() {
        let manager = manager();
        let procedure = file_procedure("plug-in-busy", "/plug-ins/busy", ProcType::PlugIn);
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/busy");
        let progress = Arc::new(RecordingProgress::new());

        let call = tokio::spawn({
            let manager = manager.clone();
            let caller = Caller::host().with_progress(progress.clone());
            async move { manager.run_on(&caller, plug_in, reader, procedure, vec![]).await }
        });
        expect_run(&mut peer, "plug-in-busy").await;

        let message = ParamValue::String("Working".to_string());
        assert!(host_call(&mut peer, "plug-in-progress-init", vec![message]).await.is_success());
        // deprecated name
        assert!(
            host_call(&mut peer, "gimp-progress-update", vec![ParamValue::Float(0.5)])
                .await
                .is_success()
        );
        assert_eq!(
            host_call(&mut peer, "plug-in-context-pop", vec![]).await.status(),
            PdbStatus::CallingError
        );
        assert!(host_call(&mut peer, "plug-in-context-push", vec![]).await.is_success());
        assert!(host_call(&mut peer, "plug-in-context-pop", vec![]).await.is_success());
        assert_eq!(
            host_call(&mut peer, "no-such-procedure", vec![]).await.status(),
            PdbStatus::ExecutionError
        );

        peer.send(Message::ProcReturn(proc_return("plug-in-busy", ReturnValues::success(vec![]))))
            .await
            .unwrap();
        assert!(call.await.unwrap().is_success());
        assert_eq!(
            progress.events(),
            [
                ProgressEvent::Start("Working".to_string()),
                ProgressEvent::Value(0.5)
            ]
        );
    }

    #[tokio::test]
    async fn test_extension_stays_running() {
        let manager = manager();
        let procedure = file_procedure("extension-test", "/plug-ins/ext", ProcType::Extension);
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/ext");

        let start = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .start_extension_on(plug_in, reader, &procedure)
                    .await
            }
        });

        assert!(expect_run(&mut peer, "extension-test").await.is_empty());
        peer.feed(install("extension-temp", ProcType::Temporary, vec![]))
            .await
            .unwrap();
        peer.send(Message::ExtensionAck).await.unwrap();

        let plug_in = start.await.unwrap().unwrap();
        assert!(plug_in.is_open());
        assert!(plug_in.is_extension());
        assert!(manager.pdb().contains("extension-temp"));

        let call = manager.execute_by_name(Caller::host(), "extension-temp", vec![]);
        let call = tokio::spawn(call);
        let Message::TempProcRun(run) = peer.recv().await.unwrap() else {
            panic!("expected temp-proc-run");
        };
        peer.send(Message::TempProcReturn(proc_return(&run.name, ReturnValues::success(vec![]))))
            .await
            .unwrap();
        assert!(call.await.unwrap().is_success());

        manager.exit().await;
        assert_eq!(peer.recv().await.unwrap(), Message::Quit);
        assert!(!manager.pdb().contains("extension-temp"));
    }

    #[tokio::test]
    async fn test_start_extension_needs_executable() {
        let manager = manager();
        let procedure = manager.pdb().lookup("plug-in-progress-end").unwrap();
        assert!(matches!(
            manager.start_extension(&procedure).await,
            Err(PlugInError::NotExecutable(_))
        ));
    }

    #[tokio::test]
    async fn test_tile_put_through_pipe() {
        let store = Arc::new(MemoryTileStore::new(64, 64));
        assert!(store.add_drawable(1, 4, 4, 1));
        let manager = PlugInManager::new(config(false), store.clone());
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/tiles");
        tokio::spawn(manager.clone().drive(plug_in.clone(), reader));

        peer.send(Message::TileReq(TileReq::put())).await.unwrap();
        let Message::TileData(descriptor) = peer.recv().await.unwrap() else {
            panic!("expected tile-data");
        };
        assert_eq!(descriptor.drawable_id, TileReq::PUT);
        assert_eq!((descriptor.width, descriptor.height, descriptor.bpp), (0, 0, 0));
        assert!(!descriptor.use_shm);

        let pixels: Vec<u8> = (1..=16).collect();
        peer.send(Message::TileData(Box::new(TileData {
            drawable_id: 1,
            tile_num: 0,
            shadow: false,
            bpp: 1,
            width: 4,
            height: 4,
            use_shm: false,
            data: Some(pixels.clone().into()),
        })))
        .await
        .unwrap();
        assert_eq!(peer.recv().await.unwrap(), Message::TileAck);
        assert_eq!(store.pixels(1, false).unwrap(), pixels);

        peer.send(Message::Quit).await.unwrap();
        wait_until(|| !plug_in.is_open()).await;
    }

    #[tokio::test]
    async fn test_tile_get_same_bytes_through_shm_and_pipe() {
        use plug_in_shm::{PipeChannel, PosixShm};

        let store = Arc::new(MemoryTileStore::new(64, 64));
        assert!(store.add_drawable(1, 100, 70, 3));
        let pixels: Vec<u8> = (0..100 * 70 * 3).map(|i| (i % 251) as u8).collect();
        assert!(store.set_pixels(1, false, &pixels));

        let req = TileReq {
            drawable_id: 1,
            tile_num: 1,
            shadow: false,
        };

        let shm = PosixShm::create(config(true).tile_buffer_size()).unwrap();
        let via_shm = PlugInManager::with_bulk(config(true), store.clone(), Arc::new(shm));
        let via_pipe = PlugInManager::with_bulk(config(false), store.clone(), Arc::new(PipeChannel));

        let a = fetch_tile(&via_shm, req).await;
        let b = fetch_tile(&via_pipe, req).await;

        let (geometry, expected) = store.read_tile(1, 1, false).unwrap();
        assert_eq!((geometry.width, geometry.height), (36, 64));
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    async fn fetch_tile(manager: &Arc<PlugInManager>, req: TileReq) -> Vec<u8> {
        use plug_in_shm::PosixShm;

        let (plug_in, reader, mut peer) = connect(manager, CallMode::Run, "/plug-ins/tiles");
        tokio::spawn(manager.clone().drive(plug_in.clone(), reader));

        peer.send(Message::TileReq(req)).await.unwrap();
        let Message::TileData(tile) = peer.recv().await.unwrap() else {
            panic!("expected tile-data");
        };
        assert_eq!(tile.use_shm, manager.bulk().uses_shm());

        let len = tile.byte_len().unwrap();
        let data = if tile.use_shm {
            assert!(tile.data.is_none());
            let bulk = manager.bulk();
            let segment =
                PosixShm::attach(std::process::id(), bulk.segment_id(), bulk.capacity()).unwrap();
            segment.receive(None, len).unwrap()
        } else {
            tile.data.clone().unwrap()
        };

        peer.send(Message::TileAck).await.unwrap();
        peer.send(Message::Quit).await.unwrap();
        wait_until(|| !plug_in.is_open()).await;
        data.to_vec()
    }

    async fn put_tile(
        manager: &Arc<PlugInManager>,
        tile_num: u32,
        geometry: TileGeometry,
        pixels: &[u8],
    ) {
        use plug_in_shm::PosixShm;

        let (plug_in, reader, mut peer) = connect(manager, CallMode::Run, "/plug-ins/tiles");
        tokio::spawn(manager.clone().drive(plug_in.clone(), reader));

        peer.send(Message::TileReq(TileReq::put())).await.unwrap();
        let Message::TileData(descriptor) = peer.recv().await.unwrap() else {
            panic!("expected tile-data");
        };
        assert_eq!(descriptor.use_shm, manager.bulk().uses_shm());

        let data = if descriptor.use_shm {
            let bulk = manager.bulk();
            let segment =
                PosixShm::attach(std::process::id(), bulk.segment_id(), bulk.capacity()).unwrap();
            assert!(segment.send(pixels).unwrap().is_none());
            None
        } else {
            Some(pixels.to_vec().into())
        };

        peer.send(Message::TileData(Box::new(TileData {
            drawable_id: 1,
            tile_num,
            shadow: false,
            bpp: geometry.bpp,
            width: geometry.width,
            height: geometry.height,
            use_shm: descriptor.use_shm,
            data,
        })))
        .await
        .unwrap();
        assert_eq!(peer.recv().await.unwrap(), Message::TileAck);

        peer.send(Message::Quit).await.unwrap();
        wait_until(|| !plug_in.is_open()).await;
    }

    #[tokio::test]
    async fn test_tile_put_same_pixels_through_shm_and_pipe() {
        use plug_in_shm::{PipeChannel, PosixShm};

        let geometry = TileGeometry { width: 36, height: 64, bpp: 3 };
        let pixels: Vec<u8> = (0..geometry.byte_len()).map(|i| (i % 241) as u8).collect();

        let mut stored = Vec::new();
        for use_shm in [true, false] {
            let store = Arc::new(MemoryTileStore::new(64, 64));
            assert!(store.add_drawable(1, 100, 70, 3));
            let bulk: Arc<dyn BulkChannel> = if use_shm {
                Arc::new(PosixShm::create(config(true).tile_buffer_size()).unwrap())
            } else {
                Arc::new(PipeChannel)
            };
            let manager = PlugInManager::with_bulk(config(use_shm), store.clone(), bulk);
            assert_eq!(manager.bulk().uses_shm(), use_shm);

            put_tile(&manager, 1, geometry, &pixels).await;

            let (_, tile) = store.read_tile(1, 1, false).unwrap();
            assert_eq!(tile, pixels);
            stored.push(store.pixels(1, false).unwrap());
        }
        assert_eq!(stored[0], stored[1]);
    }

    #[tokio::test]
    async fn test_tile_put_with_wrong_geometry_closes() {
        let store = Arc::new(MemoryTileStore::new(64, 64));
        assert!(store.add_drawable(1, 4, 4, 1));
        let manager = PlugInManager::new(config(false), store.clone());
        let (plug_in, reader, mut peer) = connect(&manager, CallMode::Run, "/plug-ins/tiles");
        tokio::spawn(manager.clone().drive(plug_in.clone(), reader));

        peer.send(Message::TileReq(TileReq::put())).await.unwrap();
        let Message::TileData(_) = peer.recv().await.unwrap() else {
            panic!("expected tile-data");
        };

        // same byte count as the drawable's 4x4x1 tile
        peer.send(Message::TileData(Box::new(TileData {
            drawable_id: 1,
            tile_num: 0,
            shadow: false,
            bpp: 2,
            width: 4,
            height: 2,
            use_shm: false,
            data: Some(vec![7u8; 16].into()),
        })))
        .await
        .unwrap();

        assert_eq!(peer.recv().await.unwrap(), Message::Quit);
        wait_until(|| !plug_in.is_open()).await;
        assert_eq!(store.pixels(1, false).unwrap(), vec![0; 16]);
    }

    #[tokio::test]
    async fn test_shared_segment_serves_one_transfer_at_a_time() {
        use plug_in_shm::PosixShm;

        let store = Arc::new(MemoryTileStore::new(4, 4));
        assert!(store.add_drawable(1, 4, 4, 1));
        assert!(store.add_drawable(2, 4, 4, 1));
        assert!(store.set_pixels(1, false, &[0xaa; 16]));
        assert!(store.set_pixels(2, false, &[0xbb; 16]));

        let shm = PosixShm::create(config(true).tile_buffer_size()).unwrap();
        let manager = PlugInManager::with_bulk(config(true), store, Arc::new(shm));
        let bulk = manager.bulk().clone();
        let segment =
            PosixShm::attach(std::process::id(), bulk.segment_id(), bulk.capacity()).unwrap();

        let (first, first_reader, mut first_peer) =
            connect(&manager, CallMode::Run, "/plug-ins/first");
        let (second, second_reader, mut second_peer) =
            connect(&manager, CallMode::Run, "/plug-ins/second");
        tokio::spawn(manager.clone().drive(first.clone(), first_reader));
        tokio::spawn(manager.clone().drive(second.clone(), second_reader));

        let get = |drawable_id| {
            Message::TileReq(TileReq {
                drawable_id,
                tile_num: 0,
                shadow: false,
            })
        };

        first_peer.send(get(1)).await.unwrap();
        let Message::TileData(tile) = first_peer.recv().await.unwrap() else {
            panic!("expected tile-data");
        };
        assert!(tile.use_shm);
        assert_eq!(tile.drawable_id, 1);

        // the segment still holds the first tile until it is acknowledged
        second_peer.send(get(2)).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), second_peer.recv())
                .await
                .is_err()
        );
        assert_eq!(&segment.receive(None, 16).unwrap()[..], &[0xaa; 16][..]);
        first_peer.send(Message::TileAck).await.unwrap();

        let Message::TileData(tile) = second_peer.recv().await.unwrap() else {
            panic!("expected tile-data");
        };
        assert_eq!(tile.drawable_id, 2);
        assert_eq!(&segment.receive(None, 16).unwrap()[..], &[0xbb; 16][..]);
        second_peer.send(Message::TileAck).await.unwrap();

        first_peer.send(Message::Quit).await.unwrap();
        second_peer.send(Message::Quit).await.unwrap();
        wait_until(|| !first.is_open() && !second.is_open()).await;
    }

    #[test]
    fn test_search_paths() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let write = |rel: &str, mode: u32| {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
            path
        };

        let top = write("blur", 0o755);
        let nested = write("sharpen/sharpen", 0o755);
        let script = write("scripts/filter.py", 0o644);
        write("readme.txt", 0o644);
        write(".hidden/tool", 0o755);
        write("a/b/too-deep", 0o755);

        let interpreters = InterpreterDb::new(&[crate::config::InterpreterConfig {
            program: PathBuf::from("/usr/bin/python3"),
            arg: None,
            extensions: vec!["py".to_string()],
        }]);

        let found = search_paths(&[dir.path().to_path_buf()], &interpreters);
        let mut expected = vec![top, nested, script];
        expected.sort();
        assert_eq!(found, expected);
    }
}
