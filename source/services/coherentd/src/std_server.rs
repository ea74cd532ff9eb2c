// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coherent_mem::protocol::{self, Request, STATUS_NOT_FOUND, STATUS_OK};
use coherent_mem::{
    AddressSpaceProvider, BlockStateStore, Config, ControlFileMigrator, ControlSurface, Discovery,
    HotplugController, MemoryStore, MigrationController, ProcMapsProvider, RangeMigrator,
    RecordingMigrator, RegionRegistry, RegistrationReport, SysfsStore,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

/// Block size advertised by the in-memory store used for dry runs.
pub const DRY_RUN_BLOCK_SIZE: u64 = 0x1000_0000;

/// Largest frame accepted from a client.
pub const MAX_FRAME_LEN: usize = 4096;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Result alias used by the service.
pub type Result<T> = core::result::Result<T, ServerError>;

/// Errors surfaced while serving requests.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Transport level failure.
    #[error("transport error: {0}")]
    Transport(TransportError),
    /// Coherent memory backend failure.
    #[error("service error: {0}")]
    Service(ServiceError),
}

impl From<TransportError> for ServerError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<ServiceError> for ServerError {
    fn from(value: ServiceError) -> Self {
        Self::Service(value)
    }
}

impl From<coherent_mem::Error> for ServerError {
    fn from(value: coherent_mem::Error) -> Self {
        Self::Service(ServiceError::Coherent(value))
    }
}

/// Transport level failures surfaced by [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection closed by the peer.
    #[error("transport closed")]
    Closed,
    /// I/O failure.
    #[error("io error: {0}")]
    Io(String),
    /// Any other failure category.
    #[error("transport error: {0}")]
    Other(String),
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Failures of the coherent memory backend.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Library operation failed.
    #[error(transparent)]
    Coherent(coherent_mem::Error),
    /// Control socket could not be set up.
    #[error("socket {path}: {source}")]
    Socket {
        /// Socket path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// Transport abstraction used by coherentd.
pub trait Transport {
    /// Error surfaced by the transport implementation.
    type Error: Into<TransportError>;

    /// Receives the next frame; `None` once the peer is gone.
    fn recv(&mut self) -> core::result::Result<Option<Vec<u8>>, Self::Error>;

    /// Sends a response frame back to the caller.
    fn send(&mut self, frame: &[u8]) -> core::result::Result<(), Self::Error>;
}

/// Frames carried over a Unix stream, each prefixed with its length as `u32` LE.
pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    /// Wraps a connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }
}

impl Transport for UnixTransport {
    type Error = TransportError;

    fn recv(&mut self) -> core::result::Result<Option<Vec<u8>>, Self::Error> {
        let mut len = [0u8; 4];
        match self.stream.read_exact(&mut len) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::Other(format!(
                "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
            )));
        }
        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => err.into(),
        })?;
        Ok(Some(frame))
    }

    fn send(&mut self, frame: &[u8]) -> core::result::Result<(), Self::Error> {
        let len = u32::try_from(frame.len())
            .map_err(|_| TransportError::Other("frame too large".to_string()))?;
        self.stream.write_all(&len.to_le_bytes())?;
        self.stream.write_all(frame)?;
        Ok(())
    }
}

/// Notifies init when the service is ready.
pub struct ReadyNotifier(Box<dyn FnOnce() + Send>);

impl ReadyNotifier {
    /// Creates a notifier from `func`.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(func))
    }

    /// Emits the ready marker.
    pub fn notify(self) {
        (self.0)();
    }
}

/// Startup options taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Configuration file; built-in defaults when absent.
    pub config: Option<PathBuf>,
    /// Use an in-memory block store and record migrations instead of performing them.
    pub dry_run: bool,
}

/// Regions brought online at start, plus the control surface served to clients.
pub struct Service {
    registry: Mutex<RegionRegistry<Arc<dyn BlockStateStore>>>,
    control: ControlSurface,
    spaces: Box<dyn AddressSpaceProvider>,
}

impl Service {
    /// Assembles a service from its parts.
    pub fn new(
        registry: RegionRegistry<Arc<dyn BlockStateStore>>,
        control: ControlSurface,
        spaces: Box<dyn AddressSpaceProvider>,
    ) -> Self {
        Self { registry: Mutex::new(registry), control, spaces }
    }

    /// Builds the service described by `config`.
    pub fn from_config(config: &Config, dry_run: bool) -> Self {
        let store: Arc<dyn BlockStateStore>;
        let migrator: Box<dyn RangeMigrator>;
        if dry_run {
            info!("coherentd: dry run, no sysfs or migration writes");
            store = Arc::new(MemoryStore::new(DRY_RUN_BLOCK_SIZE));
            migrator = Box::new(RecordingMigrator::new());
        } else {
            store = Arc::new(SysfsStore::new(config.hotplug.sysfs_root.clone()));
            migrator = Box::new(ControlFileMigrator::new(config.control.migrate_file.clone()));
        }
        let registry =
            RegionRegistry::new(HotplugController::new(store), config.hotplug.max_regions);
        let migration = MigrationController::new(migrator, config.tier_map());
        let control = ControlSurface::new(migration, config.parse_mode());
        let spaces = Box::new(ProcMapsProvider::new(config.control.procfs_root.clone()));
        Self::new(registry, control, spaces)
    }

    /// Onlines every region `discovery` reports.
    pub fn start(&self, discovery: &dyn Discovery) -> Result<RegistrationReport> {
        let report = self.registry.lock().online_discovered(discovery)?;
        info!("coherentd: {} region(s) online, {} failed", report.onlined, report.failed);
        Ok(report)
    }

    /// Offlines every registered region.
    pub fn shutdown(&self) {
        let mut registry = self.registry.lock();
        info!("coherentd: offlining {} region(s)", registry.len());
        registry.teardown_all();
    }

    /// Number of regions currently online.
    pub fn online_regions(&self) -> usize {
        self.registry.lock().len()
    }

    /// Answers one request frame.
    pub fn dispatch(&self, frame: &[u8]) -> Vec<u8> {
        let request = match protocol::decode_request(frame) {
            Ok(request) => request,
            Err(status) => {
                warn!("coherentd: rejected frame ({} bytes), status {status}", frame.len());
                return protocol::encode_status_response(frame.get(3).copied().unwrap_or(0), status);
            }
        };
        match request {
            Request::Ioctl { cmd, pid, addr } => {
                let space = match self.spaces.address_space(pid) {
                    Ok(space) => space,
                    Err(err) => {
                        warn!("coherentd: pid {pid}: {err}");
                        return protocol::encode_status_response(
                            protocol::OP_IOCTL,
                            STATUS_NOT_FOUND,
                        );
                    }
                };
                let status = match self.control.ioctl(&space, cmd, addr) {
                    Ok(Some(_)) => STATUS_OK,
                    Ok(None) => STATUS_NOT_FOUND,
                    Err(err) => protocol::status_for(&err),
                };
                protocol::encode_status_response(protocol::OP_IOCTL, status)
            }
            Request::Write { text } => match self.control.write(text) {
                Ok(consumed) => protocol::encode_write_response(STATUS_OK, consumed as u32),
                Err(err) => {
                    debug!("coherentd: write rejected: {err}");
                    protocol::encode_write_response(protocol::status_for(&err), 0)
                }
            },
            Request::Usage => protocol::encode_usage_response(self.control.usage()),
        }
    }
}

/// Runs the service on the configured control socket until `shutdown` is raised.
///
/// Regions are onlined before the ready marker is emitted and offlined on every
/// exit path once they were onlined.
pub fn service_main_loop(
    options: Options,
    notifier: ReadyNotifier,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let config = match &options.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let service = Service::from_config(&config, options.dry_run);
    service.start(&*config.discovery())?;

    let socket = config.control.socket.clone();
    let result = bind(&socket).and_then(|listener| {
        info!("coherentd: listening on {}", socket.display());
        notifier.notify();
        serve(&listener, &service, &shutdown)
    });

    service.shutdown();
    if let Err(err) = std::fs::remove_file(&socket) {
        if err.kind() != ErrorKind::NotFound {
            warn!("coherentd: removing {}: {err}", socket.display());
        }
    }
    result
}

fn bind(path: &Path) -> Result<UnixListener> {
    let socket_err = |source| ServiceError::Socket { path: path.to_path_buf(), source };
    match std::fs::remove_file(path) {
        Ok(()) => debug!("coherentd: removed stale socket {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(socket_err(err).into()),
    }
    let listener = UnixListener::bind(path).map_err(socket_err)?;
    listener.set_nonblocking(true).map_err(socket_err)?;
    Ok(listener)
}

/// Accepts clients one at a time until `shutdown` is raised.
pub fn serve(listener: &UnixListener, service: &Service, shutdown: &AtomicBool) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).map_err(TransportError::from)?;
                let mut transport = UnixTransport::new(stream);
                if let Err(err) = run_with_transport(&mut transport, service) {
                    warn!("coherentd: client dropped: {err}");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(TransportError::from(err).into()),
        }
    }
    info!("coherentd: shutdown requested");
    Ok(())
}

/// Serves `transport` until the peer goes away.
pub fn run_with_transport<T: Transport>(transport: &mut T, service: &Service) -> Result<()> {
    while let Some(frame) = transport.recv().map_err(|err| ServerError::Transport(err.into()))? {
        if frame.is_empty() {
            continue;
        }
        if let Err(err) = handle_frame(service, transport, &frame) {
            error!("coherentd: handle error: {err}");
            return Err(err);
        }
    }
    Ok(())
}

fn handle_frame<T: Transport>(service: &Service, transport: &mut T, frame: &[u8]) -> Result<()> {
    let response = service.dispatch(frame);
    transport.send(&response).map_err(|err| ServerError::Transport(err.into()))
}
