// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! State shared by the server and client roles: the connection state
//! machine, the single-slot stop channel, lifecycle callbacks, keep-alive
//! setup and the per-connection read loop.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};

use super::shutdown::{terminal_signal, Shutdown};
use crate::network::{Session, SessionReader};
use crate::request::Router;
use crate::utils::WorkerPool;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Init = 0,
    Running = 1,
    ShuttingDown = 2,
    Terminate = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Init,
            1 => ConnState::Running,
            2 => ConnState::ShuttingDown,
            _ => ConnState::Terminate,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Init => "init",
            ConnState::Running => "running",
            ConnState::ShuttingDown => "shutting down",
            ConnState::Terminate => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a connection, or a whole server/client, stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The remote end closed the stream.
    PeerClosed,
    /// This side closed the session.
    LocalClosed,
    /// Explicit shutdown request or terminal signal.
    Shutdown,
    /// Framing, I/O or accept failure.
    Failed(AppError),
}

impl StopReason {
    pub fn from_error(err: AppError) -> StopReason {
        match err {
            AppError::PeerClosed => StopReason::PeerClosed,
            AppError::LocalClosed => StopReason::LocalClosed,
            AppError::IoError(ref io_err) if super::is_disconnect(io_err) => StopReason::PeerClosed,
            err => StopReason::Failed(err),
        }
    }

    /// Everything except `Failed` is part of a normal teardown.
    pub fn is_expected(&self) -> bool {
        !matches!(self, StopReason::Failed(_))
    }

    pub fn error(&self) -> Option<&AppError> {
        match self {
            StopReason::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::PeerClosed => f.write_str("closed by peer"),
            StopReason::LocalClosed => f.write_str("closed locally"),
            StopReason::Shutdown => f.write_str("shutdown"),
            StopReason::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

/// `Init → Running → ShuttingDown → Terminate`, plus the stop channel.
///
/// The `Running → ShuttingDown` transition happens at most once per run and
/// is the only way a reason gets into the stop channel, so the channel never
/// sees more than one value.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    stop_tx: Mutex<Option<oneshot::Sender<StopReason>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            state: AtomicU8::new(ConnState::Init as u8),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `Running` and hands out the receiving end of a fresh stop
    /// channel. Only valid from `Init` or `Terminate`.
    pub fn start(&self) -> AppResult<oneshot::Receiver<StopReason>> {
        let mut stop_tx = self.stop_tx.lock();
        let state = self.state();
        if !matches!(state, ConnState::Init | ConnState::Terminate) {
            return Err(AppError::IllegalStateError(format!(
                "cannot start while {}",
                state
            )));
        }
        let (tx, rx) = oneshot::channel();
        *stop_tx = Some(tx);
        self.state.store(ConnState::Running as u8, Ordering::Release);
        Ok(rx)
    }

    /// Requests a stop. Returns `false`, doing nothing, unless the lifecycle
    /// is currently `Running`.
    pub fn stop(&self, reason: StopReason) -> bool {
        if self
            .state
            .compare_exchange(
                ConnState::Running as u8,
                ConnState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            trace!(state = %self.state(), "stop ignored: {}", reason);
            return false;
        }
        debug!("stopping: {}", reason);
        if let Some(tx) = self.stop_tx.lock().take() {
            // the receiver only goes away once the run has ended
            let _ = tx.send(reason);
        }
        true
    }

    pub fn terminate(&self) {
        self.stop_tx.lock().take();
        self.state
            .store(ConnState::Terminate as u8, Ordering::Release);
    }
}

/// Cloneable handle that stops a running server or client from anywhere.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownHandle {
    pub(crate) fn new(lifecycle: Arc<Lifecycle>) -> Self {
        ShutdownHandle { lifecycle }
    }

    /// Returns `true` if this call initiated the shutdown.
    pub fn shutdown(&self) -> bool {
        self.lifecycle.stop(StopReason::Shutdown)
    }

    pub fn state(&self) -> ConnState {
        self.lifecycle.state()
    }
}

pub type ConnectedFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type ConnectedCallback = Arc<dyn Fn(Arc<Session>) -> ConnectedFuture + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(&Session, &StopReason) + Send + Sync>;
type BeforeShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// Best-effort lifecycle notifications. None of them can affect the
/// connection they are told about.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    connected: Option<ConnectedCallback>,
    disconnect: Option<DisconnectCallback>,
    before_shutdown: Option<BeforeShutdownCallback>,
}

impl Callbacks {
    pub(crate) fn set_on_connected<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connected = Some(Arc::new(move |session: Arc<Session>| -> ConnectedFuture {
            Box::pin(f(session))
        }));
    }

    pub(crate) fn set_on_disconnect<F>(&mut self, f: F)
    where
        F: Fn(&Session, &StopReason) + Send + Sync + 'static,
    {
        self.disconnect = Some(Arc::new(f));
    }

    pub(crate) fn set_before_shutdown<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_shutdown = Some(Arc::new(f));
    }

    /// Runs the connected callback on its own task.
    pub(crate) fn connected(&self, session: Arc<Session>) {
        if let Some(callback) = &self.connected {
            tokio::spawn(callback(session));
        }
    }

    pub(crate) fn disconnected(&self, session: &Session, reason: &StopReason) {
        if reason.is_expected() {
            debug!(session = session.id(), remote = %session.remote_addr(), "session ended: {}", reason);
        } else {
            warn!(session = session.id(), remote = %session.remote_addr(), "session ended: {}", reason);
        }
        if let Some(callback) = &self.disconnect {
            callback(session, reason);
        }
    }

    pub(crate) fn before_shutdown(&self) {
        if let Some(callback) = &self.before_shutdown {
            callback();
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("connected", &self.connected.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .field("before_shutdown", &self.before_shutdown.is_some())
            .finish()
    }
}

/// Turns on TCP keep-alive with `interval` as the idle time before probes.
pub fn configure_keepalive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_keepalive(true)?;
    let keepalive = TcpKeepalive::new().with_time(interval).with_interval(interval);
    socket.set_tcp_keepalive(&keepalive)
}

/// Stops `lifecycle` with [`StopReason::Shutdown`] on SIGINT or SIGTERM.
/// Dropping the returned guard removes the listener.
pub(crate) fn spawn_signal_listener(lifecycle: Arc<Lifecycle>) -> DropGuard {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            res = terminal_signal() => match res {
                Ok(signal) => {
                    info!("shutting down on {}", signal);
                    lifecycle.stop(StopReason::Shutdown);
                }
                Err(err) => error!("failed to install signal handlers: {}", err),
            }
        }
    });
    token.drop_guard()
}

/// Read loop of one connection.
///
/// Decodes messages and submits one dispatch job per message to the worker
/// pool. Holds a clone of the shutdown-complete sender, so the owner can wait
/// for every read loop by draining the matching receiver.
pub(crate) struct ConnectionHandler {
    pub(crate) session: Arc<Session>,
    reader: SessionReader,
    router: Arc<Router>,
    pool: Arc<WorkerPool>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        session: Arc<Session>,
        reader: SessionReader,
        router: Arc<Router>,
        pool: Arc<WorkerPool>,
        shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        ConnectionHandler {
            session,
            reader,
            router,
            pool,
            shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    /// Runs until the connection ends on its own, returning why, or until the
    /// shutdown notification arrives, returning `None`.
    pub(crate) async fn run(&mut self) -> Option<StopReason> {
        loop {
            // shutdown wins over a session closed during teardown
            let res = tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    debug!(session = self.session.id(), "read loop exit after recv shutdown signal");
                    return None;
                }
                res = self.reader.read_message() => res,
            };

            let message = match res {
                Ok(message) => message,
                Err(err) => return Some(StopReason::from_error(err)),
            };
            trace!(session = self.session.id(), "received {}", message);

            let router = self.router.clone();
            let session = self.session.clone();
            if let Err(err) = self
                .pool
                .submit(async move { router.dispatch(session, message).await })
                .await
            {
                return Some(StopReason::Failed(err));
            }
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        trace!(session = self.session.id(), "connection handler dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_util::loopback_session;
    use crate::network::CodecConfig;
    use std::io;

    #[test]
    fn stop_fires_once() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.start().unwrap();
        assert_eq!(lifecycle.state(), ConnState::Running);

        assert!(lifecycle.stop(StopReason::Shutdown));
        assert!(!lifecycle.stop(StopReason::PeerClosed));
        assert_eq!(lifecycle.state(), ConnState::ShuttingDown);

        assert!(matches!(rx.try_recv(), Ok(StopReason::Shutdown)));
    }

    #[test]
    fn stop_before_start_is_a_noop() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.stop(StopReason::Shutdown));
        assert_eq!(lifecycle.state(), ConnState::Init);
    }

    #[test]
    fn restart_only_after_terminate() {
        let lifecycle = Lifecycle::new();
        let _rx = lifecycle.start().unwrap();
        assert!(matches!(
            lifecycle.start(),
            Err(AppError::IllegalStateError(_))
        ));

        lifecycle.stop(StopReason::Shutdown);
        assert!(lifecycle.start().is_err());

        lifecycle.terminate();
        assert!(!lifecycle.stop(StopReason::Shutdown));
        assert!(lifecycle.start().is_ok());
    }

    #[test]
    fn handle_clones_share_the_lifecycle() {
        let lifecycle = Arc::new(Lifecycle::new());
        let _rx = lifecycle.start().unwrap();
        let handle = ShutdownHandle::new(lifecycle.clone());
        let other = handle.clone();

        assert!(handle.shutdown());
        assert!(!other.shutdown());
        assert_eq!(other.state(), ConnState::ShuttingDown);
    }

    #[test]
    fn stop_reasons_from_errors() {
        assert!(matches!(
            StopReason::from_error(AppError::PeerClosed),
            StopReason::PeerClosed
        ));
        assert!(matches!(
            StopReason::from_error(AppError::LocalClosed),
            StopReason::LocalClosed
        ));
        let reset = AppError::IoError(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(StopReason::from_error(reset).is_expected());

        let framing = StopReason::from_error(AppError::MalformedFrame("length".into()));
        assert!(!framing.is_expected());
        assert!(framing.error().is_some_and(AppError::is_framing));
    }

    #[tokio::test]
    async fn keepalive_can_be_configured() {
        let (session, _reader, peer) = loopback_session(CodecConfig::default()).await;
        configure_keepalive(&peer, Duration::from_secs(10)).unwrap();
        let socket = SockRef::from(&peer);
        assert!(socket.keepalive().unwrap());
        #[cfg(target_os = "linux")]
        {
            assert_eq!(socket.keepalive_time().unwrap(), Duration::from_secs(10));
            assert_eq!(socket.keepalive_interval().unwrap(), Duration::from_secs(10));
        }
        drop(session);
    }
}
