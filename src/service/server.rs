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

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use super::config::TransportConfig;
use super::lifecycle::{
    configure_keepalive, spawn_signal_listener, Callbacks, ConnState, ConnectionHandler,
    Lifecycle, ShutdownHandle, StopReason,
};
use super::Shutdown;
use crate::network::{MessageCodec, Session};
use crate::request::Router;
use crate::utils::{TokenBucket, WorkerPool, WorkerPoolConfig};
use crate::{AppError, AppResult};

type SessionMap = Arc<DashMap<u64, Arc<Session>>>;

/// TCP server: accepts connections, runs one read loop per connection and
/// dispatches messages on a shared worker pool.
#[derive(Debug)]
pub struct Server {
    listener: Option<TcpListener>,
    codec: Arc<MessageCodec>,
    pool_config: WorkerPoolConfig,
    heartbeat: Duration,
    accept_limiter: Option<Arc<TokenBucket>>,
    handle_signals: bool,
    lifecycle: Arc<Lifecycle>,
    sessions: SessionMap,
    callbacks: Callbacks,
}

impl Server {
    pub fn new(config: &TransportConfig) -> Self {
        let mut server = Server {
            listener: None,
            codec: config.build_codec(),
            pool_config: config.worker_pool_config(),
            heartbeat: config.heartbeat_interval(),
            accept_limiter: None,
            handle_signals: config.network.handle_signals,
            lifecycle: Arc::new(Lifecycle::new()),
            sessions: Arc::new(DashMap::new()),
            callbacks: Callbacks::default(),
        };
        server.set_accept_rate(config.network.accept_rate_per_sec);
        server
    }

    /// Replaces the codec, together with the buffer pool and rate limiter it
    /// owns.
    pub fn with_codec(mut self, codec: Arc<MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Limits accepted connections per second; 0 removes the limit.
    pub fn set_accept_rate(&mut self, per_sec: u64) {
        self.accept_limiter = (per_sec > 0).then(|| Arc::new(TokenBucket::per_second(per_sec)));
    }

    /// `n` workers with a queue twice as deep, applied on the next `serve`.
    pub fn set_worker(&mut self, n: usize) {
        self.pool_config = WorkerPoolConfig::with_workers(n);
    }

    pub fn set_heartbeat(&mut self, interval: Duration) {
        self.heartbeat = interval;
    }

    pub fn set_handle_signals(&mut self, enabled: bool) {
        self.handle_signals = enabled;
    }

    pub fn set_on_connected<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.set_on_connected(f);
    }

    pub fn set_on_disconnect<F>(&mut self, f: F)
    where
        F: Fn(&Session, &StopReason) + Send + Sync + 'static,
    {
        self.callbacks.set_on_disconnect(f);
    }

    pub fn set_before_shutdown<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.set_before_shutdown(f);
    }

    pub fn state(&self) -> ConnState {
        self.lifecycle.state()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.lifecycle.clone())
    }

    /// Stops a running `serve`. A no-op unless the server is running.
    pub fn shutdown(&self) -> bool {
        self.lifecycle.stop(StopReason::Shutdown)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Binds `addr` and returns the bound address (useful with port 0).
    pub async fn listen(&mut self, addr: &str) -> AppResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            error!("Failed to bind server to address: {} - Error: {}", addr, err);
            AppError::IoError(err)
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Accepts and serves connections until shutdown, returning why the
    /// server stopped.
    ///
    /// Teardown order once a stop is requested:
    /// 1. the accept loop ends and the listener is dropped,
    /// 2. `before_shutdown` runs,
    /// 3. read loops are notified, then live sessions are closed and
    ///    reported to `on_disconnect`, which also fails any send blocked on
    ///    a peer that stopped reading,
    /// 4. read loops are joined, so no new jobs are submitted,
    /// 5. the worker pool drains.
    pub async fn serve(&mut self, router: Arc<Router>) -> AppResult<StopReason> {
        let listener = self.listener.take().ok_or_else(|| {
            AppError::IllegalStateError("listener is not bound, call listen first".into())
        })?;
        let mut stop_rx = match self.lifecycle.start() {
            Ok(rx) => rx,
            Err(err) => {
                self.listener = Some(listener);
                return Err(err);
            }
        };

        let pool = Arc::new(WorkerPool::new(self.pool_config.clone()));
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let _signals = self
            .handle_signals
            .then(|| spawn_signal_listener(self.lifecycle.clone()));

        let acceptor = Acceptor {
            listener,
            limiter: self.accept_limiter.clone(),
            heartbeat: self.heartbeat,
            codec: self.codec.clone(),
            router,
            pool: pool.clone(),
            sessions: self.sessions.clone(),
            callbacks: self.callbacks.clone(),
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete_tx,
        };

        let stopped = tokio::select! {
            res = acceptor.run() => Err(res),
            reason = &mut stop_rx => Ok(reason.unwrap_or(StopReason::Shutdown)),
        };
        let reason = match stopped {
            Ok(reason) => reason,
            Err(res) => {
                let err = res
                    .err()
                    .unwrap_or_else(|| AppError::IllegalStateError("accept loop exited".into()));
                error!(cause = %err, "failed to accept");
                self.lifecycle.stop(StopReason::Failed(err));
                stop_rx.await.unwrap_or(StopReason::Shutdown)
            }
        };
        drop(acceptor);
        info!("tcp server stopped accepting: {}", reason);

        self.callbacks.before_shutdown();

        // read loops see the notification before their sessions close
        let _ = notify_shutdown.send(());
        drop(notify_shutdown);
        self.close_sessions().await;

        shutdown_complete_rx.recv().await;
        debug!("all read loops exited");

        pool.log_status();
        pool.shutdown().await;

        self.lifecycle.terminate();
        info!("tcp server shutdown complete");
        Ok(reason)
    }

    async fn close_sessions(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            // a read loop ending on its own may have removed it already
            if let Some((_, session)) = self.sessions.remove(&id) {
                close_session(&session).await;
                self.callbacks.disconnected(&session, &StopReason::Shutdown);
            }
        }
    }

    /// `listen` followed by `serve`.
    pub async fn listen_and_serve(&mut self, addr: &str, router: Arc<Router>) -> AppResult<StopReason> {
        self.listen(addr).await?;
        self.serve(router).await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

async fn close_session(session: &Session) {
    if let Err(err) = session.close().await {
        warn!(session = session.id(), "failed to close session: {}", err);
    }
}

/// Accept loop state for one `serve` run. Dropping it closes the listener.
struct Acceptor {
    listener: TcpListener,
    limiter: Option<Arc<TokenBucket>>,
    heartbeat: Duration,
    codec: Arc<MessageCodec>,
    router: Arc<Router>,
    pool: Arc<WorkerPool>,
    sessions: SessionMap,
    callbacks: Callbacks,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    /// Only returns on a fatal accept error. Failures of a single connection
    /// are logged and the loop carries on.
    async fn run(&self) -> AppResult<()> {
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.wait(1).await;
            }
            let (socket, remote_addr) = self.accept().await?;
            debug!(%remote_addr, "accept new connection");

            if let Err(err) = configure_keepalive(&socket, self.heartbeat) {
                error!(%remote_addr, "Configure connection error: {}", err);
                continue;
            }
            let (session, reader) = match Session::new(socket, self.codec.clone()) {
                Ok(pair) => pair,
                Err(err) => {
                    error!(%remote_addr, "Failed to create session: {}", err);
                    continue;
                }
            };
            self.sessions.insert(session.id(), session.clone());

            let mut handler = ConnectionHandler::new(
                session.clone(),
                reader,
                self.router.clone(),
                self.pool.clone(),
                Shutdown::new(self.notify_shutdown.subscribe()),
                self.shutdown_complete_tx.clone(),
            );
            let sessions = self.sessions.clone();
            let callbacks = self.callbacks.clone();
            tokio::spawn(async move {
                // on shutdown the server closes the session itself
                if let Some(reason) = handler.run().await {
                    if let Some((_, session)) = sessions.remove(&handler.session.id()) {
                        close_session(&session).await;
                        callbacks.disconnected(&session, &reason);
                    }
                }
            });

            self.callbacks.connected(session);
        }
    }

    /// Retries failed accepts with exponential backoff (1s doubling), giving
    /// up once the backoff would exceed 64s.
    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::IoError(err));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}
