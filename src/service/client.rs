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
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::config::TransportConfig;
use super::lifecycle::{
    configure_keepalive, spawn_signal_listener, Callbacks, ConnState, ConnectionHandler,
    Lifecycle, ShutdownHandle, StopReason,
};
use super::Shutdown;
use crate::network::{MessageCodec, Session};
use crate::request::Router;
use crate::utils::{WorkerPool, WorkerPoolConfig};
use crate::{AppError, AppResult};

/// Client side of the transport: one connection, one session, no
/// reconnection.
#[derive(Debug)]
pub struct Client {
    codec: Arc<MessageCodec>,
    pool_config: WorkerPoolConfig,
    heartbeat: Duration,
    handle_signals: bool,
    lifecycle: Arc<Lifecycle>,
    session: Mutex<Option<Arc<Session>>>,
    callbacks: Callbacks,
}

impl Client {
    pub fn new(config: &TransportConfig) -> Self {
        Client {
            codec: config.build_codec(),
            pool_config: config.worker_pool_config(),
            heartbeat: config.heartbeat_interval(),
            handle_signals: config.network.handle_signals,
            lifecycle: Arc::new(Lifecycle::new()),
            session: Mutex::new(None),
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

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

    /// The live session, while `connect` is running.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.lifecycle.clone())
    }

    pub fn shutdown(&self) -> bool {
        self.lifecycle.stop(StopReason::Shutdown)
    }

    /// Dials `addr` and runs the connection until it ends, returning why.
    ///
    /// Resolution, dial and keep-alive failures are returned as errors before
    /// any traffic flows. Once connected, the returned [`StopReason`] tells a
    /// peer close or local close apart from a failure.
    pub async fn connect(&self, addr: &str, router: Arc<Router>) -> AppResult<StopReason> {
        let remote_addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| AppError::InvalidValue(format!("no address found for {}", addr)))?;
        let socket = TcpStream::connect(remote_addr).await?;
        configure_keepalive(&socket, self.heartbeat)?;
        let (session, reader) = Session::new(socket, self.codec.clone())?;
        let stop_rx = self.lifecycle.start()?;
        info!(%remote_addr, session = session.id(), "connected");
        *self.session.lock() = Some(session.clone());

        let pool = Arc::new(WorkerPool::new(self.pool_config.clone()));
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let _signals = self
            .handle_signals
            .then(|| spawn_signal_listener(self.lifecycle.clone()));

        let mut handler = ConnectionHandler::new(
            session.clone(),
            reader,
            router,
            pool.clone(),
            Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx,
        );
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            // a read loop told to exit never reports back
            if let Some(reason) = handler.run().await {
                lifecycle.stop(reason);
            }
        });
        self.callbacks.connected(session.clone());

        let reason = stop_rx.await.unwrap_or(StopReason::Shutdown);
        self.callbacks.before_shutdown();
        self.callbacks.disconnected(&session, &reason);

        // closing after the notification fails any send stuck on the peer
        let _ = notify_shutdown.send(());
        drop(notify_shutdown);
        if let Err(err) = session.close().await {
            warn!(session = session.id(), "failed to close session: {}", err);
        }
        shutdown_complete_rx.recv().await;
        pool.shutdown().await;

        self.session.lock().take();
        self.lifecycle.terminate();
        debug!(%remote_addr, "client stopped: {}", reason);
        Ok(reason)
    }
}
