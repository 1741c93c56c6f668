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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use msgwire::network::{CodecConfig, MessageCodec, RequestId};
use msgwire::request::{Context, Handler, HandlerFuture, Router};
use msgwire::service::{ConnState, ShutdownHandle};
use msgwire::{AppError, AppResult, Client, Server, StopReason, TransportConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

const PING: i32 = 1;
const PONG: i32 = 2;
const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.network.handle_signals = false;
    config.worker_pool.num_workers = 4;
    config.worker_pool.queue_capacity = 8;
    config
}

fn pong(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move {
        if ctx.text() == "ping" {
            ctx.reply(PONG, b"", b"pong").await.unwrap();
        }
    })
}

fn ping_router() -> Router {
    let mut router = Router::new();
    router.route(PING, pong);
    router
}

/// Forwards every message it handles to a channel.
struct Forward {
    tx: mpsc::UnboundedSender<(i32, String, Option<RequestId>)>,
}

impl Handler for Forward {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let _ = self
                .tx
                .send((ctx.msg_id(), ctx.text(), ctx.request_id().copied()));
        })
    }
}

struct RunningServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    task: JoinHandle<AppResult<StopReason>>,
}

async fn start_server<F>(config: &TransportConfig, router: Router, configure: F) -> RunningServer
where
    F: FnOnce(&mut Server),
{
    let mut server = Server::new(config);
    configure(&mut server);
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let handle = server.shutdown_handle();
    let task = tokio::spawn(async move { server.serve(Arc::new(router)).await });
    RunningServer { addr, handle, task }
}

#[tokio::test]
async fn ping_pong_then_client_close_is_peer_closed_on_server() {
    let config = test_config();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let server = start_server(&config, ping_router(), |server| {
        server.set_on_disconnect(move |_, reason| {
            let _ = disconnect_tx.send(matches!(reason, StopReason::PeerClosed));
        });
    })
    .await;

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    let mut client_router = Router::new();
    client_router.route(PONG, Forward { tx: pong_tx });
    let mut client = Client::new(&config);
    client.set_on_connected(|session| async move {
        session.send_text(PING, "ping").await.unwrap();
    });
    let client = Arc::new(client);
    let connect = {
        let client = client.clone();
        let addr = server.addr.to_string();
        tokio::spawn(async move { client.connect(&addr, Arc::new(client_router)).await })
    };

    let (msg_id, text, _) = timeout(WAIT, pong_rx.recv()).await.unwrap().unwrap();
    assert_eq!((msg_id, text.as_str()), (PONG, "pong"));

    client.session().unwrap().close().await.unwrap();
    let reason = timeout(WAIT, connect).await.unwrap().unwrap().unwrap();
    assert!(matches!(reason, StopReason::LocalClosed));
    assert_eq!(client.state(), ConnState::Terminate);
    assert!(client.session().is_none());

    let peer_closed = timeout(WAIT, disconnect_rx.recv()).await.unwrap().unwrap();
    assert!(peer_closed);

    assert!(server.handle.shutdown());
    let reason = timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    assert!(matches!(reason, StopReason::Shutdown));
}

#[tokio::test]
async fn unmatched_message_id_keeps_the_connection() {
    let config = test_config();
    let server = start_server(&config, ping_router(), |_| {}).await;
    let codec = MessageCodec::unthrottled(CodecConfig::default());

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    codec.write_message(&mut stream, 99, b"", b"nobody").await.unwrap();
    codec.write_message(&mut stream, PING, b"", b"ping").await.unwrap();

    let reply = timeout(WAIT, codec.read_message(&mut stream))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.id(), PONG);
    assert_eq!(reply.body().as_ref(), b"pong");

    server.handle.shutdown();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn oversize_frame_fails_only_that_connection() {
    let mut config = test_config();
    config.codec.max_message_size = 1024;
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let server = start_server(&config, ping_router(), |server| {
        server.set_on_disconnect(move |_, reason| {
            let too_large = matches!(
                reason.error(),
                Some(AppError::MessageTooLarge { size: 4096, max: 1024 })
            );
            let _ = disconnect_tx.send(too_large);
        });
    })
    .await;

    let mut bad = TcpStream::connect(server.addr).await.unwrap();
    bad.write_all(&4096u32.to_le_bytes()).await.unwrap();
    assert!(timeout(WAIT, disconnect_rx.recv()).await.unwrap().unwrap());

    // the server keeps accepting
    let codec = MessageCodec::unthrottled(CodecConfig {
        max_message_size: 1024,
        correlation_id: false,
    });
    let mut good = TcpStream::connect(server.addr).await.unwrap();
    codec.write_message(&mut good, PING, b"", b"ping").await.unwrap();
    let reply = timeout(WAIT, codec.read_message(&mut good))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.id(), PONG);

    server.handle.shutdown();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let config = test_config();
    let before_shutdown = Arc::new(AtomicBool::new(false));
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let server = {
        let before_shutdown = before_shutdown.clone();
        start_server(&config, ping_router(), move |server| {
            server.set_on_connected(move |_| {
                let connected_tx = connected_tx.clone();
                async move {
                    let _ = connected_tx.send(());
                }
            });
            server.set_before_shutdown(move || before_shutdown.store(true, Ordering::SeqCst));
            server.set_on_disconnect(move |_, reason| {
                let _ = disconnect_tx.send(matches!(reason, StopReason::Shutdown));
            });
        })
        .await
    };

    let client = Client::new(&config);
    let addr = server.addr.to_string();
    let connect = tokio::spawn(async move { client.connect(&addr, Arc::new(Router::new())).await });
    // the server has registered the session once its callback ran
    timeout(WAIT, connected_rx.recv()).await.unwrap().unwrap();

    assert!(server.handle.shutdown());
    assert!(!server.handle.shutdown());

    let reason = timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    assert!(matches!(reason, StopReason::Shutdown));
    assert!(before_shutdown.load(Ordering::SeqCst));
    assert_eq!(server.handle.state(), ConnState::Terminate);
    assert!(timeout(WAIT, disconnect_rx.recv()).await.unwrap().unwrap());

    // the client sees the server going away
    let reason = timeout(WAIT, connect).await.unwrap().unwrap().unwrap();
    assert!(matches!(reason, StopReason::PeerClosed));
}

fn flood(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move {
        let chunk = vec![0u8; 1024 * 1024];
        while ctx.send(PONG, b"", &chunk).await.is_ok() {}
    })
}

#[tokio::test]
async fn shutdown_is_not_blocked_by_a_peer_that_stops_reading() {
    let config = test_config();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    let mut router = Router::new();
    router.route(PING, flood);
    let server = start_server(&config, router, |server| {
        server.set_on_disconnect(move |_, reason| {
            let _ = disconnect_tx.send(matches!(reason, StopReason::Shutdown));
        });
    })
    .await;

    let codec = MessageCodec::unthrottled(CodecConfig::default());
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    codec.write_message(&mut stream, PING, b"", b"ping").await.unwrap();
    // let the handler fill the socket buffers and block in send
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(server.handle.shutdown());
    let reason = timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    assert!(matches!(reason, StopReason::Shutdown));
    assert!(timeout(WAIT, disconnect_rx.recv()).await.unwrap().unwrap());
    drop(stream);
}

#[tokio::test]
async fn accept_rate_spaces_out_connections() {
    let mut config = test_config();
    config.network.accept_rate_per_sec = 1;
    let start = Instant::now();
    let server = start_server(&config, ping_router(), |_| {}).await;
    let codec = MessageCodec::unthrottled(CodecConfig::default());

    let mut first = TcpStream::connect(server.addr).await.unwrap();
    let mut second = TcpStream::connect(server.addr).await.unwrap();
    codec.write_message(&mut first, PING, b"", b"ping").await.unwrap();
    codec.write_message(&mut second, PING, b"", b"ping").await.unwrap();

    let reply = timeout(WAIT, codec.read_message(&mut first)).await.unwrap().unwrap();
    assert_eq!(reply.id(), PONG);
    assert!(start.elapsed() < Duration::from_millis(900));

    // the second connection waits in the backlog for the next token
    let reply = timeout(WAIT, codec.read_message(&mut second)).await.unwrap().unwrap();
    assert_eq!(reply.id(), PONG);
    assert!(start.elapsed() >= Duration::from_millis(900));

    server.handle.shutdown();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_sends_never_interleave() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = Client::new(&test_config());
    client.set_on_connected(|session| async move {
        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.send(10, b"a", &vec![b'a'; 256 * 1024]).await })
        };
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.send(20, b"b", &vec![b'b'; 256 * 1024]).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    });
    let connect = tokio::spawn(async move {
        client
            .connect(&addr.to_string(), Arc::new(Router::new()))
            .await
    });

    let (mut stream, _) = listener.accept().await.unwrap();
    let codec = MessageCodec::unthrottled(CodecConfig::default());
    let mut ids = Vec::new();
    for _ in 0..2 {
        let msg = timeout(WAIT, codec.read_message(&mut stream))
            .await
            .unwrap()
            .unwrap();
        let fill = if msg.id() == 10 { b'a' } else { b'b' };
        assert_eq!(msg.header().as_ref(), &[fill]);
        assert_eq!(msg.body().len(), 256 * 1024);
        assert!(msg.body().iter().all(|&b| b == fill));
        ids.push(msg.id());
    }
    ids.sort();
    assert_eq!(ids, vec![10, 20]);

    drop(stream);
    let reason = timeout(WAIT, connect).await.unwrap().unwrap().unwrap();
    assert!(matches!(reason, StopReason::PeerClosed));
}

#[tokio::test]
async fn correlated_reply_carries_the_request_id() {
    let mut config = test_config();
    config.codec.correlation_id = true;
    let server = start_server(&config, ping_router(), |_| {}).await;

    let request_id = RequestId::new_random();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    let mut client_router = Router::new();
    client_router.route(PONG, Forward { tx: pong_tx });
    let mut client = Client::new(&config);
    client.set_on_connected(move |session| async move {
        session
            .send_correlated(PING, Some(&request_id), b"", b"ping")
            .await
            .unwrap();
    });
    let handle = client.shutdown_handle();
    let addr = server.addr.to_string();
    let connect = tokio::spawn(async move { client.connect(&addr, Arc::new(client_router)).await });

    let (msg_id, _, echoed) = timeout(WAIT, pong_rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg_id, PONG);
    assert_eq!(echoed, Some(request_id));

    assert!(handle.shutdown());
    let reason = timeout(WAIT, connect).await.unwrap().unwrap().unwrap();
    assert!(matches!(reason, StopReason::Shutdown));

    server.handle.shutdown();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn connect_to_closed_port_fails_synchronously() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(&test_config());
    let err = client
        .connect(&addr.to_string(), Arc::new(Router::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::IoError(_)));
    assert_eq!(client.state(), ConnState::Init);
}

#[tokio::test]
async fn serve_without_listen_is_rejected() {
    let mut server = Server::new(&test_config());
    let err = server.serve(Arc::new(Router::new())).await.unwrap_err();
    assert!(matches!(err, AppError::IllegalStateError(_)));
}
