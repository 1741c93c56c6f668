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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use msgwire::request::boxed;
use msgwire::{
    setup_local_tracing, AppResult, Client, Context, Handler, HandlerFuture, Router, Server,
    ShutdownHandle, TransportConfig,
};
use serde::Deserialize;
use tokio::runtime;
use tokio::time::Instant;
use tracing::{error, info, warn};

const PING: i32 = 1;
const PONG: i32 = 2;
const TEXT: i32 = 3;
const JSON: i32 = 4;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// run the demo server (the default)
    Serve,
    /// connect, send pings and wait for the pongs
    Ping {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_local_tracing(level)?;

    let config = match &commandline.conf {
        Some(path) => TransportConfig::set_up_config(path)?,
        None => TransportConfig::from_env()?,
    };

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    match commandline.command.unwrap_or(Command::Serve) {
        Command::Serve => rt.block_on(serve(config)),
        Command::Ping { count } => rt.block_on(ping(config, count)),
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: TransportConfig) -> AppResult<()> {
    let mut router = Router::new();
    router
        .use_middleware([boxed(log_request)])
        .route(PING, pong)
        .route(TEXT, echo_text)
        .route(JSON, echo_json);

    let mut server = Server::new(&config);
    server.set_on_connected(|session| async move {
        info!(remote = %session.remote_addr(), "client connected");
    });
    server.set_on_disconnect(|session, reason| {
        info!(remote = %session.remote_addr(), "client disconnected: {}", reason);
    });
    server.set_before_shutdown(|| info!("server shutting down"));

    let reason = server
        .listen_and_serve(&config.network.address, Arc::new(router))
        .await?;
    info!("server stopped: {}", reason);
    Ok(())
}

async fn ping(config: TransportConfig, count: u32) -> AppResult<()> {
    let mut client = Client::new(&config);
    let counter = PongCounter {
        remaining: AtomicU32::new(count.max(1)),
        started: Instant::now(),
        handle: client.shutdown_handle(),
    };
    let mut router = Router::new();
    router.route(PONG, counter);

    client.set_on_connected(move |session| async move {
        for _ in 0..count.max(1) {
            if let Err(err) = session.send_text(PING, "ping").await {
                error!("failed to send ping: {}", err);
                return;
            }
        }
    });

    let reason = client
        .connect(&config.network.address, Arc::new(router))
        .await?;
    match reason.error() {
        Some(err) => error!("connection failed: {}", err),
        None => info!("client stopped: {}", reason),
    }
    Ok(())
}

fn log_request(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move {
        let start = Instant::now();
        let msg_id = ctx.msg_id();
        ctx.next().await;
        info!(
            msg_id,
            remote = %ctx.remote_addr(),
            size = ctx.msg_size(),
            elapsed = ?start.elapsed(),
            "request handled"
        );
    })
}

fn pong(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move {
        if ctx.text() != "ping" {
            warn!(remote = %ctx.remote_addr(), "unexpected ping body: {}", ctx.text());
            return;
        }
        if let Err(err) = ctx.reply(PONG, b"", b"pong").await {
            warn!("failed to send pong: {}", err);
        }
    })
}

fn echo_text(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move {
        let text = ctx.text();
        if let Err(err) = ctx.send_text(TEXT, &text).await {
            warn!("failed to echo text: {}", err);
        }
    })
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct Echo {
    message: String,
}

fn echo_json(ctx: &mut Context) -> HandlerFuture<'_> {
    Box::pin(async move {
        let response = match ctx.bind_json::<Echo>() {
            Ok(echo) => serde_json::json!({ "code": 0, "echo": echo }),
            Err(err) => serde_json::json!({ "code": 1, "error": err.to_string() }),
        };
        if let Err(err) = ctx.send_json(JSON, &response).await {
            warn!("failed to send json response: {}", err);
        }
    })
}

/// Prints each pong and stops the client after the last one.
struct PongCounter {
    remaining: AtomicU32,
    started: Instant,
    handle: ShutdownHandle,
}

impl Handler for PongCounter {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            println!(
                "{} from {} in {:?}",
                ctx.text(),
                ctx.remote_addr(),
                self.started.elapsed()
            );
            if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.handle.shutdown();
            }
        })
    }
}
