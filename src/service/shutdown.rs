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

use tokio::sync::broadcast;
use tracing::info;

use crate::AppResult;

/// Listens for the server-wide shutdown notification.
///
/// Every read loop holds one; once the notification has been seen, `recv`
/// returns immediately.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // a lagged or closed channel means the same thing here
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// Waits for a terminal OS signal and returns its name.
///
/// SIGINT and SIGTERM are terminal. SIGHUP, SIGUSR1 and SIGUSR2 are logged
/// and otherwise ignored.
#[cfg(unix)]
pub async fn terminal_signal() -> AppResult<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut user2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("Received SIGINT.");
                return Ok("SIGINT");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM.");
                return Ok("SIGTERM");
            }
            _ = hangup.recv() => info!("Received SIGHUP."),
            _ = user1.recv() => info!("Received SIGUSR1."),
            _ = user2.recv() => info!("Received SIGUSR2."),
        }
    }
}

#[cfg(not(unix))]
pub async fn terminal_signal() -> AppResult<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C.");
    Ok("CTRL_C")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_is_sticky_after_notification() {
        let (notify, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(notify.subscribe());
        assert!(!shutdown.is_shutdown());

        notify.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // returns at once the second time
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (notify, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::new(notify.subscribe());
        drop(notify);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
