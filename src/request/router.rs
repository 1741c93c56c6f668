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

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use super::context::Context;
use super::handler::{boxed, BoxedHandler, Handler, HandlerChain};
use crate::network::{Message, Session};

/// Message id → handler table plus the global middleware list.
///
/// Register everything first, then share it (`Arc<Router>`) with the server
/// or client; it is never modified while serving.
#[derive(Default)]
pub struct Router {
    middlewares: Vec<BoxedHandler>,
    handlers: HashMap<i32, Vec<BoxedHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends middleware run ahead of every matched handler list.
    pub fn use_middleware<I>(&mut self, middlewares: I) -> &mut Self
    where
        I: IntoIterator<Item = BoxedHandler>,
    {
        self.middlewares.extend(middlewares);
        self
    }

    pub fn wrap<H: Handler>(&mut self, middleware: H) -> &mut Self {
        self.middlewares.push(boxed(middleware));
        self
    }

    /// Appends handlers for `msg_id`. Repeated registrations for the same id
    /// accumulate in order.
    pub fn register<I>(&mut self, msg_id: i32, handlers: I) -> &mut Self
    where
        I: IntoIterator<Item = BoxedHandler>,
    {
        self.handlers.entry(msg_id).or_default().extend(handlers);
        self
    }

    pub fn route<H: Handler>(&mut self, msg_id: i32, handler: H) -> &mut Self {
        self.register(msg_id, [boxed(handler)])
    }

    pub fn middlewares(&self) -> &[BoxedHandler] {
        &self.middlewares
    }

    pub fn handlers(&self, msg_id: i32) -> &[BoxedHandler] {
        self.handlers.get(&msg_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Middleware followed by the handlers for `msg_id`, or `None` when no
    /// handler is registered for it.
    pub fn resolve(&self, msg_id: i32) -> Option<HandlerChain> {
        let handlers = self.handlers.get(&msg_id).filter(|h| !h.is_empty())?;
        let chain = self
            .middlewares
            .iter()
            .chain(handlers.iter())
            .cloned()
            .collect();
        Some(HandlerChain::new(chain))
    }

    /// Runs the chain for one message. Unmatched ids are logged and dropped
    /// without running any middleware.
    pub async fn dispatch(&self, session: Arc<Session>, message: Message) {
        let msg_id = message.id();
        let Some(chain) = self.resolve(msg_id) else {
            warn!(
                msg_id,
                remote = %session.remote_addr(),
                "No handler for message id: {}",
                msg_id
            );
            return;
        };
        trace!(msg_id, handlers = chain.len(), "dispatching message");
        let mut ctx = Context::new(session, message, chain);
        ctx.run().await;
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().collect();
        ids.sort();
        f.debug_struct("Router")
            .field("middlewares", &self.middlewares.len())
            .field("routes", &ids)
            .finish()
    }
}
