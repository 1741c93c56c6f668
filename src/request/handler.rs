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
use std::pin::Pin;
use std::sync::Arc;

use super::context::Context;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A message handler or middleware.
///
/// Middleware is just a handler that calls [`Context::next`] to run the rest
/// of the chain, doing its own work before and after that call.
///
/// Plain functions implement this trait directly:
///
/// ```ignore
/// fn pong(ctx: &mut Context) -> HandlerFuture<'_> {
///     Box::pin(async move {
///         let _ = ctx.send_text(2, "pong").await;
///     })
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        self(ctx)
    }
}

pub type BoxedHandler = Arc<dyn Handler>;

pub fn boxed<H: Handler>(handler: H) -> BoxedHandler {
    Arc::new(handler)
}

/// The handlers resolved for one dispatch: global middleware followed by the
/// handlers registered for the message id. Never modified once built.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Arc<[BoxedHandler]>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<BoxedHandler>) -> Self {
        HandlerChain {
            handlers: handlers.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get(&self, cursor: &Cursor) -> Option<BoxedHandler> {
        cursor
            .position()
            .and_then(|index| self.handlers.get(index))
            .cloned()
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.handlers.len())
            .finish()
    }
}

/// Position in a [`HandlerChain`].
///
/// Only ever moves forward. Once aborted it never yields a position again,
/// which stops every loop walking the chain, including the ones suspended in
/// outer middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    index: usize,
    aborted: bool,
}

impl Cursor {
    pub fn advance(&mut self) {
        if !self.aborted {
            self.index += 1;
        }
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn position(&self) -> Option<usize> {
        (!self.aborted).then_some(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_moves_forward() {
        let mut cursor = Cursor::default();
        assert_eq!(cursor.position(), Some(0));
        cursor.advance();
        cursor.advance();
        assert_eq!(cursor.position(), Some(2));
    }

    #[test]
    fn aborted_cursor_has_no_position() {
        let mut cursor = Cursor::default();
        cursor.advance();
        cursor.abort();
        assert!(cursor.is_aborted());
        assert_eq!(cursor.position(), None);
        cursor.advance();
        assert_eq!(cursor.position(), None);
    }

    #[test]
    fn chain_lookup_stops_past_the_end() {
        fn noop(_: &mut Context) -> HandlerFuture<'_> {
            Box::pin(async {})
        }
        let chain = HandlerChain::new(vec![boxed(noop), boxed(noop)]);
        let mut cursor = Cursor::default();
        assert!(chain.get(&cursor).is_some());
        cursor.advance();
        assert!(chain.get(&cursor).is_some());
        cursor.advance();
        assert!(chain.get(&cursor).is_none());
    }
}
