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

//! Message dispatch.
//!
//! A [`Router`] maps message ids to handler lists and holds the global
//! middleware. For every decoded message the router resolves a
//! [`HandlerChain`] (middleware first, then the id's handlers) and walks it
//! with a [`Context`], which also carries the request accessors and the
//! response helpers handlers use to answer on the session.

mod context;
mod handler;
mod router;

pub use context::Context;
pub use handler::{boxed, BoxedHandler, Cursor, Handler, HandlerChain, HandlerFuture};
pub use router::Router;
