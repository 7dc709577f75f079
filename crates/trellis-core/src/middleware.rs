//! Ordered middleware around handler invocation.
//!
//! Middlewares observe calls; they never touch payload bytes. Entry hooks
//! run in registration order, exit hooks in reverse. An entry hook may
//! short-circuit the call by returning a terminal status, which becomes
//! the trailer.

use std::sync::Arc;

use crate::server::CallContext;
use crate::status::Status;

pub trait Middleware: Send + Sync {
    /// Before the handler. May replace call metadata on the context or
    /// short-circuit with a terminal status.
    fn on_request(&self, _ctx: &mut CallContext) -> Result<(), Status> {
        Ok(())
    }

    /// After the handler, with the trailer status that was (or would have
    /// been) sent. Runs in reverse registration order.
    fn on_response(&self, _ctx: &CallContext, _status: &Status) {}

    /// When the call terminates with a non-OK status. Runs in reverse
    /// registration order, only for middlewares that entered.
    fn on_error(&self, _ctx: &CallContext, _status: &Status) {}
}

/// An ordered list of middlewares.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        MiddlewareChain::default()
    }

    pub fn push(&mut self, middleware: impl Middleware + 'static) {
        self.layers.push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run entry hooks in order. On a short-circuit, exit hooks run for
    /// the layers already entered and the terminal status is returned.
    pub fn enter(&self, ctx: &mut CallContext) -> Result<(), Status> {
        for (i, layer) in self.layers.iter().enumerate() {
            if let Err(status) = layer.on_request(ctx) {
                for entered in self.layers[..i].iter().rev() {
                    entered.on_error(ctx, &status);
                }
                return Err(status);
            }
        }
        Ok(())
    }

    /// Run exit hooks in reverse order after the call completed.
    pub fn exit(&self, ctx: &CallContext, status: &Status) {
        for layer in self.layers.iter().rev() {
            if status.is_ok() {
                layer.on_response(ctx, status);
            } else {
                layer.on_error(ctx, status);
                layer.on_response(ctx, status);
            }
        }
    }
}
