//! Connection handlers
//!
//! A handler gets each established connection together with its
//! [`Context`] and runs as its own task on the listener's `LocalSet`, so
//! neither the handler nor its future needs to be `Send`.

use crate::connection::Connection;
use crate::listener::Context;
use futures_util::future::LocalBoxFuture;
use knsock_core::error::Result;
use knsock_core::message::Message;
use std::fmt;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Trait for handling WebSocket connections over streams of type `S`
pub trait Handler<S = TcpStream>: 'static {
    /// Serve one connection until it ends
    fn handle(&self, connection: Connection<S>, ctx: Context) -> LocalBoxFuture<'static, Result<()>>;
}

/// Answers every text message with `Echo: <text>` and every binary message
/// with the same bytes
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

impl EchoHandler {
    /// Create a new echo handler
    pub fn new() -> Self {
        Self
    }
}

impl<S> Handler<S> for EchoHandler
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    fn handle(
        &self,
        connection: Connection<S>,
        _ctx: Context,
    ) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            loop {
                let reply = match connection.recv().await? {
                    Message::Text(text) => Message::text(format!("Echo: {}", text)),
                    binary => binary,
                };
                connection.send(reply).await?;
            }
        })
    }
}

/// Function-based handler
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Create a new function-based handler
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("f", &"<function>")
            .finish()
    }
}

impl<S, F, Fut> Handler<S> for FnHandler<F>
where
    S: 'static,
    F: Fn(Connection<S>, Context) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    fn handle(&self, connection: Connection<S>, ctx: Context) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin((self.f)(connection, ctx))
    }
}

/// Create a handler from an async function
pub fn from_fn<S, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Connection<S>, Context) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    FnHandler::new(f)
}
