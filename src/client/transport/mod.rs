/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Transports: per-subchannel socket lifecycle and stream handout.
//!
//! A transport is owned 1:1 by its subchannel.  The socket-supervising
//! variant opens and health-checks TCP sockets and hands ready duplex byte
//! streams to the HTTP/2 stack; the passive variant only models connectivity
//! for callers that bring their own socket management.

pub mod passive;
pub mod tcp;

mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tonic::{async_trait, Status};

use crate::client::name_resolution::Address;

pub use registry::{TransportRegistry, GLOBAL_TRANSPORT_REGISTRY};
pub use tcp::TransportStream;

/// The outcome of one transport connection attempt.
#[derive(Debug)]
pub enum ConnectResult {
    /// A connection is established; the subchannel may go Ready.
    Success,
    /// Every candidate address failed.  Carries the first error observed.
    Failure(Status),
    /// The connect context's deadline fired without a caller cancellation.
    Timeout,
}

/// Coarse view of what the transport currently holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    /// No socket and no streams.
    NotConnected,
    /// The passive transport is nominally connected.
    Passive,
    /// A probed socket is cached, waiting to be consumed by the first
    /// stream.
    InitialSocket,
    /// At least one handed-out stream is alive.
    ActiveStream,
}

/// The cancellable context of a single connection attempt, owned by the
/// transport while connecting.
///
/// Cancellation comes from two places with different meanings: the caller
/// abandoning the attempt, or the connect deadline firing.  The flag keeps
/// the two apart so a deadline surfaces as `Timeout` rather than a caller
/// cancellation.
pub struct ConnectContext {
    token: CancellationToken,
    caller_cancelled: AtomicBool,
    disposed: AtomicBool,
}

impl ConnectContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            caller_cancelled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Cancels the attempt on behalf of the caller.
    pub fn cancel(&self) {
        self.caller_cancelled.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Cancels the attempt because its deadline fired.
    pub fn expire(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_caller_cancelled(&self) -> bool {
        self.caller_cancelled.load(Ordering::SeqCst)
    }

    /// Marks the context disposed.  Disposal cancels any in-flight attempt
    /// and is idempotent.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for ConnectContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoked by the transport when an established connection is lost outside
/// of a connect attempt: a failed health ping or the last active stream
/// closing.  An OK status means a quiet return to idle.
pub type DisconnectNotifier = Arc<dyn Fn(Status) + Send + Sync>;

/// Options applied when creating connections.
#[derive(Clone)]
pub struct TransportOptions {
    /// Deadline for a single try_connect pass, enforced by the subchannel
    /// through the connect context.
    pub connect_timeout: Option<Duration>,
    /// How long a probed initial socket stays eligible for reuse by
    /// get_stream before a fresh connection is preferred.
    pub socket_idle_timeout: Duration,
    /// Period of the socket health ping.
    pub health_ping_interval: Duration,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(20)),
            socket_idle_timeout: Duration::from_secs(1),
            health_ping_interval: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive: None,
        }
    }
}

/// The per-subchannel socket lifecycle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempts to establish a connection, walking the address list from
    /// where the previous attempt left off.  `attempt` is the ordinal of
    /// this attempt for logging.
    async fn try_connect(&self, ctx: &ConnectContext, attempt: usize) -> ConnectResult;

    /// Hands out a ready duplex byte stream to the given address, consuming
    /// the cached initial socket when it matches and is fresh.
    async fn get_stream(&self, address: &Address) -> Result<TransportStream, Status>;

    /// Tears down the socket and any bookkeeping.  Idempotent; after this
    /// returns, current_address is None and no active stream is tracked.
    fn disconnect(&self);

    /// Replaces the address list used by future connect passes.  Transports
    /// bound to a single fixed address ignore this.
    fn update_addresses(&self, _addresses: Vec<Address>) {}

    /// The address of the established connection, if any.
    fn current_address(&self) -> Option<Address>;

    /// The transport's connect timeout, used by the subchannel to arm the
    /// connect context's deadline.
    fn connect_timeout(&self) -> Option<Duration>;

    fn status(&self) -> TransportStatus;
}

/// Constructs transports for a network type.  Registered in a
/// TransportRegistry so subchannels can build the right transport for each
/// address.
pub trait TransportBuilder: Send + Sync {
    fn build(
        &self,
        addresses: Vec<Address>,
        options: TransportOptions,
        on_disconnect: DisconnectNotifier,
    ) -> Arc<dyn Transport>;

    /// The network type (Address::network_type) this builder serves.
    fn network_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_context_distinguishes_cancel_sources() {
        let ctx = ConnectContext::new();
        assert!(!ctx.is_cancelled());

        ctx.expire();
        assert!(ctx.is_cancelled());
        assert!(!ctx.is_caller_cancelled());

        let ctx = ConnectContext::new();
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.is_caller_cancelled());
    }

    #[test]
    fn connect_context_dispose_is_idempotent() {
        let ctx = ConnectContext::new();
        ctx.dispose();
        ctx.dispose();
        assert!(ctx.is_disposed());
        assert!(ctx.is_cancelled());
    }
}
