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

//! Call resilience: transparent retries and hedging, per gRFC A6.
//!
//! Every resilient call buffers its outgoing messages until it commits to a
//! single underlying attempt.  RetryCall runs attempts sequentially with
//! exponential backoff; HedgingCall runs them in parallel on a delay.  Both
//! share the channel-wide retry throttle and the buffered-message budget.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tonic::metadata::MetadataMap;
use tonic::{async_trait, Status};
use tracing::trace;

pub mod buffer;
pub mod hedging_call;
pub mod retry_call;

/// Trailer asking the client to delay (non-negative integer, milliseconds) or
/// stop (anything else) retrying.
pub const GRPC_RETRY_PUSHBACK_MS: &str = "grpc-retry-pushback-ms";

/// Trailer set when a picker dropped the request; disables retries and
/// hedging for the call.
pub const GRPC_INTERNAL_DROP_REQUEST: &str = "grpc-internal-drop-request";

/// The shape of the RPC, which decides whether the call is done when response
/// headers arrive or a response stream follows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl CallKind {
    /// Whether responses stream: the final status arrives after an arbitrary
    /// number of messages rather than right behind the headers.
    pub fn has_response_stream(&self) -> bool {
        matches!(self, CallKind::ServerStreaming | CallKind::BidiStreaming)
    }
}

/// Why a call bound itself to a single attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommitReason {
    /// The picker dropped the request; never retried.
    Drop,
    /// The server began a response; the attempt is the call.
    ResponseHeadersReceived,
    /// The call-level deadline fired.
    DeadlineExceeded,
    /// The channel retry throttle is active.
    Throttled,
    /// The attempt budget is spent.
    AttemptsExhausted,
    /// The server sent a stop pushback.
    PushbackStop,
    /// The status is not retryable (retry) or fatal (hedging).
    FatalStatus,
    /// A buffered write would exceed the per-call or per-channel budget.
    BufferLimitExceeded,
    /// The caller cancelled or disposed the call.
    Canceled,
}

/// The server's initial reaction to one attempt.
#[derive(Debug)]
pub enum AttemptResponse {
    /// Response headers arrived; the call is being served.
    Headers(MetadataMap),
    /// The attempt terminated without a response.  Trailers, including any
    /// retry pushback, travel in the status metadata.
    Status(Status),
}

/// One underlying call attempt.  Production attempts wrap a picked
/// subchannel's service; tests script them.
#[async_trait]
pub trait CallAttempt: Send + Sync {
    /// Waits for the server's initial response to this attempt.
    async fn response(&self) -> AttemptResponse;

    /// Waits for the final status of an attempt whose headers were already
    /// received.
    async fn final_status(&self) -> Status;

    /// Sends one serialized message on this attempt.
    async fn write(&self, message: Bytes) -> Result<(), Status>;

    /// Cancels the underlying call.  Idempotent.
    fn cancel(&self);
}

/// Creates call attempts on demand.  `attempt` is the zero-based ordinal of
/// the attempt being launched.
#[async_trait]
pub trait CallLauncher: Send + Sync {
    async fn launch(&self, attempt: usize) -> Result<Arc<dyn CallAttempt>, Status>;
}

/// The outcome of a committed call: the reason, the surviving attempt if the
/// call is being served, and the final status otherwise.
#[derive(Clone)]
pub struct CommittedCall {
    pub reason: CommitReason,
    pub attempt: Option<Arc<dyn CallAttempt>>,
    pub status: Option<Status>,
}

/// One-shot commit cell shared between the retry/hedging worker and response
/// readers/writers.
pub(crate) struct CommitCell {
    committed: Mutex<Option<CommittedCall>>,
    notify: Notify,
}

impl CommitCell {
    pub(crate) fn new() -> Self {
        Self {
            committed: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Records the committed call.  Returns false if the call had already
    /// committed; the later commit is discarded.
    pub(crate) fn commit(&self, call: CommittedCall) -> bool {
        let mut committed = self.committed.lock().unwrap();
        if committed.is_some() {
            return false;
        }
        trace!(reason = ?call.reason, "call committed");
        *committed = Some(call);
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn get(&self) -> Option<CommittedCall> {
        self.committed.lock().unwrap().clone()
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.committed.lock().unwrap().is_some()
    }

    /// Waits until the call commits.
    pub(crate) async fn committed(&self) -> CommittedCall {
        loop {
            let wait = self.notify.notified();
            if let Some(call) = self.get() {
                return call;
            }
            wait.await;
        }
    }
}

/// A server retry pushback, decoded from trailer metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushback {
    /// Run the next attempt after this delay.
    Delay(Duration),
    /// Stop retrying or hedging.
    Stop,
}

/// Decodes `grpc-retry-pushback-ms` from trailers.  A non-integer or
/// negative value means stop; absent means no pushback.
pub fn retry_pushback(trailers: &MetadataMap) -> Option<Pushback> {
    let value = trailers.get(GRPC_RETRY_PUSHBACK_MS)?;
    let parsed = value.to_str().ok().and_then(|s| s.trim().parse::<i64>().ok());
    match parsed {
        Some(ms) if ms >= 0 => Some(Pushback::Delay(Duration::from_millis(ms as u64))),
        _ => Some(Pushback::Stop),
    }
}

/// Whether trailers carry the internal drop-request marker.
pub fn is_drop_request(trailers: &MetadataMap) -> bool {
    trailers
        .get(GRPC_INTERNAL_DROP_REQUEST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Token bucket gating retries and hedges, per channel.
///
/// Tokens start full.  Failures subtract one token, successes restore
/// `token_ratio`, and throttling is active while the bucket is at or below
/// half of `max_tokens`.  Token arithmetic runs in integer thousandths so
/// concurrent updates stay exact.
pub struct RetryThrottle {
    max_tokens_millis: i64,
    token_ratio_millis: i64,
    tokens_millis: Mutex<i64>,
}

impl RetryThrottle {
    pub fn new(max_tokens: u32, token_ratio: f64) -> Self {
        // token_ratio supports up to 3 decimal places; the remainder is
        // truncated.
        let token_ratio_millis = (token_ratio * 1000.0).trunc() as i64;
        let max_tokens_millis = max_tokens as i64 * 1000;
        Self {
            max_tokens_millis,
            token_ratio_millis,
            tokens_millis: Mutex::new(max_tokens_millis),
        }
    }

    pub fn from_config(config: &crate::client::service_config::RetryThrottlingConfig) -> Self {
        Self::new(config.max_tokens, config.token_ratio)
    }

    pub fn on_success(&self) {
        let mut tokens = self.tokens_millis.lock().unwrap();
        let next = (*tokens + self.token_ratio_millis).min(self.max_tokens_millis);
        if next != *tokens {
            *tokens = next;
            trace!(tokens = *tokens as f64 / 1000.0, "retry throttle credit");
        }
    }

    pub fn on_failure(&self) {
        let mut tokens = self.tokens_millis.lock().unwrap();
        let next = (*tokens - 1000).max(0);
        if next != *tokens {
            *tokens = next;
            trace!(tokens = *tokens as f64 / 1000.0, "retry throttle debit");
        }
    }

    /// Throttling is active while tokens are at or below half the maximum.
    pub fn is_throttling_active(&self) -> bool {
        let tokens = self.tokens_millis.lock().unwrap();
        *tokens <= self.max_tokens_millis / 2
    }

    pub fn tokens(&self) -> f64 {
        *self.tokens_millis.lock().unwrap() as f64 / 1000.0
    }
}
