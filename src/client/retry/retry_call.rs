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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, trace};

use crate::client::retry::buffer::CallBuffer;
use crate::client::retry::{
    is_drop_request, retry_pushback, AttemptResponse, CallAttempt, CallKind, CallLauncher,
    CommitCell, CommitReason, CommittedCall, Pushback, RetryThrottle,
};
use crate::client::service_config::RetryPolicy;

/// Samples the sleep before the next attempt given the current backoff
/// ceiling.  Injectable so tests run on exact delays.
pub(crate) type DelaySampler = Box<dyn Fn(Duration) -> Duration + Send + Sync>;

fn uniform_delay_sampler() -> DelaySampler {
    Box::new(|ceiling| {
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::rng().random_range(0.0..ceiling.as_secs_f64()))
    })
}

/// A call wrapped in the sequential retry state machine of gRFC A6.
///
/// The worker launches one attempt at a time, classifies its outcome, and
/// either commits the call to that attempt or sleeps and launches the next.
/// Outgoing messages buffer until commit so later attempts can replay them.
pub struct RetryCall {
    launcher: Arc<dyn CallLauncher>,
    policy: RetryPolicy,
    kind: CallKind,
    throttle: Option<Arc<RetryThrottle>>,
    buffer: Arc<CallBuffer>,
    token: CancellationToken,
    deadline: Option<Instant>,
    /// Channel-level ceiling on attempts, applied on top of the policy.
    attempt_cap: usize,
    commit: CommitCell,
    /// The attempt currently in flight, if any.  Guarded by `write_lock` for
    /// ordering between replay and fresh writes.
    active: Mutex<Option<Arc<dyn CallAttempt>>>,
    /// Serializes attempt launch+replay against caller writes so every
    /// attempt observes buffered messages in their original order before any
    /// new message.
    write_lock: tokio::sync::Mutex<()>,
    delay_sampler: DelaySampler,
}

impl RetryCall {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        launcher: Arc<dyn CallLauncher>,
        policy: RetryPolicy,
        kind: CallKind,
        throttle: Option<Arc<RetryThrottle>>,
        buffer: Arc<CallBuffer>,
        token: CancellationToken,
        deadline: Option<Instant>,
        attempt_cap: usize,
    ) -> Self {
        Self {
            launcher,
            policy,
            kind,
            throttle,
            buffer,
            token,
            deadline,
            attempt_cap,
            commit: CommitCell::new(),
            active: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            delay_sampler: uniform_delay_sampler(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_delay_sampler(mut self, sampler: DelaySampler) -> Self {
        self.delay_sampler = sampler;
        self
    }

    /// Waits until the call commits to a single attempt.
    pub async fn committed(&self) -> CommittedCall {
        self.commit.committed().await
    }

    /// Buffers and sends one outgoing message.  If the message does not fit
    /// the retry buffer budgets, the call commits to the attempt in flight
    /// and the message is sent on it directly.
    pub async fn write_message(&self, message: Bytes) -> Result<(), Status> {
        let _guard = self.write_lock.lock().await;
        if let Some(committed) = self.commit.get() {
            return match committed.attempt {
                Some(attempt) => attempt.write(message).await,
                None => Err(committed
                    .status
                    .unwrap_or_else(|| Status::cancelled("call already completed"))),
            };
        }

        if !self.buffer.try_add(message.clone()) {
            let attempt = self.active.lock().unwrap().clone();
            debug!("retry buffer limit exceeded, committing in-flight attempt");
            self.do_commit(CommitReason::BufferLimitExceeded, attempt.clone(), None);
            return match attempt {
                Some(attempt) => attempt.write(message).await,
                None => Err(Status::resource_exhausted(
                    "message exceeds the retry buffer limit",
                )),
            };
        }

        let attempt = self.active.lock().unwrap().clone();
        if let Some(attempt) = attempt {
            attempt.write(message).await?;
        }
        Ok(())
    }

    /// Runs the retry worker to completion, returning the committed call.
    pub async fn run(&self) -> CommittedCall {
        let max_attempts = self.policy.max_attempts.min(self.attempt_cap).max(1);
        let mut next_backoff = self.policy.initial_backoff;
        let mut attempt_index = 0usize;

        loop {
            // A prior write may have committed the call (buffer overflow)
            // while we were sleeping between attempts.
            if let Some(committed) = self.commit.get() {
                return committed;
            }

            let attempt = match self.start_attempt(attempt_index).await {
                Ok(attempt) => attempt,
                Err(status) => return self.commit_synthesized(status),
            };
            attempt_index += 1;
            trace!(attempt = attempt_index, "retry attempt started");

            let response = tokio::select! {
                _ = self.token.cancelled() => {
                    attempt.cancel();
                    return self.commit_synthesized(Status::cancelled("call cancelled"));
                }
                response = attempt.response() => response,
            };

            let status = match response {
                AttemptResponse::Headers(_) => {
                    return self.commit_headers_received(attempt).await;
                }
                AttemptResponse::Status(status) => status,
            };

            // Drop metadata bypasses retries entirely.
            if is_drop_request(status.metadata()) {
                return self.do_commit(CommitReason::Drop, None, Some(status));
            }

            // A trailers-only OK is a served call with no response stream.
            if status.code() == Code::Ok {
                if let Some(throttle) = &self.throttle {
                    throttle.on_success();
                }
                return self.do_commit(
                    CommitReason::ResponseHeadersReceived,
                    Some(attempt),
                    Some(status),
                );
            }

            let pushback = retry_pushback(status.metadata());
            if let Some(throttle) = &self.throttle {
                throttle.on_failure();
            }

            if let Some(reason) =
                self.evaluate_retry(&status, pushback, attempt_index, max_attempts)
            {
                return self.do_commit(reason, None, Some(status));
            }

            let delay = match pushback {
                Some(Pushback::Delay(delay)) => delay,
                _ => (self.delay_sampler)(next_backoff),
            };
            next_backoff = advance_backoff(&self.policy, next_backoff);

            *self.active.lock().unwrap() = None;
            trace!(?delay, "retrying after delay");
            tokio::select! {
                _ = self.token.cancelled() => {
                    return self.commit_synthesized(Status::cancelled("call cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn start_attempt(&self, attempt_index: usize) -> Result<Arc<dyn CallAttempt>, Status> {
        let _guard = self.write_lock.lock().await;
        let attempt = self.launcher.launch(attempt_index).await?;
        *self.active.lock().unwrap() = Some(attempt.clone());
        for message in self.buffer.snapshot() {
            // A replay failure surfaces through the attempt's response; the
            // classification below decides whether to retry.
            if let Err(status) = attempt.write(message).await {
                trace!(%status, "buffered replay write failed");
                break;
            }
        }
        Ok(attempt)
    }

    /// Ordered checks from the retry algorithm; the first that fires names
    /// the commit reason.
    fn evaluate_retry(
        &self,
        status: &Status,
        pushback: Option<Pushback>,
        attempts_made: usize,
        max_attempts: usize,
    ) -> Option<CommitReason> {
        if self.deadline_exceeded() {
            return Some(CommitReason::DeadlineExceeded);
        }
        if let Some(throttle) = &self.throttle {
            if throttle.is_throttling_active() {
                return Some(CommitReason::Throttled);
            }
        }
        if attempts_made >= max_attempts {
            return Some(CommitReason::AttemptsExhausted);
        }
        if pushback == Some(Pushback::Stop) {
            return Some(CommitReason::PushbackStop);
        }
        if !self.policy.is_retryable(status.code()) {
            return Some(CommitReason::FatalStatus);
        }
        None
    }

    async fn commit_headers_received(&self, attempt: Arc<dyn CallAttempt>) -> CommittedCall {
        let committed =
            self.do_commit(CommitReason::ResponseHeadersReceived, Some(attempt.clone()), None);
        // For calls without a response stream the final status lands right
        // behind the headers; observe it so the throttle stays current.
        // Streamed responses may outlive this worker, so their terminal
        // status is not awaited here.
        if !self.kind.has_response_stream() {
            if let Some(throttle) = &self.throttle {
                let status = attempt.final_status().await;
                if status.code() == Code::Ok {
                    throttle.on_success();
                } else {
                    throttle.on_failure();
                }
            }
        }
        committed
    }

    /// Commits a status synthesized locally, distinguishing deadline from
    /// caller cancellation from other failures.
    fn commit_synthesized(&self, status: Status) -> CommittedCall {
        if self.deadline_exceeded() {
            return self.do_commit(
                CommitReason::DeadlineExceeded,
                None,
                Some(Status::deadline_exceeded("deadline exceeded before commit")),
            );
        }
        if self.token.is_cancelled() {
            return self.do_commit(
                CommitReason::Canceled,
                None,
                Some(Status::cancelled("call cancelled")),
            );
        }
        self.do_commit(CommitReason::FatalStatus, None, Some(status))
    }

    fn do_commit(
        &self,
        reason: CommitReason,
        attempt: Option<Arc<dyn CallAttempt>>,
        status: Option<Status>,
    ) -> CommittedCall {
        let call = CommittedCall {
            reason,
            attempt,
            status,
        };
        if self.commit.commit(call) {
            self.buffer.commit_clear();
        }
        self.commit.get().unwrap()
    }

    fn deadline_exceeded(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

fn advance_backoff(policy: &RetryPolicy, current: Duration) -> Duration {
    let next = current.as_secs_f64() * policy.backoff_multiplier;
    Duration::from_secs_f64(next.min(policy.max_backoff.as_secs_f64()))
}
