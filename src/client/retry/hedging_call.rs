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
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::trace;

use crate::client::retry::buffer::CallBuffer;
use crate::client::retry::{
    is_drop_request, retry_pushback, AttemptResponse, CallAttempt, CallLauncher, CommitCell,
    CommitReason, CommittedCall, Pushback, RetryThrottle,
};
use crate::client::service_config::HedgingPolicy;

/// A call fanned out into up to `max_attempts` parallel attempts, separated
/// by the policy's hedging delay, per gRFC A6.
///
/// The first attempt that produces response headers wins the hedge; the call
/// commits to it and every other attempt is cancelled.  A non-fatal failure
/// interrupts the delay so the next attempt launches sooner; a fatal failure
/// kills the whole hedge.
pub struct HedgingCall {
    launcher: Arc<dyn CallLauncher>,
    policy: HedgingPolicy,
    throttle: Option<Arc<RetryThrottle>>,
    buffer: Arc<CallBuffer>,
    token: CancellationToken,
    deadline: Option<Instant>,
    /// Channel-level ceiling on attempts, applied on top of the policy.
    attempt_cap: usize,
    commit: CommitCell,
    shared: Mutex<HedgeShared>,
    /// Signalled when a non-fatal failure should cut the hedging delay
    /// short.  notify_one stores a permit so a failure between selects is
    /// not lost.
    delay_interrupt: Notify,
    /// Serializes attempt launch+replay against caller writes; see
    /// RetryCall for the ordering argument.
    write_lock: tokio::sync::Mutex<()>,
}

struct HedgeShared {
    /// Attempts currently in flight.
    active: Vec<Arc<dyn CallAttempt>>,
    /// Total attempts launched so far.
    launched: usize,
    /// The most recent non-fatal failure, surfaced if every attempt fails.
    last_failure: Option<Status>,
    /// Set when the server pushed back with stop; no further launches.
    pushback_stop: bool,
    /// A server-requested delay overriding the next hedging delay.
    pushback_delay: Option<Duration>,
}

impl HedgingCall {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        launcher: Arc<dyn CallLauncher>,
        policy: HedgingPolicy,
        throttle: Option<Arc<RetryThrottle>>,
        buffer: Arc<CallBuffer>,
        token: CancellationToken,
        deadline: Option<Instant>,
        attempt_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            policy,
            throttle,
            buffer,
            token,
            deadline,
            attempt_cap,
            commit: CommitCell::new(),
            shared: Mutex::new(HedgeShared {
                active: Vec::new(),
                launched: 0,
                last_failure: None,
                pushback_stop: false,
                pushback_delay: None,
            }),
            delay_interrupt: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Waits until the call commits to a single attempt.
    pub async fn committed(&self) -> CommittedCall {
        self.commit.committed().await
    }

    /// Buffers one outgoing message and broadcasts it to every attempt in
    /// flight.  The write succeeds once at least one attempt observed it (or
    /// none is in flight yet, in which case replay delivers it at launch).
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
            // Bind the call to the newest attempt in flight; the hedge is
            // over once messages can no longer be replayed.
            let attempt = self.shared.lock().unwrap().active.last().cloned();
            self.do_commit(CommitReason::BufferLimitExceeded, attempt.clone(), None);
            self.cancel_attempts_except(attempt.as_deref());
            return match attempt {
                Some(attempt) => attempt.write(message).await,
                None => Err(Status::resource_exhausted(
                    "message exceeds the retry buffer limit",
                )),
            };
        }

        let attempts = self.shared.lock().unwrap().active.clone();
        if attempts.is_empty() {
            return Ok(());
        }
        let mut delivered = false;
        for attempt in attempts {
            if attempt.write(message.clone()).await.is_ok() {
                delivered = true;
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(Status::unavailable("no hedging attempt accepted the write"))
        }
    }

    /// Runs the hedge to completion, returning the committed call.
    pub async fn run(self: Arc<Self>) -> CommittedCall {
        let this = self.clone();
        let launcher = tokio::spawn(async move { this.launch_loop().await });

        let committed = tokio::select! {
            _ = self.token.cancelled() => {
                self.commit_synthesized()
            }
            _ = self.sleep_until_deadline() => {
                self.do_commit(
                    CommitReason::DeadlineExceeded,
                    None,
                    Some(Status::deadline_exceeded("deadline exceeded before commit")),
                )
            }
            committed = self.commit.committed() => committed,
        };
        launcher.abort();
        self.cancel_attempts_except(committed.attempt.as_deref());
        committed
    }

    async fn launch_loop(self: Arc<Self>) {
        let max_attempts = self.max_attempts();
        Self::launch_next(&self).await;

        if self.policy.hedging_delay.is_zero() {
            // Fan out everything immediately, gated only by commit and the
            // throttle.
            while self.shared.lock().unwrap().launched < max_attempts {
                if self.commit.is_committed() || !self.can_launch_more() {
                    break;
                }
                Self::launch_next(&self).await;
            }
            self.maybe_commit_to_remaining();
            return;
        }

        while self.shared.lock().unwrap().launched < max_attempts {
            let delay = {
                let mut shared = self.shared.lock().unwrap();
                shared.pushback_delay.take().unwrap_or(self.policy.hedging_delay)
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.delay_interrupt.notified() => {
                    // A concurrent attempt failed non-fatally: the next
                    // attempt starts now, unless the server pushed a
                    // specific delay back.
                    let pushback = self.shared.lock().unwrap().pushback_delay.take();
                    if let Some(delay) = pushback {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            if self.commit.is_committed() {
                return;
            }
            if !self.can_launch_more() {
                break;
            }
            Self::launch_next(&self).await;
        }
        self.maybe_commit_to_remaining();
    }

    async fn launch_next(this: &Arc<Self>) {
        let attempt_index = {
            let mut shared = this.shared.lock().unwrap();
            let index = shared.launched;
            shared.launched += 1;
            index
        };
        trace!(attempt = attempt_index + 1, "hedging attempt launched");

        let attempt = {
            let _guard = this.write_lock.lock().await;
            let attempt = match this.launcher.launch(attempt_index).await {
                Ok(attempt) => attempt,
                Err(status) => {
                    this.on_attempt_failure(None, status);
                    return;
                }
            };
            this.shared.lock().unwrap().active.push(attempt.clone());
            for message in this.buffer.snapshot() {
                if let Err(status) = attempt.write(message).await {
                    trace!(%status, "buffered replay write failed");
                    break;
                }
            }
            attempt
        };

        let this = this.clone();
        tokio::spawn(async move {
            this.drive_attempt(attempt).await;
        });
    }

    async fn drive_attempt(self: Arc<Self>, attempt: Arc<dyn CallAttempt>) {
        let response = tokio::select! {
            _ = self.token.cancelled() => {
                attempt.cancel();
                return;
            }
            response = attempt.response() => response,
        };

        let status = match response {
            AttemptResponse::Headers(_) => {
                self.do_commit(
                    CommitReason::ResponseHeadersReceived,
                    Some(attempt.clone()),
                    None,
                );
                self.cancel_attempts_except(Some(attempt.as_ref()));
                self.delay_interrupt.notify_one();
                return;
            }
            AttemptResponse::Status(status) => status,
        };

        if is_drop_request(status.metadata()) {
            self.do_commit(CommitReason::Drop, None, Some(status));
            self.cancel_attempts_except(None);
            return;
        }

        if status.code() == Code::Ok {
            if let Some(throttle) = &self.throttle {
                throttle.on_success();
            }
            self.do_commit(
                CommitReason::ResponseHeadersReceived,
                Some(attempt.clone()),
                Some(status),
            );
            self.cancel_attempts_except(Some(attempt.as_ref()));
            return;
        }

        if !self.policy.is_non_fatal(status.code()) {
            // A fatal status ends the hedge: the call takes this outcome no
            // matter what the other attempts are doing.
            self.do_commit(CommitReason::FatalStatus, None, Some(status));
            self.cancel_attempts_except(None);
            return;
        }

        self.on_attempt_failure(Some(attempt.as_ref()), status);
    }

    /// Records a non-fatal failure: updates the throttle, captures any
    /// pushback, interrupts the hedging delay, and commits if this was the
    /// last hope.
    fn on_attempt_failure(&self, attempt: Option<&dyn CallAttempt>, status: Status) {
        if let Some(throttle) = &self.throttle {
            throttle.on_failure();
        }
        {
            let mut shared = self.shared.lock().unwrap();
            match retry_pushback(status.metadata()) {
                Some(Pushback::Stop) => shared.pushback_stop = true,
                Some(Pushback::Delay(delay)) => shared.pushback_delay = Some(delay),
                None => {}
            }
            if let Some(attempt) = attempt {
                shared.active.retain(|a| !std::ptr::addr_eq(Arc::as_ptr(a), attempt));
            }
            shared.last_failure = Some(status);
        }
        self.delay_interrupt.notify_one();
        self.maybe_commit_to_remaining();
    }

    /// Commits when no further attempt can launch and at most one attempt is
    /// still in flight: to that attempt if one remains, else to the most
    /// recent failure.
    fn maybe_commit_to_remaining(&self) {
        if self.commit.is_committed() || self.can_launch_more() {
            return;
        }
        let (remaining, last_failure, pushback_stop) = {
            let shared = self.shared.lock().unwrap();
            (
                shared.active.clone(),
                shared.last_failure.clone(),
                shared.pushback_stop,
            )
        };
        match remaining.len() {
            0 => {
                let reason = if pushback_stop {
                    CommitReason::PushbackStop
                } else if self.throttle_active() {
                    CommitReason::Throttled
                } else {
                    CommitReason::AttemptsExhausted
                };
                let status = last_failure
                    .unwrap_or_else(|| Status::unavailable("all hedging attempts failed"));
                self.do_commit(reason, None, Some(status));
            }
            1 => {
                self.do_commit(
                    CommitReason::AttemptsExhausted,
                    Some(remaining[0].clone()),
                    None,
                );
            }
            _ => {}
        }
    }

    fn can_launch_more(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        if shared.pushback_stop || shared.launched >= self.max_attempts() {
            return false;
        }
        !self.throttle_active()
    }

    fn throttle_active(&self) -> bool {
        self.throttle
            .as_ref()
            .map(|t| t.is_throttling_active())
            .unwrap_or(false)
    }

    fn max_attempts(&self) -> usize {
        self.policy.max_attempts.min(self.attempt_cap).max(1)
    }

    fn cancel_attempts_except(&self, keep: Option<&dyn CallAttempt>) {
        let attempts = {
            let mut shared = self.shared.lock().unwrap();
            std::mem::take(&mut shared.active)
        };
        for attempt in attempts {
            let is_kept = keep
                .map(|k| std::ptr::addr_eq(Arc::as_ptr(&attempt), k))
                .unwrap_or(false);
            if is_kept {
                self.shared.lock().unwrap().active.push(attempt);
            } else {
                attempt.cancel();
            }
        }
    }

    fn commit_synthesized(&self) -> CommittedCall {
        if self.deadline_exceeded() {
            self.do_commit(
                CommitReason::DeadlineExceeded,
                None,
                Some(Status::deadline_exceeded("deadline exceeded before commit")),
            )
        } else {
            self.do_commit(
                CommitReason::Canceled,
                None,
                Some(Status::cancelled("call cancelled")),
            )
        }
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

    async fn sleep_until_deadline(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    fn deadline_exceeded(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}
