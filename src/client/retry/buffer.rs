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

use bytes::Bytes;
use tracing::trace;

/// The channel-wide byte budget shared by every resilient call's buffer.
/// Reservations are taken while messages sit in a call buffer and refunded
/// when the call commits.
pub struct ChannelRetryBudget {
    capacity: usize,
    remaining: Mutex<usize>,
}

impl ChannelRetryBudget {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            remaining: Mutex::new(capacity),
        })
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        if bytes > *remaining {
            return false;
        }
        *remaining -= bytes;
        true
    }

    fn refund(&self, bytes: usize) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = (*remaining + bytes).min(self.capacity);
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock().unwrap()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct CallBufferInner {
    messages: Vec<Bytes>,
    bytes: usize,
}

/// The ordered buffer of serialized messages a call has written so far.
/// Messages stay buffered until the call commits so later attempts can
/// replay them in order; `try_add` enforces both the per-call and the
/// per-channel byte budgets.
pub struct CallBuffer {
    per_call_limit: usize,
    channel_budget: Arc<ChannelRetryBudget>,
    inner: Mutex<CallBufferInner>,
}

impl CallBuffer {
    pub fn new(per_call_limit: usize, channel_budget: Arc<ChannelRetryBudget>) -> Self {
        Self {
            per_call_limit,
            channel_budget,
            inner: Mutex::new(CallBufferInner {
                messages: Vec::new(),
                bytes: 0,
            }),
        }
    }

    /// Appends a message if both byte budgets allow it.  Returns false when
    /// the message does not fit; the caller is expected to commit the call.
    pub fn try_add(&self, message: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let len = message.len();
        if inner.bytes + len > self.per_call_limit {
            trace!(bytes = inner.bytes, message = len, "per-call buffer limit hit");
            return false;
        }
        if !self.channel_budget.try_reserve(len) {
            trace!(message = len, "channel retry buffer budget exhausted");
            return false;
        }
        inner.bytes += len;
        inner.messages.push(message);
        true
    }

    /// The buffered messages, in write order.  Bytes is cheaply cloneable so
    /// replay does not copy message payloads.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Empties the buffer and refunds its bytes to the channel budget.
    /// Called on commit.  Returns the number of bytes freed.
    pub fn commit_clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let freed = inner.bytes;
        inner.messages.clear();
        inner.bytes = 0;
        self.channel_budget.refund(freed);
        freed
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CallBuffer {
    fn drop(&mut self) {
        // A call torn down before committing still returns its reservation.
        self.commit_clear();
    }
}
