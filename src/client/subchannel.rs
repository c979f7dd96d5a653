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

use std::fmt::{Debug, Display};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tonic::{Code, Status};
use tracing::{debug, trace};

use crate::client::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::load_balancing::{Subchannel, SubchannelState};
use crate::client::name_resolution::Address;
use crate::client::transport::{ConnectContext, ConnectResult, DisconnectNotifier, Transport};
use crate::client::ConnectivityState;

/// Observes every state transition of one subchannel.  Watchers run under
/// the subchannel lock and must hand work off rather than call back in.
pub(crate) type StateWatcher = Arc<dyn Fn(SubchannelState) + Send + Sync>;

enum SubchannelEvent {
    ConnectRequested,
    ConnectOk,
    ConnectFailed(Status),
    ConnectTimedOut,
    Disconnected(Status),
    BackoffExpired,
    Shutdown,
}

impl Debug for SubchannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectRequested => write!(f, "ConnectRequested"),
            Self::ConnectOk => write!(f, "ConnectOk"),
            Self::ConnectFailed(status) => write!(f, "ConnectFailed({status})"),
            Self::ConnectTimedOut => write!(f, "ConnectTimedOut"),
            Self::Disconnected(status) => write!(f, "Disconnected({status})"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct InnerSubchannel {
    state: ConnectivityState,
    last_status: Option<Status>,
    addresses: Vec<Address>,
    watchers: Vec<StateWatcher>,
    connect_task: Option<tokio::task::JoinHandle<()>>,
    backoff_task: Option<tokio::task::JoinHandle<()>>,
    connect_ctx: Option<Arc<ConnectContext>>,
    /// Set when a connection was requested while in TransientFailure: the
    /// subchannel reconnects as soon as the backoff expires.
    pending_connect: bool,
    attempt_count: usize,
}

/// A per-endpoint connection state machine.
///
/// State transitions are driven by an event loop so they are totally
/// ordered: balancer requests, transport callbacks and timers all enqueue
/// events and the loop applies them one at a time.  Valid transitions:
///
/// - Idle -> Connecting (connection requested)
/// - Connecting -> Ready | TransientFailure | Idle (ok / fail / disconnect)
/// - Ready -> Idle (connection lost)
/// - TransientFailure -> Idle or Connecting once the backoff expires
/// - any -> Shutdown (terminal)
pub(crate) struct InternalSubchannel {
    id: String,
    transport: Arc<dyn Transport>,
    backoff: Arc<ExponentialBackoff>,
    event_tx: mpsc::UnboundedSender<SubchannelEvent>,
    inner: Mutex<InnerSubchannel>,
}

impl InternalSubchannel {
    /// Creates the subchannel and its transport.  `make_transport` receives
    /// the disconnect notifier wired into this subchannel's event loop.
    pub(crate) fn new(
        id: String,
        addresses: Vec<Address>,
        make_transport: impl FnOnce(DisconnectNotifier) -> Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SubchannelEvent>();
        let notifier: DisconnectNotifier = {
            let event_tx = event_tx.clone();
            Arc::new(move |status| {
                let _ = event_tx.send(SubchannelEvent::Disconnected(status));
            })
        };
        let transport = make_transport(notifier);
        let backoff = Arc::new(
            ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone())
                .expect("default backoff config is valid"),
        );
        let subchannel = Arc::new(Self {
            id,
            transport,
            backoff,
            event_tx,
            inner: Mutex::new(InnerSubchannel {
                state: ConnectivityState::Idle,
                last_status: None,
                addresses,
                watchers: Vec::new(),
                connect_task: None,
                backoff_task: None,
                connect_ctx: None,
                pending_connect: false,
                attempt_count: 0,
            }),
        });

        // The state machine task: exits when the subchannel is dropped (the
        // weak upgrade fails) or shut down.
        let weak = Arc::downgrade(&subchannel);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(subchannel) = weak.upgrade() else {
                    return;
                };
                trace!(id = %subchannel.id, ?event, "subchannel event");
                if !subchannel.handle_event(event) {
                    return;
                }
            }
        });
        subchannel
    }

    pub(crate) fn register_state_watcher(&self, watcher: StateWatcher) {
        let mut inner = self.inner.lock().unwrap();
        watcher(SubchannelState {
            connectivity_state: inner.state,
            last_status: inner.last_status.clone(),
        });
        inner.watchers.push(watcher);
    }

    /// Replaces the ordered address list used for future connection
    /// attempts.
    pub(crate) fn update_addresses(&self, addresses: Vec<Address>) {
        self.transport.update_addresses(addresses.clone());
        self.inner.lock().unwrap().addresses = addresses;
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Enters the terminal Shutdown state, cancelling any in-flight work.
    pub(crate) fn shutdown(&self) {
        let _ = self.event_tx.send(SubchannelEvent::Shutdown);
    }

    /// Applies one event.  Returns false when the state machine is done.
    fn handle_event(&self, event: SubchannelEvent) -> bool {
        let state = self.inner.lock().unwrap().state;
        if state == ConnectivityState::Shutdown {
            return false;
        }
        match (state, event) {
            (ConnectivityState::Idle, SubchannelEvent::ConnectRequested) => {
                self.move_to_connecting();
            }
            (ConnectivityState::TransientFailure, SubchannelEvent::ConnectRequested) => {
                // Reconnection waits out the backoff; remember the request.
                self.inner.lock().unwrap().pending_connect = true;
            }
            (ConnectivityState::Connecting, SubchannelEvent::ConnectOk) => {
                self.backoff.reset();
                self.move_to_ready();
            }
            (ConnectivityState::Connecting, SubchannelEvent::ConnectFailed(status)) => {
                self.move_to_transient_failure(status);
            }
            (ConnectivityState::Connecting, SubchannelEvent::ConnectTimedOut) => {
                self.move_to_transient_failure(Status::deadline_exceeded(
                    "connection attempt timed out",
                ));
            }
            (ConnectivityState::Connecting, SubchannelEvent::Disconnected(status))
            | (ConnectivityState::Ready, SubchannelEvent::Disconnected(status))
            | (ConnectivityState::TransientFailure, SubchannelEvent::Disconnected(status)) => {
                self.move_to_idle(if status.code() == Code::Ok {
                    None
                } else {
                    Some(status)
                });
            }
            (ConnectivityState::TransientFailure, SubchannelEvent::BackoffExpired) => {
                let pending = {
                    let mut inner = self.inner.lock().unwrap();
                    std::mem::take(&mut inner.pending_connect)
                };
                if pending {
                    self.move_to_connecting();
                } else {
                    self.move_to_idle(None);
                }
            }
            (_, SubchannelEvent::Shutdown) => {
                self.move_to_shutdown();
                return false;
            }
            (state, event) => {
                debug!(id = %self.id, %state, ?event, "ignoring event in current state");
            }
        }
        true
    }

    fn set_state_and_notify(&self, state: ConnectivityState, status: Option<Status>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.last_status = status.clone();
        let update = SubchannelState {
            connectivity_state: state,
            last_status: status,
        };
        for watcher in &inner.watchers {
            watcher(update.clone());
        }
    }

    fn move_to_connecting(&self) {
        self.set_state_and_notify(ConnectivityState::Connecting, None);

        let ctx = Arc::new(ConnectContext::new());
        let attempt = {
            let mut inner = self.inner.lock().unwrap();
            inner.connect_ctx = Some(ctx.clone());
            inner.attempt_count += 1;
            inner.attempt_count
        };

        // Connect timeouts expire only the connect context, never the call's
        // token, so they surface as Timeout rather than a cancellation.
        let deadline_task = self.transport.connect_timeout().map(|timeout| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                ctx.expire();
            })
        });

        let transport = self.transport.clone();
        let event_tx = self.event_tx.clone();
        let connect_task = tokio::spawn(async move {
            let result = transport.try_connect(&ctx, attempt).await;
            if let Some(task) = deadline_task {
                task.abort();
            }
            let event = match result {
                ConnectResult::Success => SubchannelEvent::ConnectOk,
                ConnectResult::Failure(status) => SubchannelEvent::ConnectFailed(status),
                ConnectResult::Timeout => SubchannelEvent::ConnectTimedOut,
            };
            let _ = event_tx.send(event);
        });
        self.inner.lock().unwrap().connect_task = Some(connect_task);
    }

    fn move_to_ready(&self) {
        self.set_state_and_notify(ConnectivityState::Ready, None);
    }

    fn move_to_idle(&self, status: Option<Status>) {
        self.transport.disconnect();
        self.set_state_and_notify(ConnectivityState::Idle, status);
    }

    fn move_to_transient_failure(&self, status: Status) {
        self.set_state_and_notify(ConnectivityState::TransientFailure, Some(status));

        let delay = self.backoff.backoff_duration();
        let event_tx = self.event_tx.clone();
        let backoff_task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(SubchannelEvent::BackoffExpired);
        });
        self.inner.lock().unwrap().backoff_task = Some(backoff_task);
    }

    fn move_to_shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(task) = inner.connect_task.take() {
                task.abort();
            }
            if let Some(task) = inner.backoff_task.take() {
                task.abort();
            }
            if let Some(ctx) = inner.connect_ctx.take() {
                ctx.dispose();
            }
        }
        self.transport.disconnect();
        self.set_state_and_notify(ConnectivityState::Shutdown, None);
    }
}

impl Subchannel for InternalSubchannel {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn address(&self) -> Address {
        let inner = self.inner.lock().unwrap();
        inner.addresses.first().cloned().unwrap_or_default()
    }

    fn connect(&self) {
        let state = self.inner.lock().unwrap().state;
        if state == ConnectivityState::Idle || state == ConnectivityState::TransientFailure {
            let _ = self.event_tx.send(SubchannelEvent::ConnectRequested);
        }
    }

    fn connectivity_state(&self) -> ConnectivityState {
        self.inner.lock().unwrap().state
    }

    fn connected_address(&self) -> Option<Address> {
        self.transport.current_address()
    }
}

impl Display for InternalSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.address())
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.connect_task.take() {
            task.abort();
        }
        if let Some(task) = inner.backoff_task.take() {
            task.abort();
        }
        self.transport.disconnect();
    }
}
