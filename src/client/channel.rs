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

//! The channel: composition of name resolution, load balancing and call
//! resilience behind a single `pick` surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::client::load_balancing::{
    child_handler::{ChildHandler, ChildHandlerConfig},
    pick_first, CallTracker, ChannelController, LbPolicy, LbPolicyBuilder, LbState, PickResult,
    Picker, QueuingPicker, Subchannel, SubchannelState, WorkScheduler, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{
    Address, Resolver, ResolverListener, ResolverUpdate,
};
use crate::client::retry::{
    buffer::{CallBuffer, ChannelRetryBudget},
    hedging_call::HedgingCall,
    retry_call::RetryCall,
    CallKind, CallLauncher, CommittedCall, RetryThrottle, GRPC_INTERNAL_DROP_REQUEST,
};
use crate::client::service_config::{LbConfig, RetryPolicy, ServiceConfig};
use crate::client::subchannel::InternalSubchannel;
use crate::client::transport::{
    passive::PassiveTransport, TransportBuilder, TransportOptions, GLOBAL_TRANSPORT_REGISTRY,
};
use crate::client::ConnectivityState;
use crate::service::Request;

/// The process-global channel id counter; the only process-global state in
/// the channel.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Per-channel defaults for the retry buffer budgets, matching the common
/// client defaults of 16 MiB per channel and 1 MiB per call.
const DEFAULT_CHANNEL_BUFFER_LIMIT: usize = 16 * 1024 * 1024;
const DEFAULT_PER_CALL_BUFFER_LIMIT: usize = 1024 * 1024;

pub struct ChannelOptions {
    /// Service config used when the resolver does not provide one.
    pub default_service_config: Option<ServiceConfig>,
    /// When set, service configs delivered by the resolver are ignored.
    pub disable_resolver_service_config: bool,
    /// Channel-wide ceiling on attempts per call, applied on top of any
    /// method retry or hedging policy.
    pub max_attempts_limit: usize,
    pub per_call_buffer_limit: usize,
    pub channel_buffer_limit: usize,
    pub transport_options: TransportOptions,
    /// Overrides transport construction for every subchannel.  Used by
    /// tests; when unset, builders come from the global transport registry.
    pub transport_builder: Option<Arc<dyn TransportBuilder>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_service_config: None,
            disable_resolver_service_config: false,
            max_attempts_limit: 5,
            per_call_buffer_limit: DEFAULT_PER_CALL_BUFFER_LIMIT,
            channel_buffer_limit: DEFAULT_CHANNEL_BUFFER_LIMIT,
            transport_options: TransportOptions::default(),
            transport_builder: None,
        }
    }
}

/// The channel state observed by applications: connectivity plus the
/// current picker, published atomically.
#[derive(Clone)]
pub struct ChannelState {
    pub connectivity_state: ConnectivityState,
    picker: Arc<dyn Picker>,
    version: u64,
}

enum WorkItem {
    ResolverUpdate(ResolverUpdate),
    SubchannelUpdate(Arc<dyn Subchannel>, SubchannelState),
    Work,
    Connect,
    Shutdown,
}

/// A virtual, persistent connection to a service.
///
/// The channel owns the resolver and the root load balancing policy, routes
/// each request through the current picker, and wraps calls in the retry or
/// hedging machinery their method config asks for.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ActiveChannel>,
}

struct ActiveChannel {
    id: u64,
    target: String,
    resolver: Arc<dyn Resolver>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    state_tx: watch::Sender<ChannelState>,
    /// Every live subchannel by id, for routing picked requests to their
    /// transport.
    subchannels: Mutex<std::collections::HashMap<String, Weak<InternalSubchannel>>>,
    /// The effective service config after resolver-result handling.
    service_config: Mutex<ServiceConfig>,
    /// The channel-wide retry throttle, present when the service config
    /// carries retryThrottling.
    throttle: Mutex<Option<Arc<RetryThrottle>>>,
    retry_budget: Arc<ChannelRetryBudget>,
    max_attempts_limit: usize,
    per_call_buffer_limit: usize,
}

impl Channel {
    /// Constructs a new channel for `target`, fed by the given resolver.
    /// Resolution starts immediately.
    pub fn new(target: &str, resolver: Arc<dyn Resolver>, options: ChannelOptions) -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ChannelState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(QueuingPicker {}),
            version: 0,
        });

        let inner = Arc::new(ActiveChannel {
            id,
            target: target.to_string(),
            resolver: resolver.clone(),
            work_tx: work_tx.clone(),
            state_tx,
            subchannels: Mutex::new(std::collections::HashMap::new()),
            service_config: Mutex::new(
                options.default_service_config.clone().unwrap_or_default(),
            ),
            throttle: Mutex::new(None),
            retry_budget: ChannelRetryBudget::new(options.channel_buffer_limit),
            max_attempts_limit: options.max_attempts_limit,
            per_call_buffer_limit: options.per_call_buffer_limit,
        });

        let worker = ChannelWorker {
            channel: Arc::downgrade(&inner),
            channel_id: id,
            options,
            lb: None,
            cached_config: None,
            current_lb_entry: None,
            next_subchannel_id: 0,
        };
        tokio::spawn(worker.run(work_rx));

        resolver.start(Arc::new(WorkQueueListener { work_tx }));
        Channel { inner }
    }

    /// The process-unique id of this channel.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// The default authority for this channel: the path portion of the
    /// target URI with the leading prefix removed, falling back to the URI
    /// authority, or to the raw target when it is not a valid URI.
    pub fn authority(&self) -> String {
        match url::Url::parse(&self.inner.target) {
            Ok(url) => {
                let path = url.path();
                let path = path.strip_prefix('/').unwrap_or(path);
                if path.is_empty() {
                    url.authority().to_string()
                } else {
                    path.to_string()
                }
            }
            Err(_) => self.inner.target.clone(),
        }
    }

    /// Returns the current state of the channel.
    pub fn current_state(&self) -> ConnectivityState {
        self.inner.state_tx.borrow().connectivity_state
    }

    /// Kicks the channel out of idle, optionally waiting until it becomes
    /// Ready.
    pub async fn connect(
        &self,
        wait_for_ready: bool,
        token: &CancellationToken,
    ) -> Result<(), Status> {
        let _ = self.inner.work_tx.send(WorkItem::Connect);
        if !wait_for_ready {
            return Ok(());
        }
        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            match state_rx.borrow().connectivity_state {
                ConnectivityState::Ready => return Ok(()),
                ConnectivityState::Shutdown => {
                    return Err(Status::unavailable("channel is shut down"));
                }
                _ => {}
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Status::cancelled("connect cancelled")),
                changed = state_rx.changed() => {
                    changed.map_err(|_| Status::unavailable("channel is shut down"))?;
                }
            }
        }
    }

    /// Routes one request to a ready subchannel.
    ///
    /// Loops over picker snapshots: each pick is attempted on a picker that
    /// differs from the previously tried one, queueing until the load
    /// balancer produces something usable.  Returns the subchannel, the
    /// address its transport is connected to, and the pick's call tracker.
    pub async fn pick(
        &self,
        request: &Request,
        wait_for_ready: bool,
        token: &CancellationToken,
    ) -> Result<(Arc<dyn Subchannel>, Address, Option<CallTracker>), Status> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let mut last_version: Option<u64> = None;

        loop {
            // Await a picker that differs from the previously tried one.
            let state = loop {
                let state = state_rx.borrow().clone();
                if state.connectivity_state == ConnectivityState::Shutdown {
                    return Err(Status::unavailable("channel is shut down"));
                }
                if last_version != Some(state.version) {
                    break state;
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(Status::cancelled("pick cancelled")),
                    changed = state_rx.changed() => {
                        changed.map_err(|_| Status::unavailable("channel is shut down"))?;
                    }
                }
            };
            last_version = Some(state.version);

            if state.connectivity_state == ConnectivityState::Idle {
                let _ = self.inner.work_tx.send(WorkItem::Connect);
            }

            match state.picker.pick(request) {
                PickResult::Pick(pick) => {
                    let ready =
                        pick.subchannel.connectivity_state() == ConnectivityState::Ready;
                    if let (true, Some(address)) = (ready, pick.subchannel.connected_address()) {
                        return Ok((pick.subchannel, address, pick.on_complete));
                    }
                    // The picked subchannel raced a disconnect; observe a
                    // fresh picker and try again.
                }
                PickResult::Queue => {}
                PickResult::Fail(status) => {
                    if !wait_for_ready {
                        return Err(as_unavailable(status));
                    }
                }
                PickResult::Drop(status) => {
                    return Err(drop_status(status));
                }
            }
        }
    }

    /// Picks a subchannel for the request and opens a duplex byte stream on
    /// its transport for the HTTP/2 stack.  Each attempt of a call routes
    /// through here: pick, then the picked subchannel's transport hands out
    /// the stream.
    pub async fn pick_stream(
        &self,
        request: &Request,
        wait_for_ready: bool,
        token: &CancellationToken,
    ) -> Result<crate::client::transport::TransportStream, Status> {
        let (subchannel, address, _tracker) = self.pick(request, wait_for_ready, token).await?;
        let internal = {
            let subchannels = self.inner.subchannels.lock().unwrap();
            subchannels.get(&subchannel.id()).and_then(Weak::upgrade)
        };
        match internal {
            Some(internal) => internal.transport().get_stream(&address).await,
            None => Err(Status::unavailable("picked subchannel is gone")),
        }
    }

    /// Waits until the channel's connectivity differs from `last_seen` and
    /// returns the new state.
    pub async fn wait_for_state_change(
        &self,
        last_seen: ConnectivityState,
        token: &CancellationToken,
    ) -> Result<ConnectivityState, Status> {
        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            let current = state_rx.borrow().connectivity_state;
            if current != last_seen {
                return Ok(current);
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Status::cancelled("wait cancelled")),
                changed = state_rx.changed() => {
                    changed.map_err(|_| Status::unavailable("channel is shut down"))?;
                }
            }
        }
    }

    /// Wraps one call in the resilience machinery its method config asks
    /// for.  Methods without a retry or hedging policy run as a single
    /// attempt through the same machinery.
    ///
    /// The call's token is the composition of the caller's token and the
    /// deadline: when the deadline fires the token is cancelled and the
    /// call commits with DeadlineExceeded.
    pub fn new_call(
        &self,
        service: &str,
        method: &str,
        kind: CallKind,
        launcher: Arc<dyn CallLauncher>,
        caller_token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> ResilientCall {
        let token = caller_token.child_token();
        if let Some(deadline) = deadline {
            let deadline_token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                deadline_token.cancel();
            });
        }

        let buffer = Arc::new(CallBuffer::new(
            self.inner.per_call_buffer_limit,
            self.inner.retry_budget.clone(),
        ));
        let method_config = {
            let config = self.inner.service_config.lock().unwrap();
            config.method_config(service, method).cloned()
        };
        // Calls without a resilience policy never touch the throttle.
        let has_policy = method_config
            .as_ref()
            .map(|mc| mc.retry_policy.is_some() || mc.hedging_policy.is_some())
            .unwrap_or(false);
        let throttle = if has_policy {
            self.inner.throttle.lock().unwrap().clone()
        } else {
            None
        };

        if let Some(hedging) = method_config.as_ref().and_then(|mc| mc.hedging_policy.clone()) {
            return ResilientCall::Hedging(HedgingCall::new(
                launcher,
                hedging,
                throttle,
                buffer,
                token,
                deadline,
                self.inner.max_attempts_limit,
            ));
        }

        let retry_policy = method_config
            .and_then(|mc| mc.retry_policy)
            .unwrap_or_else(single_attempt_policy);
        ResilientCall::Retry(Arc::new(RetryCall::new(
            launcher,
            retry_policy,
            kind,
            throttle,
            buffer,
            token,
            deadline,
            self.inner.max_attempts_limit,
        )))
    }

    /// Shuts the channel down: the resolver and balancer are released, all
    /// subchannels are disposed, and every pending and future pick fails.
    pub fn shutdown(&self) {
        let _ = self.inner.work_tx.send(WorkItem::Shutdown);
    }
}

/// A call bound to the resilience variant its method config selected.
pub enum ResilientCall {
    Retry(Arc<RetryCall>),
    Hedging(Arc<HedgingCall>),
}

impl ResilientCall {
    /// Drives attempts until the call commits.
    pub async fn run(&self) -> CommittedCall {
        match self {
            ResilientCall::Retry(call) => call.run().await,
            ResilientCall::Hedging(call) => call.clone().run().await,
        }
    }

    pub async fn committed(&self) -> CommittedCall {
        match self {
            ResilientCall::Retry(call) => call.committed().await,
            ResilientCall::Hedging(call) => call.committed().await,
        }
    }

    pub async fn write_message(&self, message: bytes::Bytes) -> Result<(), Status> {
        match self {
            ResilientCall::Retry(call) => call.write_message(message).await,
            ResilientCall::Hedging(call) => call.write_message(message).await,
        }
    }
}

/// A no-retry policy: one attempt, nothing retryable.
fn single_attempt_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        initial_backoff: std::time::Duration::ZERO,
        max_backoff: std::time::Duration::ZERO,
        backoff_multiplier: 1.0,
        retryable_status_codes: vec![],
    }
}

/// Picker failures surface as Unavailable unless they already carry a
/// usable code.
fn as_unavailable(status: Status) -> Status {
    if status.code() == Code::Unavailable {
        status
    } else {
        Status::unavailable(format!("pick failed: {}", status.message()))
    }
}

/// Tags a dropped request so the retry and hedging layers never re-attempt
/// it.
fn drop_status(status: Status) -> Status {
    let mut status = status;
    status
        .metadata_mut()
        .insert(GRPC_INTERNAL_DROP_REQUEST, "true".parse().unwrap());
    status
}

struct WorkQueueListener {
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl ResolverListener for WorkQueueListener {
    fn on_update(&self, update: ResolverUpdate) {
        let _ = self.work_tx.send(WorkItem::ResolverUpdate(update));
    }
}

struct WorkQueueScheduler {
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl WorkScheduler for WorkQueueScheduler {
    fn schedule_work(&self) {
        let _ = self.work_tx.send(WorkItem::Work);
    }
}

/// The single task that owns the load balancing policy.  Resolver results,
/// subchannel transitions, scheduled work and shutdown are all serialized
/// through its queue, which is what makes LB mutations totally ordered.
struct ChannelWorker {
    channel: Weak<ActiveChannel>,
    channel_id: u64,
    options: ChannelOptions,
    lb: Option<ChildHandler>,
    /// The most recent service config successfully received from the
    /// resolver, used as a fallback when a later result carries an error.
    cached_config: Option<ServiceConfig>,
    current_lb_entry: Option<(Arc<dyn LbPolicyBuilder>, Option<LbConfig>)>,
    next_subchannel_id: u64,
}

impl ChannelWorker {
    async fn run(mut self, mut work_rx: mpsc::UnboundedReceiver<WorkItem>) {
        while let Some(item) = work_rx.recv().await {
            let Some(channel) = self.channel.upgrade() else {
                return;
            };
            match item {
                WorkItem::ResolverUpdate(update) => {
                    self.handle_resolver_update(&channel, update);
                }
                WorkItem::SubchannelUpdate(subchannel, state) => {
                    if let Some(lb) = self.lb.as_mut() {
                        let mut controller = WorkerController {
                            channel: &channel,
                            worker_fields: WorkerFields {
                                channel_id: self.channel_id,
                                next_subchannel_id: &mut self.next_subchannel_id,
                                options: &self.options,
                            },
                        };
                        lb.subchannel_update(subchannel, &state, &mut controller);
                    }
                }
                WorkItem::Work => {
                    if let Some(lb) = self.lb.as_mut() {
                        let mut controller = WorkerController {
                            channel: &channel,
                            worker_fields: WorkerFields {
                                channel_id: self.channel_id,
                                next_subchannel_id: &mut self.next_subchannel_id,
                                options: &self.options,
                            },
                        };
                        lb.work(&mut controller);
                    }
                }
                WorkItem::Connect => {
                    if let Some(lb) = self.lb.as_mut() {
                        let mut controller = WorkerController {
                            channel: &channel,
                            worker_fields: WorkerFields {
                                channel_id: self.channel_id,
                                next_subchannel_id: &mut self.next_subchannel_id,
                                options: &self.options,
                            },
                        };
                        lb.exit_idle(&mut controller);
                    }
                }
                WorkItem::Shutdown => {
                    // Dropping the balancer drops its subchannels, which
                    // tears down their transports.
                    self.lb = None;
                    channel.publish_state(ConnectivityState::Shutdown, Arc::new(QueuingPicker {}));
                    return;
                }
            }
        }
    }

    /// Resolver-result handling: decide the effective service config, pick
    /// the load balancing policy, and forward the update to the balancer.
    fn handle_resolver_update(&mut self, channel: &Arc<ActiveChannel>, update: ResolverUpdate) {
        let effective_config = match &update.service_config {
            Ok(Some(config)) if !self.options.disable_resolver_service_config => {
                self.cached_config = Some(config.clone());
                config.clone()
            }
            Ok(_) => self
                .cached_config
                .clone()
                .or_else(|| self.options.default_service_config.clone())
                .unwrap_or_default(),
            Err(status) => {
                if let Some(previous) = &self.cached_config {
                    warn!(
                        channel = self.channel_id,
                        error = %status,
                        "resolver service config error, continuing with previous config"
                    );
                    previous.clone()
                } else {
                    warn!(
                        channel = self.channel_id,
                        error = %status,
                        "resolver service config error with no previous config, failing channel"
                    );
                    let error = status.message().to_string();
                    channel.publish_state(
                        ConnectivityState::TransientFailure,
                        Arc::new(crate::client::load_balancing::Failing { error }),
                    );
                    return;
                }
            }
        };

        *channel.service_config.lock().unwrap() = effective_config.clone();
        *channel.throttle.lock().unwrap() = effective_config
            .retry_throttling
            .as_ref()
            .map(|config| Arc::new(RetryThrottle::from_config(config)));

        // The first load balancing entry whose policy name resolves to a
        // known factory wins.
        let lb_entry = effective_config
            .load_balancing_configs
            .iter()
            .find_map(|entry| {
                let builder = GLOBAL_LB_REGISTRY.get_policy(&entry.policy_name)?;
                let parsed = entry
                    .config
                    .as_ref()
                    .and_then(|config| builder.parse_config(config).ok())
                    .flatten();
                Some((builder, parsed))
            });

        match lb_entry {
            Some(entry) => self.current_lb_entry = Some(entry),
            None => {
                if !effective_config.load_balancing_configs.is_empty() {
                    warn!(
                        channel = self.channel_id,
                        "no usable load balancing policy in service config, keeping current"
                    );
                    if self.current_lb_entry.is_none() {
                        channel.publish_state(
                            ConnectivityState::TransientFailure,
                            Arc::new(crate::client::load_balancing::Failing {
                                error: "no supported load balancing policy in service config"
                                    .to_string(),
                            }),
                        );
                        return;
                    }
                } else if self.current_lb_entry.is_none() {
                    let builder = GLOBAL_LB_REGISTRY
                        .get_policy(pick_first::POLICY_NAME)
                        .expect("pick_first is always registered");
                    self.current_lb_entry = Some((builder, None));
                }
            }
        }

        let (builder, child_config) = self.current_lb_entry.as_ref().unwrap();
        let handler_config = LbConfig::new(ChildHandlerConfig {
            child_builder: builder.clone(),
            child_config: child_config.clone(),
        });

        let lb = self.lb.get_or_insert_with(|| {
            ChildHandler::new(Arc::new(WorkQueueScheduler {
                work_tx: channel.work_tx.clone(),
            }))
        });
        let mut controller = WorkerController {
            channel,
            worker_fields: WorkerFields {
                channel_id: self.channel_id,
                next_subchannel_id: &mut self.next_subchannel_id,
                options: &self.options,
            },
        };
        if let Err(e) = lb.resolver_update(update, Some(&handler_config), &mut controller) {
            debug!(channel = self.channel_id, error = %e, "balancer rejected resolver update");
        }
    }
}

struct WorkerFields<'a> {
    channel_id: u64,
    next_subchannel_id: &'a mut u64,
    options: &'a ChannelOptions,
}

/// The ChannelController handed to the balancer: creates wired-up
/// subchannels and publishes picker snapshots.
struct WorkerController<'a> {
    channel: &'a Arc<ActiveChannel>,
    worker_fields: WorkerFields<'a>,
}

impl ChannelController for WorkerController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        *self.worker_fields.next_subchannel_id += 1;
        let id = format!(
            "channel-{}-subchannel-{}",
            self.worker_fields.channel_id, self.worker_fields.next_subchannel_id
        );

        let builder = self
            .worker_fields
            .options
            .transport_builder
            .clone()
            .or_else(|| GLOBAL_TRANSPORT_REGISTRY.get_transport(&address.network_type));
        let transport_options = self.worker_fields.options.transport_options.clone();
        let address_for_transport = address.clone();

        let subchannel = InternalSubchannel::new(
            id,
            vec![address.clone()],
            move |notifier| match builder {
                Some(builder) => builder.build(
                    vec![address_for_transport.clone()],
                    transport_options,
                    notifier,
                ),
                // Unknown network types fall back to the passive transport:
                // the bundled HTTP stack manages its own sockets.
                None => PassiveTransport::new(address_for_transport.clone()),
            },
        );

        {
            let mut subchannels = self.channel.subchannels.lock().unwrap();
            subchannels.retain(|_, weak| weak.strong_count() > 0);
            subchannels.insert(subchannel.id(), Arc::downgrade(&subchannel));
        }

        // Transitions flow back through the work queue so balancer
        // callbacks stay totally ordered with resolver updates.
        let work_tx = self.channel.work_tx.clone();
        let weak = Arc::downgrade(&subchannel);
        subchannel.register_state_watcher(Arc::new(move |state| {
            if let Some(subchannel) = weak.upgrade() {
                let _ = work_tx.send(WorkItem::SubchannelUpdate(subchannel, state));
            }
        }));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.channel
            .publish_state(update.connectivity_state, update.picker);
    }

    fn request_resolution(&mut self) {
        self.channel.resolver.refresh();
    }
}

impl ActiveChannel {
    /// Publishes connectivity and picker atomically, skipping snapshots
    /// that equal the current one so pick waiters are not woken for
    /// nothing.
    fn publish_state(&self, connectivity_state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.state_tx.send_if_modified(|state| {
            if state.connectivity_state == connectivity_state
                && Arc::ptr_eq(&state.picker, &picker)
            {
                return false;
            }
            state.connectivity_state = connectivity_state;
            state.picker = picker;
            state.version += 1;
            true
        });
    }
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        let _ = self.work_tx.send(WorkItem::Shutdown);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::name_resolution::{Endpoint, ManualResolver};
    use crate::client::retry::{AttemptResponse, CallAttempt, CommitReason};
    use crate::client::service_config::{
        LbConfigEntry, MethodConfig, MethodName, RetryThrottlingConfig,
    };
    use crate::client::transport::{
        ConnectContext, ConnectResult, DisconnectNotifier, Transport, TransportStatus,
        TransportStream,
    };
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tonic::async_trait;

    fn new_request() -> Request {
        Request::new(Box::pin(tokio_stream::once(Bytes::new())))
    }

    /// Per-address scripted behavior for the fake transport.
    #[derive(Clone)]
    enum ConnectScript {
        Ok,
        Refuse(&'static str),
    }

    struct FakeTransport {
        address: Address,
        script: ConnectScript,
        /// When set, connects block until released, letting tests observe
        /// the Connecting state deterministically.
        gate: Option<Arc<Notify>>,
        connected: Mutex<Option<Address>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn try_connect(&self, _ctx: &ConnectContext, _attempt: usize) -> ConnectResult {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.script {
                ConnectScript::Ok => {
                    *self.connected.lock().unwrap() = Some(self.address.clone());
                    ConnectResult::Success
                }
                ConnectScript::Refuse(message) => {
                    ConnectResult::Failure(Status::unavailable(*message))
                }
            }
        }

        async fn get_stream(&self, _address: &Address) -> Result<TransportStream, Status> {
            Err(Status::internal("unsupported on the fake transport"))
        }

        fn disconnect(&self) {
            *self.connected.lock().unwrap() = None;
        }

        fn current_address(&self) -> Option<Address> {
            self.connected.lock().unwrap().clone()
        }

        fn connect_timeout(&self) -> Option<Duration> {
            None
        }

        fn status(&self) -> TransportStatus {
            if self.connected.lock().unwrap().is_some() {
                TransportStatus::Passive
            } else {
                TransportStatus::NotConnected
            }
        }
    }

    struct FakeTransportBuilder {
        scripts: Mutex<HashMap<String, ConnectScript>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeTransportBuilder {
        fn new(scripts: &[(&str, ConnectScript)]) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(
                    scripts
                        .iter()
                        .map(|(addr, script)| (addr.to_string(), script.clone()))
                        .collect(),
                ),
                gate: None,
            })
        }

        fn gated(scripts: &[(&str, ConnectScript)], gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(
                    scripts
                        .iter()
                        .map(|(addr, script)| (addr.to_string(), script.clone()))
                        .collect(),
                ),
                gate: Some(gate),
            })
        }
    }

    impl TransportBuilder for FakeTransportBuilder {
        fn build(
            &self,
            addresses: Vec<Address>,
            _options: TransportOptions,
            _on_disconnect: DisconnectNotifier,
        ) -> Arc<dyn Transport> {
            let address = addresses[0].clone();
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&address.address)
                .cloned()
                .unwrap_or(ConnectScript::Ok);
            Arc::new(FakeTransport {
                address,
                script,
                gate: self.gate.clone(),
                connected: Mutex::new(None),
            })
        }

        fn network_type(&self) -> &'static str {
            crate::client::name_resolution::TCP_IP_NETWORK_TYPE
        }
    }

    fn endpoints(addresses: &[&str]) -> Vec<Endpoint> {
        addresses
            .iter()
            .map(|a| Endpoint::new(vec![Address::tcp(*a)]))
            .collect()
    }

    fn channel_with(
        builder: Arc<FakeTransportBuilder>,
        resolver: Arc<ManualResolver>,
    ) -> Channel {
        Channel::new(
            "dns:///test.example.com",
            resolver,
            ChannelOptions {
                transport_builder: Some(builder),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn pick_returns_ready_subchannel() {
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::new(&[("1.1.1.1:1", ConnectScript::Ok)]),
            resolver.clone(),
        );
        resolver.update(ResolverUpdate::with_endpoints(endpoints(&["1.1.1.1:1"])));

        let token = CancellationToken::new();
        let (subchannel, address, _tracker) = channel
            .pick(&new_request(), false, &token)
            .await
            .expect("pick should succeed");
        assert_eq!(address.address, "1.1.1.1:1");
        assert_eq!(subchannel.connectivity_state(), ConnectivityState::Ready);
        assert_eq!(channel.current_state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn state_walks_idle_connecting_ready() {
        let gate = Arc::new(Notify::new());
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::gated(&[("1.1.1.1:1", ConnectScript::Ok)], gate.clone()),
            resolver.clone(),
        );
        assert_eq!(channel.current_state(), ConnectivityState::Idle);

        let token = CancellationToken::new();
        resolver.update(ResolverUpdate::with_endpoints(endpoints(&["1.1.1.1:1"])));

        let state = channel
            .wait_for_state_change(ConnectivityState::Idle, &token)
            .await
            .unwrap();
        assert_eq!(state, ConnectivityState::Connecting);

        gate.notify_one();
        let state = channel
            .wait_for_state_change(ConnectivityState::Connecting, &token)
            .await
            .unwrap();
        assert_eq!(state, ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn failover_to_second_address() {
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::new(&[
                ("1.1.1.1:1", ConnectScript::Refuse("refused")),
                ("2.2.2.2:2", ConnectScript::Ok),
            ]),
            resolver.clone(),
        );
        resolver.update(ResolverUpdate::with_endpoints(endpoints(&[
            "1.1.1.1:1",
            "2.2.2.2:2",
        ])));

        let token = CancellationToken::new();
        let (_subchannel, address, _) = channel
            .pick(&new_request(), false, &token)
            .await
            .expect("pick should succeed");
        assert_eq!(address.address, "2.2.2.2:2");
        assert_eq!(channel.current_state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn round_robin_policy_from_service_config() {
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::new(&[
                ("1.1.1.1:1", ConnectScript::Ok),
                ("2.2.2.2:2", ConnectScript::Ok),
            ]),
            resolver.clone(),
        );

        let config = ServiceConfig {
            load_balancing_configs: vec![
                LbConfigEntry::new("unknown_policy"),
                LbConfigEntry::new("round_robin"),
            ],
            ..Default::default()
        };
        resolver.update(ResolverUpdate {
            endpoints: Ok(endpoints(&["1.1.1.1:1", "2.2.2.2:2"])),
            service_config: Ok(Some(config)),
            ..Default::default()
        });

        let token = CancellationToken::new();
        // Once both backends are ready, consecutive picks rotate over them.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let (_, address, _) = channel.pick(&new_request(), false, &token).await.unwrap();
            seen.insert(address.address);
            if seen.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(seen.len(), 2, "round robin should use both backends");
    }

    #[tokio::test]
    async fn service_config_error_without_cache_fails_channel() {
        let resolver = ManualResolver::new();
        let channel = channel_with(FakeTransportBuilder::new(&[]), resolver.clone());

        resolver.update(ResolverUpdate {
            endpoints: Ok(endpoints(&["1.1.1.1:1"])),
            service_config: Err(Status::invalid_argument("bad service config")),
            ..Default::default()
        });

        let token = CancellationToken::new();
        let err = channel
            .pick(&new_request(), false, &token)
            .await
            .err()
            .expect("pick should fail");
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.message().contains("bad service config"));
        assert_eq!(
            channel.current_state(),
            ConnectivityState::TransientFailure
        );
    }

    #[tokio::test]
    async fn service_config_error_with_cache_keeps_previous() {
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::new(&[("1.1.1.1:1", ConnectScript::Ok)]),
            resolver.clone(),
        );

        resolver.update(ResolverUpdate {
            endpoints: Ok(endpoints(&["1.1.1.1:1"])),
            service_config: Ok(Some(ServiceConfig::default())),
            ..Default::default()
        });
        let token = CancellationToken::new();
        channel.pick(&new_request(), false, &token).await.unwrap();

        // A later result with a config error keeps the cached config and
        // the channel serving.
        resolver.update(ResolverUpdate {
            endpoints: Ok(endpoints(&["1.1.1.1:1"])),
            service_config: Err(Status::invalid_argument("bad service config")),
            ..Default::default()
        });
        tokio::task::yield_now().await;
        let (_, address, _) = channel.pick(&new_request(), false, &token).await.unwrap();
        assert_eq!(address.address, "1.1.1.1:1");
    }

    #[test]
    fn drop_status_disables_retries() {
        let status = drop_status(Status::unavailable("dropped by picker"));
        assert!(crate::client::retry::is_drop_request(status.metadata()));
    }

    #[test]
    fn pick_failures_surface_as_unavailable() {
        let status = as_unavailable(Status::internal("broken picker"));
        assert_eq!(status.code(), Code::Unavailable);
        assert!(status.message().contains("broken picker"));
    }

    #[tokio::test]
    async fn pick_stream_routes_to_picked_transport() {
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::new(&[("1.1.1.1:1", ConnectScript::Ok)]),
            resolver.clone(),
        );
        resolver.update(ResolverUpdate::with_endpoints(endpoints(&["1.1.1.1:1"])));

        // The pick succeeds and the request reaches the picked subchannel's
        // transport, which is where the fake draws the line.
        let token = CancellationToken::new();
        let err = channel
            .pick_stream(&new_request(), false, &token)
            .await
            .err()
            .expect("fake transport cannot hand out streams");
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("unsupported on the fake transport"));
    }

    #[tokio::test]
    async fn authority_comes_from_target_path() {
        let resolver = ManualResolver::new();
        let channel = channel_with(FakeTransportBuilder::new(&[]), resolver);
        assert_eq!(channel.authority(), "test.example.com");
    }

    #[tokio::test]
    async fn pick_cancellation_unblocks() {
        let resolver = ManualResolver::new();
        let channel = channel_with(FakeTransportBuilder::new(&[]), resolver);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        // No resolver update ever arrives: the pick queues until cancelled.
        let err = channel
            .pick(&new_request(), false, &token)
            .await
            .err()
            .expect("pick should be cancelled");
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn shutdown_fails_picks() {
        let resolver = ManualResolver::new();
        let channel = channel_with(FakeTransportBuilder::new(&[]), resolver);

        channel.shutdown();
        let token = CancellationToken::new();
        let err = channel
            .pick(&new_request(), false, &token)
            .await
            .err()
            .expect("pick should fail after shutdown");
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(channel.current_state(), ConnectivityState::Shutdown);
    }

    struct CountingAttempt;

    #[async_trait]
    impl CallAttempt for CountingAttempt {
        async fn response(&self) -> AttemptResponse {
            AttemptResponse::Status(Status::unavailable("backend down"))
        }

        async fn final_status(&self) -> Status {
            Status::unavailable("backend down")
        }

        async fn write(&self, _message: Bytes) -> Result<(), Status> {
            Ok(())
        }

        fn cancel(&self) {}
    }

    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl CallLauncher for CountingLauncher {
        async fn launch(&self, _attempt: usize) -> Result<Arc<dyn CallAttempt>, Status> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingAttempt))
        }
    }

    fn retrying_service_config() -> ServiceConfig {
        ServiceConfig {
            method_configs: vec![MethodConfig {
                names: vec![MethodName {
                    service: "echo.Echo".to_string(),
                    method: String::new(),
                }],
                retry_policy: Some(RetryPolicy {
                    max_attempts: 3,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(2),
                    backoff_multiplier: 1.0,
                    retryable_status_codes: vec![Code::Unavailable],
                }),
                hedging_policy: None,
            }],
            retry_throttling: Some(RetryThrottlingConfig {
                max_tokens: 100,
                token_ratio: 0.1,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_call_applies_method_retry_policy() {
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::new(&[("1.1.1.1:1", ConnectScript::Ok)]),
            resolver.clone(),
        );
        resolver.update(ResolverUpdate {
            endpoints: Ok(endpoints(&["1.1.1.1:1"])),
            service_config: Ok(Some(retrying_service_config())),
            ..Default::default()
        });
        // Let the worker install the config.
        let token = CancellationToken::new();
        channel.pick(&new_request(), false, &token).await.unwrap();

        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let call = channel.new_call(
            "echo.Echo",
            "UnaryEcho",
            CallKind::Unary,
            launcher.clone(),
            &token,
            None,
        );
        let committed = call.run().await;
        assert_eq!(committed.reason, CommitReason::AttemptsExhausted);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn new_call_without_policy_is_single_attempt() {
        let resolver = ManualResolver::new();
        let channel = channel_with(
            FakeTransportBuilder::new(&[("1.1.1.1:1", ConnectScript::Ok)]),
            resolver.clone(),
        );
        resolver.update(ResolverUpdate::with_endpoints(endpoints(&["1.1.1.1:1"])));
        let token = CancellationToken::new();
        channel.pick(&new_request(), false, &token).await.unwrap();

        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let call = channel.new_call(
            "other.Service",
            "Method",
            CallKind::Unary,
            launcher.clone(),
            &token,
            None,
        );
        let committed = call.run().await;
        assert_eq!(committed.reason, CommitReason::AttemptsExhausted);
        assert_eq!(committed.status.unwrap().code(), Code::Unavailable);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }
}
