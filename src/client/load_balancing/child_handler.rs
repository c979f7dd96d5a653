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

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use tracing::debug;

use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Subchannel,
    SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::ConnectivityState;

/// Configuration handed to the ChildHandler: the builder of the child policy
/// chosen from the service config, plus that child's own parsed config.
pub(crate) struct ChildHandlerConfig {
    pub child_builder: Arc<dyn LbPolicyBuilder>,
    pub child_config: Option<LbConfig>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ChildKind {
    Current,
    Pending,
}

struct Child {
    name: &'static str,
    policy: Box<dyn LbPolicy>,
    state: ConnectivityState,
    /// The child's most recent picker, held back until the child is
    /// promoted to current.
    cached_picker: Option<LbState>,
}

/// The meta-balancer that gracefully switches between LB policies when the
/// service config changes.
///
/// It holds a current child serving picks and, during a switch, a pending
/// child warming up.  The pending child's picker updates are cached, not
/// published; the swap happens once the pending child leaves Connecting (or
/// the current one stops being Ready), at which point the previous current
/// child is disposed.
pub(crate) struct ChildHandler {
    work_scheduler: Arc<dyn WorkScheduler>,
    current: Option<Child>,
    pending: Option<Child>,
    /// Which child each created subchannel belongs to, by subchannel id.
    subchannel_to_child: HashMap<String, ChildKind>,
}

impl ChildHandler {
    pub(crate) fn new(work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            work_scheduler,
            current: None,
            pending: None,
            subchannel_to_child: HashMap::new(),
        }
    }

    fn latest_child_name(&self) -> Option<&'static str> {
        self.pending
            .as_ref()
            .or(self.current.as_ref())
            .map(|child| child.name)
    }

    fn child_mut(&mut self, kind: ChildKind) -> Option<&mut Child> {
        match kind {
            ChildKind::Current => self.current.as_mut(),
            ChildKind::Pending => self.pending.as_mut(),
        }
    }

    /// Applies a child's buffered effects: records its picker (publishing
    /// only for the current child), maps any subchannels it created, and
    /// swaps if the switch condition is met.
    fn resolve_child_controller(
        &mut self,
        mut wrapped: WrappedController<'_>,
        child_kind: ChildKind,
    ) {
        let picker_update = wrapped.picker_update.take();
        let created = std::mem::take(&mut wrapped.created_subchannels);
        let inner = wrapped.into_inner();

        match child_kind {
            ChildKind::Pending => {
                if let (Some(pending), Some(picker)) = (self.pending.as_mut(), picker_update) {
                    pending.state = picker.connectivity_state;
                    pending.cached_picker = Some(picker);
                }
            }
            ChildKind::Current => {
                if let (Some(current), Some(picker)) = (self.current.as_mut(), picker_update) {
                    current.state = picker.connectivity_state;
                    inner.update_picker(picker);
                }
            }
        }

        // Swap when the pending child has left Connecting, or the current
        // one can no longer serve.
        let should_swap = match (&self.current, &self.pending) {
            (Some(current), Some(pending)) => {
                current.state != ConnectivityState::Ready
                    || pending.state != ConnectivityState::Connecting
            }
            _ => false,
        };
        let mut final_kind = child_kind;
        if should_swap {
            self.swap(inner);
            final_kind = ChildKind::Current;
        }

        for subchannel in created {
            self.subchannel_to_child
                .entry(subchannel.id())
                .or_insert(final_kind);
        }
    }

    /// Promotes the pending child, disposing the previous current child and
    /// publishing the promoted child's cached picker.
    fn swap(&mut self, channel_controller: &mut dyn ChannelController) {
        debug!("child handler swapping to pending policy");
        self.current = self.pending.take();
        self.subchannel_to_child
            .retain(|_, kind| *kind == ChildKind::Pending);
        for kind in self.subchannel_to_child.values_mut() {
            *kind = ChildKind::Current;
        }

        if let Some(current) = self.current.as_mut() {
            if let Some(picker) = current.cached_picker.take() {
                current.state = picker.connectivity_state;
                channel_controller.update_picker(picker);
            }
        }
    }
}

impl LbPolicy for ChildHandler {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let cfg: Arc<ChildHandlerConfig> = config
            .and_then(|c| c.convert_to())
            .ok_or("child handler requires a ChildHandlerConfig")?;

        let needs_switch = self.latest_child_name() != Some(cfg.child_builder.name());
        let target = if needs_switch {
            let policy = cfg.child_builder.build(LbPolicyOptions {
                work_scheduler: self.work_scheduler.clone(),
            });
            let child = Child {
                name: cfg.child_builder.name(),
                policy,
                state: ConnectivityState::Connecting,
                cached_picker: None,
            };
            if self.current.is_none() {
                self.current = Some(child);
                ChildKind::Current
            } else {
                // A previous pending child that never finished warming up is
                // replaced outright, along with its subchannel mappings.
                if self.pending.take().is_some() {
                    self.subchannel_to_child
                        .retain(|_, kind| *kind == ChildKind::Current);
                }
                self.pending = Some(child);
                ChildKind::Pending
            }
        } else if self.pending.is_some() {
            ChildKind::Pending
        } else {
            ChildKind::Current
        };

        let mut wrapped = WrappedController::new(channel_controller);
        let result = match self.child_mut(target) {
            Some(child) => {
                child
                    .policy
                    .resolver_update(update, cfg.child_config.as_ref(), &mut wrapped)
            }
            None => Ok(()),
        };
        self.resolve_child_controller(wrapped, target);
        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(kind) = self.subchannel_to_child.get(&subchannel.id()).copied() else {
            // Updates for subchannels of disposed children arrive late;
            // drop them.
            debug!(subchannel = %subchannel, "dropping update from unknown child");
            return;
        };
        let mut wrapped = WrappedController::new(channel_controller);
        if let Some(child) = self.child_mut(kind) {
            child.policy.subchannel_update(subchannel, state, &mut wrapped);
        }
        self.resolve_child_controller(wrapped, kind);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut wrapped = WrappedController::new(channel_controller);
        let kind = if self.pending.is_some() {
            ChildKind::Pending
        } else {
            ChildKind::Current
        };
        if let Some(child) = self.child_mut(kind) {
            child.policy.work(&mut wrapped);
        }
        self.resolve_child_controller(wrapped, kind);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut wrapped = WrappedController::new(channel_controller);
        let kind = if self.pending.is_some() {
            ChildKind::Pending
        } else {
            ChildKind::Current
        };
        if let Some(child) = self.child_mut(kind) {
            child.policy.exit_idle(&mut wrapped);
        }
        self.resolve_child_controller(wrapped, kind);
    }
}

/// Buffers a child's picker update and subchannel creations so the handler
/// can decide what to publish and who owns what.
struct WrappedController<'a> {
    inner: &'a mut dyn ChannelController,
    picker_update: Option<LbState>,
    created_subchannels: Vec<Arc<dyn Subchannel>>,
}

impl<'a> WrappedController<'a> {
    fn new(inner: &'a mut dyn ChannelController) -> Self {
        Self {
            inner,
            picker_update: None,
            created_subchannels: Vec::new(),
        }
    }

    fn into_inner(self) -> &'a mut dyn ChannelController {
        self.inner
    }
}

impl ChannelController for WrappedController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = self.inner.new_subchannel(address);
        self.created_subchannels.push(subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        // Only the newest update matters; the handler publishes or caches
        // it after the child returns.
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.inner.request_resolution();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::load_balancing::test_utils::{
        new_request, TestChannelController, TestEvent, TestWorkScheduler,
    };
    use crate::client::load_balancing::{PickResult, Picker};
    use crate::client::name_resolution::Endpoint;
    use crate::service::Request;
    use tokio::sync::mpsc;
    use tonic::Status;

    /// A child policy that creates one subchannel per update and publishes a
    /// picker naming itself, with a configurable connectivity state.
    struct StubPolicy {
        name: &'static str,
        report_state: ConnectivityState,
    }

    struct NamedPicker {
        name: &'static str,
    }

    impl Picker for NamedPicker {
        fn pick(&self, _request: &Request) -> PickResult {
            PickResult::Fail(Status::unavailable(self.name))
        }
    }

    impl LbPolicy for StubPolicy {
        fn resolver_update(
            &mut self,
            update: ResolverUpdate,
            _config: Option<&LbConfig>,
            channel_controller: &mut dyn ChannelController,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            for endpoint in update.endpoints.unwrap_or_default() {
                for address in &endpoint.addresses {
                    channel_controller.new_subchannel(address);
                }
            }
            channel_controller.update_picker(LbState {
                connectivity_state: self.report_state,
                picker: Arc::new(NamedPicker { name: self.name }),
            });
            Ok(())
        }

        fn subchannel_update(
            &mut self,
            _subchannel: Arc<dyn Subchannel>,
            state: &SubchannelState,
            channel_controller: &mut dyn ChannelController,
        ) {
            channel_controller.update_picker(LbState {
                connectivity_state: state.connectivity_state,
                picker: Arc::new(NamedPicker { name: self.name }),
            });
        }

        fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

        fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {}
    }

    struct StubBuilder {
        name: &'static str,
        report_state: ConnectivityState,
    }

    impl LbPolicyBuilder for StubBuilder {
        fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
            Box::new(StubPolicy {
                name: self.name,
                report_state: self.report_state,
            })
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    fn setup() -> (
        mpsc::UnboundedReceiver<TestEvent>,
        ChildHandler,
        TestChannelController,
    ) {
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let work_scheduler = Arc::new(TestWorkScheduler {
            tx_events: tx_events.clone(),
        });
        let controller = TestChannelController {
            tx_events: tx_events.clone(),
        };
        (rx_events, ChildHandler::new(work_scheduler), controller)
    }

    fn handler_config(
        name: &'static str,
        report_state: ConnectivityState,
    ) -> LbConfig {
        LbConfig::new(ChildHandlerConfig {
            child_builder: Arc::new(StubBuilder { name, report_state }),
            child_config: None,
        })
    }

    fn addresses_update() -> ResolverUpdate {
        ResolverUpdate::with_endpoints(vec![Endpoint::new(vec![Address::tcp("1.1.1.1:1")])])
    }

    fn picker_name(state: &LbState) -> String {
        match state.picker.pick(&new_request()) {
            PickResult::Fail(status) => status.message().to_string(),
            _ => panic!("expected Fail from NamedPicker"),
        }
    }

    #[tokio::test]
    async fn first_config_creates_current_child() {
        let (mut rx, mut handler, mut controller) = setup();

        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_a", ConnectivityState::Ready)),
                &mut controller,
            )
            .unwrap();

        // The first child is current: its subchannel and its picker are
        // published directly.
        assert!(matches!(
            rx.recv().await.unwrap(),
            TestEvent::NewSubchannel(_)
        ));
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(picker_name(&state), "stub_a");
                assert_eq!(state.connectivity_state, ConnectivityState::Ready);
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_child_picker_is_held_back_while_current_is_ready() {
        let (mut rx, mut handler, mut controller) = setup();

        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_a", ConnectivityState::Ready)),
                &mut controller,
            )
            .unwrap();
        rx.recv().await.unwrap(); // NewSubchannel
        rx.recv().await.unwrap(); // UpdatePicker stub_a

        // New policy name: a pending child spawns.  It reports Connecting,
        // so no swap happens and its picker stays cached.
        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_b", ConnectivityState::Connecting)),
                &mut controller,
            )
            .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            TestEvent::NewSubchannel(_)
        ));
        assert!(rx.try_recv().is_err(), "pending picker must not publish");
    }

    #[tokio::test]
    async fn pending_child_promotes_when_it_leaves_connecting() {
        let (mut rx, mut handler, mut controller) = setup();

        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_a", ConnectivityState::Ready)),
                &mut controller,
            )
            .unwrap();
        rx.recv().await.unwrap(); // NewSubchannel (stub_a)
        rx.recv().await.unwrap(); // UpdatePicker stub_a

        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_b", ConnectivityState::Connecting)),
                &mut controller,
            )
            .unwrap();
        let pending_sc = match rx.recv().await.unwrap() {
            TestEvent::NewSubchannel(sc) => sc,
            other => panic!("expected NewSubchannel, got {other:?}"),
        };

        // The pending child's subchannel goes Ready: the stub republishes a
        // Ready picker, the handler swaps and publishes it.
        let pending_dyn: Arc<dyn Subchannel> = pending_sc.clone();
        handler.subchannel_update(
            pending_dyn.clone(),
            &SubchannelState {
                connectivity_state: ConnectivityState::Ready,
                last_status: None,
            },
            &mut controller,
        );
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(picker_name(&state), "stub_b");
                assert_eq!(state.connectivity_state, ConnectivityState::Ready);
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }

        // The old child is gone: its subchannel updates are dropped.
        handler.subchannel_update(pending_dyn, &SubchannelState::default(), &mut controller);
        // (the pending subchannel now belongs to current, so this one still
        // routes; create a fake unknown subchannel instead)
        let (tx, _rx2) = mpsc::unbounded_channel();
        let unknown: Arc<dyn Subchannel> = Arc::new(
            crate::client::load_balancing::test_utils::TestSubchannel::new(
                Address::tcp("9.9.9.9:9"),
                tx,
            ),
        );
        handler.subchannel_update(unknown, &SubchannelState::default(), &mut controller);
    }

    #[tokio::test]
    async fn swap_happens_immediately_when_current_not_ready() {
        let (mut rx, mut handler, mut controller) = setup();

        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_a", ConnectivityState::TransientFailure)),
                &mut controller,
            )
            .unwrap();
        rx.recv().await.unwrap(); // NewSubchannel
        rx.recv().await.unwrap(); // UpdatePicker stub_a (TF)

        // The current child is failing, so the new child swaps in as soon
        // as it reports, Connecting or not.
        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_b", ConnectivityState::Connecting)),
                &mut controller,
            )
            .unwrap();
        rx.recv().await.unwrap(); // NewSubchannel (stub_b)
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(picker_name(&state), "stub_b");
                assert_eq!(state.connectivity_state, ConnectivityState::Connecting);
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_config_routes_to_existing_child() {
        let (mut rx, mut handler, mut controller) = setup();

        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_a", ConnectivityState::Ready)),
                &mut controller,
            )
            .unwrap();
        rx.recv().await.unwrap(); // NewSubchannel
        rx.recv().await.unwrap(); // UpdatePicker

        // Same policy name again: no pending child, the update goes to the
        // current one (which creates another subchannel and republishes).
        handler
            .resolver_update(
                addresses_update(),
                Some(&handler_config("stub_a", ConnectivityState::Ready)),
                &mut controller,
            )
            .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            TestEvent::NewSubchannel(_)
        ));
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => assert_eq!(picker_name(&state), "stub_a"),
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
    }
}
