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

use std::{
    collections::{HashMap, HashSet},
    error::Error,
    sync::{Arc, LazyLock, Mutex},
};

use serde::{Deserialize, Serialize};
use tonic::{metadata::MetadataMap, Status};
use tracing::debug;

use crate::client::{
    load_balancing::{
        ChannelController, Failing, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Pick,
        PickResult, Picker, QueuingPicker, Subchannel, SubchannelState, WorkScheduler,
    },
    name_resolution::{Address, Endpoint, ResolverUpdate},
    service_config::{LbConfig, ParsedJsonLbConfig},
    ConnectivityState,
};
use crate::service::Request;

// A function type that takes a mutable slice of endpoints and shuffles them.
type EndpointShuffler = dyn Fn(&mut [Endpoint]) + Send + Sync + 'static;

// A global shuffler function that can be overridden for testing.
pub(crate) static SHUFFLE_ENDPOINTS_FN: LazyLock<Mutex<Box<EndpointShuffler>>> =
    LazyLock::new(|| Mutex::new(thread_rng_shuffler()));

pub(crate) fn thread_rng_shuffler() -> Box<EndpointShuffler> {
    Box::new(|endpoints: &mut [Endpoint]| {
        use rand::seq::SliceRandom;
        let mut rng = rand::rng();
        endpoints.shuffle(&mut rng);
    })
}

pub static POLICY_NAME: &str = "pick_first";

/// Builds pick_first policies.  Registered with the global LB registry at
/// first use.
pub(crate) struct PickFirstBuilder {}

impl LbPolicyBuilder for PickFirstBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            subchannel_list: None,
            selected_subchannel: None,
            addresses: vec![],
            last_resolver_error: None,
            last_connection_error: None,
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
            num_transient_failures: 0,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = match config.convert_to() {
            Ok(c) => c,
            Err(e) => {
                return Err(format!("failed to parse JSON config: {}", e).into());
            }
        };
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(super) struct PickFirstConfig {
    shuffle_address_list: Option<bool>,
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    subchannel_list: Option<SubchannelList>, // Subchannels we are currently connecting to.
    selected_subchannel: Option<Arc<dyn Subchannel>>, // The currently connected subchannel.
    addresses: Vec<Address>,                 // Most recent addresses from the name resolver.
    last_resolver_error: Option<String>,     // Most recent error from the name resolver.
    last_connection_error: Option<Status>,   // Most recent error from any subchannel.
    connectivity_state: ConnectivityState,   // Overall connectivity state of the channel.
    sent_connecting_state: bool, // Whether we have sent a CONNECTING state to the channel.
    num_transient_failures: usize, // Number of transient failures after the end of the first pass.
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(mut endpoints) => {
                // Shuffle endpoints if requested in the LB config.
                if let Some(err) = self.shuffle_endpoints(config, &mut endpoints) {
                    return Err(err);
                }

                let new_addresses: Vec<Address> = self.address_list_from_endpoints(&endpoints);

                // Treat empty resolver updates identically to resolver errors
                // that occur before any valid update has been received.
                if new_addresses.is_empty() {
                    self.handle_empty_endpoints(channel_controller);
                    return Err("received empty address list from the name resolver".into());
                }

                // Start using the new address list unless in IDLE, in which
                // case exit_idle takes care of it.
                if self.connectivity_state != ConnectivityState::Idle {
                    self.subchannel_list =
                        Some(SubchannelList::new(&new_addresses, channel_controller));
                }
                self.addresses = new_addresses;
            }
            Err(error) => {
                debug!(%error, "pick_first received error from resolver");
                self.last_resolver_error = Some(error);

                // Enter or stay in TransientFailure if there is no good
                // previous update from the resolver, or if already failing.
                // Either way the failing picker carries the new error.
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(channel_controller);
                }

                // Continue using the previous good update, if one exists.
            }
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Handle the update for this subchannel, provided it's included in
        // the subchannel list (if the list exists).
        if let Some(subchannel_list) = &self.subchannel_list {
            if subchannel_list.contains(&subchannel) {
                if state.connectivity_state == ConnectivityState::Ready {
                    self.move_to_ready(subchannel, channel_controller);
                } else {
                    self.update_tracked_subchannel(subchannel, state, channel_controller);
                }
                return;
            }
        }

        // Handle updates for the currently selected subchannel.  Any state
        // change for the currently connected subchannel means that we are no
        // longer connected.
        if let Some(selected) = &self.selected_subchannel {
            if selected.id() == subchannel.id() {
                self.move_to_idle(channel_controller);
                return;
            }
        }

        debug!(subchannel = %subchannel, "pick_first ignoring update for unknown subchannel");
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Build a new subchannel list with the most recent addresses
        // received from the name resolver.  This will start connecting from
        // the first address in the list.
        self.subchannel_list = Some(SubchannelList::new(&self.addresses, channel_controller));
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state != ConnectivityState::Idle {
            return;
        }
        self.connectivity_state = ConnectivityState::Connecting;
        self.work(channel_controller);
    }
}

impl PickFirstPolicy {
    fn shuffle_endpoints(
        &self,
        config: Option<&LbConfig>,
        endpoints: &mut [Endpoint],
    ) -> Option<Box<dyn Error + Send + Sync>> {
        let Some(config) = config else {
            return None;
        };
        let Some(cfg) = config.convert_to::<PickFirstConfig>() else {
            return Some("pick_first config has the wrong type".into());
        };
        if cfg.shuffle_address_list.unwrap_or(false) {
            // The shuffling changes the order of the endpoints but not the
            // order of the addresses within each endpoint.
            SHUFFLE_ENDPOINTS_FN.lock().unwrap()(endpoints);
        }
        None
    }

    fn address_list_from_endpoints(&self, endpoints: &[Endpoint]) -> Vec<Address> {
        // Flatten the endpoints list by concatenating the ordered list of
        // addresses for each of the endpoints.
        let mut addresses: Vec<Address> = endpoints
            .iter()
            .flat_map(|ep| ep.addresses.clone())
            .collect();

        // Remove duplicates.
        let mut uniques = HashSet::new();
        addresses.retain(|e| uniques.insert(e.clone()));

        addresses
    }

    // Handles the case when the resolver returns an empty address list.
    // Resets internal state and moves to TransientFailure.
    fn handle_empty_endpoints(&mut self, channel_controller: &mut dyn ChannelController) {
        self.subchannel_list = None;
        self.selected_subchannel = None;
        self.addresses = vec![];
        self.last_resolver_error =
            Some(String::from("received empty address list from the name resolver"));
        self.move_to_transient_failure(channel_controller);
    }

    // Handles updates for subchannels currently in the subchannel list.
    fn update_tracked_subchannel(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let subchannel_list = self.subchannel_list.as_mut().unwrap();

        // Update subchannel data.  Return early if not all subchannels have
        // seen their first state update.
        let old_state = subchannel_list.update_subchannel_data(&subchannel, state);
        if !subchannel_list.all_subchannels_seen_initial_state() {
            return;
        }

        // Handle the last subchannel to report its initial state.
        if old_state.is_none() {
            if self.selected_subchannel.is_some() {
                // Close the selected subchannel and go Idle because it is no
                // longer part of the most recent update from the resolver.
                self.move_to_idle(channel_controller);
            } else if !subchannel_list.connect_to_next_subchannel() {
                debug!("pick_first failed to initiate connection to the first subchannel");
            }
            return;
        }

        match state.connectivity_state {
            ConnectivityState::Idle => {
                // Immediately connect to subchannels transitioning to Idle
                // once the first pass is complete.
                if subchannel_list.is_first_pass_complete() {
                    subchannel.connect();
                }
            }
            ConnectivityState::Connecting => {
                if self.connectivity_state == ConnectivityState::Connecting
                    && self.sent_connecting_state
                {
                    return;
                }
                if self.connectivity_state != ConnectivityState::TransientFailure {
                    self.move_to_connecting(channel_controller);
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_status.clone();

                if !subchannel_list.is_first_pass_complete() {
                    // Connect to the next subchannel in the list.
                    if !subchannel_list.connect_to_next_subchannel() {
                        // End of the first pass: report failure, ask for
                        // fresh addresses, and keep trying everything.
                        self.move_to_transient_failure(channel_controller);
                        self.subchannel_list
                            .as_mut()
                            .unwrap()
                            .connect_to_all_idle_subchannels();
                    }
                } else {
                    self.num_transient_failures += 1;
                    if self.num_transient_failures == self.subchannel_list.as_ref().unwrap().len() {
                        self.move_to_transient_failure(channel_controller);
                        self.num_transient_failures = 0;
                    }
                }
            }
            _ => {
                debug!(
                    subchannel = %subchannel,
                    state = %state.connectivity_state,
                    "pick_first ignoring unexpected subchannel transition"
                );
            }
        }
    }

    fn move_to_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Idle;
        self.subchannel_list = None;
        self.selected_subchannel = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
        self.sent_connecting_state = true;
    }

    fn move_to_ready(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.connectivity_state = ConnectivityState::Ready;
        self.selected_subchannel = Some(subchannel.clone());
        self.subchannel_list = None;
        self.last_connection_error = None;
        self.last_resolver_error = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { sc: subchannel }),
        });
        self.sent_connecting_state = false;
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let error = format!(
            "last seen resolver error: {:?}, last seen connection error: {:?}",
            self.last_resolver_error, self.last_connection_error,
        );
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    sc: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.sc.clone(),
            on_complete: None,
            metadata: MetadataMap::new(),
        })
    }
}

// A picker that always queues picks and schedules work.  This triggers the
// LB policy to start connecting from the first address.
pub(crate) struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _request: &Request) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}

// Data tracked for each subchannel in the subchannel list.
#[derive(Clone)]
struct SubchannelData {
    state: Option<SubchannelState>,
    seen_transient_failure: bool,
}

impl SubchannelData {
    fn new() -> SubchannelData {
        SubchannelData {
            state: None,
            seen_transient_failure: false,
        }
    }
}

// A list of subchannels created from the most recent address list from the
// resolver.
//
// The list tracks the state of each subchannel, and helps to manage
// connection attempts to the subchannels in the list.
struct SubchannelList {
    subchannels: HashMap<String, SubchannelData>,
    ordered_subchannels: Vec<Arc<dyn Subchannel>>,
    current_idx: usize,
    num_initial_notifications_seen: usize,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let mut scl = SubchannelList {
            subchannels: HashMap::new(),
            ordered_subchannels: Vec::new(),
            current_idx: 0,
            num_initial_notifications_seen: 0,
        };
        for address in addresses {
            let sc = channel_controller.new_subchannel(address);
            scl.ordered_subchannels.push(sc.clone());
            scl.subchannels.insert(sc.id(), SubchannelData::new());
        }
        scl
    }

    fn len(&self) -> usize {
        self.ordered_subchannels.len()
    }

    fn contains(&self, sc: &Arc<dyn Subchannel>) -> bool {
        self.subchannels.contains_key(&sc.id())
    }

    // Updates internal state of the subchannel with the new state.  Callers
    // must ensure that this method is called only for subchannels in the
    // list.
    //
    // Returns the old state corresponding to the subchannel, if one exists.
    fn update_subchannel_data(
        &mut self,
        sc: &Arc<dyn Subchannel>,
        state: &SubchannelState,
    ) -> Option<SubchannelState> {
        let sc_data = self.subchannels.get_mut(&sc.id()).unwrap();

        // Increment the counter when seeing the first update.
        if sc_data.state.is_none() {
            self.num_initial_notifications_seen += 1;
        }

        let old_state = sc_data.state.clone();
        sc_data.state = Some(state.clone());
        match state.connectivity_state {
            ConnectivityState::Ready => sc_data.seen_transient_failure = false,
            ConnectivityState::TransientFailure => sc_data.seen_transient_failure = true,
            _ => {}
        }

        old_state
    }

    fn all_subchannels_seen_initial_state(&self) -> bool {
        self.num_initial_notifications_seen == self.ordered_subchannels.len()
    }

    // Initiates a connection attempt on the next subchannel in the list that
    // is Idle.  Returns false if there are no more subchannels in the list.
    fn connect_to_next_subchannel(&mut self) -> bool {
        // Special case for the first connection attempt, as current_idx is
        // set to 0 when the subchannel list is created.
        if self.current_idx != 0 {
            self.current_idx += 1;
        }

        for idx in self.current_idx..self.ordered_subchannels.len() {
            let sc = &self.ordered_subchannels[idx];
            let sc_data = self.subchannels.get(&sc.id()).unwrap();

            match &sc_data.state {
                Some(state) => match state.connectivity_state {
                    ConnectivityState::Connecting | ConnectivityState::TransientFailure => {
                        self.current_idx += 1;
                        continue;
                    }
                    ConnectivityState::Idle => {
                        sc.connect();
                        return true;
                    }
                    _ => {}
                },
                None => {
                    debug!(subchannel = %sc, "no state available when asked to connect");
                }
            }
        }
        false
    }

    fn is_first_pass_complete(&self) -> bool {
        if self.current_idx < self.ordered_subchannels.len() {
            return false;
        }
        self.subchannels.values().all(|data| data.seen_transient_failure)
    }

    fn connect_to_all_idle_subchannels(&mut self) {
        for sc in &self.ordered_subchannels {
            let data = self.subchannels.get(&sc.id()).unwrap();
            if let Some(state) = &data.state {
                if state.connectivity_state == ConnectivityState::Idle {
                    sc.connect();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::load_balancing::test_utils::{
        new_request, TestChannelController, TestEvent, TestSubchannel, TestWorkScheduler,
    };
    use crate::client::load_balancing::GLOBAL_LB_REGISTRY;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tonic::Code;

    #[test]
    fn builder_name() {
        let builder = GLOBAL_LB_REGISTRY
            .get_policy(POLICY_NAME)
            .expect("pick_first LB policy not registered");
        assert_eq!(builder.name(), "pick_first");
    }

    #[test]
    fn builder_parse_config() {
        let builder = GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).unwrap();

        struct TestCase {
            config: ParsedJsonLbConfig,
            want_shuffle: Option<bool>,
        }
        let test_cases = vec![
            TestCase {
                config: ParsedJsonLbConfig::from_value(json!({})),
                want_shuffle: None,
            },
            TestCase {
                config: ParsedJsonLbConfig::from_value(json!({"shuffleAddressList": false})),
                want_shuffle: Some(false),
            },
            TestCase {
                config: ParsedJsonLbConfig::from_value(json!({"shuffleAddressList": true})),
                want_shuffle: Some(true),
            },
        ];
        for tc in test_cases {
            let config = builder
                .parse_config(&tc.config)
                .unwrap_or_else(|e| panic!("parse_config({:?}) failed: {e}", tc.config))
                .expect("parse_config returned None");
            let got: Arc<PickFirstConfig> = config.convert_to().unwrap();
            assert_eq!(got.shuffle_address_list, tc.want_shuffle);
        }
    }

    // Sets up the test environment: a work scheduler, a fake channel acting
    // as the channel controller, and a pick_first LB policy.
    fn setup() -> (
        mpsc::UnboundedReceiver<TestEvent>,
        Box<dyn LbPolicy>,
        TestChannelController,
    ) {
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let work_scheduler = Arc::new(TestWorkScheduler {
            tx_events: tx_events.clone(),
        });
        let controller = TestChannelController {
            tx_events: tx_events.clone(),
        };
        let policy = GLOBAL_LB_REGISTRY
            .get_policy(POLICY_NAME)
            .unwrap()
            .build(LbPolicyOptions { work_scheduler });
        (rx_events, policy, controller)
    }

    fn update_with_addresses(addresses: &[&str]) -> ResolverUpdate {
        ResolverUpdate::with_endpoints(
            addresses
                .iter()
                .map(|a| Endpoint::new(vec![Address::tcp(*a)]))
                .collect(),
        )
    }

    async fn expect_new_subchannel(
        rx: &mut mpsc::UnboundedReceiver<TestEvent>,
    ) -> Arc<TestSubchannel> {
        match rx.recv().await.unwrap() {
            TestEvent::NewSubchannel(sc) => sc,
            other => panic!("expected NewSubchannel, got {other:?}"),
        }
    }

    async fn expect_connect(rx: &mut mpsc::UnboundedReceiver<TestEvent>, want: &Address) {
        match rx.recv().await.unwrap() {
            TestEvent::Connect(addr) => assert_eq!(addr, *want),
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    fn idle_state() -> SubchannelState {
        SubchannelState::default()
    }

    fn tf_state(message: &str) -> SubchannelState {
        SubchannelState {
            connectivity_state: ConnectivityState::TransientFailure,
            last_status: Some(Status::unavailable(message)),
        }
    }

    #[tokio::test]
    async fn connects_to_first_address() {
        let (mut rx, mut policy, mut controller) = setup();

        policy
            .resolver_update(update_with_addresses(&["1.1.1.1:1", "2.2.2.2:2"]), None, &mut controller)
            .unwrap();

        let sc1 = expect_new_subchannel(&mut rx).await;
        let sc2 = expect_new_subchannel(&mut rx).await;

        // Initial Idle notifications for every subchannel; on the last one
        // the policy starts connecting from the front of the list.
        let sc1_dyn: Arc<dyn Subchannel> = sc1.clone();
        let sc2_dyn: Arc<dyn Subchannel> = sc2.clone();
        policy.subchannel_update(sc1_dyn.clone(), &idle_state(), &mut controller);
        policy.subchannel_update(sc2_dyn, &idle_state(), &mut controller);
        expect_connect(&mut rx, &sc1.address()).await;

        // Ready on the first subchannel produces a Ready picker pinned to
        // it.
        sc1.set_state(ConnectivityState::Ready);
        policy.subchannel_update(
            sc1_dyn.clone(),
            &SubchannelState {
                connectivity_state: ConnectivityState::Ready,
                last_status: None,
            },
            &mut controller,
        );
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(state.connectivity_state, ConnectivityState::Ready);
                match state.picker.pick(&new_request()) {
                    PickResult::Pick(pick) => {
                        assert_eq!(pick.subchannel.id(), sc1.id());
                    }
                    _ => panic!("expected a Pick from the ready picker"),
                }
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn walks_addresses_on_connect_failure() {
        let (mut rx, mut policy, mut controller) = setup();

        policy
            .resolver_update(update_with_addresses(&["1.1.1.1:1", "2.2.2.2:2"]), None, &mut controller)
            .unwrap();

        let sc1 = expect_new_subchannel(&mut rx).await;
        let sc2 = expect_new_subchannel(&mut rx).await;
        let sc1_dyn: Arc<dyn Subchannel> = sc1.clone();
        let sc2_dyn: Arc<dyn Subchannel> = sc2.clone();
        policy.subchannel_update(sc1_dyn.clone(), &idle_state(), &mut controller);
        policy.subchannel_update(sc2_dyn.clone(), &idle_state(), &mut controller);
        expect_connect(&mut rx, &sc1.address()).await;

        // First address refuses; the policy walks to the second.
        policy.subchannel_update(sc1_dyn, &tf_state("refused"), &mut controller);
        expect_connect(&mut rx, &sc2.address()).await;

        sc2.set_state(ConnectivityState::Ready);
        policy.subchannel_update(
            sc2_dyn,
            &SubchannelState {
                connectivity_state: ConnectivityState::Ready,
                last_status: None,
            },
            &mut controller,
        );
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(state.connectivity_state, ConnectivityState::Ready);
                match state.picker.pick(&new_request()) {
                    PickResult::Pick(pick) => assert_eq!(pick.subchannel.id(), sc2.id()),
                    _ => panic!("expected a Pick from the ready picker"),
                }
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_failures_produce_failing_picker() {
        let (mut rx, mut policy, mut controller) = setup();

        policy
            .resolver_update(update_with_addresses(&["1.1.1.1:1", "2.2.2.2:2"]), None, &mut controller)
            .unwrap();

        let sc1 = expect_new_subchannel(&mut rx).await;
        let sc2 = expect_new_subchannel(&mut rx).await;
        let sc1_dyn: Arc<dyn Subchannel> = sc1.clone();
        let sc2_dyn: Arc<dyn Subchannel> = sc2.clone();
        policy.subchannel_update(sc1_dyn.clone(), &idle_state(), &mut controller);
        policy.subchannel_update(sc2_dyn.clone(), &idle_state(), &mut controller);
        expect_connect(&mut rx, &sc1.address()).await;

        policy.subchannel_update(sc1_dyn, &tf_state("refused"), &mut controller);
        expect_connect(&mut rx, &sc2.address()).await;

        // The second failure ends the first pass: a failing picker is
        // published and re-resolution requested.
        policy.subchannel_update(sc2_dyn, &tf_state("refused"), &mut controller);
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
                match state.picker.pick(&new_request()) {
                    PickResult::Fail(status) => {
                        assert_eq!(status.code(), Code::Unavailable);
                        assert!(status.message().contains("refused"));
                    }
                    _ => panic!("expected Fail from the failing picker"),
                }
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            TestEvent::RequestResolution
        ));
    }

    #[tokio::test]
    async fn empty_address_list_is_an_error() {
        let (mut rx, mut policy, mut controller) = setup();

        let err = policy
            .resolver_update(ResolverUpdate::with_endpoints(vec![]), None, &mut controller)
            .unwrap_err();
        assert!(err.to_string().contains("empty address list"));

        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn selected_subchannel_loss_goes_idle() {
        let (mut rx, mut policy, mut controller) = setup();

        policy
            .resolver_update(update_with_addresses(&["1.1.1.1:1"]), None, &mut controller)
            .unwrap();
        let sc1 = expect_new_subchannel(&mut rx).await;
        let sc1_dyn: Arc<dyn Subchannel> = sc1.clone();
        policy.subchannel_update(sc1_dyn.clone(), &idle_state(), &mut controller);
        expect_connect(&mut rx, &sc1.address()).await;

        sc1.set_state(ConnectivityState::Ready);
        policy.subchannel_update(
            sc1_dyn.clone(),
            &SubchannelState {
                connectivity_state: ConnectivityState::Ready,
                last_status: None,
            },
            &mut controller,
        );
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(state.connectivity_state, ConnectivityState::Ready)
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }

        // The connection drops: the selected subchannel reports Idle and the
        // policy goes Idle with a picker that triggers reconnection.
        sc1.set_state(ConnectivityState::Idle);
        policy.subchannel_update(sc1_dyn, &idle_state(), &mut controller);
        match rx.recv().await.unwrap() {
            TestEvent::UpdatePicker(state) => {
                assert_eq!(state.connectivity_state, ConnectivityState::Idle);
                assert!(matches!(state.picker.pick(&new_request()), PickResult::Queue));
            }
            other => panic!("expected UpdatePicker, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            TestEvent::RequestResolution
        ));
        // The idle picker scheduled work on first use.
        assert!(matches!(rx.recv().await.unwrap(), TestEvent::ScheduleWork));
    }
}
