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

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::client::load_balancing::{
    ChannelController, Failing, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Pick,
    PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::client::ConnectivityState;
use crate::service::Request;

pub static POLICY_NAME: &str = "round_robin";

/// Builds round_robin policies.  Registered with the global LB registry at
/// first use.
pub(crate) struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            subchannels: Vec::new(),
            states: HashMap::new(),
            last_resolver_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

/// Round robin: one subchannel per resolved address, kept connected, with
/// picks rotating over the Ready subchannels.
struct RoundRobinPolicy {
    /// Subchannels in resolver order, paired with the address they serve.
    subchannels: Vec<(Address, Arc<dyn Subchannel>)>,
    /// The most recent state reported for each subchannel, by id.
    states: HashMap<String, SubchannelState>,
    last_resolver_error: Option<String>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let endpoints = match update.endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                debug!(%error, "round_robin received error from resolver");
                self.last_resolver_error = Some(error.clone());
                if self.subchannels.is_empty() {
                    self.publish_failing(channel_controller);
                    return Err(error.into());
                }
                // Keep serving with the previous address list.
                return Ok(());
            }
        };

        let mut addresses: Vec<Address> = endpoints
            .iter()
            .flat_map(|ep| ep.addresses.clone())
            .collect();
        let mut uniques = HashSet::new();
        addresses.retain(|a| uniques.insert(a.clone()));

        if addresses.is_empty() {
            self.subchannels.clear();
            self.states.clear();
            self.last_resolver_error =
                Some("received empty address list from the name resolver".to_string());
            self.publish_failing(channel_controller);
            channel_controller.request_resolution();
            return Err("received empty address list from the name resolver".into());
        }

        // Keep subchannels whose address is still present; create the rest.
        let mut next: Vec<(Address, Arc<dyn Subchannel>)> = Vec::with_capacity(addresses.len());
        for address in &addresses {
            match self
                .subchannels
                .iter()
                .find(|(existing, _)| existing == address)
            {
                Some((_, sc)) => next.push((address.clone(), sc.clone())),
                None => {
                    let sc = channel_controller.new_subchannel(address);
                    sc.connect();
                    // Counts as Idle until its first state report arrives.
                    self.states.insert(sc.id(), SubchannelState::default());
                    next.push((address.clone(), sc.clone()));
                }
            }
        }

        // Dropped subchannels take their recorded state with them.
        let keep: HashSet<String> = next.iter().map(|(_, sc)| sc.id()).collect();
        self.states.retain(|id, _| keep.contains(id));
        self.subchannels = next;

        self.publish_aggregate(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if !self.subchannels.iter().any(|(_, sc)| sc.id() == subchannel.id()) {
            debug!(subchannel = %subchannel, "round_robin ignoring update for unknown subchannel");
            return;
        }
        self.states.insert(subchannel.id(), state.clone());

        match state.connectivity_state {
            ConnectivityState::Idle => {
                // Round robin keeps every subchannel connected.
                subchannel.connect();
            }
            ConnectivityState::TransientFailure => {
                channel_controller.request_resolution();
            }
            _ => {}
        }

        self.publish_aggregate(channel_controller);
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for (_, sc) in &self.subchannels {
            if sc.connectivity_state() == ConnectivityState::Idle {
                sc.connect();
            }
        }
    }
}

impl RoundRobinPolicy {
    /// Ready beats everything; otherwise the strongest of Connecting,
    /// TransientFailure and Idle wins.
    fn aggregate_state(&self) -> ConnectivityState {
        let states = || self.states.values().map(|s| s.connectivity_state);
        if states().any(|s| s == ConnectivityState::Ready) {
            ConnectivityState::Ready
        } else if states().any(|s| s == ConnectivityState::Connecting) {
            ConnectivityState::Connecting
        } else if states().any(|s| s == ConnectivityState::TransientFailure) {
            ConnectivityState::TransientFailure
        } else {
            ConnectivityState::Idle
        }
    }

    fn publish_aggregate(&mut self, channel_controller: &mut dyn ChannelController) {
        match self.aggregate_state() {
            ConnectivityState::Ready => {
                let ready: Vec<Arc<dyn Subchannel>> = self
                    .subchannels
                    .iter()
                    .filter(|(_, sc)| {
                        self.states
                            .get(&sc.id())
                            .map(|s| s.connectivity_state == ConnectivityState::Ready)
                            .unwrap_or(false)
                    })
                    .map(|(_, sc)| sc.clone())
                    .collect();
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::Ready,
                    picker: Arc::new(RoundRobinPicker::new(ready)),
                });
            }
            ConnectivityState::Connecting | ConnectivityState::Idle => {
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::Connecting,
                    picker: Arc::new(QueuingPicker {}),
                });
            }
            ConnectivityState::TransientFailure => {
                self.publish_failing(channel_controller);
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn publish_failing(&mut self, channel_controller: &mut dyn ChannelController) {
        let connection_error = self
            .states
            .values()
            .find_map(|s| s.last_status.clone());
        let error = format!(
            "last seen resolver error: {:?}, last seen connection error: {:?}",
            self.last_resolver_error, connection_error,
        );
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
    }
}

/// Rotates picks over the Ready subchannels, starting at a random offset so
/// multiple channels do not gang up on the first backend.
struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        let offset = rand::random_range(..subchannels.len().max(1));
        Self::with_offset(subchannels, offset)
    }

    fn with_offset(subchannels: Vec<Arc<dyn Subchannel>>, offset: usize) -> Self {
        Self {
            subchannels,
            next: AtomicUsize::new(offset),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        if self.subchannels.is_empty() {
            return PickResult::Queue;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick {
            subchannel: self.subchannels[idx].clone(),
            on_complete: None,
            metadata: MetadataMap::new(),
        })
    }
}
