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

pub mod child_handler;
pub mod pick_first;
pub mod registry;
pub mod round_robin;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{error::Error, fmt::Display, sync::Arc};

use tonic::{metadata::MetadataMap, Status};

use crate::client::{
    name_resolution::{Address, ResolverUpdate},
    service_config::{LbConfig, ParsedJsonLbConfig},
    ConnectivityState,
};
use crate::service::Request;

pub use registry::{LbPolicyRegistry, GLOBAL_LB_REGISTRY};

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already
    // a pending work call that has not yet started, this may not schedule
    // another call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is
    /// delivered via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal
    /// representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel when an RPC arrives while the policy is idle.
    /// The policy should initiate connections.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);
}

/// Controls channel behaviors.  Passed to every LbPolicy entry point so the
/// policy's effects are serialized under the channel's work queue.
pub trait ChannelController: Send {
    /// Creates a new subchannel in IDLE state for the given address.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.  The
    /// channel skips publication if the snapshot equals the current one.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.
    /// Typically used when connections fail, indicating a possible change in
    /// the overall network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a Subchannel, as observed by LB policies.
#[derive(Clone, Default)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    /// The status that caused the most recent transition.  Set when the
    /// connectivity state is TransientFailure (the connection error), or
    /// when a ready connection was lost.  None otherwise.
    pub last_status: Option<Status>,
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_status {
            Some(status) => write!(f, "{} ({})", self.connectivity_state, status),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

/// A Subchannel represents a method of communicating with a server which may
/// be connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when connect() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on
///   error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to IDLE once the reconnect backoff timer
///   expires; the LB policy decides when to connect again.
///
/// - SHUTDOWN is terminal and is entered when the owning LB policy disposes
///   the subchannel.
pub trait Subchannel: Send + Sync + Display {
    /// The stable identity of this subchannel within the process.
    fn id(&self) -> String;

    /// The address list entry this subchannel was created for.
    fn address(&self) -> Address;

    /// Begins connecting asynchronously if the subchannel is Idle.
    fn connect(&self);

    /// A snapshot of the subchannel's connectivity state.
    fn connectivity_state(&self) -> ConnectivityState;

    /// The address the subchannel's transport is currently connected to, if
    /// any.
    fn connected_address(&self) -> Option<Address>;
}

/// Fired once per picked call, at response-header receipt, to feed load
/// reporting.
pub type CallTracker = Arc<dyn Fn(&Status) + Send + Sync>;

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns
/// Queue, the channel will queue the RPC until a new Picker is produced by
/// the LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are snapshots: they never call back into the LB policy and hold
/// no locks, so the channel may invoke them from any task.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking
    /// or time-consuming work to service this request, it should return
    /// Queue, and the pick will be repeated by the channel when a new Picker
    /// is produced by the LbPolicy.
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use
    /// for the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is
    /// wait-for-ready, then it will not be terminated, but instead attempted
    /// on a new picker if one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.  Drops are never
    /// retried or hedged.
    Drop(Status),
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Invoked when the call reaches its response headers, for policies
    /// that track outstanding calls.
    pub on_complete: Option<CallTracker>,
    /// Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker
    /// which queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }

    /// Value equality for publication skipping: same connectivity state and
    /// the same picker snapshot.
    pub fn same_as(&self, other: &LbState) -> bool {
        self.connectivity_state == other.connectivity_state
            && Arc::ptr_eq(&self.picker, &other.picker)
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that fails every pick with the recorded error.  Produced when
/// the policy is in TransientFailure.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}
