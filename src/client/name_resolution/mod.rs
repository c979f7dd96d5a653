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

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted
//! into network addresses (typically IP addresses) used by the channel to
//! connect to a service.

use core::fmt;

use std::{
    fmt::{Display, Formatter},
    hash::Hash,
    sync::{Arc, Mutex},
};

use tonic::Status;

use crate::attributes::Attributes;

use super::service_config::ServiceConfig;

/// Indicates the address is an IPv4 or IPv6 address that should be connected
/// to via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

/// An Address is an identifier that indicates how to connect to a server.
///
/// Two addresses are equal iff their endpoint (network type and address
/// string) and their attribute bags are deeply equal.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: String,
    /// The address itself, in "host:port" form for TCP, passed to the
    /// transport in order to create a connection.
    pub address: String,
    /// Optional data which the LB policy or the transport may use.
    pub attributes: Attributes,
}

impl Address {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network_type: TCP_IP_NETWORK_TYPE.to_string(),
            address: address.into(),
            attributes: Attributes::new(),
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type
            && self.address == other.address
            && self.attributes == other.attributes
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Attributes do not take part in the hash; equal addresses have
        // equal endpoints, so this stays consistent with Eq.
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// An Endpoint is an address or a collection of addresses which reference one
/// logical server.  Multiple addresses may be used if there are multiple ways
/// which the server can be reached, e.g. via IPv4 and IPv6 addresses.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Endpoint {
    /// The list of addresses used to connect to the server.
    pub addresses: Vec<Address>,
    /// Optional data which may be used by the LB policy or channel.
    pub attributes: Attributes,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            attributes: Attributes::new(),
        }
    }
}

/// A name resolver update expresses the current state of the resolver.
///
/// `endpoints` and `service_config` fail independently: a resolver may
/// produce a valid address list along with an error from service config
/// retrieval, and vice versa.
#[derive(Debug)]
pub struct ResolverUpdate {
    /// The most recent endpoint list, or an error describing why resolution
    /// failed.
    pub endpoints: Result<Vec<Endpoint>, String>,
    /// The service config the client should use, None if the resolver does
    /// not support service configs, or the error encountered retrieving it.
    pub service_config: Result<Option<ServiceConfig>, Status>,
    /// Optional data which may be used by the LB policy or channel.
    pub attributes: Attributes,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        Self {
            endpoints: Ok(vec![]),
            service_config: Ok(None),
            attributes: Attributes::new(),
        }
    }
}

impl ResolverUpdate {
    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: Ok(endpoints),
            ..Default::default()
        }
    }
}

/// The channel's view of resolver output.  Registered via Resolver::start and
/// invoked on every new result.
pub trait ResolverListener: Send + Sync {
    fn on_update(&self, update: ResolverUpdate);
}

/// A name resolver instance.
///
/// Resolvers are started once by the channel, push updates through the
/// registered listener, and may be prodded to re-resolve via refresh.
/// Dropping the resolver releases any background resolution work.
pub trait Resolver: Send + Sync {
    /// Registers the listener and begins resolution.  Called exactly once by
    /// the channel; implementations should deliver an initial update as soon
    /// as one is available.
    fn start(&self, listener: Arc<dyn ResolverListener>);

    /// Signals the resolver to attempt to re-resolve.  Typically called when
    /// connections fail, indicating a possible change in the overall network
    /// configuration.  Implementations should apply a backoff mechanism to
    /// avoid overloading the remote resolver.
    fn refresh(&self);
}

/// A resolver whose results are supplied manually by the caller, for tests
/// and for channels whose addresses are known up front.
///
/// Updates pushed before start are buffered and replayed to the listener on
/// registration.
#[derive(Default)]
pub struct ManualResolver {
    inner: Mutex<ManualResolverInner>,
}

#[derive(Default)]
struct ManualResolverInner {
    listener: Option<Arc<dyn ResolverListener>>,
    pending: Option<ResolverUpdate>,
    refresh_count: usize,
}

impl ManualResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pushes an update to the channel, or buffers it if the resolver has
    /// not been started yet.
    pub fn update(&self, update: ResolverUpdate) {
        let listener = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.listener {
                Some(l) => l.clone(),
                None => {
                    inner.pending = Some(update);
                    return;
                }
            }
        };
        listener.on_update(update);
    }

    /// Number of refresh requests observed, for tests.
    pub fn refresh_count(&self) -> usize {
        self.inner.lock().unwrap().refresh_count
    }
}

impl Resolver for ManualResolver {
    fn start(&self, listener: Arc<dyn ResolverListener>) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            inner.listener = Some(listener.clone());
            inner.pending.take()
        };
        if let Some(update) = pending {
            listener.on_update(update);
        }
    }

    fn refresh(&self) {
        self.inner.lock().unwrap().refresh_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct HostOverride(String);

    #[test]
    fn address_equality_includes_attributes() {
        let plain = Address::tcp("10.0.0.1:50051");
        let same = Address::tcp("10.0.0.1:50051");
        assert_eq!(plain, same);

        let with_override = Address {
            attributes: plain
                .attributes
                .add(HostOverride("svc.example.com".to_string())),
            ..plain.clone()
        };
        assert_ne!(plain, with_override);

        let with_same_override = Address {
            attributes: same
                .attributes
                .add(HostOverride("svc.example.com".to_string())),
            ..same.clone()
        };
        assert_eq!(with_override, with_same_override);

        let other_endpoint = Address::tcp("10.0.0.2:50051");
        assert_ne!(plain, other_endpoint);
    }

    struct ChannelListener {
        tx: mpsc::UnboundedSender<Vec<Endpoint>>,
    }

    impl ResolverListener for ChannelListener {
        fn on_update(&self, update: ResolverUpdate) {
            self.tx.send(update.endpoints.unwrap()).unwrap();
        }
    }

    #[tokio::test]
    async fn manual_resolver_buffers_until_start() {
        let resolver = ManualResolver::new();
        let endpoints = vec![Endpoint::new(vec![Address::tcp("1.2.3.4:443")])];
        resolver.update(ResolverUpdate::with_endpoints(endpoints.clone()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        resolver.start(Arc::new(ChannelListener { tx }));
        assert_eq!(rx.recv().await.unwrap(), endpoints);

        // Updates after start are delivered directly.
        let more = vec![Endpoint::new(vec![Address::tcp("5.6.7.8:443")])];
        resolver.update(ResolverUpdate::with_endpoints(more.clone()));
        assert_eq!(rx.recv().await.unwrap(), more);
    }
}
