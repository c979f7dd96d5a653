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
use std::sync::{Arc, LazyLock, Mutex};

use crate::client::transport::TransportBuilder;

/// A registry to store and retrieve transport builders, indexed by the
/// network type they serve.
pub struct TransportRegistry {
    m: Arc<Mutex<HashMap<String, Arc<dyn TransportBuilder>>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self { m: Arc::default() }
    }

    pub fn add_builder(&self, builder: impl TransportBuilder + 'static) {
        self.m
            .lock()
            .unwrap()
            .insert(builder.network_type().to_string(), Arc::new(builder));
    }

    pub fn get_transport(&self, network_type: &str) -> Option<Arc<dyn TransportBuilder>> {
        self.m.lock().unwrap().get(network_type).cloned()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry consulted when a subchannel needs a transport for an
/// address.
pub static GLOBAL_TRANSPORT_REGISTRY: LazyLock<TransportRegistry> = LazyLock::new(|| {
    let registry = TransportRegistry::new();
    registry.add_builder(crate::client::transport::tcp::SocketTransportBuilder {});
    registry
});
