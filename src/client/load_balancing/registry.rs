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

use crate::client::load_balancing::{pick_first, round_robin, LbPolicyBuilder};

/// Maps LB policy names (the strings that appear in service configs) to the
/// builders that produce them.
pub struct LbPolicyRegistry {
    builders: Mutex<HashMap<&'static str, Arc<dyn LbPolicyBuilder>>>,
}

impl LbPolicyRegistry {
    /// An empty registry, for channels that bring their own policy set.
    pub fn new() -> Self {
        Self {
            builders: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a builder under its reported name.  A later builder with
    /// the same name wins.
    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        self.builders
            .lock()
            .unwrap()
            .insert(builder.name(), Arc::new(builder));
    }

    /// Looks up a builder by policy name, or None if no such policy is
    /// registered.
    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.builders.lock().unwrap().get(name).cloned()
    }
}

impl Default for LbPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry consulted when a service config names an LB policy.  The
/// bundled policies are registered up front.
pub static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> = LazyLock::new(|| {
    let registry = LbPolicyRegistry::new();
    registry.add_builder(pick_first::PickFirstBuilder {});
    registry.add_builder(round_robin::RoundRobinBuilder {});
    registry
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_policies_are_registered() {
        assert!(GLOBAL_LB_REGISTRY.get_policy("pick_first").is_some());
        assert!(GLOBAL_LB_REGISTRY.get_policy("round_robin").is_some());
        assert!(GLOBAL_LB_REGISTRY.get_policy("no_such_policy").is_none());
    }

    #[test]
    fn later_builder_with_same_name_wins() {
        let registry = LbPolicyRegistry::new();
        registry.add_builder(pick_first::PickFirstBuilder {});
        let first = registry.get_policy("pick_first").unwrap();
        registry.add_builder(pick_first::PickFirstBuilder {});
        let second = registry.get_policy("pick_first").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
