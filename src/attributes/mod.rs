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

use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::sync::Arc;

/// Ensures only types that support comparison can be inserted into the
/// Attributes struct.  This allows the use of value-based equality rather
/// than relying on pointer comparisons.
trait AttributeTrait: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AttributeTrait) -> bool;
}

impl<T: Any + Send + Sync + Eq + Debug> AttributeTrait for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AttributeTrait) -> bool {
        if let Some(other) = other.any_ref().downcast_ref::<T>() {
            self == other
        } else {
            false
        }
    }
}

#[derive(Clone, Debug)]
struct AttributeValue(Arc<dyn AttributeTrait>);

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for AttributeValue {}

/// A collection of attributes indexed by their type.
///
/// `Attributes` provides a map-like interface where values are keyed by their
/// TypeId.  Equality is structural: two `Attributes` maps are equal if they
/// contain the same set of values, compared by value via the `Eq` trait.
/// Stored types must implement `Any + Send + Sync + Eq + Debug`.
///
/// The collection is persistent: `add` and `remove` return a new value and
/// leave the original untouched, so snapshots handed to pickers and
/// subchannels stay stable.  It is intended to hold a handful of entries and
/// is not optimized for query speed.
#[derive(Clone, Default, Debug)]
pub struct Attributes {
    entries: Vec<(TypeId, AttributeValue)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value to the attributes, returning a new Attributes with the
    /// value added.  If a value of the same type already exists, it is
    /// replaced.
    pub fn add<T: Send + Sync + Eq + Debug + 'static>(&self, value: T) -> Self {
        let id = TypeId::of::<T>();
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|(k, _)| *k != id)
            .cloned()
            .collect();
        entries.push((id, AttributeValue(Arc::new(value))));
        Attributes { entries }
    }

    /// Gets a reference to a value of type T.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        let id = TypeId::of::<T>();
        self.entries
            .iter()
            .find(|(k, _)| *k == id)
            .and_then(|(_, v)| v.0.any_ref().downcast_ref())
    }

    /// Removes a value of type T, returning a new Attributes without it.
    pub fn remove<T: 'static>(&self) -> Self {
        let id = TypeId::of::<T>();
        Attributes {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| *k != id)
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        // Order-insensitive comparison; entries are keyed by TypeId so each
        // key appears at most once per side.
        self.entries.iter().all(|(k, v)| {
            other
                .entries
                .iter()
                .any(|(ok, ov)| ok == k && ov == v)
        })
    }
}

impl Eq for Attributes {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq() {
        let a1 = Attributes::new().add(10i32);
        let a2 = a1.clone();
        let a3 = Attributes::new().add(10i32); // Structural equality

        assert_eq!(a1, a2);
        assert_eq!(a1, a3);

        let a4 = Attributes::new().add(10i32).add("foo".to_string());
        assert_ne!(a1, a4);
    }

    #[test]
    fn test_eq_order_insensitive() {
        let a1 = Attributes::new().add(10i32).add("foo".to_string());
        let a2 = Attributes::new().add("foo".to_string()).add(10i32);
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_attributes() {
        let attrs = Attributes::new();
        let attrs = attrs.add(42i32);
        let attrs = attrs.add("hello".to_string());

        assert_eq!(attrs.get::<i32>(), Some(&42));
        assert_eq!(attrs.get::<String>(), Some(&"hello".to_string()));
        assert_eq!(attrs.get::<bool>(), None);
    }

    #[test]
    fn test_remove() {
        let attrs = Attributes::new().add(10i32).add(20u32);
        let attrs2 = attrs.remove::<i32>();

        assert_eq!(attrs.get::<i32>(), Some(&10));
        assert_eq!(attrs.get::<u32>(), Some(&20));

        assert_eq!(attrs2.get::<i32>(), None);
        assert_eq!(attrs2.get::<u32>(), Some(&20));
    }

    #[test]
    fn test_persistence() {
        let a1 = Attributes::new().add(10i32);
        let a2 = a1.add(20u32);

        assert_eq!(a1.get::<i32>(), Some(&10));
        assert_eq!(a1.get::<u32>(), None);

        assert_eq!(a2.get::<i32>(), Some(&10));
        assert_eq!(a2.get::<u32>(), Some(&20));
    }

    #[test]
    fn test_overwrite() {
        let a1 = Attributes::new().add(10i32);
        let a2 = a1.add(20i32);

        assert_eq!(a1.get::<i32>(), Some(&10));
        assert_eq!(a2.get::<i32>(), Some(&20));
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct HostOverride(String);

    #[test]
    fn test_custom_structs() {
        let h = HostOverride("svc.example.com".to_string());
        let attrs = Attributes::new().add(h.clone());
        assert_eq!(attrs.get::<HostOverride>(), Some(&h));

        let h2 = HostOverride("other.example.com".to_string());
        let attrs2 = attrs.add(h2.clone());
        assert_eq!(attrs2.get::<HostOverride>(), Some(&h2));
        assert_eq!(attrs.get::<HostOverride>(), Some(&h));
    }
}
