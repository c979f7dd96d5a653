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

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tonic::Code;

/// An in-memory representation of a service config.  Full JSON service-config
/// parsing happens above this crate; resolvers deliver the already-structured
/// form.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Candidate load balancing configurations, in preference order.  The
    /// channel uses the first entry whose policy name resolves to a
    /// registered builder.
    pub load_balancing_configs: Vec<LbConfigEntry>,
    /// Per-method configuration, matched by service and method name.
    pub method_configs: Vec<MethodConfig>,
    /// Channel-wide retry throttling, shared by retry and hedging.
    pub retry_throttling: Option<RetryThrottlingConfig>,
}

impl ServiceConfig {
    /// Looks up the configuration for a method.  An entry naming the service
    /// with an empty method matches every method of that service; more
    /// specific entries win.
    pub fn method_config(&self, service: &str, method: &str) -> Option<&MethodConfig> {
        let mut service_wide = None;
        for mc in &self.method_configs {
            for name in &mc.names {
                if name.service != service {
                    continue;
                }
                if name.method == method {
                    return Some(mc);
                }
                if name.method.is_empty() {
                    service_wide = Some(mc);
                }
            }
        }
        service_wide
    }
}

/// One candidate load balancing policy from the service config: the policy
/// name (e.g. "pick_first", "round_robin") and its raw configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LbConfigEntry {
    pub policy_name: String,
    pub config: Option<ParsedJsonLbConfig>,
}

impl LbConfigEntry {
    pub fn new(policy_name: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            config: None,
        }
    }
}

/// Represents an opaque piece of JSON from the service config which an LB
/// policy's builder parses into its internal representation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJsonLbConfig {
    pub value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn new(json: &str) -> Result<Self, String> {
        match serde_json::from_str(json) {
            Ok(value) => Ok(ParsedJsonLbConfig { value }),
            Err(e) => Err(format!("failed to parse JSON: {}", e)),
        }
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        ParsedJsonLbConfig { value }
    }

    /// Converts the JSON into the concrete configuration type used by the LB
    /// policy.
    pub fn convert_to<T: DeserializeOwned>(
        &self,
    ) -> Result<T, Box<dyn std::error::Error + Send + Sync>> {
        serde_json::from_value(self.value.clone()).map_err(|e| e.into())
    }
}

/// Identifies the method(s) a MethodConfig applies to.  An empty method name
/// matches all methods of the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodName {
    pub service: String,
    pub method: String,
}

/// Per-method configuration delivered by the resolver: at most one of retry
/// or hedging may be set for a given method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodConfig {
    pub names: Vec<MethodName>,
    pub retry_policy: Option<RetryPolicy>,
    pub hedging_policy: Option<HedgingPolicy>,
}

/// Retry policy for a method, mirroring the retryPolicy service-config
/// message.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempt budget, including the original attempt.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Status codes that permit another attempt.
    pub retryable_status_codes: Vec<Code>,
}

impl RetryPolicy {
    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable_status_codes.contains(&code)
    }
}

/// Hedging policy for a method, mirroring the hedgingPolicy service-config
/// message.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgingPolicy {
    /// Total attempt budget, including the first attempt.
    pub max_attempts: usize,
    /// Delay between successive hedged attempts.  Zero launches every
    /// attempt immediately.
    pub hedging_delay: Duration,
    /// Status codes that do not kill the hedge and allow further attempts.
    pub non_fatal_status_codes: Vec<Code>,
}

impl HedgingPolicy {
    pub fn is_non_fatal(&self, code: Code) -> bool {
        self.non_fatal_status_codes.contains(&code)
    }
}

/// Channel-wide token bucket parameters gating retries and hedges.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryThrottlingConfig {
    pub max_tokens: u32,
    /// Fraction of a token restored per success; truncated to 3 decimal
    /// places when the throttle is built.
    pub token_ratio: f64,
}

/// A convenience wrapper for an LB policy's parsed configuration object.
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_config_lookup_prefers_exact_match() {
        let service_wide = MethodConfig {
            names: vec![MethodName {
                service: "echo.Echo".to_string(),
                method: String::new(),
            }],
            ..Default::default()
        };
        let exact = MethodConfig {
            names: vec![MethodName {
                service: "echo.Echo".to_string(),
                method: "UnaryEcho".to_string(),
            }],
            retry_policy: Some(RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                backoff_multiplier: 2.0,
                retryable_status_codes: vec![Code::Unavailable],
            }),
            ..Default::default()
        };
        let config = ServiceConfig {
            method_configs: vec![service_wide.clone(), exact.clone()],
            ..Default::default()
        };

        assert_eq!(config.method_config("echo.Echo", "UnaryEcho"), Some(&exact));
        assert_eq!(
            config.method_config("echo.Echo", "StreamingEcho"),
            Some(&service_wide)
        );
        assert_eq!(config.method_config("other.Service", "UnaryEcho"), None);
    }

    #[test]
    fn lb_config_roundtrip() {
        #[derive(Debug, PartialEq)]
        struct FakePolicyConfig {
            limit: usize,
        }
        let config = LbConfig::new(FakePolicyConfig { limit: 7 });
        let got: Arc<FakePolicyConfig> = config.convert_to().unwrap();
        assert_eq!(*got, FakePolicyConfig { limit: 7 });
        assert!(config.convert_to::<String>().is_none());
    }

    #[test]
    fn parsed_json_lb_config() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        #[serde(rename_all = "camelCase")]
        struct ShuffleConfig {
            shuffle_address_list: Option<bool>,
        }
        let parsed = ParsedJsonLbConfig::new(r#"{"shuffleAddressList": true}"#).unwrap();
        let config: ShuffleConfig = parsed.convert_to().unwrap();
        assert_eq!(config.shuffle_address_list, Some(true));

        assert!(ParsedJsonLbConfig::new("not json").is_err());
    }
}
