// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Declarative configuration types and the admin-facing error taxonomy.

use serde::{Deserialize, Serialize};

use crate::common::cluster::{ClusterConfig, Protocol};
use crate::common::route::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("duplicate {kind} name \"{name}\"")]
  DuplicateName { kind: &'static str, name: String },
  #[error("unknown {kind} \"{name}\"")]
  Unknown { kind: &'static str, name: String },
  #[error("cluster \"{cluster}\": protocol {protocol} does not take endpoints")]
  EndPointsNotSupported { cluster: String, protocol: Protocol },
  #[error("cluster \"{cluster}\": spec.port is required for protocol {protocol}")]
  MissingPort { cluster: String, protocol: Protocol },
  #[error("cluster \"{cluster}\": invalid bind address: {source}")]
  InvalidBindAddress {
    cluster: String,
    #[source]
    source: std::net::AddrParseError,
  },
  #[error("invalid configuration: {0}")]
  Parse(#[from] serde_json::Error),
}

/// A route template: the cluster chain sessions bound to this route travel
/// through, and the retry policy governing every stage of the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
  /// Generated when absent.
  #[serde(default)]
  pub name: Option<String>,
  pub destination: String,
  #[serde(default)]
  pub ingress: Vec<String>,
  #[serde(default)]
  pub egress: Vec<String>,
  #[serde(default)]
  pub retry: RetryPolicy,
}

/// A whole data-plane description, applied against a registry in one call.
/// Clusters are added before routes so route references resolve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
  #[serde(default)]
  pub clusters: Vec<ClusterConfig>,
  #[serde(default)]
  pub routes: Vec<RouteConfig>,
}

impl StaticConfig {
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(json)?)
  }
}

#[cfg(test)]
mod tests {
  use crate::common::cluster::{LoadBalancingPolicy, Protocol};
  use crate::common::route::RetryOn;

  use super::*;

  #[test]
  fn parses_a_full_static_config() {
    let config = StaticConfig::from_json(
      r#"{
        "clusters": [
          {
            "name": "backend",
            "spec": { "protocol": "tcp", "port": 8080, "timeout_ms": 500 },
            "endpoints": [
              { "name": "b1", "spec": { "address": "10.0.0.1" } },
              { "spec": { "address": "10.0.0.2" }, "weight": 2.0 }
            ],
            "loadbalancer": "trivial"
          },
          {
            "name": "mirror",
            "spec": { "protocol": "echo" }
          }
        ],
        "routes": [
          {
            "name": "default",
            "destination": "backend",
            "ingress": ["mirror"],
            "retry": { "retry_on": "connect-failure", "num_retries": 3, "timeout_ms": 250 }
          }
        ]
      }"#,
    )
    .unwrap();

    let backend = &config.clusters[0];
    assert_eq!(backend.spec.protocol, Protocol::Tcp);
    assert_eq!(backend.spec.port, Some(8080));
    assert_eq!(backend.spec.timeout_ms, 500);
    assert!(backend.spec.retriable);
    assert_eq!(backend.loadbalancer, Some(LoadBalancingPolicy::Trivial));
    assert_eq!(backend.endpoints[0].name.as_deref(), Some("b1"));
    assert_eq!(backend.endpoints[1].weight, Some(2.0));

    let route = &config.routes[0];
    assert_eq!(route.destination, "backend");
    assert_eq!(route.ingress, vec!["mirror".to_string()]);
    assert!(route.egress.is_empty());
    assert_eq!(route.retry.retry_on, RetryOn::ConnectFailure);
    assert_eq!(route.retry.num_retries, 3);
  }

  #[test]
  fn retry_policy_defaults_to_never() {
    let config =
      StaticConfig::from_json(r#"{ "routes": [ { "destination": "backend" } ] }"#).unwrap();
    let retry = &config.routes[0].retry;
    assert_eq!(retry.retry_on, RetryOn::Never);
    assert_eq!(retry.num_retries, 0);
    assert_eq!(retry.timeout_ms, 2000);
  }

  #[test]
  fn rejects_malformed_json() {
    assert!(matches!(
      StaticConfig::from_json("{ not json").unwrap_err(),
      ConfigError::Parse(_)
    ));
  }
}
