// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ClusterError, EndPoint};

/// How a cluster picks an endpoint for a new session.
///
/// Selection is pure over the endpoint snapshot passed in, so a policy can be
/// re-applied safely after hot endpoint updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancingPolicy {
  /// Never selects; the policy of clusters that cannot take endpoints.
  None,
  /// Deterministically selects the first endpoint.
  Trivial,
}

impl Default for LoadBalancingPolicy {
  fn default() -> Self {
    LoadBalancingPolicy::Trivial
  }
}

impl LoadBalancingPolicy {
  pub fn apply(
    &self,
    endpoints: &[Arc<EndPoint>],
    session: &str,
  ) -> Result<Arc<EndPoint>, ClusterError> {
    match self {
      LoadBalancingPolicy::None => Err(ClusterError::NoEndPoint),
      LoadBalancingPolicy::Trivial => {
        let endpoint = endpoints.first().cloned().ok_or(ClusterError::NoEndPoint)?;
        tracing::trace!(endpoint = %endpoint.name(), session, "trivial balancer selected endpoint");
        Ok(endpoint)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::common::cluster::endpoint::test_connectors::{refused, FnConnector};

  use super::*;

  fn endpoint(name: &str) -> Arc<EndPoint> {
    EndPoint::with_connector(name, Box::new(FnConnector(|| Err(refused()))))
  }

  #[test]
  fn trivial_is_deterministic() {
    let endpoints = vec![endpoint("a"), endpoint("b"), endpoint("c")];
    for _ in 0..4 {
      let picked = LoadBalancingPolicy::Trivial
        .apply(&endpoints, "s1")
        .unwrap();
      assert_eq!(picked.name(), "a");
    }
  }

  #[test]
  fn trivial_fails_without_endpoints() {
    let err = LoadBalancingPolicy::Trivial.apply(&[], "s1").unwrap_err();
    assert!(matches!(err, ClusterError::NoEndPoint));
  }

  #[test]
  fn none_never_selects() {
    let endpoints = vec![endpoint("a")];
    let err = LoadBalancingPolicy::None.apply(&endpoints, "s1").unwrap_err();
    assert!(matches!(err, ClusterError::NoEndPoint));
  }
}
