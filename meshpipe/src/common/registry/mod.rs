// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The explicit registry tying the engine together: clusters and route
//! templates are administered here, and listeners emit their accepted
//! connections into it to become supervised sessions.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::common::cluster::{Cluster, ClusterConfig, ClusterSnapshot, EndPointConfig};
use crate::common::config::{ConfigError, RouteConfig, StaticConfig};
use crate::common::session::{Session, SessionMetadata, SessionSnapshot};
use crate::util::io_stream::WrappedStream;

/// Cluster, route, and session stores. Cheap to share; all methods take
/// `&self`. Sessions remove themselves when their supervisor finishes, every
/// other mutation is explicit.
#[derive(Default)]
pub struct Registry {
  clusters: DashMap<String, Arc<Cluster>>,
  routes: DashMap<String, RouteConfig>,
  sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl Registry {
  pub fn new() -> Registry {
    Registry::default()
  }

  /// Apply a whole static configuration: clusters first, then routes.
  pub fn apply_config(&self, config: StaticConfig) -> Result<(), ConfigError> {
    for cluster in config.clusters {
      self.add_cluster(cluster)?;
    }
    for route in config.routes {
      self.add_route(route)?;
    }
    Ok(())
  }

  pub fn add_cluster(&self, config: ClusterConfig) -> Result<Arc<Cluster>, ConfigError> {
    match self.clusters.entry(config.name.clone()) {
      Entry::Occupied(_) => Err(ConfigError::DuplicateName {
        kind: "cluster",
        name: config.name,
      }),
      Entry::Vacant(vacant) => {
        let cluster = Cluster::new(config)?;
        vacant.insert(Arc::clone(&cluster));
        Ok(cluster)
      }
    }
  }

  pub fn get_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
    self.clusters.get(name).map(|entry| Arc::clone(&entry))
  }

  pub fn clusters(&self) -> Vec<Arc<Cluster>> {
    self
      .clusters
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect()
  }

  /// Delete a cluster. Its endpoint set is drained so in-flight reconnects
  /// fail cleanly, and every session whose route traverses it is ended.
  pub fn delete_cluster(&self, name: &str) -> Result<(), ConfigError> {
    let (_, cluster) = self.clusters.remove(name).ok_or(ConfigError::Unknown {
      kind: "cluster",
      name: name.to_string(),
    })?;
    cluster.drain_endpoints();
    let affected: Vec<_> = self
      .sessions
      .iter()
      .filter(|entry| entry.value().uses_cluster(name))
      .map(|entry| Arc::clone(entry.value()))
      .collect();
    for session in affected {
      tracing::info!(cluster = %name, session = %session.name(), "ending session of deleted cluster");
      session.end();
    }
    tracing::info!(cluster = %name, "cluster deleted");
    Ok(())
  }

  pub fn add_endpoint(
    &self,
    cluster: &str,
    config: EndPointConfig,
  ) -> Result<(), ConfigError> {
    let cluster = self.get_cluster(cluster).ok_or(ConfigError::Unknown {
      kind: "cluster",
      name: cluster.to_string(),
    })?;
    cluster.add_endpoint(config)?;
    Ok(())
  }

  pub fn delete_endpoint(&self, cluster: &str, endpoint: &str) -> Result<(), ConfigError> {
    let cluster = self.get_cluster(cluster).ok_or(ConfigError::Unknown {
      kind: "cluster",
      name: cluster.to_string(),
    })?;
    cluster.delete_endpoint(endpoint)
  }

  /// Register a route template. A name is generated when the config carries
  /// none; the effective name is returned either way.
  pub fn add_route(&self, config: RouteConfig) -> Result<String, ConfigError> {
    let name = config
      .name
      .clone()
      .unwrap_or_else(|| format!("route-{}", Uuid::new_v4()));
    match self.routes.entry(name.clone()) {
      Entry::Occupied(_) => Err(ConfigError::DuplicateName {
        kind: "route",
        name,
      }),
      Entry::Vacant(vacant) => {
        vacant.insert(RouteConfig {
          name: Some(name.clone()),
          ..config
        });
        Ok(name)
      }
    }
  }

  pub fn get_route(&self, name: &str) -> Option<RouteConfig> {
    self.routes.get(name).map(|entry| entry.clone())
  }

  /// Delete a route template. Sessions already bound to it are unaffected;
  /// the template only matters at admission.
  pub fn delete_route(&self, name: &str) -> Result<(), ConfigError> {
    self
      .routes
      .remove(name)
      .map(|_| ())
      .ok_or(ConfigError::Unknown {
        kind: "route",
        name: name.to_string(),
      })
  }

  pub fn get_session(&self, name: &str) -> Option<Arc<Session>> {
    self.sessions.get(name).map(|entry| Arc::clone(&entry))
  }

  pub fn sessions(&self) -> Vec<Arc<Session>> {
    self
      .sessions
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect()
  }

  /// The listener contract: turn an accepted connection into a supervised
  /// session bound to the named route. Must be called within a tokio runtime;
  /// the session's supervisor task is spawned here.
  pub fn emit_session(
    &self,
    metadata: SessionMetadata,
    listener: &str,
    stream: WrappedStream,
    route_name: &str,
  ) -> Result<Arc<Session>, ConfigError> {
    let route = self.get_route(route_name).ok_or(ConfigError::Unknown {
      kind: "route",
      name: route_name.to_string(),
    })?;
    let resolve = |name: &String| {
      self.get_cluster(name).ok_or(ConfigError::Unknown {
        kind: "cluster",
        name: name.clone(),
      })
    };
    let destination = resolve(&route.destination)?;
    let ingress = route.ingress.iter().map(resolve).collect::<Result<_, _>>()?;
    let egress = route.egress.iter().map(resolve).collect::<Result<_, _>>()?;

    match self.sessions.entry(metadata.name.clone()) {
      Entry::Occupied(_) => Err(ConfigError::DuplicateName {
        kind: "session",
        name: metadata.name,
      }),
      Entry::Vacant(vacant) => {
        tracing::info!(session = %metadata.name, listener, route = %route_name, "session emitted");
        let (session, supervisor) = Session::establish(
          metadata,
          listener.to_string(),
          stream,
          route_name.to_string(),
          destination,
          ingress,
          egress,
          route.retry.clone(),
          Arc::clone(&self.sessions),
        );
        vacant.insert(Arc::clone(&session));
        tokio::spawn(supervisor);
        Ok(session)
      }
    }
  }

  /// Request teardown of a session. Removal from the registry happens when
  /// the session reaches `destroy`, not here.
  pub fn delete_session(&self, name: &str) -> Result<(), ConfigError> {
    let session = self.get_session(name).ok_or(ConfigError::Unknown {
      kind: "session",
      name: name.to_string(),
    })?;
    session.end();
    Ok(())
  }

  pub fn snapshot(&self) -> RegistrySnapshot {
    RegistrySnapshot {
      clusters: self
        .clusters
        .iter()
        .map(|entry| entry.value().snapshot())
        .collect(),
      routes: self.routes.iter().map(|entry| entry.clone()).collect(),
      sessions: self
        .sessions
        .iter()
        .map(|entry| entry.value().snapshot())
        .collect(),
    }
  }

  #[cfg(test)]
  pub(crate) fn insert_cluster(&self, cluster: Arc<Cluster>) {
    self.clusters.insert(cluster.name().to_string(), cluster);
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
  pub clusters: Vec<ClusterSnapshot>,
  pub routes: Vec<RouteConfig>,
  pub sessions: Vec<SessionSnapshot>,
}
