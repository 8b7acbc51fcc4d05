// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Clusters: named, protocol-typed groups of endpoints that produce ready
//! byte streams for sessions. A cluster owns endpoint selection and the
//! connect timeout; retry policy belongs to the route that uses it.

use std::io::Error as IOError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::common::config::ConfigError;
use crate::util::counter::{ActiveGuard, Metered};
use crate::util::io_stream::WrappedStream;

pub mod endpoint;
pub mod load_balancer;

pub use endpoint::{Connector, EndPoint, EndPointConfig, EndPointSnapshot, EndPointSpec};
pub use load_balancer::LoadBalancingPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  Tcp,
  Udp,
  /// Synthetic: yields the session's own traffic back, no endpoints involved.
  Echo,
}

impl Protocol {
  /// Synthetic protocols produce their stream internally and take no
  /// endpoints.
  pub fn is_synthetic(self) -> bool {
    matches!(self, Protocol::Echo)
  }

  pub fn stream_mode(self) -> StreamMode {
    match self {
      Protocol::Tcp => StreamMode::Byte,
      Protocol::Udp | Protocol::Echo => StreamMode::Datagram,
    }
  }
}

impl std::fmt::Display for Protocol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Protocol::Tcp => "tcp",
      Protocol::Udp => "udp",
      Protocol::Echo => "echo",
    };
    f.write_str(name)
  }
}

/// Whether a protocol preserves message boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
  Byte,
  Datagram,
}

/// Local address endpoints dial out from; applies to every endpoint of the
/// cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindSpec {
  pub address: String,
  #[serde(default)]
  pub port: u16,
}

impl BindSpec {
  fn to_socket_addr(&self, cluster: &str) -> Result<SocketAddr, ConfigError> {
    let ip = self
      .address
      .parse()
      .map_err(|source| ConfigError::InvalidBindAddress {
        cluster: cluster.to_string(),
        source,
      })?;
    Ok(SocketAddr::new(ip, self.port))
  }
}

fn default_timeout_ms() -> u64 {
  2000
}

fn default_retriable() -> bool {
  true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
  pub protocol: Protocol,
  /// Remote port shared by all endpoints; required for transport protocols.
  #[serde(default)]
  pub port: Option<u16>,
  #[serde(default)]
  pub bind: Option<BindSpec>,
  /// Connect timeout; an attempt still pending after this long fails.
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// Routes refuse to reconnect through a non-retriable cluster.
  #[serde(default = "default_retriable")]
  pub retriable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
  pub name: String,
  pub spec: ClusterSpec,
  #[serde(default)]
  pub endpoints: Vec<EndPointConfig>,
  #[serde(default)]
  pub loadbalancer: Option<LoadBalancingPolicy>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
  #[error("no endpoint available")]
  NoEndPoint,
  #[error("connect timed out after {timeout:?}")]
  ConnectTimeout { timeout: Duration },
  #[error("transport connect failed: {0}")]
  Connect(#[from] IOError),
}

/// A stream produced by a cluster for one session, along with the endpoint it
/// was opened against. Synthetic clusters have no endpoint.
#[derive(Debug)]
pub struct ClusterStream {
  pub stream: WrappedStream,
  pub endpoint: Option<Arc<EndPoint>>,
}

#[derive(Debug, Default)]
pub struct ClusterStats {
  pub total_sessions: AtomicU64,
}

/// A named group of interchangeable endpoints behind one load-balancing
/// policy. The endpoint list supports hot add and remove; readers always see
/// a consistent snapshot.
pub struct Cluster {
  name: String,
  spec: ClusterSpec,
  bind: Option<SocketAddr>,
  loadbalancer: LoadBalancingPolicy,
  endpoints: ArcSwap<Vec<Arc<EndPoint>>>,
  stats: ClusterStats,
}

impl Cluster {
  pub fn new(config: ClusterConfig) -> Result<Arc<Cluster>, ConfigError> {
    let ClusterConfig {
      name,
      spec,
      endpoints,
      loadbalancer,
    } = config;
    if spec.protocol.is_synthetic() && !endpoints.is_empty() {
      return Err(ConfigError::EndPointsNotSupported {
        cluster: name,
        protocol: spec.protocol,
      });
    }
    if !spec.protocol.is_synthetic() && spec.port.is_none() {
      return Err(ConfigError::MissingPort {
        cluster: name,
        protocol: spec.protocol,
      });
    }
    let bind = spec
      .bind
      .as_ref()
      .map(|bind| bind.to_socket_addr(&name))
      .transpose()?;
    let loadbalancer = loadbalancer.unwrap_or(if spec.protocol.is_synthetic() {
      LoadBalancingPolicy::None
    } else {
      LoadBalancingPolicy::Trivial
    });
    let cluster = Cluster {
      name,
      spec,
      bind,
      loadbalancer,
      endpoints: ArcSwap::from_pointee(Vec::new()),
      stats: ClusterStats::default(),
    };
    for endpoint in endpoints {
      cluster.add_endpoint(endpoint)?;
    }
    tracing::info!(cluster = %cluster.name, protocol = %cluster.spec.protocol, "cluster created");
    Ok(Arc::new(cluster))
  }

  #[cfg(test)]
  pub(crate) fn for_tests(
    name: &str,
    endpoints: Vec<Arc<EndPoint>>,
    timeout: Duration,
    retriable: bool,
  ) -> Arc<Cluster> {
    Arc::new(Cluster {
      name: name.to_string(),
      spec: ClusterSpec {
        protocol: Protocol::Tcp,
        port: Some(1),
        bind: None,
        timeout_ms: timeout.as_millis() as u64,
        retriable,
      },
      bind: None,
      loadbalancer: LoadBalancingPolicy::Trivial,
      endpoints: ArcSwap::from_pointee(endpoints),
      stats: ClusterStats::default(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn protocol(&self) -> Protocol {
    self.spec.protocol
  }

  pub fn retriable(&self) -> bool {
    self.spec.retriable
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.spec.timeout_ms)
  }

  pub fn loadbalancer(&self) -> LoadBalancingPolicy {
    self.loadbalancer
  }

  pub fn stats(&self) -> &ClusterStats {
    &self.stats
  }

  pub fn endpoints(&self) -> Vec<Arc<EndPoint>> {
    self.endpoints.load().as_ref().clone()
  }

  pub fn get_endpoint(&self, name: &str) -> Option<Arc<EndPoint>> {
    self
      .endpoints
      .load()
      .iter()
      .find(|endpoint| endpoint.name() == name)
      .cloned()
  }

  /// Add an endpoint to the live set; sessions admitted afterwards can be
  /// balanced onto it.
  pub fn add_endpoint(&self, config: EndPointConfig) -> Result<Arc<EndPoint>, ConfigError> {
    // Transport clusters are validated for a port at construction.
    let port = self.spec.port.ok_or_else(|| ConfigError::MissingPort {
      cluster: self.name.clone(),
      protocol: self.spec.protocol,
    })?;
    let endpoint =
      EndPoint::from_config(&self.name, self.spec.protocol, port, self.bind, config)?;
    let current = self.endpoints.load_full();
    if current.iter().any(|e| e.name() == endpoint.name()) {
      return Err(ConfigError::DuplicateName {
        kind: "endpoint",
        name: endpoint.name().to_string(),
      });
    }
    let mut next = (*current).clone();
    next.push(Arc::clone(&endpoint));
    self.endpoints.store(Arc::new(next));
    tracing::info!(cluster = %self.name, endpoint = %endpoint.name(), "endpoint added");
    Ok(endpoint)
  }

  /// Remove an endpoint from the live set. Streams already opened through it
  /// keep running; only new selection is affected.
  pub fn delete_endpoint(&self, name: &str) -> Result<(), ConfigError> {
    let current = self.endpoints.load_full();
    if !current.iter().any(|e| e.name() == name) {
      return Err(ConfigError::Unknown {
        kind: "endpoint",
        name: name.to_string(),
      });
    }
    let next: Vec<_> = current
      .iter()
      .filter(|e| e.name() != name)
      .cloned()
      .collect();
    self.endpoints.store(Arc::new(next));
    tracing::info!(cluster = %self.name, endpoint = %name, "endpoint deleted");
    Ok(())
  }

  /// Empty the endpoint set, failing any future selection. Used when the
  /// cluster is deleted while routes still hold a handle to it.
  pub(crate) fn drain_endpoints(&self) {
    self.endpoints.store(Arc::new(Vec::new()));
  }

  /// Produce a ready stream for a session: select an endpoint, connect, race
  /// the cluster timeout, and wrap the transport in the endpoint's byte
  /// accounting.
  pub async fn stream(&self, session: &str) -> Result<ClusterStream, ClusterError> {
    if self.spec.protocol.is_synthetic() {
      self.stats.total_sessions.fetch_add(1, Ordering::Relaxed);
      tracing::trace!(cluster = %self.name, session, "synthetic stream");
      return Ok(ClusterStream {
        stream: WrappedStream::pass_through(),
        endpoint: None,
      });
    }
    let endpoints = self.endpoints.load_full();
    let endpoint = self.loadbalancer.apply(&endpoints, session)?;
    let stream = match tokio::time::timeout(self.timeout(), endpoint.connect(session)).await {
      Ok(Ok(stream)) => stream,
      Ok(Err(error)) => return Err(ClusterError::Connect(error)),
      Err(_) => {
        return Err(ClusterError::ConnectTimeout {
          timeout: self.timeout(),
        })
      }
    };
    endpoint
      .stats()
      .total_sessions
      .fetch_add(1, Ordering::Relaxed);
    self.stats.total_sessions.fetch_add(1, Ordering::Relaxed);
    let metered = Metered::new(stream, Arc::clone(&endpoint.stats().counter))
      .with_active_guard(ActiveGuard::acquire(&endpoint.stats().active_sessions));
    Ok(ClusterStream {
      stream: WrappedStream::Metered(Box::new(metered)),
      endpoint: Some(endpoint),
    })
  }

  pub fn snapshot(&self) -> ClusterSnapshot {
    ClusterSnapshot {
      name: self.name.clone(),
      mode: self.spec.protocol.stream_mode(),
      spec: self.spec.clone(),
      loadbalancer: self.loadbalancer,
      endpoints: self
        .endpoints
        .load()
        .iter()
        .map(|endpoint| endpoint.snapshot())
        .collect(),
      total_sessions: self.stats.total_sessions.load(Ordering::Relaxed),
    }
  }
}

impl std::fmt::Debug for Cluster {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Cluster")
      .field("name", &self.name)
      .field("spec", &self.spec)
      .field("loadbalancer", &self.loadbalancer)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
  pub name: String,
  pub mode: StreamMode,
  pub spec: ClusterSpec,
  pub loadbalancer: LoadBalancingPolicy,
  pub endpoints: Vec<EndPointSnapshot>,
  pub total_sessions: u64,
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::Ordering;

  use futures::FutureExt;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, UdpSocket};

  use crate::common::cluster::endpoint::test_connectors::{
    refused, FnConnector, MockConnector, PendingConnector,
  };

  use super::*;

  fn echo_config(name: &str) -> ClusterConfig {
    ClusterConfig {
      name: name.to_string(),
      spec: ClusterSpec {
        protocol: Protocol::Echo,
        port: None,
        bind: None,
        timeout_ms: 2000,
        retriable: true,
      },
      endpoints: Vec::new(),
      loadbalancer: None,
    }
  }

  #[tokio::test]
  async fn stream_fails_without_endpoints() {
    let cluster = Cluster::for_tests("empty", Vec::new(), Duration::from_millis(100), true);
    let err = cluster.stream("s1").await.unwrap_err();
    assert!(matches!(err, ClusterError::NoEndPoint));
  }

  #[tokio::test(start_paused = true)]
  async fn stream_times_out_against_unresponsive_endpoint() {
    let endpoint = EndPoint::with_connector("slow", Box::new(PendingConnector));
    let cluster = Cluster::for_tests("dest", vec![endpoint], Duration::from_millis(100), true);
    let err = cluster.stream("s1").await.unwrap_err();
    assert!(matches!(err, ClusterError::ConnectTimeout { .. }));
  }

  #[tokio::test]
  async fn stream_surfaces_connect_errors() {
    let endpoint = EndPoint::with_connector("down", Box::new(FnConnector(|| Err(refused()))));
    let cluster = Cluster::for_tests(
      "dest",
      vec![Arc::clone(&endpoint)],
      Duration::from_millis(100),
      true,
    );
    let err = cluster.stream("s1").await.unwrap_err();
    assert!(matches!(err, ClusterError::Connect(_)));
    assert_eq!(endpoint.stats().connect_attempts.load(Ordering::Relaxed), 1);
    assert_eq!(endpoint.stats().total_sessions.load(Ordering::Relaxed), 0);
  }

  #[tokio::test]
  async fn stream_connects_once_and_meters_traffic() {
    let mut mock = MockConnector::new();
    mock
      .expect_connect()
      .times(1)
      .returning(|_| futures::future::ready(Ok(WrappedStream::pass_through())).boxed());
    let endpoint = EndPoint::with_connector("up", Box::new(mock));
    let cluster = Cluster::for_tests(
      "dest",
      vec![Arc::clone(&endpoint)],
      Duration::from_millis(100),
      true,
    );

    let mut ready = cluster.stream("s1").await.unwrap();
    assert_eq!(ready.endpoint.as_ref().unwrap().name(), "up");
    assert_eq!(endpoint.stats().active_sessions.load(Ordering::Relaxed), 1);

    ready.stream.write_all(b"meter").await.unwrap();
    let mut buf = [0u8; 5];
    ready.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"meter");
    assert_eq!(endpoint.stats().counter.bytes_out(), 5);
    assert_eq!(endpoint.stats().counter.bytes_in(), 5);
    assert_eq!(endpoint.stats().total_sessions.load(Ordering::Relaxed), 1);

    drop(ready);
    assert_eq!(endpoint.stats().active_sessions.load(Ordering::Relaxed), 0);
  }

  #[tokio::test]
  async fn echo_cluster_streams_without_endpoints() {
    let cluster = Cluster::new(echo_config("echo")).unwrap();
    let mut ready = cluster.stream("s1").await.unwrap();
    assert!(ready.endpoint.is_none());
    ready.stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    ready.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
  }

  #[tokio::test]
  async fn tcp_cluster_dials_real_listener() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let cluster = Cluster::new(ClusterConfig {
      name: "dest".to_string(),
      spec: ClusterSpec {
        protocol: Protocol::Tcp,
        port: Some(port),
        bind: None,
        timeout_ms: 2000,
        retriable: true,
      },
      endpoints: vec![EndPointConfig {
        name: Some("local".to_string()),
        spec: EndPointSpec {
          address: "127.0.0.1".to_string(),
        },
        weight: None,
      }],
      loadbalancer: None,
    })
    .unwrap();

    let mut ready = cluster.stream("s1").await?;
    let (mut accepted, _) = listener.accept().await?;
    ready.stream.write_all(b"over tcp").await?;
    let mut buf = [0u8; 8];
    accepted.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"over tcp");
    Ok(())
  }

  #[tokio::test]
  async fn udp_cluster_exchanges_datagrams() -> anyhow::Result<()> {
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let port = peer.local_addr()?.port();
    let cluster = Cluster::new(ClusterConfig {
      name: "dest".to_string(),
      spec: ClusterSpec {
        protocol: Protocol::Udp,
        port: Some(port),
        bind: None,
        timeout_ms: 2000,
        retriable: true,
      },
      endpoints: vec![EndPointConfig {
        name: Some("local".to_string()),
        spec: EndPointSpec {
          address: "127.0.0.1".to_string(),
        },
        weight: None,
      }],
      loadbalancer: None,
    })
    .unwrap();

    let mut ready = cluster.stream("s1").await?;
    ready.stream.write_all(b"dgram").await?;
    let mut buf = [0u8; 16];
    let (received, from) = peer.recv_from(&mut buf).await?;
    assert_eq!(&buf[..received], b"dgram");
    peer.send_to(b"reply", from).await?;
    let read = ready.stream.read(&mut buf).await?;
    assert_eq!(&buf[..read], b"reply");
    Ok(())
  }

  #[tokio::test]
  async fn endpoints_can_be_added_and_deleted_live() {
    let cluster = Cluster::for_tests("dest", Vec::new(), Duration::from_millis(100), true);
    let added = cluster
      .add_endpoint(EndPointConfig {
        name: Some("a".to_string()),
        spec: EndPointSpec {
          address: "10.0.0.1".to_string(),
        },
        weight: None,
      })
      .unwrap();
    assert_eq!(added.name(), "a");
    assert_eq!(cluster.endpoints().len(), 1);

    let err = cluster
      .add_endpoint(EndPointConfig {
        name: Some("a".to_string()),
        spec: EndPointSpec {
          address: "10.0.0.2".to_string(),
        },
        weight: None,
      })
      .unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateName { kind: "endpoint", .. }));

    assert!(matches!(
      cluster.delete_endpoint("missing").unwrap_err(),
      ConfigError::Unknown { kind: "endpoint", .. }
    ));
    cluster.delete_endpoint("a").unwrap();
    assert!(cluster.endpoints().is_empty());
  }

  #[test]
  fn snapshot_reports_the_stream_mode() {
    let echo = Cluster::new(echo_config("echo")).unwrap();
    assert_eq!(echo.snapshot().mode, StreamMode::Datagram);
    let tcp = Cluster::for_tests("dest", Vec::new(), Duration::from_millis(100), true);
    assert_eq!(tcp.snapshot().mode, StreamMode::Byte);
  }

  #[test]
  fn synthetic_clusters_reject_endpoints() {
    let mut config = echo_config("echo");
    config.endpoints.push(EndPointConfig {
      name: None,
      spec: EndPointSpec {
        address: "10.0.0.1".to_string(),
      },
      weight: None,
    });
    assert!(matches!(
      Cluster::new(config).unwrap_err(),
      ConfigError::EndPointsNotSupported { .. }
    ));
  }

  #[test]
  fn transport_clusters_require_a_port() {
    let config = ClusterConfig {
      name: "dest".to_string(),
      spec: ClusterSpec {
        protocol: Protocol::Tcp,
        port: None,
        bind: None,
        timeout_ms: 2000,
        retriable: true,
      },
      endpoints: Vec::new(),
      loadbalancer: None,
    };
    assert!(matches!(
      Cluster::new(config).unwrap_err(),
      ConfigError::MissingPort { .. }
    ));
  }
}
