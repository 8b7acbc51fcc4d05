// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::{Error as IOError, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpSocket, TcpStream, UdpSocket};
use uuid::Uuid;

use crate::common::cluster::Protocol;
use crate::common::config::ConfigError;
use crate::util::counter::ByteCounter;
use crate::util::io_stream::{DatagramStream, WrappedStream};

/// The seam through which an endpoint opens one raw transport connection.
///
/// Production connectors are TCP and connected UDP; tests substitute their own
/// to script connect outcomes without real sockets.
pub trait Connector: Send + Sync {
  fn connect(&self, session: &str) -> BoxFuture<'static, Result<WrappedStream, IOError>>;
}

/// Dials a TCP remote, optionally from a fixed local address.
pub struct TcpConnector {
  pub host: String,
  pub port: u16,
  pub bind: Option<SocketAddr>,
}

impl Connector for TcpConnector {
  fn connect(&self, _session: &str) -> BoxFuture<'static, Result<WrappedStream, IOError>> {
    let host = self.host.clone();
    let port = self.port;
    let bind = self.bind;
    async move {
      match bind {
        None => TcpStream::connect((host.as_str(), port))
          .await
          .map(WrappedStream::Tcp),
        Some(local) => {
          let mut last_error = None;
          for addr in lookup_host((host.as_str(), port)).await? {
            let socket = if addr.is_ipv4() {
              TcpSocket::new_v4()
            } else {
              TcpSocket::new_v6()
            }?;
            socket.bind(local)?;
            match socket.connect(addr).await {
              Ok(stream) => return Ok(WrappedStream::Tcp(stream)),
              Err(error) => last_error = Some(error),
            }
          }
          Err(last_error.unwrap_or_else(|| {
            IOError::new(ErrorKind::NotFound, "address resolved to no candidates")
          }))
        }
      }
    }
    .boxed()
  }
}

/// Opens a local UDP socket connected to the remote, exposed as a
/// datagram-per-read stream.
pub struct UdpConnector {
  pub host: String,
  pub port: u16,
  pub bind: Option<SocketAddr>,
}

impl Connector for UdpConnector {
  fn connect(&self, _session: &str) -> BoxFuture<'static, Result<WrappedStream, IOError>> {
    let host = self.host.clone();
    let port = self.port;
    let local = self
      .bind
      .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    async move {
      let socket = UdpSocket::bind(local).await?;
      socket.connect((host.as_str(), port)).await?;
      Ok(WrappedStream::Datagram(DatagramStream::new(socket)))
    }
    .boxed()
  }
}

/// Endpoint spec: the per-endpoint address; port and local bind come from the
/// owning cluster's spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndPointSpec {
  pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndPointConfig {
  /// Generated when absent.
  #[serde(default)]
  pub name: Option<String>,
  pub spec: EndPointSpec,
  #[serde(default)]
  pub weight: Option<f64>,
}

#[derive(Debug, Default)]
pub struct EndPointStats {
  pub active_sessions: Arc<AtomicUsize>,
  pub total_sessions: AtomicU64,
  pub connect_attempts: AtomicU64,
  pub counter: Arc<ByteCounter>,
}

/// One target of a cluster: a name, an address spec, a relative weight, and
/// the connector that turns it into live transport streams.
pub struct EndPoint {
  name: String,
  spec: EndPointSpec,
  weight: f64,
  connector: Box<dyn Connector>,
  stats: EndPointStats,
}

impl EndPoint {
  pub(crate) fn from_config(
    cluster_name: &str,
    protocol: Protocol,
    port: u16,
    bind: Option<SocketAddr>,
    config: EndPointConfig,
  ) -> Result<Arc<EndPoint>, ConfigError> {
    let connector: Box<dyn Connector> = match protocol {
      Protocol::Tcp => Box::new(TcpConnector {
        host: config.spec.address.clone(),
        port,
        bind,
      }),
      Protocol::Udp => Box::new(UdpConnector {
        host: config.spec.address.clone(),
        port,
        bind,
      }),
      Protocol::Echo => {
        return Err(ConfigError::EndPointsNotSupported {
          cluster: cluster_name.to_string(),
          protocol,
        })
      }
    };
    Ok(Arc::new(EndPoint {
      name: config
        .name
        .unwrap_or_else(|| format!("endpoint-{}", Uuid::new_v4())),
      spec: config.spec,
      weight: config.weight.unwrap_or(1.0),
      connector,
      stats: EndPointStats::default(),
    }))
  }

  #[cfg(test)]
  pub(crate) fn with_connector(name: &str, connector: Box<dyn Connector>) -> Arc<EndPoint> {
    Arc::new(EndPoint {
      name: name.to_string(),
      spec: EndPointSpec {
        address: format!("{name}.test.invalid"),
      },
      weight: 1.0,
      connector,
      stats: EndPointStats::default(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn spec(&self) -> &EndPointSpec {
    &self.spec
  }

  pub fn weight(&self) -> f64 {
    self.weight
  }

  pub fn stats(&self) -> &EndPointStats {
    &self.stats
  }

  pub(crate) async fn connect(&self, session: &str) -> Result<WrappedStream, IOError> {
    self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(endpoint = %self.name, address = %self.spec.address, session, "opening transport connection");
    self.connector.connect(session).await
  }

  pub fn snapshot(&self) -> EndPointSnapshot {
    EndPointSnapshot {
      name: self.name.clone(),
      spec: self.spec.clone(),
      weight: self.weight,
      total_sessions: self.stats.total_sessions.load(Ordering::Relaxed),
    }
  }
}

impl std::fmt::Debug for EndPoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EndPoint")
      .field("name", &self.name)
      .field("spec", &self.spec)
      .field("weight", &self.weight)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndPointSnapshot {
  pub name: String,
  pub spec: EndPointSpec,
  pub weight: f64,
  pub total_sessions: u64,
}
