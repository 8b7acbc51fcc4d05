// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bound routes: the per-session pipeline that chains the listener stream
//! through ingress clusters, the destination, and egress clusters, and keeps
//! the chain alive under the session's retry policy.

use std::io::Error as IOError;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::common::cluster::{Cluster, ClusterError};
use crate::common::session::{SessionEvent, SessionShared, SessionStatus};
use crate::util::io_stream::WrappedStream;
use crate::util::lock_unpoisoned;
use crate::util::pump::{pump, SharedReader, SharedWriter};

/// Which stage failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryOn {
  Never,
  ConnectFailure,
  Disconnect,
  Always,
}

impl Default for RetryOn {
  fn default() -> Self {
    RetryOn::Never
  }
}

impl RetryOn {
  pub fn retries_connect_failure(self) -> bool {
    matches!(self, RetryOn::ConnectFailure | RetryOn::Always)
  }

  pub fn retries_disconnect(self) -> bool {
    matches!(self, RetryOn::Disconnect | RetryOn::Always)
  }
}

fn default_retry_timeout_ms() -> u64 {
  2000
}

/// Per-route retry policy. The timeout doubles as the constant inter-attempt
/// delay and the reconnect dampening window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
  #[serde(default)]
  pub retry_on: RetryOn,
  #[serde(default)]
  pub num_retries: u32,
  #[serde(default = "default_retry_timeout_ms")]
  pub timeout_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    RetryPolicy {
      retry_on: RetryOn::default(),
      num_retries: 0,
      timeout_ms: default_retry_timeout_ms(),
    }
  }
}

impl RetryPolicy {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

/// A stage's slot in the chain. Identity is positional: a reconnected stream
/// is piped back into the same slot regardless of which streams died
/// meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagePosition {
  Source,
  Ingress(usize),
  Destination,
  Egress(usize),
}

impl std::fmt::Display for StagePosition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StagePosition::Source => f.write_str("source"),
      StagePosition::Ingress(i) => write!(f, "ingress[{i}]"),
      StagePosition::Destination => f.write_str("destination"),
      StagePosition::Egress(i) => write!(f, "egress[{i}]"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
  Init,
  Connected,
  Ready,
  Disconnected,
  Retrying,
  End,
}

/// Stage state shared with connect and reconnect subtasks.
#[derive(Debug)]
pub(crate) struct StageShared {
  status: std::sync::Mutex<StageStatus>,
  last_conn: std::sync::Mutex<Option<Instant>>,
}

impl StageShared {
  fn new() -> Arc<Self> {
    Arc::new(StageShared {
      status: std::sync::Mutex::new(StageStatus::Init),
      last_conn: std::sync::Mutex::new(None),
    })
  }

  pub(crate) fn status(&self) -> StageStatus {
    *lock_unpoisoned(&self.status)
  }

  fn set_status(&self, status: StageStatus) {
    *lock_unpoisoned(&self.status) = status;
  }

  fn mark_connected(&self) {
    self.set_status(StageStatus::Connected);
    *lock_unpoisoned(&self.last_conn) = Some(Instant::now());
  }

  fn last_conn(&self) -> Option<Instant> {
    *lock_unpoisoned(&self.last_conn)
  }
}

enum StageOrigin {
  /// The listener-side stage; its stream pre-exists the route and cannot be
  /// reconnected from here.
  Listener { name: String },
  Cluster(Arc<Cluster>),
}

impl StageOrigin {
  fn name(&self) -> &str {
    match self {
      StageOrigin::Listener { name } => name,
      StageOrigin::Cluster(cluster) => cluster.name(),
    }
  }
}

struct Stage {
  origin: StageOrigin,
  shared: Arc<StageShared>,
  /// Bumped on every stream install; terminal events carrying an older epoch
  /// refer to a stream that has already been replaced.
  epoch: u64,
  reader: Option<SharedReader>,
  writer: Option<SharedWriter>,
}

impl Stage {
  fn new(origin: StageOrigin) -> Stage {
    Stage {
      origin,
      shared: StageShared::new(),
      epoch: 0,
      reader: None,
      writer: None,
    }
  }

  fn install(&mut self, stream: WrappedStream) {
    let (reader, writer) = tokio::io::split(stream);
    self.reader = Some(Arc::new(tokio::sync::Mutex::new(reader)));
    self.writer = Some(Arc::new(tokio::sync::Mutex::new(writer)));
    self.epoch += 1;
  }

  fn drop_stream(&mut self) {
    self.reader = None;
    self.writer = None;
  }
}

/// Reports from pump and reconnect subtasks back to the session supervisor.
pub(crate) enum RouteEvent {
  StageClosed {
    position: StagePosition,
    epoch: u64,
    /// `None` for a clean end-of-file.
    error: Option<Arc<IOError>>,
  },
  StageReconnected {
    position: StagePosition,
    stream: WrappedStream,
  },
  StageRetryFailed {
    position: StagePosition,
    error: RouteError,
  },
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
  #[error("could not connect stage \"{stage}\": {source}")]
  StageFailed {
    stage: String,
    #[source]
    source: ClusterError,
  },
  #[error("stage \"{stage}\" disconnected: {error}")]
  StageDisconnected { stage: String, error: Arc<IOError> },
  #[error("stage \"{stage}\" is not retriable")]
  StageNotRetriable { stage: String },
  #[error("stage \"{stage}\" already ended, not retrying")]
  StageEnded { stage: String },
  #[error("refusing to retry connected stage \"{stage}\"")]
  StageConnected { stage: String },
  #[error("session finalizing, abandoning retry of stage \"{stage}\"")]
  SessionFinalizing { stage: String },
}

struct Pump {
  from: StagePosition,
  to: StagePosition,
  handle: JoinHandle<()>,
}

/// A route bound to one session: the listener stream plus one stage per
/// cluster in the chain, the pumps wiring them together, and the bookkeeping
/// to retry and repipe failed stages.
pub(crate) struct Route {
  name: String,
  session: Arc<SessionShared>,
  retry: RetryPolicy,
  source: Stage,
  ingress: Vec<Stage>,
  destination: Stage,
  egress: Vec<Stage>,
  pumps: Vec<Pump>,
  events_tx: mpsc::UnboundedSender<RouteEvent>,
  /// Stages currently holding a live stream.
  active_streams: usize,
  num_streams: usize,
}

impl Route {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn bind(
    name: String,
    session: Arc<SessionShared>,
    source_name: String,
    source_stream: WrappedStream,
    destination: Arc<Cluster>,
    ingress: Vec<Arc<Cluster>>,
    egress: Vec<Arc<Cluster>>,
    retry: RetryPolicy,
  ) -> (Route, mpsc::UnboundedReceiver<RouteEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut source = Stage::new(StageOrigin::Listener { name: source_name });
    source.install(source_stream);
    source.shared.mark_connected();
    let ingress: Vec<_> = ingress
      .into_iter()
      .map(|cluster| Stage::new(StageOrigin::Cluster(cluster)))
      .collect();
    let egress: Vec<_> = egress
      .into_iter()
      .map(|cluster| Stage::new(StageOrigin::Cluster(cluster)))
      .collect();
    let num_streams = 2 + ingress.len() + egress.len();
    let route = Route {
      name,
      session,
      retry,
      source,
      ingress,
      destination: Stage::new(StageOrigin::Cluster(destination)),
      egress,
      pumps: Vec::new(),
      events_tx,
      active_streams: 1,
      num_streams,
    };
    (route, events_rx)
  }

  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  fn stage(&self, position: StagePosition) -> &Stage {
    match position {
      StagePosition::Source => &self.source,
      StagePosition::Ingress(i) => &self.ingress[i],
      StagePosition::Destination => &self.destination,
      StagePosition::Egress(i) => &self.egress[i],
    }
  }

  fn stage_mut(&mut self, position: StagePosition) -> &mut Stage {
    match position {
      StagePosition::Source => &mut self.source,
      StagePosition::Ingress(i) => &mut self.ingress[i],
      StagePosition::Destination => &mut self.destination,
      StagePosition::Egress(i) => &mut self.egress[i],
    }
  }

  /// Every stage slot, chain order.
  fn positions(&self) -> Vec<StagePosition> {
    let mut positions = Vec::with_capacity(self.num_streams);
    positions.push(StagePosition::Source);
    positions.extend((0..self.ingress.len()).map(StagePosition::Ingress));
    positions.push(StagePosition::Destination);
    positions.extend((0..self.egress.len()).map(StagePosition::Egress));
    positions
  }

  /// Cluster-backed stage slots, connect order.
  fn cluster_positions(&self) -> Vec<StagePosition> {
    let mut positions = Vec::with_capacity(self.num_streams - 1);
    positions.extend((0..self.ingress.len()).map(StagePosition::Ingress));
    positions.extend((0..self.egress.len()).map(StagePosition::Egress));
    positions.push(StagePosition::Destination);
    positions
  }

  /// The directed edges of the chain: source through ingress stages into the
  /// destination, then destination through egress stages back to the source.
  fn chain_edges(&self) -> Vec<(StagePosition, StagePosition)> {
    let mut edges = Vec::with_capacity(self.num_streams);
    let mut from = StagePosition::Source;
    for i in 0..self.ingress.len() {
      edges.push((from, StagePosition::Ingress(i)));
      from = StagePosition::Ingress(i);
    }
    edges.push((from, StagePosition::Destination));
    let mut from = StagePosition::Destination;
    for i in 0..self.egress.len() {
      edges.push((from, StagePosition::Egress(i)));
      from = StagePosition::Egress(i);
    }
    edges.push((from, StagePosition::Source));
    edges
  }

  /// Upstream and downstream neighbors derived purely from the stage's slot,
  /// so a replacement stream lands back exactly where the old one sat.
  fn neighbors(&self, position: StagePosition) -> (StagePosition, StagePosition) {
    let last_ingress = self.ingress.len().checked_sub(1).map(StagePosition::Ingress);
    let last_egress = self.egress.len().checked_sub(1).map(StagePosition::Egress);
    match position {
      StagePosition::Source => (
        last_egress.unwrap_or(StagePosition::Destination),
        if self.ingress.is_empty() {
          StagePosition::Destination
        } else {
          StagePosition::Ingress(0)
        },
      ),
      StagePosition::Destination => (
        last_ingress.unwrap_or(StagePosition::Source),
        if self.egress.is_empty() {
          StagePosition::Source
        } else {
          StagePosition::Egress(0)
        },
      ),
      StagePosition::Ingress(i) => (
        if i == 0 {
          StagePosition::Source
        } else {
          StagePosition::Ingress(i - 1)
        },
        if i + 1 == self.ingress.len() {
          StagePosition::Destination
        } else {
          StagePosition::Ingress(i + 1)
        },
      ),
      StagePosition::Egress(i) => (
        if i == 0 {
          StagePosition::Destination
        } else {
          StagePosition::Egress(i - 1)
        },
        if i + 1 == self.egress.len() {
          StagePosition::Source
        } else {
          StagePosition::Egress(i + 1)
        },
      ),
    }
  }

  /// Connect every cluster stage concurrently, then wire the pumps. Stage
  /// streams are only piped once all of them are up; a failed bind leaves no
  /// partial pipeline behind.
  pub(crate) async fn pipeline(&mut self) -> Result<(), RouteError> {
    let num_retries = if self.retry.retry_on.retries_connect_failure() {
      self.retry.num_retries
    } else {
      0
    };
    let retry_timeout = self.retry.timeout();

    let mut pending = Vec::new();
    for position in self.cluster_positions() {
      let stage = self.stage(position);
      let cluster = match &stage.origin {
        StageOrigin::Cluster(cluster) => Arc::clone(cluster),
        StageOrigin::Listener { .. } => continue,
      };
      let session = Arc::clone(&self.session);
      let shared = Arc::clone(&stage.shared);
      pending.push(async move {
        connect_stage(session, shared, cluster, num_retries, retry_timeout)
          .await
          .map(|stream| (position, stream))
      });
    }

    for (position, stream) in try_join_all(pending).await? {
      let stage = self.stage_mut(position);
      stage.install(stream);
      self.active_streams += 1;
    }
    debug_assert_eq!(self.active_streams, self.num_streams);

    for (from, to) in self.chain_edges() {
      self.spawn_pump(from, to);
    }
    for position in self.positions() {
      self.stage(position).shared.set_status(StageStatus::Ready);
    }
    tracing::debug!(
      session = %self.session.name(),
      route = %self.name,
      streams = self.active_streams,
      "pipeline established"
    );
    Ok(())
  }

  fn spawn_pump(&mut self, from: StagePosition, to: StagePosition) {
    let (reader, from_epoch) = {
      let stage = self.stage(from);
      (stage.reader.clone(), stage.epoch)
    };
    let (writer, to_epoch) = {
      let stage = self.stage(to);
      (stage.writer.clone(), stage.epoch)
    };
    let (Some(reader), Some(writer)) = (reader, writer) else {
      tracing::error!(%from, %to, "pump requested for a stage without a stream");
      return;
    };
    let span = tracing::debug_span!(
      "pump",
      session = %self.session.name(),
      %from,
      %to
    );
    let handle = tokio::spawn(
      pump(
        from,
        from_epoch,
        to,
        to_epoch,
        reader,
        writer,
        self.events_tx.clone(),
      )
      .instrument(span),
    );
    self.pumps.push(Pump { from, to, handle });
  }

  fn abort_pumps_touching(&mut self, position: StagePosition) {
    self.pumps.retain(|pump| {
      if pump.from == position || pump.to == position {
        pump.handle.abort();
        false
      } else {
        true
      }
    });
  }

  /// Dispatch one subtask report. `Break` means the session is over and the
  /// supervisor should emit `destroy`.
  pub(crate) fn on_event(&mut self, event: RouteEvent) -> ControlFlow<()> {
    match event {
      RouteEvent::StageClosed {
        position,
        epoch,
        error,
      } => self.stage_closed(position, epoch, error),
      RouteEvent::StageReconnected { position, stream } => self.stage_reconnected(position, stream),
      RouteEvent::StageRetryFailed { position, error } => self.stage_retry_failed(position, error),
    }
  }

  fn stage_closed(
    &mut self,
    position: StagePosition,
    epoch: u64,
    error: Option<Arc<IOError>>,
  ) -> ControlFlow<()> {
    let (stage_epoch, status, origin_name, cluster) = {
      let stage = self.stage(position);
      let cluster = match &stage.origin {
        StageOrigin::Cluster(cluster) => Some(Arc::clone(cluster)),
        StageOrigin::Listener { .. } => None,
      };
      (
        stage.epoch,
        stage.shared.status(),
        stage.origin.name().to_string(),
        cluster,
      )
    };
    if epoch != stage_epoch || status != StageStatus::Ready {
      // Both pumps of a failed stage may report; the first event wins.
      tracing::debug!(stage = %position, ?status, "ignoring duplicate or stale stage event");
      return ControlFlow::Continue(());
    }
    tracing::info!(
      session = %self.session.name(),
      stage = %position,
      origin = %origin_name,
      error = ?error,
      "stage disconnected"
    );

    self.abort_pumps_touching(position);
    {
      let stage = self.stage_mut(position);
      stage.shared.set_status(StageStatus::Disconnected);
      stage.drop_stream();
    }
    self.active_streams -= 1;

    if self.session.status() == SessionStatus::Connected {
      self.session.set_status(SessionStatus::Disconnected);
      self.session.emit(SessionEvent::Disconnect {
        origin: origin_name.clone(),
        error: error.clone(),
      });
    }

    if self.active_streams == 0 {
      self.session.set_status(SessionStatus::Finalizing);
      self.session.finalize();
      return self.end_control();
    }

    match self.retry.retry_on {
      RetryOn::Always | RetryOn::Disconnect => {
        if position == StagePosition::Source {
          tracing::info!(
            session = %self.session.name(),
            "listener stage closed, terminating session"
          );
          return self.fail(RouteError::StageNotRetriable { stage: origin_name });
        }
        let Some(cluster) = cluster else {
          return self.fail(RouteError::StageNotRetriable { stage: origin_name });
        };
        if !cluster.retriable() {
          tracing::info!(
            session = %self.session.name(),
            stage = %origin_name,
            "stage not retriable, terminating session"
          );
          return self.fail(RouteError::StageNotRetriable { stage: origin_name });
        }
        self.spawn_reconnect(position, cluster);
        ControlFlow::Continue(())
      }
      RetryOn::ConnectFailure | RetryOn::Never => {
        if self.session.status() == SessionStatus::Finalizing {
          return ControlFlow::Continue(());
        }
        match error {
          Some(error) => self.fail(RouteError::StageDisconnected {
            stage: origin_name,
            error,
          }),
          None => self.finish(),
        }
      }
    }
  }

  fn spawn_reconnect(&mut self, position: StagePosition, cluster: Arc<Cluster>) {
    let session = Arc::clone(&self.session);
    let shared = Arc::clone(&self.stage(position).shared);
    let events = self.events_tx.clone();
    let retry = self.retry.clone();
    let span = tracing::debug_span!(
      "reconnect",
      session = %session.name(),
      stage = %position
    );
    shared.set_status(StageStatus::Disconnected);
    tokio::spawn(
      async move {
        // Dampening: never redial within one retry timeout of the previous
        // successful connect, so a flapping peer cannot hot-loop us.
        let wait = match shared.last_conn() {
          Some(last_conn) => retry.timeout().saturating_sub(last_conn.elapsed()),
          None => Duration::ZERO,
        };
        if !wait.is_zero() {
          tracing::debug!(?wait, "dampening reconnect");
          tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = session.finalized() => {
              let _ = events.send(RouteEvent::StageRetryFailed {
                position,
                error: RouteError::SessionFinalizing {
                  stage: cluster.name().to_string(),
                },
              });
              return;
            }
          }
        }
        let num_retries = if retry.retry_on.retries_disconnect() {
          retry.num_retries
        } else {
          0
        };
        let outcome =
          connect_stage(session, shared, cluster, num_retries, retry.timeout()).await;
        let _ = events.send(match outcome {
          Ok(stream) => RouteEvent::StageReconnected { position, stream },
          Err(error) => RouteEvent::StageRetryFailed { position, error },
        });
      }
      .instrument(span),
    );
  }

  fn stage_reconnected(&mut self, position: StagePosition, stream: WrappedStream) -> ControlFlow<()> {
    if self.session.is_finalizing() {
      // The reconnect resolved after end(); drop the fresh stream and see
      // whether the route can now go away.
      self.stage_mut(position).shared.set_status(StageStatus::End);
      return self.end_control();
    }
    self.stage_mut(position).install(stream);
    self.active_streams += 1;
    self.repipe(position);
    self.stage(position).shared.set_status(StageStatus::Ready);
    tracing::info!(
      session = %self.session.name(),
      stage = %position,
      "stage reconnected"
    );
    if self.active_streams == self.num_streams {
      self.session.set_status(SessionStatus::Connected);
      self.session.emit(SessionEvent::Connect);
    }
    ControlFlow::Continue(())
  }

  /// Wire a replaced stream back into its slot: one pump from the upstream
  /// neighbor in, one pump out to the downstream neighbor.
  fn repipe(&mut self, position: StagePosition) {
    let (upstream, downstream) = self.neighbors(position);
    self.spawn_pump(upstream, position);
    self.spawn_pump(position, downstream);
    tracing::debug!(
      session = %self.session.name(),
      stage = %position,
      %upstream,
      %downstream,
      "stage repiped"
    );
  }

  fn stage_retry_failed(&mut self, position: StagePosition, error: RouteError) -> ControlFlow<()> {
    self.stage_mut(position).shared.set_status(StageStatus::End);
    if self.session.is_finalizing() {
      return self.end_control();
    }
    tracing::info!(
      session = %self.session.name(),
      stage = %position,
      %error,
      "stage reconnect failed"
    );
    self.fail(error)
  }

  fn fail(&mut self, error: RouteError) -> ControlFlow<()> {
    self.session.set_status(SessionStatus::Finalizing);
    self.session.emit(SessionEvent::Error {
      error: Arc::new(error),
    });
    self.session.finalize();
    self.end_control()
  }

  fn finish(&mut self) -> ControlFlow<()> {
    self.session.set_status(SessionStatus::Finalizing);
    self.session.emit(SessionEvent::End);
    self.session.finalize();
    self.end_control()
  }

  fn end_control(&mut self) -> ControlFlow<()> {
    if self.end() {
      ControlFlow::Break(())
    } else {
      ControlFlow::Continue(())
    }
  }

  /// Terminate every stage that is not mid-retry and tear down the pumps.
  /// Returns whether the route is fully disposable; a retrying stage keeps it
  /// alive until its reconnect subtask reports back.
  pub(crate) fn end(&mut self) -> bool {
    for pump in self.pumps.drain(..) {
      pump.handle.abort();
    }
    let mut disposable = true;
    for position in self.positions() {
      let stage = self.stage_mut(position);
      match stage.shared.status() {
        StageStatus::Retrying => {
          tracing::debug!(stage = %position, "stage mid-retry, deferring teardown");
          disposable = false;
        }
        StageStatus::End => {}
        _ => {
          stage.drop_stream();
          stage.shared.set_status(StageStatus::End);
        }
      }
    }
    disposable
  }
}

/// Connect one cluster stage with the route's bounded retry: up to
/// `1 + num_retries` attempts separated by a constant `retry_timeout` delay.
/// Aborts early when the session starts finalizing or the stage was already
/// terminated elsewhere.
async fn connect_stage(
  session: Arc<SessionShared>,
  shared: Arc<StageShared>,
  cluster: Arc<Cluster>,
  num_retries: u32,
  retry_timeout: Duration,
) -> Result<WrappedStream, RouteError> {
  let mut retries_left = num_retries;
  loop {
    if session.is_finalizing() {
      return Err(RouteError::SessionFinalizing {
        stage: cluster.name().to_string(),
      });
    }
    match shared.status() {
      StageStatus::End => {
        return Err(RouteError::StageEnded {
          stage: cluster.name().to_string(),
        })
      }
      StageStatus::Connected | StageStatus::Ready => {
        tracing::error!(stage = %cluster.name(), "refusing to retry a connected stage");
        return Err(RouteError::StageConnected {
          stage: cluster.name().to_string(),
        });
      }
      _ => {}
    }
    match cluster.stream(session.name()).await {
      Ok(ready) => {
        shared.mark_connected();
        tracing::info!(
          session = %session.name(),
          stage = %cluster.name(),
          endpoint = ready.endpoint.as_ref().map(|endpoint| endpoint.name()),
          "stage connected"
        );
        return Ok(ready.stream);
      }
      Err(error) => {
        if retries_left == 0 {
          shared.set_status(StageStatus::End);
          tracing::info!(
            session = %session.name(),
            stage = %cluster.name(),
            %error,
            "stage connect failed, retries exhausted"
          );
          return Err(RouteError::StageFailed {
            stage: cluster.name().to_string(),
            source: error,
          });
        }
        retries_left -= 1;
        shared.set_status(StageStatus::Retrying);
        tracing::info!(
          session = %session.name(),
          stage = %cluster.name(),
          retries_left,
          %error,
          "stage connect failed, retrying"
        );
        tokio::select! {
          _ = tokio::time::sleep(retry_timeout) => {}
          _ = session.finalized() => {
            return Err(RouteError::SessionFinalizing {
              stage: cluster.name().to_string(),
            })
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_stream::StreamExt;

  use crate::common::cluster::endpoint::test_connectors::{refused, FnConnector};
  use crate::common::cluster::EndPoint;
  use crate::common::session::SessionMetadata;

  use super::*;

  fn echo_cluster(name: &str) -> Arc<Cluster> {
    use crate::common::cluster::{ClusterConfig, ClusterSpec, Protocol};
    Cluster::new(ClusterConfig {
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
    })
    .unwrap()
  }

  fn bound_route(
    destination: Arc<Cluster>,
    retry: RetryPolicy,
  ) -> (
    Route,
    mpsc::UnboundedReceiver<RouteEvent>,
    WrappedStream,
    Arc<SessionShared>,
  ) {
    let (shared, _rx) = SessionShared::new(SessionMetadata::new("s1"));
    let (client, server) = WrappedStream::duplex(4096);
    let (route, events) = Route::bind(
      "r1".to_string(),
      Arc::clone(&shared),
      "listener-0".to_string(),
      server,
      destination,
      Vec::new(),
      Vec::new(),
      retry,
    );
    (route, events, client, shared)
  }

  #[tokio::test]
  async fn pipeline_echoes_through_the_chain() {
    let (mut route, _events, mut client, _shared) =
      bound_route(echo_cluster("dest"), RetryPolicy::default());
    route.pipeline().await.unwrap();

    client.write_all(b"test").await.unwrap();
    client.flush().await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"test");
    route.end();
  }

  #[tokio::test]
  async fn pipeline_failure_reports_the_stage() {
    let endpoint = EndPoint::with_connector("down", Box::new(FnConnector(|| Err(refused()))));
    let cluster = Cluster::for_tests("dest", vec![endpoint], Duration::from_millis(50), true);
    let (mut route, _events, _client, _shared) = bound_route(cluster, RetryPolicy::default());
    let err = route.pipeline().await.unwrap_err();
    assert!(matches!(err, RouteError::StageFailed { ref stage, .. } if stage == "dest"));
  }

  #[tokio::test]
  async fn duplicate_stage_closed_events_are_dropped() {
    let (shared, _rx) = SessionShared::new(SessionMetadata::new("s1"));
    let mut session_events = shared.subscribe();
    let (_client, server) = WrappedStream::duplex(4096);
    let (mut route, mut route_events) = Route::bind(
      "r1".to_string(),
      Arc::clone(&shared),
      "listener-0".to_string(),
      server,
      echo_cluster("dest"),
      Vec::new(),
      Vec::new(),
      RetryPolicy {
        retry_on: RetryOn::Disconnect,
        num_retries: 1,
        timeout_ms: 10,
      },
    );
    route.pipeline().await.unwrap();
    shared.set_status(SessionStatus::Connected);
    let epoch = route.stage(StagePosition::Destination).epoch;

    let first = route.on_event(RouteEvent::StageClosed {
      position: StagePosition::Destination,
      epoch,
      error: None,
    });
    assert_eq!(first, ControlFlow::Continue(()));
    assert_eq!(route.active_streams, route.num_streams - 1);

    // Same terminal event again, as the second pump of the edge would report.
    let second = route.on_event(RouteEvent::StageClosed {
      position: StagePosition::Destination,
      epoch,
      error: None,
    });
    assert_eq!(second, ControlFlow::Continue(()));
    assert_eq!(route.active_streams, route.num_streams - 1);

    // Exactly one session-level disconnect was emitted.
    let mut disconnects = 0;
    while let Ok(Some(event)) =
      tokio::time::timeout(Duration::from_millis(50), session_events.next()).await
    {
      if matches!(event, Ok(SessionEvent::Disconnect { .. })) {
        disconnects += 1;
      }
    }
    assert_eq!(disconnects, 1);

    // Drain the reconnect subtask's report so its stream is not leaked.
    while route_events.recv().await.is_some() {
      break;
    }
  }

  #[tokio::test]
  async fn end_is_deferred_while_a_stage_retries() {
    let (mut route, _events, _client, _shared) =
      bound_route(echo_cluster("dest"), RetryPolicy::default());
    route.pipeline().await.unwrap();

    route
      .stage(StagePosition::Destination)
      .shared
      .set_status(StageStatus::Retrying);
    assert!(!route.end(), "retrying stage must defer teardown");
    assert!(route.pumps.is_empty());
    assert_eq!(route.source.shared.status(), StageStatus::End);

    route
      .stage(StagePosition::Destination)
      .shared
      .set_status(StageStatus::End);
    assert!(route.end(), "route must be disposable once no stage retries");
  }

  #[tokio::test]
  async fn neighbors_are_positional() {
    let (shared, _rx) = SessionShared::new(SessionMetadata::new("s1"));
    let (_client, server) = WrappedStream::duplex(64);
    let (route, _events) = Route::bind(
      "r1".to_string(),
      shared,
      "listener-0".to_string(),
      server,
      echo_cluster("dest"),
      vec![echo_cluster("in0"), echo_cluster("in1")],
      vec![echo_cluster("eg0")],
      RetryPolicy::default(),
    );
    assert_eq!(
      route.neighbors(StagePosition::Ingress(0)),
      (StagePosition::Source, StagePosition::Ingress(1))
    );
    assert_eq!(
      route.neighbors(StagePosition::Ingress(1)),
      (StagePosition::Ingress(0), StagePosition::Destination)
    );
    assert_eq!(
      route.neighbors(StagePosition::Destination),
      (StagePosition::Ingress(1), StagePosition::Egress(0))
    );
    assert_eq!(
      route.neighbors(StagePosition::Egress(0)),
      (StagePosition::Destination, StagePosition::Source)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn connect_retries_use_a_constant_delay() {
    let endpoint = EndPoint::with_connector("down", Box::new(FnConnector(|| Err(refused()))));
    let cluster = Cluster::for_tests(
      "dest",
      vec![Arc::clone(&endpoint)],
      Duration::from_millis(1000),
      true,
    );
    let (shared, _rx) = SessionShared::new(SessionMetadata::new("s1"));
    let stage = StageShared::new();

    let started = Instant::now();
    let err = connect_stage(shared, stage, cluster, 2, Duration::from_millis(100)).await;
    assert!(matches!(err, Err(RouteError::StageFailed { .. })));
    let elapsed = started.elapsed();
    // Three attempts, two constant inter-attempt delays.
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(250), "elapsed {elapsed:?}");
    assert_eq!(
      endpoint
        .stats()
        .connect_attempts
        .load(std::sync::atomic::Ordering::Relaxed),
      3
    );
  }

  #[tokio::test]
  async fn connect_refuses_an_ended_stage() {
    let (shared, _rx) = SessionShared::new(SessionMetadata::new("s1"));
    let stage = StageShared::new();
    stage.set_status(StageStatus::End);
    let err = connect_stage(
      shared,
      stage,
      echo_cluster("dest"),
      0,
      Duration::from_millis(100),
    )
    .await;
    assert!(matches!(err, Err(RouteError::StageEnded { .. })));
  }

  #[tokio::test]
  async fn connect_refuses_a_finalizing_session() {
    let (shared, _rx) = SessionShared::new(SessionMetadata::new("s1"));
    shared.set_status(SessionStatus::Finalizing);
    let err = connect_stage(
      shared,
      StageShared::new(),
      echo_cluster("dest"),
      0,
      Duration::from_millis(100),
    )
    .await;
    assert!(matches!(err, Err(RouteError::SessionFinalizing { .. })));
  }
}
