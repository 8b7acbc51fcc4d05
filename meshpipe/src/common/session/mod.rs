// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Sessions: the lifecycle wrapper around one bound route. A session is
//! created by a listener handing its stream to the registry, lives in a
//! supervisor task that drives the route's event loop, and removes itself
//! from the registry once the route is disposable.

use std::future::Future;
use std::io::Error as IOError;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing_futures::Instrument;

use crate::common::cluster::Cluster;
use crate::common::route::{Route, RouteError, RouteEvent, RetryPolicy};
use crate::util::io_stream::WrappedStream;
use crate::util::lock_unpoisoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
  Init,
  Connected,
  Disconnected,
  Finalizing,
  Destroyed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
  Init,
  /// The full pipeline holds live streams, traffic can flow.
  Connect,
  /// A stage lost its stream; `error` is absent on clean end-of-file.
  Disconnect {
    origin: String,
    error: Option<Arc<IOError>>,
  },
  Error {
    error: Arc<RouteError>,
  },
  /// The session finished without error and is tearing down.
  End,
  /// Terminal; the session has been removed from the registry.
  Destroy,
}

/// Transport facts supplied by the emitting listener. The engine passes them
/// through untouched; only `name` is interpreted, as the session's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
  pub name: String,
  #[serde(flatten)]
  pub fields: serde_json::Map<String, serde_json::Value>,
}

impl SessionMetadata {
  pub fn new(name: impl Into<String>) -> Self {
    SessionMetadata {
      name: name.into(),
      fields: serde_json::Map::new(),
    }
  }

  pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    self.fields.insert(key.into(), value);
    self
  }
}

/// Session state shared between the handle, the route, and its subtasks.
pub struct SessionShared {
  metadata: SessionMetadata,
  status: std::sync::Mutex<SessionStatus>,
  events: broadcast::Sender<SessionEvent>,
  finalized: CancellationToken,
}

impl SessionShared {
  pub(crate) fn new(metadata: SessionMetadata) -> (Arc<Self>, broadcast::Receiver<SessionEvent>) {
    let (events, initial_rx) = broadcast::channel(32);
    let shared = Arc::new(SessionShared {
      metadata,
      status: std::sync::Mutex::new(SessionStatus::Init),
      events,
      finalized: CancellationToken::new(),
    });
    shared.emit(SessionEvent::Init);
    (shared, initial_rx)
  }

  pub fn name(&self) -> &str {
    &self.metadata.name
  }

  pub fn metadata(&self) -> &SessionMetadata {
    &self.metadata
  }

  pub fn status(&self) -> SessionStatus {
    *lock_unpoisoned(&self.status)
  }

  pub(crate) fn set_status(&self, status: SessionStatus) {
    *lock_unpoisoned(&self.status) = status;
  }

  pub fn is_finalizing(&self) -> bool {
    matches!(
      self.status(),
      SessionStatus::Finalizing | SessionStatus::Destroyed
    )
  }

  pub(crate) fn emit(&self, event: SessionEvent) {
    // Send fails when nobody listens; lifecycle does not depend on observers.
    let _ = self.events.send(event);
  }

  pub fn subscribe(&self) -> BroadcastStream<SessionEvent> {
    BroadcastStream::new(self.events.subscribe())
  }

  /// Resolves once the session enters teardown; connect and reconnect
  /// subtasks abandon their work when this fires.
  pub(crate) fn finalized(&self) -> WaitForCancellationFuture<'_> {
    self.finalized.cancelled()
  }

  pub(crate) fn finalize(&self) {
    self.finalized.cancel();
  }
}

pub(crate) enum SessionCommand {
  End,
}

/// Handle to a supervised session. Dropping the handle does not end the
/// session; call [`Session::end`] or delete it through the registry.
pub struct Session {
  shared: Arc<SessionShared>,
  route_name: String,
  /// Names of the clusters this session's route traverses.
  clusters: Vec<String>,
  ctl: mpsc::UnboundedSender<SessionCommand>,
  initial_rx: std::sync::Mutex<Option<broadcast::Receiver<SessionEvent>>>,
}

impl Session {
  /// Bind a route for a freshly emitted session. Returns the handle and the
  /// supervisor future; the caller registers the handle, then spawns the
  /// supervisor.
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn establish(
    metadata: SessionMetadata,
    source_name: String,
    source_stream: WrappedStream,
    route_name: String,
    destination: Arc<Cluster>,
    ingress: Vec<Arc<Cluster>>,
    egress: Vec<Arc<Cluster>>,
    retry: RetryPolicy,
    sessions: Arc<DashMap<String, Arc<Session>>>,
  ) -> (Arc<Session>, impl Future<Output = ()> + Send + 'static) {
    let (shared, initial_rx) = SessionShared::new(metadata);
    let clusters = std::iter::once(&destination)
      .chain(ingress.iter())
      .chain(egress.iter())
      .map(|cluster| cluster.name().to_string())
      .collect();
    let (route, route_events) = Route::bind(
      route_name.clone(),
      Arc::clone(&shared),
      source_name,
      source_stream,
      destination,
      ingress,
      egress,
      retry,
    );
    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session {
      shared: Arc::clone(&shared),
      route_name,
      clusters,
      ctl: ctl_tx,
      initial_rx: std::sync::Mutex::new(Some(initial_rx)),
    });
    let span = tracing::info_span!("session", name = %shared.name());
    let supervisor = supervise(route, route_events, ctl_rx, shared, sessions).instrument(span);
    (session, supervisor)
  }

  pub fn name(&self) -> &str {
    self.shared.name()
  }

  pub fn metadata(&self) -> &SessionMetadata {
    self.shared.metadata()
  }

  pub fn status(&self) -> SessionStatus {
    self.shared.status()
  }

  pub fn route_name(&self) -> &str {
    &self.route_name
  }

  pub(crate) fn uses_cluster(&self, name: &str) -> bool {
    self.clusters.iter().any(|cluster| cluster == name)
  }

  /// The session's lifecycle events. The first call observes the full
  /// history from `init` on; later calls subscribe from the present.
  pub fn events(&self) -> BroadcastStream<SessionEvent> {
    match lock_unpoisoned(&self.initial_rx).take() {
      Some(rx) => BroadcastStream::new(rx),
      None => self.shared.subscribe(),
    }
  }

  /// Request a graceful teardown. Idempotent; the terminal `destroy` event
  /// still waits for any in-flight reconnect to stand down.
  pub fn end(&self) {
    let _ = self.ctl.send(SessionCommand::End);
  }

  pub fn snapshot(&self) -> SessionSnapshot {
    SessionSnapshot {
      name: self.shared.name().to_string(),
      route: self.route_name.clone(),
      status: self.shared.status(),
      metadata: self.shared.metadata().clone(),
    }
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("name", &self.shared.name())
      .field("route", &self.route_name)
      .field("status", &self.shared.status())
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
  pub name: String,
  pub route: String,
  pub status: SessionStatus,
  pub metadata: SessionMetadata,
}

/// Drive one session from bind to destroy: establish the pipeline, then loop
/// over route events and control commands until the route reports it is
/// disposable.
async fn supervise(
  mut route: Route,
  mut route_events: mpsc::UnboundedReceiver<RouteEvent>,
  mut ctl: mpsc::UnboundedReceiver<SessionCommand>,
  shared: Arc<SessionShared>,
  sessions: Arc<DashMap<String, Arc<Session>>>,
) {
  match route.pipeline().await {
    Ok(()) => {
      shared.set_status(SessionStatus::Connected);
      shared.emit(SessionEvent::Connect);
      tracing::info!(route = %route.name(), "session connected");
    }
    Err(error) => {
      tracing::info!(%error, "session failed to establish its pipeline");
      shared.set_status(SessionStatus::Finalizing);
      shared.emit(SessionEvent::Error {
        error: Arc::new(error),
      });
      shared.finalize();
      route.end();
      destroy(&shared, &sessions);
      return;
    }
  }

  let mut ctl_open = true;
  loop {
    tokio::select! {
      event = route_events.recv() => match event {
        Some(event) => {
          if route.on_event(event).is_break() {
            break;
          }
        }
        None => break,
      },
      command = ctl.recv(), if ctl_open => match command {
        Some(SessionCommand::End) => {
          if !shared.is_finalizing() {
            tracing::info!("session teardown requested");
            shared.set_status(SessionStatus::Finalizing);
            shared.emit(SessionEvent::End);
            shared.finalize();
            if route.end() {
              break;
            }
          }
        }
        // All handles dropped; sessions keep serving until their streams end.
        None => ctl_open = false,
      },
    }
  }
  destroy(&shared, &sessions);
}

fn destroy(shared: &Arc<SessionShared>, sessions: &DashMap<String, Arc<Session>>) {
  shared.set_status(SessionStatus::Destroyed);
  // Deregister before the terminal event so an observer of `destroy` never
  // finds the session still listed.
  sessions.remove(shared.name());
  shared.emit(SessionEvent::Destroy);
  tracing::info!("session destroyed");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn metadata_round_trips_arbitrary_fields() {
    let metadata: SessionMetadata = serde_json::from_str(
      r#"{"name":"udp:9.9.9.9:1234","ip":"9.9.9.9","port":1234}"#,
    )
    .unwrap();
    assert_eq!(metadata.name, "udp:9.9.9.9:1234");
    assert_eq!(metadata.fields["port"], 1234);
    let json = serde_json::to_value(&metadata).unwrap();
    assert_eq!(json["ip"], "9.9.9.9");
  }

  #[test]
  fn status_serializes_upper_case() {
    assert_eq!(
      serde_json::to_value(SessionStatus::Disconnected).unwrap(),
      "DISCONNECTED"
    );
  }
}
