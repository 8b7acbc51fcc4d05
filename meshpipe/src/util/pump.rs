// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use crate::common::route::{RouteEvent, StagePosition};

use super::io_stream::WrappedStream;

pub(crate) type SharedReader = Arc<Mutex<ReadHalf<WrappedStream>>>;
pub(crate) type SharedWriter = Arc<Mutex<WriteHalf<WrappedStream>>>;

const PUMP_BUFFER_CAPACITY: usize = 1024 * 32;

/// Forward bytes from one stage's read side to the next stage's write side
/// until either side terminates, then report which stage ended the edge.
///
/// Each half is locked for the lifetime of the pump; aborting the pump task
/// releases the halves so a reconnected stage can be piped back in. Events are
/// tagged with the stream epoch observed at spawn time, letting the route
/// discard reports that outlived a repipe.
pub(crate) async fn pump(
  from: StagePosition,
  from_epoch: u64,
  to: StagePosition,
  to_epoch: u64,
  reader: SharedReader,
  writer: SharedWriter,
  events: mpsc::UnboundedSender<RouteEvent>,
) {
  let mut reader_guard = reader.lock_owned().await;
  let mut writer_guard = writer.lock_owned().await;
  let reader = &mut *reader_guard;
  let writer = &mut *writer_guard;
  let mut buf = vec![0u8; PUMP_BUFFER_CAPACITY];
  loop {
    let read = match reader.read(&mut buf).await {
      Ok(0) => {
        tracing::trace!(stage = %from, "stream end-of-file");
        let _ = events.send(RouteEvent::StageClosed {
          position: from,
          epoch: from_epoch,
          error: None,
        });
        return;
      }
      Ok(read) => read,
      Err(error) => {
        tracing::trace!(stage = %from, %error, "stream read failed");
        let _ = events.send(RouteEvent::StageClosed {
          position: from,
          epoch: from_epoch,
          error: Some(Arc::new(error)),
        });
        return;
      }
    };
    let forward = async {
      writer.write_all(&buf[..read]).await?;
      writer.flush().await
    };
    if let Err(error) = forward.await {
      tracing::trace!(stage = %to, %error, "stream write failed");
      let _ = events.send(RouteEvent::StageClosed {
        position: to,
        epoch: to_epoch,
        error: Some(Arc::new(error)),
      });
      return;
    }
  }
}
