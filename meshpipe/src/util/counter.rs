// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Byte-level accounting shared between a stream wrapper and the entity
/// (endpoint or cluster) whose traffic it carries.
///
/// `bytes_in` counts bytes received from the remote, `bytes_out` bytes sent
/// toward it. Counters are monotonic and relaxed; they feed introspection,
/// never control flow.
#[derive(Debug, Default)]
pub struct ByteCounter {
  bytes_in: AtomicU64,
  bytes_out: AtomicU64,
}

impl ByteCounter {
  pub fn bytes_in(&self) -> u64 {
    self.bytes_in.load(Ordering::Relaxed)
  }

  pub fn bytes_out(&self) -> u64 {
    self.bytes_out.load(Ordering::Relaxed)
  }

  fn add_in(&self, n: u64) {
    self.bytes_in.fetch_add(n, Ordering::Relaxed);
  }

  fn add_out(&self, n: u64) {
    self.bytes_out.fetch_add(n, Ordering::Relaxed);
  }
}

/// Decrements its paired gauge when the guarded stream goes away.
pub struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
  pub fn acquire(gauge: &Arc<AtomicUsize>) -> Self {
    gauge.fetch_add(1, Ordering::Relaxed);
    ActiveGuard(Arc::clone(gauge))
  }
}

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::Relaxed);
  }
}

pin_project! {
  /// Stream wrapper that feeds a [`ByteCounter`] as traffic passes through.
  pub struct Metered<S> {
    #[pin]
    inner: S,
    counter: Arc<ByteCounter>,
    active: Option<ActiveGuard>,
  }
}

impl<S> Metered<S> {
  pub fn new(inner: S, counter: Arc<ByteCounter>) -> Self {
    Self {
      inner,
      counter,
      active: None,
    }
  }

  /// Attach a session gauge guard, released when the stream is dropped.
  pub fn with_active_guard(mut self, guard: ActiveGuard) -> Self {
    self.active = Some(guard);
    self
  }
}

impl<S: AsyncRead> AsyncRead for Metered<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.project();
    let filled_before = buf.filled().len();
    let res = this.inner.poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = res {
      this.counter.add_in((buf.filled().len() - filled_before) as u64);
    }
    res
  }
}

impl<S: AsyncWrite> AsyncWrite for Metered<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.project();
    match this.inner.poll_write(cx, buf) {
      Poll::Ready(Ok(written)) => {
        this.counter.add_out(written as u64);
        Poll::Ready(Ok(written))
      }
      other => other,
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.project().inner.poll_shutdown(cx)
  }
}
