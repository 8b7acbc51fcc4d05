// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A programmable layer-7 session pipeline engine.
//!
//! Listeners accept connections and emit them into a [`Registry`] as
//! sessions: a bundle of transport metadata plus a bidirectional byte
//! stream. A route template binds each session to a pipeline that chains the
//! listener stream through ingress clusters, a destination cluster, and
//! egress clusters; the bound route then supervises connection, piping, and
//! per-stage reconnection under the route's retry policy until the session
//! ends.
//!
//! The engine is deliberately transport-agnostic at both edges: anything that
//! can produce a [`WrappedStream`](util::io_stream::WrappedStream) can emit
//! sessions, and clusters reach their endpoints through a pluggable
//! [`Connector`](common::cluster::Connector) seam.
//!
//! [`Registry`]: common::registry::Registry

pub mod common;
pub mod util;
