// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A compact remote-procedure-call runtime.
//!
//! A server hosts named procedures that accept a small, typed parameter list and return a typed
//! value; clients invoke those procedures over a framed request/response protocol on TCP. A
//! connection carries exactly one request and exactly one response.
//!
//! The pieces, leaves first:
//!
//! - [`varint`]: the base-128/zigzag/size-prefixed integer codec everything else is built on.
//! - [`wire`]: the framed request/response protocol and the typed [`wire::Val`].
//! - [`slab`]: a generation-counted object pool used to allocate connection records.
//! - [`queue`]: the blocking MPMC FIFO that hands work between the reactor and worker threads.
//! - [`reactor`]: the low-level `poll(2)` wrapper and per-connection event bitmask.
//! - [`core`]: [`core::RpcCore`], which owns every socket and drives the per-connection state
//!   machine described in the module's own docs.
//! - [`dispatcher`]: [`dispatcher::Dispatcher`], the method table and worker pool that turn
//!   requests pulled off [`core::RpcCore::request_queue`] into responses.
//! - [`client`]: the blocking one-shot client call, plus a non-blocking callback-driven variant
//!   that reuses a running [`core::RpcCore`]'s reactor.
//!
//! This crate never initializes a logger; embed it in a binary that calls `env_logger::init()`
//! (or any other `log` backend) to see its `trace!`/`debug!`/`warn!`/`error!` output. The
//! separate, always-on log file described in [`core::RpcCore::init`]/[`core::RpcCore::write_log`]
//! is a distinct, operator-facing sink and is not related to the `log` crate.

pub mod client;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod reactor;
pub mod slab;
pub mod varint;
pub mod wire;

pub use error::{Error, ProtocolError};
