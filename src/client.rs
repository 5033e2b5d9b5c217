// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The blocking client: a one-shot connect/send/recv helper for a single RPC on a synchronous
//! socket. A connection carries exactly one request and exactly one response, so there is
//! nothing to pool or keep alive here.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use log::trace;

use crate::core;
use crate::error::Error;
use crate::wire::{self, MethodType, Request, Response, Val};

/// Sends `method_name(params)` to `addr` and blocks for the reply.
///
/// Opens a fresh TCP connection, writes the serialized request, then reads until
/// [`wire::get_package_size`] can determine the full frame length and parses it. The transaction
/// id is generated from the wall clock and is not required to be collision-free, since a
/// connection carries at most one RPC and nothing ever needs to match a reply against a table of
/// outstanding ids.
pub fn request(
    addr: impl ToSocketAddrs,
    method_type: MethodType,
    method_name: &str,
    params: Vec<Val>,
) -> Result<Response, Error> {
    let xid = core::generate_xid();
    let req = Request {
        method_type,
        xid,
        method_name: method_name.to_string(),
        params,
    };
    let bytes = wire::encode_request(&req);

    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(&bytes)?;
    trace!("sent {} byte request for {method_name}", bytes.len());

    read_response(&mut stream)
}

/// Reads frames off `stream` until a complete response is available, then parses it. Starts with
/// a ~10 KB stack-sized read to avoid a heap allocation for the common case of a small reply;
/// once the frame's declared length is known to exceed that, switches to a heap buffer sized to
/// fit it exactly.
fn read_response(stream: &mut TcpStream) -> Result<Response, Error> {
    const STACK_CAP: usize = 10 * 1024;
    let mut buf = Vec::with_capacity(STACK_CAP);
    let mut chunk = [0u8; 4096];

    loop {
        match wire::get_package_size(&buf) {
            Ok(Some(total)) if buf.len() >= total => {
                return wire::decode_response(&buf[..total]).map_err(Error::from);
            }
            Ok(Some(total)) if total > buf.capacity() => {
                buf.reserve(total - buf.capacity());
            }
            _ => {}
        }

        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Non-blocking, callback-driven client request, reusing the same reactor that drives the
/// server side. See [`crate::core::RpcCore::call_async`].
pub fn request_async(
    core: &core::RpcCore,
    addr: impl ToSocketAddrs,
    method_type: MethodType,
    method_name: &str,
    params: Vec<Val>,
    timeout_ms: u64,
    callback: impl FnOnce(Result<Response, Error>) + Send + 'static,
) -> Result<(), Error> {
    core.call_async(addr, method_type, method_name, params, timeout_ms, callback)
}

/// Serializes a request without sending it. Useful for composing a frame ahead of time, e.g.
/// to hand to a transport this crate doesn't own.
pub fn request_serialize(method_type: MethodType, method_name: &str, params: Vec<Val>) -> Vec<u8> {
    let req = Request {
        method_type,
        xid: core::generate_xid(),
        method_name: method_name.to_string(),
        params,
    };
    wire::encode_request(&req)
}

/// Parses a complete response frame out of an already-received buffer.
pub fn response_parse(buf: &[u8]) -> Result<Response, Error> {
    wire::decode_response(buf).map_err(Error::from)
}
