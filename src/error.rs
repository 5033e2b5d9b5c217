// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use thiserror::Error;

/// Frame-parse errors.
///
/// These are internal: they never cross the wire. A parse error on a request drives the
/// connection to be reset (with a short linger); a parse error is never returned from
/// [`crate::wire::decode_response`] without the caller having already checked
/// [`crate::wire::get_package_size`].
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer passed to a decoder was shorter than the frame's declared `total_length`,
    /// or a field's length would read past the end of the buffer.
    #[error("package broken: buffer too short to contain a complete frame")]
    PackageBroken,

    /// A request's parameter list held more than 16 entries.
    #[error("too many parameters (max 16)")]
    TooManyParameters,

    /// `method_type` was not one of the values valid for this frame kind.
    #[error("invalid method type byte {0}")]
    InvalidMethodType(u8),

    /// The method name length prefix was 0 or >= 128.
    #[error("invalid method name length {0} (must be 1..=127)")]
    InvalidMethodNameLength(usize),

    /// A value's type tag did not match any known [`crate::wire::Val`] variant.
    #[error("invalid value type tag {0}")]
    InvalidValueTag(u8),

    /// A request or response frame had bytes left over after its fields were parsed, or a
    /// value's encoded length overran the frame boundary.
    #[error("trailing bytes after frame")]
    TrailingBytes,

    /// A varint continuation sequence exceeded 5 bytes, or a size-with-prefix tag byte was
    /// `0xFF` without enough trailing bytes for the platform width.
    #[error("malformed varint")]
    MalformedVarint,
}

/// Errors surfaced by the higher-level runtime (core, dispatcher, client).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// A frame failed to parse. See [`ProtocolError`] for the specific cause.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An I/O error occurred on a socket, the log file, or the control channel.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The listen address or log path given to [`crate::core::RpcCore::init`] was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
