// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The framed request/response wire format, built on top of the varint codec in
//! [`crate::varint`].
//!
//! Frame layout, in order: a 1-byte `method_type`, a size-with-prefix total frame length, a
//! 4-byte little-endian transaction id, a length-prefixed method name, and then either an
//! ordered parameter list (request) or a signed error code plus an optional result (response).
//! `total_length` counts every byte of the frame, including the `method_type` byte and the
//! length field itself.

use crate::error::ProtocolError;
use crate::varint;

/// Maximum number of parameters a request may carry.
pub const MAX_PARAMS: usize = 16;

/// Maximum length, in bytes, of a method name.
pub const MAX_METHOD_NAME_LEN: usize = 127;

/// Number of bytes a [`Varchar`] can hold inline before it spills to the heap.
const INLINE_CAP: usize = 15;

/// Transport-level error codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    FunctionNotFound,
    FunctionInvalidParameterSize,
    FunctionInvalidParameterType,
    /// An error code from a user callback that doesn't match one of the known variants above.
    /// Callbacks may return arbitrary application-defined negative codes; this variant
    /// round-trips them losslessly.
    Other(i32),
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::FunctionNotFound => 1,
            ErrorCode::FunctionInvalidParameterSize => 2,
            ErrorCode::FunctionInvalidParameterType => 3,
            ErrorCode::Other(c) => c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorCode::Ok,
            1 => ErrorCode::FunctionNotFound,
            2 => ErrorCode::FunctionInvalidParameterSize,
            3 => ErrorCode::FunctionInvalidParameterType,
            other => ErrorCode::Other(other),
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ErrorCode::Ok)
    }
}

/// The method-type byte. Requests may be [`MethodType::Function`] (expects a reply) or
/// [`MethodType::Notification`] (no reply). Responses always carry [`MethodType::Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    Function = 1,
    Notification = 2,
}

impl MethodType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(MethodType::Function),
            2 => Some(MethodType::Notification),
            _ => None,
        }
    }
}

/// A small-string-optimized byte buffer used for the `VARCHAR` value type. Buffers of
/// [`INLINE_CAP`] bytes or fewer are stored inline without heap allocation; longer buffers are
/// heap-allocated. The choice is made once, at construction: once a value crosses the request
/// queue into a worker thread it must own its bytes outright, so there is no borrowed variant
/// here.
#[derive(Clone)]
pub enum Varchar {
    Inline { buf: [u8; INLINE_CAP], len: u8 },
    Heap(Box<[u8]>),
}

impl Varchar {
    pub fn new(bytes: &[u8]) -> Self {
        if bytes.len() <= INLINE_CAP {
            let mut buf = [0u8; INLINE_CAP];
            buf[..bytes.len()].copy_from_slice(bytes);
            Varchar::Inline {
                buf,
                len: bytes.len() as u8,
            }
        } else {
            Varchar::Heap(bytes.into())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Varchar::Inline { buf, len } => &buf[..*len as usize],
            Varchar::Heap(b) => b,
        }
    }

    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Varchar {
    fn from(s: &str) -> Self {
        Varchar::new(s.as_bytes())
    }
}

impl From<String> for Varchar {
    fn from(s: String) -> Self {
        Varchar::new(s.as_bytes())
    }
}

impl PartialEq for Varchar {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Varchar {}

impl std::fmt::Debug for Varchar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_str() {
            Ok(s) => write!(f, "Varchar({s:?})"),
            Err(_) => write!(f, "Varchar({:?})", self.as_bytes()),
        }
    }
}

/// A typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Val {
    Uint(u32),
    Int(i32),
    Varchar(Varchar),
}

impl Val {
    fn type_tag(&self) -> u8 {
        match self {
            Val::Uint(_) => 1,
            Val::Int(_) => 2,
            Val::Varchar(_) => 3,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.type_tag());
        match self {
            Val::Uint(v) => varint::encode_u32(*v, buf),
            Val::Int(v) => varint::encode_i32(*v, buf),
            Val::Varchar(v) => {
                varint::encode_u32(v.len() as u32, buf);
                buf.extend_from_slice(v.as_bytes());
            }
        }
    }

    /// Decodes one value from the front of `buf`, returning it and the number of bytes
    /// consumed.
    fn decode(buf: &[u8]) -> Result<(Val, usize), ProtocolError> {
        let &tag = buf.first().ok_or(ProtocolError::PackageBroken)?;
        let rest = &buf[1..];
        match tag {
            1 => {
                let (v, n) = varint::decode_u32(rest)?;
                Ok((Val::Uint(v), 1 + n))
            }
            2 => {
                let (v, n) = varint::decode_i32(rest)?;
                Ok((Val::Int(v), 1 + n))
            }
            3 => {
                let (len, n) = varint::decode_u32(rest)?;
                let len = len as usize;
                let start = n;
                let end = start
                    .checked_add(len)
                    .ok_or(ProtocolError::PackageBroken)?;
                let bytes = rest.get(start..end).ok_or(ProtocolError::PackageBroken)?;
                Ok((Val::Varchar(Varchar::new(bytes)), 1 + end))
            }
            other => Err(ProtocolError::InvalidValueTag(other)),
        }
    }
}

/// A parsed request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method_type: MethodType,
    pub xid: u32,
    pub method_name: String,
    pub params: Vec<Val>,
}

/// A parsed response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub method_type: MethodType,
    pub xid: u32,
    pub method_name: String,
    pub error_code: i32,
    pub result: Option<Val>,
}

fn validate_method_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() || name.len() > MAX_METHOD_NAME_LEN {
        return Err(ProtocolError::InvalidMethodNameLength(name.len()));
    }
    Ok(())
}

fn encode_header(method_type: MethodType, xid: u32, method_name: &str, payload: &[u8], buf: &mut Vec<u8>) {
    // `total_length` includes the method_type byte, the size field itself, and everything
    // that follows it; see module docs.
    let tail_len = 4 + 1 + method_name.len() + payload.len();
    let total_1 = 1 + 1 + tail_len;
    let total = if total_1 < 255 {
        total_1
    } else {
        1 + (1 + std::mem::size_of::<usize>()) + tail_len
    };

    buf.push(method_type as u8);
    varint::encode_size(total, buf);
    buf.extend_from_slice(&xid.to_le_bytes());
    buf.push(method_name.len() as u8);
    buf.extend_from_slice(method_name.as_bytes());
}

/// Serializes a request frame.
pub fn encode_request(req: &Request) -> Vec<u8> {
    validate_method_name(&req.method_name).expect("caller must validate method name before encoding");
    debug_assert!(req.params.len() <= MAX_PARAMS);

    let mut payload = Vec::new();
    for p in &req.params {
        p.encode(&mut payload);
    }

    let mut buf = Vec::with_capacity(16 + req.method_name.len() + payload.len());
    encode_header(req.method_type, req.xid, &req.method_name, &payload, &mut buf);
    buf.extend_from_slice(&payload);
    buf
}

/// Serializes a response frame.
pub fn encode_response(resp: &Response) -> Vec<u8> {
    validate_method_name(&resp.method_name).expect("caller must validate method name before encoding");

    let mut payload = Vec::new();
    varint::encode_i32(resp.error_code, &mut payload);
    if resp.error_code == 0 {
        if let Some(v) = &resp.result {
            v.encode(&mut payload);
        }
    }

    let mut buf = Vec::with_capacity(16 + resp.method_name.len() + payload.len());
    encode_header(resp.method_type, resp.xid, &resp.method_name, &payload, &mut buf);
    buf.extend_from_slice(&payload);
    buf
}

/// A decoded frame header, shared by requests and responses.
struct Header {
    method_type: u8,
    total_length: usize,
    header_len: usize,
    xid: u32,
    method_name: String,
}

fn decode_header(buf: &[u8]) -> Result<Header, ProtocolError> {
    let &method_type = buf.first().ok_or(ProtocolError::PackageBroken)?;
    let (total_length, size_len) = varint::decode_size(&buf[1..])?
        .ok_or(ProtocolError::PackageBroken)?;
    let mut pos = 1 + size_len;

    let xid_bytes: [u8; 4] = buf
        .get(pos..pos + 4)
        .ok_or(ProtocolError::PackageBroken)?
        .try_into()
        .unwrap();
    let xid = u32::from_le_bytes(xid_bytes);
    pos += 4;

    let &name_len = buf.get(pos).ok_or(ProtocolError::PackageBroken)?;
    let name_len = name_len as usize;
    if name_len == 0 || name_len > MAX_METHOD_NAME_LEN {
        return Err(ProtocolError::InvalidMethodNameLength(name_len));
    }
    pos += 1;

    let name_bytes = buf
        .get(pos..pos + name_len)
        .ok_or(ProtocolError::PackageBroken)?;
    // `method_name` is an opaque byte string on the wire (the C source's `char name[128]`), not
    // a validated UTF-8 field: a frame with a non-UTF-8 name is still a well-formed frame, it
    // just can't match any registered method name, so it surfaces as FUNCTION_NOT_FOUND rather
    // than resetting the connection. Lossy conversion keeps `method_name: String` (every
    // registered name is plain ASCII in practice) without rejecting an otherwise-valid frame.
    let method_name = String::from_utf8_lossy(name_bytes).into_owned();
    pos += name_len;

    Ok(Header {
        method_type,
        total_length,
        header_len: pos,
        xid,
        method_name,
    })
}

/// Decodes a request frame. `buf` must hold at least [`get_package_size`]'s reported length;
/// any leftover bytes after the frame is parsed are a protocol error.
pub fn decode_request(buf: &[u8]) -> Result<Request, ProtocolError> {
    let header = decode_header(buf)?;
    let method_type = MethodType::from_byte(header.method_type)
        .ok_or(ProtocolError::InvalidMethodType(header.method_type))?;

    if buf.len() < header.total_length {
        return Err(ProtocolError::PackageBroken);
    }

    let mut pos = header.header_len;
    let mut params = Vec::new();
    while pos < header.total_length {
        let (val, consumed) = Val::decode(&buf[pos..]).map_err(|e| {
            if matches!(e, ProtocolError::PackageBroken) {
                ProtocolError::TrailingBytes
            } else {
                e
            }
        })?;
        pos += consumed;
        if pos > header.total_length {
            return Err(ProtocolError::TrailingBytes);
        }
        params.push(val);
        if params.len() > MAX_PARAMS {
            return Err(ProtocolError::TooManyParameters);
        }
    }
    if pos != header.total_length {
        return Err(ProtocolError::TrailingBytes);
    }

    Ok(Request {
        method_type,
        xid: header.xid,
        method_name: header.method_name,
        params,
    })
}

/// Decodes a response frame.
pub fn decode_response(buf: &[u8]) -> Result<Response, ProtocolError> {
    let header = decode_header(buf)?;
    let method_type = MethodType::from_byte(header.method_type)
        .filter(|mt| matches!(mt, MethodType::Function))
        .ok_or(ProtocolError::InvalidMethodType(header.method_type))?;

    if buf.len() < header.total_length {
        return Err(ProtocolError::PackageBroken);
    }

    let mut pos = header.header_len;
    let (error_code, consumed) = varint::decode_i32(&buf[pos..])?;
    pos += consumed;

    let result = if error_code == 0 && pos < header.total_length {
        let (val, consumed) = Val::decode(&buf[pos..])?;
        pos += consumed;
        Some(val)
    } else {
        None
    };

    if pos != header.total_length {
        return Err(ProtocolError::TrailingBytes);
    }

    Ok(Response {
        method_type,
        xid: header.xid,
        method_name: header.method_name,
        error_code,
        result,
    })
}

/// Inspects the leading bytes of a byte stream and, if the frame's total length is already
/// derivable, returns it. Returns `Ok(None)` when more bytes are needed before the length can
/// be determined.
pub fn get_package_size(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    match varint::decode_size(&buf[1..])? {
        Some((total, _consumed)) => Ok(Some(total)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(params: Vec<Val>) -> Request {
        Request {
            method_type: MethodType::Function,
            xid: 0xdead_beef,
            method_name: "Add".to_string(),
            params,
        }
    }

    #[test]
    fn request_roundtrip() {
        let req = sample_request(vec![Val::Uint(1), Val::Uint(3)]);
        let bytes = encode_request(&req);
        assert_eq!(get_package_size(&bytes).unwrap(), Some(bytes.len()));
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn response_roundtrip_with_varchar_result() {
        let resp = Response {
            method_type: MethodType::Function,
            xid: 7,
            method_name: "Hello World".to_string(),
            error_code: 0,
            result: Some(Val::Varchar(Varchar::new(b"Hello World"))),
        };
        let bytes = encode_response(&resp);
        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn error_response_has_no_result() {
        let resp = Response {
            method_type: MethodType::Function,
            xid: 1,
            method_name: "Nope".to_string(),
            error_code: ErrorCode::FunctionNotFound.code(),
            result: None,
        };
        let bytes = encode_response(&resp);
        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded.result, None);
        assert_eq!(decoded.error_code, ErrorCode::FunctionNotFound.code());
    }

    #[test]
    fn rejects_too_many_params() {
        let params = (0..17).map(Val::Uint).collect();
        let req = sample_request(params);
        let bytes = encode_request(&req);
        assert_eq!(decode_request(&bytes), Err(ProtocolError::TooManyParameters));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let req = sample_request(vec![Val::Uint(42)]);
        let bytes = encode_request(&req);
        let truncated = &bytes[..bytes.len() - 1];
        assert_eq!(get_package_size(truncated).unwrap(), Some(bytes.len()));
        assert_eq!(decode_request(truncated), Err(ProtocolError::PackageBroken));
    }

    #[test]
    fn package_size_needs_more_data() {
        let req = sample_request(vec![Val::Uint(42)]);
        let bytes = encode_request(&req);
        assert_eq!(get_package_size(&bytes[..1]).unwrap(), None);
    }

    #[test]
    fn large_varchar_uses_size_with_prefix_width() {
        let big = vec![b'x'; 300];
        let req = sample_request(vec![Val::Varchar(Varchar::new(&big))]);
        let bytes = encode_request(&req);
        assert_eq!(bytes[1], 0xFF);
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn rejects_bad_method_name_length() {
        let mut req = sample_request(vec![]);
        req.method_name = "x".repeat(200);
        // Can't go through encode_request (it asserts); build the frame by hand.
        let mut payload = Vec::new();
        for p in &req.params {
            p.encode(&mut payload);
        }
        let mut buf = Vec::new();
        buf.push(MethodType::Function as u8);
        let tail_len = 4 + 1 + req.method_name.len() + payload.len();
        varint::encode_size(2 + tail_len, &mut buf);
        buf.extend_from_slice(&req.xid.to_le_bytes());
        buf.push(200u8.wrapping_sub(0) as u8); // 200 truncates to 200 as u8, which is > 127
        buf.extend_from_slice(req.method_name.as_bytes());
        buf.extend_from_slice(&payload);
        assert!(matches!(
            decode_request(&buf),
            Err(ProtocolError::InvalidMethodNameLength(_))
        ));
    }

    #[test]
    fn non_utf8_method_name_decodes_instead_of_erroring() {
        // method_name is an opaque length-prefixed byte string on the wire; a name that isn't
        // valid UTF-8 is still a well-formed frame. It just won't match anything in a method
        // table keyed by `String`, which is how it ends up surfacing as FUNCTION_NOT_FOUND
        // rather than resetting the connection.
        let name_bytes: &[u8] = &[0xff, 0xfe, b'x'];
        let mut buf = Vec::new();
        buf.push(MethodType::Function as u8);
        let tail_len = 4 + 1 + name_bytes.len();
        varint::encode_size(2 + tail_len, &mut buf);
        buf.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        buf.push(name_bytes.len() as u8);
        buf.extend_from_slice(name_bytes);

        let decoded = decode_request(&buf).expect("non-UTF-8 name must still parse");
        assert_eq!(
            decoded.method_name,
            String::from_utf8_lossy(name_bytes).into_owned()
        );
    }
}
