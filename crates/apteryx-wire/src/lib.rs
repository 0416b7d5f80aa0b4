//! Wire message shapes and framing.
//!
//! `spec.md` leaves the byte encoding pluggable; this fixes it to
//! `facet`-derived `facet_json` bodies behind a 4-byte big-endian
//! length-prefixed frame, adapted from the framing scheme `peeps-wire`
//! uses for its own client/server messages.
//!
//! Two independent request/response pairs exist because every process
//! is simultaneously an RPC client and an RPC server (§2):
//!
//! - [`DaemonRequest`]/[`DaemonReply`] — sent by a library caller to the
//!   central daemon: the six server operations of §6, with `watch` and
//!   `provide` here meaning *registration*.
//! - [`CallbackRequest`]/[`CallbackReply`] — sent by the daemon to a
//!   process's inbound callback server: watch *delivery* (carries the
//!   new value) and provider resolution.

use compact_str::CompactString;
use facet::Facet;
use std::fmt;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodecError {
    PayloadTooLarge { len: usize, max: usize },
    FrameTooShort { len: usize },
    FrameTooLarge { len: usize, max: usize },
    FrameTruncated { expected: usize, actual: usize },
}

impl fmt::Display for FrameCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => write!(f, "payload too large: {len} > {max}"),
            Self::FrameTooShort { len } => write!(f, "frame too short: {len}"),
            Self::FrameTooLarge { len, max } => write!(f, "frame too large: {len} > {max}"),
            Self::FrameTruncated { expected, actual } => {
                write!(f, "truncated frame payload: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for FrameCodecError {}

#[derive(Debug)]
pub enum WireError {
    Frame(FrameCodecError),
    Json(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<FrameCodecError> for WireError {
    fn from(value: FrameCodecError) -> Self {
        Self::Frame(value)
    }
}

pub fn encode_frame(payload: &[u8], max_payload_bytes: usize) -> Result<Vec<u8>, FrameCodecError> {
    if payload.len() > max_payload_bytes {
        return Err(FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload_bytes,
        });
    }
    let payload_len =
        u32::try_from(payload.len()).map_err(|_| FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame_default(payload: &[u8]) -> Result<Vec<u8>, FrameCodecError> {
    encode_frame(payload, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_frame<'a>(
    frame: &'a [u8],
    max_payload_bytes: usize,
) -> Result<&'a [u8], FrameCodecError> {
    if frame.len() < 4 {
        return Err(FrameCodecError::FrameTooShort { len: frame.len() });
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&frame[..4]);
    let payload_len = u32::from_be_bytes(prefix) as usize;
    if payload_len > max_payload_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            len: payload_len,
            max: max_payload_bytes,
        });
    }
    let actual_payload_len = frame.len() - 4;
    if actual_payload_len != payload_len {
        return Err(FrameCodecError::FrameTruncated {
            expected: payload_len,
            actual: actual_payload_len,
        });
    }
    Ok(&frame[4..])
}

pub fn decode_frame_default(frame: &[u8]) -> Result<&[u8], FrameCodecError> {
    decode_frame(frame, DEFAULT_MAX_FRAME_BYTES)
}

/// Read just the 4-byte length prefix, to size a read buffer before the
/// payload itself has arrived off the wire.
pub fn decode_frame_len(prefix: [u8; 4]) -> u32 {
    u32::from_be_bytes(prefix)
}

// ── Daemon-bound requests (client library -> central daemon) ───────────

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum DaemonRequest {
    Set {
        path: CompactString,
        value: Vec<u8>,
    },
    Get {
        path: CompactString,
    },
    Search {
        path: CompactString,
    },
    Prune {
        path: CompactString,
    },
    /// Registration, not delivery: `cb = None` unregisters.
    RegisterWatch {
        pattern: CompactString,
        owner: u64,
        cb: Option<u64>,
        priv_: u64,
        endpoint: CompactString,
    },
    RegisterProvide {
        path: CompactString,
        owner: u64,
        cb: Option<u64>,
        priv_: u64,
        endpoint: CompactString,
    },
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum DaemonReply {
    Ok,
    Value { value: Vec<u8> },
    Paths { paths: Vec<CompactString> },
}

// ── Callback-bound requests (central daemon -> per-process callback server) ──

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum CallbackRequest {
    /// Watch delivery: `value` empty signals deletion.
    WatchNotify {
        path: CompactString,
        value: Vec<u8>,
        owner: u64,
        cb: u64,
        priv_: u64,
    },
    ProvideRequest {
        path: CompactString,
        owner: u64,
        cb: u64,
        priv_: u64,
    },
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum CallbackReply {
    Ok,
    Value { value: Vec<u8> },
}

macro_rules! codec_pair {
    ($encode:ident, $encode_default:ident, $decode:ident, $decode_default:ident, $ty:ty) => {
        pub fn $encode(message: &$ty, max_payload_bytes: usize) -> Result<Vec<u8>, WireError> {
            let payload = facet_json::to_string(message)
                .map_err(|e| WireError::Json(e.to_string()))?
                .into_bytes();
            Ok(encode_frame(&payload, max_payload_bytes)?)
        }

        pub fn $encode_default(message: &$ty) -> Result<Vec<u8>, WireError> {
            $encode(message, DEFAULT_MAX_FRAME_BYTES)
        }

        pub fn $decode(frame: &[u8], max_payload_bytes: usize) -> Result<$ty, WireError> {
            let payload = decode_frame(frame, max_payload_bytes)?;
            let text = std::str::from_utf8(payload).map_err(|e| WireError::Json(e.to_string()))?;
            facet_json::from_str(text).map_err(|e| WireError::Json(e.to_string()))
        }

        pub fn $decode_default(frame: &[u8]) -> Result<$ty, WireError> {
            $decode(frame, DEFAULT_MAX_FRAME_BYTES)
        }
    };
}

codec_pair!(
    encode_daemon_request,
    encode_daemon_request_default,
    decode_daemon_request,
    decode_daemon_request_default,
    DaemonRequest
);
codec_pair!(
    encode_daemon_reply,
    encode_daemon_reply_default,
    decode_daemon_reply,
    decode_daemon_reply_default,
    DaemonReply
);
codec_pair!(
    encode_callback_request,
    encode_callback_request_default,
    decode_callback_request,
    decode_callback_request_default,
    CallbackRequest
);
codec_pair!(
    encode_callback_reply,
    encode_callback_reply_default,
    decode_callback_reply,
    decode_callback_reply_default,
    CallbackReply
);
