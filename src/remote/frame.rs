use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{Error, Result};

/// First byte of every frame. The protocol constant is `0xBABE`; the frame carries its low byte.
pub const MAGIC: u8 = 0xBABE_u16 as u8;

pub const VERSION: u8 = 0x00;

/// magic(1) + version(1) + header length(4) + body length(4)
pub const FRAME_OVERHEAD: usize = 1 + 1 + 4 + 4;

/// Frame header, JSON encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransporterHeader {
    /// Stable name of the remote method, the key handlers are registered under.
    pub method_identifier: String,
    /// Correlates a reply with the request it answers.
    pub opaque: i64,
}

impl TransporterHeader {
    pub fn new(method_identifier: impl Into<String>, opaque: i64) -> Self {
        TransporterHeader { method_identifier: method_identifier.into(), opaque }
    }
}

/// One frame: a single RPC request, reply or event notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transporter {
    magic: u8,
    version: u8,
    header: TransporterHeader,
    body: Bytes,
}

impl Transporter {
    pub fn new(header: TransporterHeader, body: impl Into<Bytes>) -> Self {
        Transporter { magic: MAGIC, version: VERSION, header, body: body.into() }
    }

    /// Builds a frame whose body is the JSON encoding of `body`.
    pub fn with_json_body<T: Serialize>(header: TransporterHeader, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Transporter::new(header, bytes))
    }

    pub fn magic(&self) -> u8 {
        self.magic
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn header(&self) -> &TransporterHeader {
        &self.header
    }

    pub fn method_identifier(&self) -> &str {
        &self.header.method_identifier
    }

    pub fn opaque(&self) -> i64 {
        self.header.opaque
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Protocol(format!("Body of {} (opaque {}) is not valid: {}", self.header.method_identifier, self.header.opaque, e)))
    }
}

/// Per-process source of request ids. Starts at 1 and only grows.
#[derive(Debug, Default)]
pub struct OpaqueGenerator {
    next: AtomicI64,
}

impl OpaqueGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_opaque(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}
