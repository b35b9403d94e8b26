use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::remote::frame::{FRAME_OVERHEAD, MAGIC, Transporter, TransporterHeader, VERSION};

/// Upper bound for a single header or body unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Magic,
    Version,
    HeaderLength,
    Header,
    BodyLength,
    Body,
}

/// Length-prefixed framing of [`Transporter`]s:
///
/// `MAGIC(1) | VERSION(1) | headerLen(4, BE) | header | bodyLen(4, BE) | body`
///
/// The decoder is a resumable state machine. Whatever part of a frame has been read is
/// checkpointed in `self`, so bytes may arrive in chunks of any size, down to one byte.
#[derive(Debug)]
pub struct TransporterCodec {
    state: DecodeState,
    header_length: usize,
    header: Option<TransporterHeader>,
    body_length: usize,
    max_frame_length: usize,
}

impl TransporterCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        TransporterCodec { state: DecodeState::Magic, header_length: 0, header: None, body_length: 0, max_frame_length }
    }

    fn read_length(&self, src: &mut BytesMut, what: &str) -> Result<usize> {
        let length = src.get_i32();
        if length < 0 || length as usize > self.max_frame_length {
            return Err(Error::Protocol(format!("Illegal {} length {} (max {})", what, length, self.max_frame_length)));
        }
        Ok(length as usize)
    }
}

impl Default for TransporterCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TransporterCodec {
    type Item = Transporter;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecodeState::Magic => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let magic = src.get_u8();
                    if magic != MAGIC {
                        return Err(Error::Protocol(format!("Illegal magic {:#04x}, expected {:#04x}", magic, MAGIC)));
                    }
                    self.state = DecodeState::Version;
                }
                DecodeState::Version => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let version = src.get_u8();
                    if version != VERSION {
                        return Err(Error::Protocol(format!("Unsupported protocol version {:#04x}, expected {:#04x}", version, VERSION)));
                    }
                    self.state = DecodeState::HeaderLength;
                }
                DecodeState::HeaderLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    self.header_length = self.read_length(src, "header")?;
                    self.state = DecodeState::Header;
                }
                DecodeState::Header => {
                    if src.len() < self.header_length {
                        src.reserve(self.header_length - src.len());
                        return Ok(None);
                    }
                    let raw = src.split_to(self.header_length);
                    let header: TransporterHeader =
                        serde_json::from_slice(&raw).map_err(|e| Error::Protocol(format!("Malformed frame header: {}", e)))?;
                    self.header = Some(header);
                    self.state = DecodeState::BodyLength;
                }
                DecodeState::BodyLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    self.body_length = self.read_length(src, "body")?;
                    self.state = DecodeState::Body;
                }
                DecodeState::Body => {
                    if src.len() < self.body_length {
                        src.reserve(self.body_length - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(self.body_length).freeze();
                    let header = self.header.take().ok_or_else(|| Error::Protocol("Frame body without header".to_string()))?;

                    self.state = DecodeState::Magic;
                    self.header_length = 0;
                    self.body_length = 0;

                    return Ok(Some(Transporter::new(header, body)));
                }
            }
        }
    }
}

impl Encoder<Transporter> for TransporterCodec {
    type Error = Error;

    fn encode(&mut self, item: Transporter, dst: &mut BytesMut) -> Result<()> {
        let header = serde_json::to_vec(item.header())?;
        let body = item.body();

        if header.len() > self.max_frame_length || body.len() > self.max_frame_length {
            return Err(Error::Protocol(format!(
                "Frame {} too large: header {} bytes, body {} bytes (max {})",
                item.method_identifier(),
                header.len(),
                body.len(),
                self.max_frame_length
            )));
        }

        dst.reserve(FRAME_OVERHEAD + header.len() + body.len());
        dst.put_u8(item.magic());
        dst.put_u8(item.version());
        dst.put_i32(header.len() as i32);
        dst.put_slice(&header);
        dst.put_i32(body.len() as i32);
        dst.put_slice(body);
        Ok(())
    }
}
