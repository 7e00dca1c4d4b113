//! Frame codec for the server side of a connection

use bytes::{Buf, Bytes, BytesMut};
use tether_common::{decode_message, frame_len, frame_message, ClientMessage, FrameError, ServerMessage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Decoding error: {0}")]
    DecodingError(#[from] rmp_serde::decode::Error),
}

pub struct MessageCodec;

impl MessageCodec {
    pub fn encode_server_message(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(frame_message(msg)?))
    }

    /// Pops one complete frame off `buf`, or `None` if more bytes are needed.
    pub fn decode_client_message(buf: &mut BytesMut) -> Result<Option<ClientMessage>, ProtocolError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = frame_len([buf[0], buf[1], buf[2], buf[3]])?;
        if buf.len() < 4 + len {
            return Ok(None);
        }

        buf.advance(4);
        let data = buf.split_to(len);
        let msg = decode_message(&data)?;

        Ok(Some(msg))
    }
}

pub struct StreamReader {
    buffer: BytesMut,
}

impl StreamReader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn try_read(&mut self) -> Result<Option<ClientMessage>, ProtocolError> {
        MessageCodec::decode_client_message(&mut self.buffer)
    }
}

impl Default for StreamReader {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StreamWriter {
    buffer: BytesMut,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn queue(&mut self, msg: &ServerMessage) -> Result<(), ProtocolError> {
        let encoded = MessageCodec::encode_server_message(msg)?;
        self.buffer.extend_from_slice(&encoded);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

impl Default for StreamWriter {
    fn default() -> Self {
        Self::new()
    }
}
