//! Protocol codec for encoding/decoding messages
//!
//! Frame boundaries are found by a length-delimited splitter reading the
//! 4 byte length field at offset 4; only complete frames reach the
//! message decoder, so fragmented and coalesced reads are absorbed there.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use super::{
    marshal, unmarshal, Header, Message, MessageType, LENGTH_FIELD_LENGTH, LENGTH_FIELD_OFFSET,
    LENGTH_PREFIX_SIZE, MAX_FRAME_LENGTH, VALUE_LENGTH_SIZE,
};

/// Fixed part of the header: crc(4) + length(4) + session(8) + type(1) + priority(1) + count(4)
pub const FIXED_HEADER_SIZE: usize = 22;

/// Largest frame whose length field still fits in an `i32`
pub const MAX_ENCODABLE_FRAME_LENGTH: usize = i32::MAX as usize + LENGTH_PREFIX_SIZE;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Frame exceeds maximum length of {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Codec turning a byte stream into [`Message`]s and back
#[derive(Debug)]
pub struct MessageCodec {
    splitter: LengthDelimitedCodec,
    max_frame_length: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    /// Create a codec that accepts frames up to `max_frame_length` bytes in total
    ///
    /// The limit is capped at what the signed 32 bit length field can describe.
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        let max_frame_length = max_frame_length.min(MAX_ENCODABLE_FRAME_LENGTH);
        // The splitter keeps the crc and length fields in the emitted frame,
        // so the declared length is widened by the prefix it does not count.
        let splitter = LengthDelimitedCodec::builder()
            .length_field_offset(LENGTH_FIELD_OFFSET)
            .length_field_length(LENGTH_FIELD_LENGTH)
            .length_adjustment(LENGTH_PREFIX_SIZE as isize)
            .num_skip(0)
            .max_frame_length(max_frame_length.saturating_sub(LENGTH_PREFIX_SIZE))
            .big_endian()
            .new_codec();

        Self {
            splitter,
            max_frame_length,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Encode a message into `dst`, patching the length field once the frame is complete
    pub fn encode_message(&self, message: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let start = dst.len();
        if let Err(e) = write_frame(message, dst) {
            dst.truncate(start);
            return Err(e);
        }

        let frame_len = dst.len() - start;
        if frame_len > self.max_frame_length {
            dst.truncate(start);
            return Err(CodecError::InvalidMessage(format!(
                "encoded frame is {} bytes, peer accepts at most {}",
                frame_len, self.max_frame_length
            )));
        }

        let length = (frame_len - LENGTH_PREFIX_SIZE) as i32;
        let at = start + LENGTH_FIELD_OFFSET;
        dst[at..at + LENGTH_FIELD_LENGTH].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    fn split_error(&self, e: io::Error) -> CodecError {
        let too_large = e
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_large {
            CodecError::FrameTooLarge(self.max_frame_length)
        } else {
            CodecError::Io(e)
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self.splitter.decode(src) {
            Ok(Some(frame)) => decode_frame(frame.freeze()).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(self.split_error(e)),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.encode_message(&item, dst)
    }
}

fn write_frame(message: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
    let header = &message.header;

    dst.reserve(FIXED_HEADER_SIZE + VALUE_LENGTH_SIZE);
    dst.put_i32(header.crc_code);
    dst.put_i32(0);
    dst.put_i64(header.session_id);
    dst.put_u8(header.message_type.code());
    dst.put_u8(header.priority);
    dst.put_i32(header.attachments.len() as i32);

    for (key, value) in &header.attachments {
        let key = key.as_bytes();
        dst.put_i32(key.len() as i32);
        dst.put_slice(key);
        marshal(value, dst)?;
    }

    match &message.body {
        Some(body) => marshal(body, dst)?,
        None => dst.put_i32(0),
    }

    Ok(())
}

/// Decode one complete frame as produced by the splitter
pub fn decode_frame(mut frame: Bytes) -> Result<Message, CodecError> {
    let frame_len = frame.len();
    ensure_remaining(&frame, FIXED_HEADER_SIZE, "fixed header")?;

    let crc_code = frame.get_i32();
    let length = frame.get_i32();
    if i64::from(length) != (frame_len - LENGTH_PREFIX_SIZE) as i64 {
        return Err(CodecError::MalformedFrame(format!(
            "length field says {}, frame carries {}",
            length,
            frame_len - LENGTH_PREFIX_SIZE
        )));
    }

    let session_id = frame.get_i64();
    let message_type = MessageType::from_code(frame.get_u8());
    let priority = frame.get_u8();

    let count = frame.get_i32();
    if count < 0 {
        return Err(CodecError::MalformedFrame(format!(
            "negative attachment count {}",
            count
        )));
    }

    let mut attachments = HashMap::new();
    for _ in 0..count {
        ensure_remaining(&frame, 4, "attachment key length")?;
        let key_len = frame.get_i32();
        if key_len < 0 {
            return Err(CodecError::MalformedFrame(format!(
                "negative key length {}",
                key_len
            )));
        }
        ensure_remaining(&frame, key_len as usize, "attachment key")?;
        let key = frame.split_to(key_len as usize);
        let key = String::from_utf8(key.to_vec())
            .map_err(|e| CodecError::MalformedFrame(format!("attachment key is not UTF-8: {}", e)))?;

        let value = unmarshal(&mut frame)?;
        attachments.insert(key, value);
    }

    let body = match frame.remaining() {
        VALUE_LENGTH_SIZE => {
            let marker = frame.get_u32();
            if marker != 0 {
                return Err(CodecError::MalformedFrame(format!(
                    "expected empty body marker, found {:#010x}",
                    marker
                )));
            }
            None
        }
        n if n > VALUE_LENGTH_SIZE => Some(unmarshal(&mut frame)?),
        n => {
            return Err(CodecError::MalformedFrame(format!(
                "body marker needs {} bytes, {} left",
                VALUE_LENGTH_SIZE, n
            )))
        }
    };

    if frame.has_remaining() {
        return Err(CodecError::MalformedFrame(format!(
            "{} trailing bytes after the body",
            frame.remaining()
        )));
    }

    Ok(Message {
        header: Header {
            crc_code,
            length,
            session_id,
            message_type,
            priority,
            attachments,
        },
        body,
    })
}

fn ensure_remaining(buf: &Bytes, needed: usize, what: &str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::MalformedFrame(format!(
            "{} needs {} bytes, {} left",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}
