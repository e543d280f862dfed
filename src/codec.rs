use crate::{
    command::Command,
    config::{Config, MAX_FRAME_SIZE_LIMIT},
    error::{Result, SmuxError},
    frame::{Frame, HEADER_SIZE},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec for [`tokio_util::codec::Framed`]. All integers are
/// big-endian.
///
/// The codec holds no per-connection state beyond the configuration, so one
/// value can be cloned for each direction.
#[derive(Debug, Clone)]
pub struct Codec {
    config: Config,
    max_payload: usize,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    version: u8,
    cmd: Command,
    length: usize,
    stream_id: u32,
}

impl Header {
    /// Parses the first [`HEADER_SIZE`] bytes of `src` without consuming them.
    fn peek(src: &[u8]) -> Result<Header> {
        let mut raw = &src[..HEADER_SIZE];
        Ok(Header {
            version: raw.get_u8(),
            cmd: Command::try_from(raw.get_u8())?,
            length: raw.get_u16() as usize,
            stream_id: raw.get_u32(),
        })
    }
}

impl Codec {
    pub fn new(config: Config) -> Self {
        let max_payload = config.max_frame_size.min(MAX_FRAME_SIZE_LIMIT);
        Codec {
            config,
            max_payload,
        }
    }

    fn check_header(&self, header: &Header) -> Result<()> {
        if header.version != self.config.version {
            return Err(SmuxError::InvalidVersion {
                expected: self.config.version,
                actual: header.version,
            });
        }
        if header.length > self.max_payload {
            return Err(SmuxError::FrameTooLarge {
                size: header.length,
                max: self.max_payload,
            });
        }
        Ok(())
    }
}

/// Splits a UPD body into `(consumed, window)`.
fn window_update_body(mut body: Bytes) -> Result<(u32, u32)> {
    if body.len() != Command::UPD_PAYLOAD_SIZE {
        return Err(SmuxError::ProtocolViolation(format!(
            "UPD frame must carry exactly {} bytes, got {}",
            Command::UPD_PAYLOAD_SIZE,
            body.len()
        )));
    }
    Ok((body.get_u32(), body.get_u32()))
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = SmuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // A bad header is rejected before its payload arrives.
        let header = Header::peek(src)?;
        self.check_header(&header)?;

        let frame_len = HEADER_SIZE + header.length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let body = src.split_to(header.length).freeze();

        let frame = if header.cmd.window_update().is_some() {
            let (consumed, window) = window_update_body(body)?;
            Frame::upd(header.version, header.stream_id, consumed, window)
        } else {
            Frame::new(header.version, header.cmd, header.stream_id, body)
        };
        frame.validate(&self.config)?;
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = self.decode(buf)?;
        if frame.is_none() && !buf.is_empty() {
            return Err(SmuxError::Truncated);
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for Codec {
    type Error = SmuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.validate(&self.config)?;

        // validate() bounds the payload by max_frame_size <= u16::MAX
        let length = frame.payload_len();
        dst.reserve(HEADER_SIZE + length);
        dst.put_u8(frame.version);
        dst.put_u8(frame.cmd.code());
        dst.put_u16(length as u16);
        dst.put_u32(frame.stream_id);

        match frame.cmd.window_update() {
            Some((consumed, window)) => {
                dst.put_u32(consumed);
                dst.put_u32(window);
            }
            None => dst.put_slice(&frame.data),
        }
        Ok(())
    }
}

/// Encodes a single frame into a fresh buffer.
pub fn encode_frame(config: &Config, frame: Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(frame.total_size());
    Codec::new(config.clone()).encode(frame, &mut buf)?;
    Ok(buf.freeze())
}
