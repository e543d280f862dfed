use crate::{
    command::Command,
    config::{Config, MAX_FRAME_SIZE_LIMIT},
    error::{Result, SmuxError},
};
use bytes::Bytes;

/// Size of the frame header: `version:u8 | cmd:u8 | length:u16 | sid:u32`.
pub const HEADER_SIZE: usize = 8;

/// One unit on the wire.
///
/// For `Upd` the window fields live in [`Command::Upd`] and `data` stays
/// empty; the codec writes the 8-byte payload from the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Command,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(version: u8, cmd: Command, stream_id: u32, data: Bytes) -> Self {
        Frame {
            version,
            cmd,
            stream_id,
            data,
        }
    }

    fn bare(version: u8, cmd: Command, stream_id: u32) -> Self {
        Frame::new(version, cmd, stream_id, Bytes::new())
    }

    pub fn syn(version: u8, stream_id: u32) -> Self {
        Frame::bare(version, Command::Syn, stream_id)
    }

    pub fn fin(version: u8, stream_id: u32) -> Self {
        Frame::bare(version, Command::Fin, stream_id)
    }

    pub fn psh(version: u8, stream_id: u32, data: Bytes) -> Self {
        Frame::new(version, Command::Psh, stream_id, data)
    }

    /// Keep-alive. Always carries stream id 0.
    pub fn nop(version: u8) -> Self {
        Frame::bare(version, Command::Nop, 0)
    }

    pub fn upd(version: u8, stream_id: u32, consumed: u32, window: u32) -> Self {
        Frame::bare(version, Command::Upd { consumed, window }, stream_id)
    }

    /// Number of payload bytes this frame occupies on the wire.
    pub fn payload_len(&self) -> usize {
        if self.cmd.window_update().is_some() {
            Command::UPD_PAYLOAD_SIZE
        } else {
            self.data.len()
        }
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Checks the frame against the local configuration.
    ///
    /// Used on both directions: outbound frames are checked before encoding,
    /// inbound frames right after decoding.
    pub fn validate(&self, config: &Config) -> Result<()> {
        if self.version != config.version {
            return Err(SmuxError::InvalidVersion {
                expected: config.version,
                actual: self.version,
            });
        }
        if self.version < self.cmd.min_version() {
            return Err(SmuxError::ProtocolViolation(format!(
                "{:?} is not part of protocol v{}",
                self.cmd, self.version
            )));
        }

        let size = self.payload_len();
        let max = config.max_frame_size.min(MAX_FRAME_SIZE_LIMIT);
        if size > max {
            return Err(SmuxError::FrameTooLarge { size, max });
        }
        if !self.data.is_empty() && !self.cmd.carries_payload() {
            return Err(SmuxError::ProtocolViolation(format!(
                "{:?} frame cannot carry data",
                self.cmd
            )));
        }

        // NOP is session-scoped; its sid is ignored.
        if self.stream_id == 0 && self.cmd != Command::Nop {
            return Err(SmuxError::InvalidStreamId(0));
        }
        Ok(())
    }
}
