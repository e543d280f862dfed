use crate::error::SmuxError;

/// Frame command.
///
/// `Upd` carries its decoded payload so that a window update never has to be
/// re-parsed from the frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a stream.
    Syn,
    /// Close the sender's half of a stream.
    Fin,
    /// Stream data.
    Psh,
    /// Keep-alive.
    Nop,
    /// Window update (protocol v2 only).
    Upd { consumed: u32, window: u32 },
}

impl Command {
    pub const SYN: u8 = 0;
    pub const FIN: u8 = 1;
    pub const PSH: u8 = 2;
    pub const NOP: u8 = 3;
    pub const UPD: u8 = 4;

    /// Payload length of a UPD frame on the wire.
    pub const UPD_PAYLOAD_SIZE: usize = 8;

    /// Wire code of this command.
    pub fn code(self) -> u8 {
        match self {
            Command::Syn => Self::SYN,
            Command::Fin => Self::FIN,
            Command::Psh => Self::PSH,
            Command::Nop => Self::NOP,
            Command::Upd { .. } => Self::UPD,
        }
    }

    /// Served ahead of stream data by the writer. FIN is not: it stays in
    /// its stream's lane behind that stream's data.
    pub fn is_control(self) -> bool {
        !matches!(self, Command::Psh | Command::Fin)
    }

    /// Only PSH frames have a free-form body.
    pub fn carries_payload(self) -> bool {
        self == Command::Psh
    }

    /// The lowest protocol version that knows this command.
    pub fn min_version(self) -> u8 {
        match self {
            Command::Upd { .. } => 2,
            _ => 1,
        }
    }

    /// `(consumed, window)` of a window update.
    pub fn window_update(self) -> Option<(u32, u32)> {
        match self {
            Command::Upd { consumed, window } => Some((consumed, window)),
            _ => None,
        }
    }
}

/// Decodes a wire code. A `Upd` comes back with a zero payload; the codec
/// fills it in once the frame body is available.
impl TryFrom<u8> for Command {
    type Error = SmuxError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            Self::SYN => Command::Syn,
            Self::FIN => Command::Fin,
            Self::PSH => Command::Psh,
            Self::NOP => Command::Nop,
            Self::UPD => Command::Upd {
                consumed: 0,
                window: 0,
            },
            other => return Err(SmuxError::UnknownCommand(other)),
        })
    }
}
