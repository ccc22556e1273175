//! Firmware command set.
//!
//! Every message exchanged with a motor-controller node is one of these
//! variants. [`Command::parse`] is total over the 16-bit code space: codes
//! the host does not understand come back as [`Command::Unknown`] with the
//! raw payload preserved.

use tracing::warn;

/// Wire command codes. Bit-exact with the controller firmware.
pub mod codes {
    pub const ALL_STOP: u16 = 0x0000;
    pub const ALL_START: u16 = 0x0010;
    // 0x0020 reserved
    pub const UPDATE_INTERVAL: u16 = 0x0030;
    pub const GET_POSITION: u16 = 0x0040;
    pub const SET_POSITION: u16 = 0x0050;
    pub const SET_SPEED: u16 = 0x0060;
    pub const HOME: u16 = 0x0070;
    pub const NVM_UPDATE: u16 = 0x0080;
    pub const SCAN_I2C: u16 = 0x0090;
    pub const I2C_READ: u16 = 0x00A0;
    pub const I2C_WRITE: u16 = 0x00B0;
    pub const ACCEL_UPDATE: u16 = 0x0100;
    pub const SENSOR_UPDATE: u16 = 0x0110;
    pub const VERSION: u16 = 0x03E0;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Emergency stop for every motor on the node.
    AllStop,
    /// Commit: start every staged movement together.
    AllStart,
    /// Position report interval in milliseconds.
    UpdateInterval(u16),
    /// Encoder counts per actuator slot.
    GetPosition([u16; 4]),
    /// Target counts per actuator slot.
    SetPosition([u16; 4]),
    /// Speed byte per actuator slot.
    SetSpeed([u8; 4]),
    /// Drive all actuators to their home switches.
    Home,
    /// Firmware version string; empty in the host request.
    Version(String),
    /// Anything this host does not understand, payload preserved.
    Unknown { code: u16, data: Vec<u8> },
}

impl Command {
    /// The wire command code carried in the frame.
    pub fn code(&self) -> u16 {
        match self {
            Command::AllStop => codes::ALL_STOP,
            Command::AllStart => codes::ALL_START,
            Command::UpdateInterval(_) => codes::UPDATE_INTERVAL,
            Command::GetPosition(_) => codes::GET_POSITION,
            Command::SetPosition(_) => codes::SET_POSITION,
            Command::SetSpeed(_) => codes::SET_SPEED,
            Command::Home => codes::HOME,
            Command::Version(_) => codes::VERSION,
            Command::Unknown { code, .. } => *code,
        }
    }

    /// Correlation key used to route a reply back to its sender.
    ///
    /// The command codes never occupy the low id-mask nibble, which is
    /// reserved for an actuator index on per-actuator commands; everything
    /// in the current set correlates on its bare code.
    pub fn key(&self) -> u16 {
        self.code()
    }

    /// Serialises the payload for transmission.
    pub fn tx_data(&self) -> Vec<u8> {
        match self {
            Command::AllStop | Command::AllStart | Command::Home => Vec::new(),
            Command::UpdateInterval(ms) => ms.to_be_bytes().to_vec(),
            Command::GetPosition(positions) | Command::SetPosition(positions) => {
                let mut data = Vec::with_capacity(8);
                for p in positions {
                    data.extend_from_slice(&p.to_be_bytes());
                }
                data
            }
            Command::SetSpeed(speeds) => speeds.to_vec(),
            Command::Version(version) => version.as_bytes().to_vec(),
            Command::Unknown { data, .. } => data.clone(),
        }
    }

    /// Total parser from wire code and payload. Malformed payloads for known
    /// codes degrade to [`Command::Unknown`] rather than failing the listen
    /// loop; the sender's retry policy covers the missing reply.
    pub fn parse(code: u16, data: &[u8]) -> Command {
        match code {
            codes::ALL_STOP => Command::AllStop,
            codes::ALL_START => Command::AllStart,
            codes::HOME => Command::Home,
            codes::UPDATE_INTERVAL => match data.try_into() {
                Ok(bytes) => Command::UpdateInterval(u16::from_be_bytes(bytes)),
                Err(_) => Self::malformed(code, data),
            },
            codes::GET_POSITION => match Self::parse_positions(data) {
                Some(positions) => Command::GetPosition(positions),
                None => Self::malformed(code, data),
            },
            codes::SET_POSITION => match Self::parse_positions(data) {
                Some(positions) => Command::SetPosition(positions),
                None => Self::malformed(code, data),
            },
            codes::SET_SPEED => match data.try_into() {
                Ok(speeds) => Command::SetSpeed(speeds),
                Err(_) => Self::malformed(code, data),
            },
            codes::VERSION => Command::Version(String::from_utf8_lossy(data).into_owned()),
            _ => Command::Unknown {
                code,
                data: data.to_vec(),
            },
        }
    }

    fn parse_positions(data: &[u8]) -> Option<[u16; 4]> {
        if data.len() != 8 {
            return None;
        }
        let mut positions = [0u16; 4];
        for (i, chunk) in data.chunks_exact(2).enumerate() {
            positions[i] = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
        Some(positions)
    }

    fn malformed(code: u16, data: &[u8]) -> Command {
        warn!(code = format_args!("0x{code:04X}"), len = data.len(), "malformed payload");
        Command::Unknown {
            code,
            data: data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_position_payload_is_big_endian() {
        let cmd = Command::SetPosition([0x0102, 0x0304, 0x0405, 0x0607]);
        assert_eq!(
            cmd.tx_data(),
            vec![0x01, 0x02, 0x03, 0x04, 0x04, 0x05, 0x06, 0x07]
        );
    }

    #[test]
    fn set_speed_payload_is_one_byte_per_slot() {
        let cmd = Command::SetSpeed([1, 2, 3, 4]);
        assert_eq!(cmd.tx_data(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn serialise_parse_round_trip() {
        let all = [
            Command::AllStop,
            Command::AllStart,
            Command::UpdateInterval(100),
            Command::GetPosition([1, 2, 3, 4]),
            Command::SetPosition([0, 0x7FFF, 0xFFFF, 42]),
            Command::SetSpeed([0, 127, 255, 1]),
            Command::Home,
            Command::Version("0.1.2".into()),
            Command::Unknown {
                code: 0x0120,
                data: vec![9, 8, 7],
            },
        ];

        for cmd in all {
            let parsed = Command::parse(cmd.code(), &cmd.tx_data());
            assert_eq!(parsed, cmd);
        }
    }

    #[test]
    fn unknown_code_keeps_raw_payload() {
        let parsed = Command::parse(0x0260, &[0xDE, 0xAD]);
        assert_eq!(
            parsed,
            Command::Unknown {
                code: 0x0260,
                data: vec![0xDE, 0xAD],
            }
        );
    }

    #[test]
    fn malformed_known_payload_degrades_to_unknown() {
        let parsed = Command::parse(codes::SET_POSITION, &[1, 2, 3]);
        assert!(matches!(parsed, Command::Unknown { code, .. } if code == codes::SET_POSITION));
    }

    #[test]
    fn keys_match_codes_for_the_current_set() {
        assert_eq!(Command::Home.key(), codes::HOME);
        assert_eq!(Command::SetSpeed([0; 4]).key(), codes::SET_SPEED);
        assert_eq!(Command::Version(String::new()).key(), codes::VERSION);
    }
}
