// MIT License

//! Message blocks carried inside `SEND_NDAT` telegram payloads.
//!
//! A payload is a sequence of blocks, each `msg_length, msg_type, data…`
//! where `msg_length` counts the type byte plus the data. Block types are
//! the Telenot "Satztypen": state change, block status, date/time, ASCII
//! text and identification. Anything else is surfaced as [`MessageBlock::Unknown`].

use tracing::warn;

/// State change of a single address (Meldung/Adresse).
pub const MSG_TYPE_STATE_CHANGE: u8 = 0x02;
/// Packed status bits for a contiguous address range.
pub const MSG_TYPE_BLOCK_STATUS: u8 = 0x24;
/// Panel wall-clock time.
pub const MSG_TYPE_DATETIME: u8 = 0x50;
/// Free-form text from the panel.
pub const MSG_TYPE_ASCII: u8 = 0x54;
/// BCD-coded panel identification number.
pub const MSG_TYPE_IDENT: u8 = 0x56;

/// Address extension selecting the input space (Meldeeingänge).
pub const ADDR_EXT_INPUTS: u8 = 0x01;
/// Address extension selecting the output space (Schaltausgänge).
pub const ADDR_EXT_OUTPUTS: u8 = 0x02;

/// Bit 7 of a state-change message type: set means restore/clear.
pub const RESTORE_BIT: u8 = 0x80;

/// Alarm kind encoded in the low 7 bits of a state-change message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    Message,
    Fire,
    Panic,
    Burglary,
    Sabotage,
    Trouble,
    PowerTrouble,
    BatteryTrouble,
    CommTrouble,
    Technical,
    TechnicalAlarm,
    Bypass,
    Reset,
    Restart,
    ArmAway,
    ArmHome,
    Other(u8),
}

impl AlarmKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Message,
            0x10 => Self::Fire,
            0x21 => Self::Panic,
            0x22 => Self::Burglary,
            0x23 => Self::Sabotage,
            0x30 => Self::Trouble,
            0x32 => Self::PowerTrouble,
            0x33 => Self::BatteryTrouble,
            0x34 => Self::CommTrouble,
            0x40 => Self::Technical,
            0x41 => Self::TechnicalAlarm,
            0x51 => Self::Bypass,
            0x52 => Self::Reset,
            0x53 => Self::Restart,
            0x61 => Self::ArmAway,
            0x62 => Self::ArmHome,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Message => 0x00,
            Self::Fire => 0x10,
            Self::Panic => 0x21,
            Self::Burglary => 0x22,
            Self::Sabotage => 0x23,
            Self::Trouble => 0x30,
            Self::PowerTrouble => 0x32,
            Self::BatteryTrouble => 0x33,
            Self::CommTrouble => 0x34,
            Self::Technical => 0x40,
            Self::TechnicalAlarm => 0x41,
            Self::Bypass => 0x51,
            Self::Reset => 0x52,
            Self::Restart => 0x53,
            Self::ArmAway => 0x61,
            Self::ArmHome => 0x62,
            Self::Other(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Fire => "fire",
            Self::Panic => "panic",
            Self::Burglary => "burglary",
            Self::Sabotage => "sabotage",
            Self::Trouble => "trouble",
            Self::PowerTrouble => "power_trouble",
            Self::BatteryTrouble => "battery_trouble",
            Self::CommTrouble => "comm_trouble",
            Self::Technical => "technical",
            Self::TechnicalAlarm => "technical_alarm",
            Self::Bypass => "bypass",
            Self::Reset => "reset",
            Self::Restart => "restart",
            Self::ArmAway => "arm_away",
            Self::ArmHome => "arm_home",
            Self::Other(_) => "other",
        }
    }
}

impl std::fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(code) => write!(f, "other({code:#04x})"),
            kind => f.write_str(kind.name()),
        }
    }
}

/// One state change: a single address raising or restoring a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub device_area: u8,
    pub address: u16,
    pub extension: u8,
    pub message_type: u8,
}

impl StateChange {
    /// Whether the restore bit is set (condition cleared).
    pub fn is_restore(&self) -> bool {
        self.message_type & RESTORE_BIT != 0
    }

    /// Alarm kind from the low 7 bits of the message type.
    pub fn kind(&self) -> AlarmKind {
        AlarmKind::from_code(self.message_type & !RESTORE_BIT)
    }
}

/// Packed status bits for a contiguous address range.
///
/// Bit N of byte B covers `start_address + B*8 + N` (LSB first). The wire
/// uses inverted logic: a **zero** bit means the address is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    pub device_area: u8,
    pub start_address: u16,
    pub extension: u8,
    pub status: Vec<u8>,
}

impl BlockStatus {
    /// Iterate all covered addresses with their decoded active state.
    pub fn bits(&self) -> impl Iterator<Item = (u16, bool)> + '_ {
        let start = self.start_address;
        self.status.iter().enumerate().flat_map(move |(byte_idx, byte)| {
            let byte = *byte;
            (0..8u16).map(move |bit| {
                let address = start + (byte_idx as u16) * 8 + bit;
                let active = byte & (1u8 << bit) == 0;
                (address, active)
            })
        })
    }
}

/// Panel wall-clock time as transmitted (no timezone, two-digit year).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PanelDateTime {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl std::fmt::Display for PanelDateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// One parsed message block from a `SEND_NDAT` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBlock {
    StateChange(StateChange),
    BlockStatus(BlockStatus),
    DateTime(PanelDateTime),
    AsciiText(String),
    Ident(String),
    /// Unrecognized or malformed block, carried verbatim.
    Unknown { msg_type: u8, data: Vec<u8> },
}

impl MessageBlock {
    /// Parse every block in a `SEND_NDAT` payload.
    ///
    /// Malformed blocks become [`MessageBlock::Unknown`] rather than being
    /// dropped; a truncated trailing block ends the scan with a warning.
    pub fn parse_all(payload: &[u8]) -> Vec<MessageBlock> {
        let mut blocks = Vec::new();
        let mut pos = 0;
        while pos < payload.len() {
            let msg_length = payload[pos] as usize;
            if msg_length == 0 {
                warn!("Zero-length message block at offset {}, skipping byte", pos);
                pos += 1;
                continue;
            }
            if pos + 1 + msg_length > payload.len() {
                warn!(
                    "Truncated message block at offset {} (length {}, {} bytes left)",
                    pos,
                    msg_length,
                    payload.len() - pos - 1
                );
                break;
            }
            let msg_type = payload[pos + 1];
            let data = &payload[pos + 2..pos + 1 + msg_length];
            blocks.push(Self::parse_one(msg_type, data));
            pos += 1 + msg_length;
        }
        blocks
    }

    fn parse_one(msg_type: u8, data: &[u8]) -> MessageBlock {
        match msg_type {
            MSG_TYPE_STATE_CHANGE if data.len() >= 5 => MessageBlock::StateChange(StateChange {
                device_area: data[0],
                address: u16::from_be_bytes([data[1], data[2]]),
                extension: data[3],
                message_type: data[4],
            }),
            MSG_TYPE_BLOCK_STATUS if data.len() >= 4 => MessageBlock::BlockStatus(BlockStatus {
                device_area: data[0],
                start_address: u16::from_be_bytes([data[1], data[2]]),
                extension: data[3],
                status: data[4..].to_vec(),
            }),
            MSG_TYPE_DATETIME if data.len() >= 7 => MessageBlock::DateTime(PanelDateTime {
                year: data[0],
                month: data[1],
                day: data[2],
                weekday: data[3],
                hour: data[4],
                minute: data[5],
                second: data[6],
            }),
            MSG_TYPE_ASCII => MessageBlock::AsciiText(decode_text(data)),
            MSG_TYPE_IDENT => MessageBlock::Ident(decode_bcd(data)),
            _ => MessageBlock::Unknown { msg_type, data: data.to_vec() },
        }
    }

    /// Encode this block as `msg_length, msg_type, data…`.
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, data) = match self {
            MessageBlock::StateChange(sc) => {
                let addr = sc.address.to_be_bytes();
                (
                    MSG_TYPE_STATE_CHANGE,
                    vec![sc.device_area, addr[0], addr[1], sc.extension, sc.message_type],
                )
            }
            MessageBlock::BlockStatus(bs) => {
                let addr = bs.start_address.to_be_bytes();
                let mut data = vec![bs.device_area, addr[0], addr[1], bs.extension];
                data.extend_from_slice(&bs.status);
                (MSG_TYPE_BLOCK_STATUS, data)
            }
            MessageBlock::DateTime(dt) => (
                MSG_TYPE_DATETIME,
                vec![dt.year, dt.month, dt.day, dt.weekday, dt.hour, dt.minute, dt.second],
            ),
            MessageBlock::AsciiText(text) => (MSG_TYPE_ASCII, encode_text(text)),
            MessageBlock::Ident(digits) => (MSG_TYPE_IDENT, encode_bcd(digits)),
            MessageBlock::Unknown { msg_type, data } => (*msg_type, data.clone()),
        };
        let mut block = Vec::with_capacity(data.len() + 2);
        block.push((data.len() + 1) as u8);
        block.push(msg_type);
        block.extend_from_slice(&data);
        block
    }
}

/// Decode panel text: UTF-8 when valid, Latin-1 byte mapping otherwise.
/// Trailing NUL and space padding is trimmed.
pub fn decode_text(data: &[u8]) -> String {
    let text = match std::str::from_utf8(data) {
        Ok(s) => s.to_string(),
        Err(_) => data.iter().map(|&b| b as char).collect(),
    };
    text.trim_end_matches(['\0', ' ']).to_string()
}

fn encode_text(text: &str) -> Vec<u8> {
    // Latin-1 where possible, '?' for anything outside it.
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

/// Decode a BCD-coded digit string; 0xF nibbles are padding and skipped.
pub fn decode_bcd(data: &[u8]) -> String {
    let mut digits = String::with_capacity(data.len() * 2);
    for byte in data {
        for nibble in [byte >> 4, byte & 0x0F] {
            if nibble <= 9 {
                digits.push(char::from(b'0' + nibble));
            }
        }
    }
    digits
}

fn encode_bcd(digits: &str) -> Vec<u8> {
    let mut nibbles: Vec<u8> = digits.bytes().filter(u8::is_ascii_digit).map(|b| b - b'0').collect();
    // Pad to at least 6 bytes of BCD, 0xF nibbles as filler.
    while nibbles.len() < 12 || nibbles.len() % 2 != 0 {
        nibbles.push(0x0F);
    }
    nibbles.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect()
}
