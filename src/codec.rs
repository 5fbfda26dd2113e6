// MIT License

//! GMS telegram framing.
//!
//! A telegram on the wire looks like this:
//!
//! ```text
//! 0x68  L  L  0x68  control  address  payload…  checksum  0x16
//! ```
//!
//! `L` (transmitted twice) counts control + address + payload. The
//! checksum is the additive sum of those same bytes, mod 256. The decoder
//! works on an accumulating byte window: partial frames are never
//! consumed, and a frame that fails validation costs exactly one byte
//! before the scan for the next start marker resumes.

use tracing::warn;

/// Frame start marker.
pub const TELEGRAM_START: u8 = 0x68;
/// Frame end marker.
pub const TELEGRAM_END: u8 = 0x16;
/// Smallest possible frame: markers, doubled length, control, address, checksum.
pub const MIN_FRAME_LEN: usize = 8;
/// Largest payload the one-byte length field can carry.
pub const MAX_PAYLOAD_LEN: usize = 253;

/// Control field of a telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlField {
    /// `0x40` — poll/keep-alive from the sending station.
    SendNorm,
    /// `0x73` — data telegram carrying message blocks.
    SendNdat,
    /// `0x00` — positive acknowledgement.
    ConfirmAck,
    /// `0x01` — negative acknowledgement.
    ConfirmNak,
    /// Any other control value, surfaced rather than dropped.
    Other(u8),
}

impl ControlField {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x40 => Self::SendNorm,
            0x73 => Self::SendNdat,
            0x00 => Self::ConfirmAck,
            0x01 => Self::ConfirmNak,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::SendNorm => 0x40,
            Self::SendNdat => 0x73,
            Self::ConfirmAck => 0x00,
            Self::ConfirmNak => 0x01,
            Self::Other(b) => *b,
        }
    }
}

/// One decoded wire telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub control: ControlField,
    pub address: u8,
    pub payload: Vec<u8>,
}

impl Telegram {
    pub fn new(control: ControlField, address: u8, payload: Vec<u8>) -> Self {
        Self { control, address, payload }
    }

    /// Positive acknowledgement telegram.
    pub fn confirm_ack() -> Self {
        Self::new(ControlField::ConfirmAck, 0x02, Vec::new())
    }

    /// Negative acknowledgement telegram.
    pub fn confirm_nak() -> Self {
        Self::new(ControlField::ConfirmNak, 0x02, Vec::new())
    }

    /// Poll telegram announcing that data follows.
    pub fn send_norm() -> Self {
        Self::new(ControlField::SendNorm, 0x02, Vec::new())
    }

    /// Data telegram carrying message blocks.
    pub fn send_ndat(payload: Vec<u8>) -> Self {
        Self::new(ControlField::SendNdat, 0x01, payload)
    }

    /// Encode into a complete, checksummed frame ready for transmission.
    ///
    /// # Panics
    ///
    /// If the payload exceeds [`MAX_PAYLOAD_LEN`]; the one-byte length
    /// field cannot represent a longer frame.
    pub fn encode(&self) -> Vec<u8> {
        assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "telegram payload too long: {} bytes (max {})",
            self.payload.len(),
            MAX_PAYLOAD_LEN
        );
        let length = (2 + self.payload.len()) as u8;
        let mut frame = Vec::with_capacity(self.payload.len() + MIN_FRAME_LEN);
        frame.push(TELEGRAM_START);
        frame.push(length);
        frame.push(length);
        frame.push(TELEGRAM_START);
        frame.push(self.control.as_byte());
        frame.push(self.address);
        frame.extend_from_slice(&self.payload);
        frame.push(checksum(self.control.as_byte(), self.address, &self.payload));
        frame.push(TELEGRAM_END);
        frame
    }
}

/// Additive mod-256 checksum over control, address and payload.
pub fn checksum(control: u8, address: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(control.wrapping_add(address), |sum, b| sum.wrapping_add(*b))
}

/// Reasons a candidate frame is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("length fields disagree ({0:#04x} vs {1:#04x})")]
    LengthMismatch(u8, u8),
    #[error("length field too small ({0})")]
    BadLength(u8),
    #[error("missing second start marker")]
    BadStartMarker,
    #[error("missing end marker")]
    BadEndMarker,
    #[error("checksum mismatch: telegram says {expected:#04x}, computed {computed:#04x}")]
    ChecksumMismatch { expected: u8, computed: u8 },
}

/// Result of one decode attempt over a byte window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Telegram(Telegram),
    NeedMoreBytes,
    InvalidFrame(FrameError),
}

/// Try to decode one telegram from the front of `buf`.
///
/// Returns the outcome plus the number of bytes consumed. Bytes before
/// the first start marker are treated as line noise and consumed.
/// `NeedMoreBytes` consumes only leading noise; an invalid frame consumes
/// exactly one byte past the noise so the scan can resynchronize on the
/// next plausible start marker.
pub fn decode(buf: &[u8]) -> (DecodeOutcome, usize) {
    let start = match buf.iter().position(|&b| b == TELEGRAM_START) {
        Some(p) => p,
        None => return (DecodeOutcome::NeedMoreBytes, buf.len()),
    };

    let window = &buf[start..];
    if window.len() < 4 {
        return (DecodeOutcome::NeedMoreBytes, start);
    }

    let l1 = window[1];
    let l2 = window[2];
    if l1 != l2 {
        return (DecodeOutcome::InvalidFrame(FrameError::LengthMismatch(l1, l2)), start + 1);
    }
    if l1 < 2 {
        return (DecodeOutcome::InvalidFrame(FrameError::BadLength(l1)), start + 1);
    }
    if window[3] != TELEGRAM_START {
        return (DecodeOutcome::InvalidFrame(FrameError::BadStartMarker), start + 1);
    }

    let total = 4 + l1 as usize + 2;
    if window.len() < total {
        return (DecodeOutcome::NeedMoreBytes, start);
    }

    let body = &window[4..4 + l1 as usize];
    let expected = window[4 + l1 as usize];
    let end = window[4 + l1 as usize + 1];

    if end != TELEGRAM_END {
        return (DecodeOutcome::InvalidFrame(FrameError::BadEndMarker), start + 1);
    }

    let computed = checksum(body[0], body[1], &body[2..]);
    if computed != expected {
        return (
            DecodeOutcome::InvalidFrame(FrameError::ChecksumMismatch { expected, computed }),
            start + 1,
        );
    }

    let telegram = Telegram {
        control: ControlField::from_byte(body[0]),
        address: body[1],
        payload: body[2..].to_vec(),
    };
    (DecodeOutcome::Telegram(telegram), start + total)
}

/// Accumulating byte window over a socket read stream.
///
/// Feed raw reads with [`extend`](Self::extend) and drain complete
/// telegrams with [`next_telegram`](Self::next_telegram). Invalid frames
/// are logged, counted and skipped; they never abort the stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    invalid_frames: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete, valid telegram, or `None` once the buffer holds
    /// only a partial frame (or nothing parseable yet).
    pub fn next_telegram(&mut self) -> Option<Telegram> {
        loop {
            let (outcome, consumed) = decode(&self.buf);
            self.buf.drain(..consumed);
            match outcome {
                DecodeOutcome::Telegram(t) => return Some(t),
                DecodeOutcome::NeedMoreBytes => return None,
                DecodeOutcome::InvalidFrame(e) => {
                    self.invalid_frames += 1;
                    warn!("Discarding invalid frame: {}", e);
                }
            }
        }
    }

    /// Number of invalid frames skipped so far.
    pub fn invalid_frames(&self) -> u64 {
        self.invalid_frames
    }

    /// Bytes currently buffered (partial frame remainder).
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Telegram {
        Telegram::send_ndat(vec![0x06, 0x02, 0x00, 0x05, 0x30, 0x02, 0x61])
    }

    #[test]
    fn test_encode_layout() {
        let frame = Telegram::confirm_ack().encode();
        assert_eq!(frame, vec![0x68, 0x02, 0x02, 0x68, 0x00, 0x02, 0x02, 0x16]);
    }

    #[test]
    fn test_round_trip() {
        let telegram = sample();
        let frame = telegram.encode();
        let (outcome, consumed) = decode(&frame);
        assert_eq!(consumed, frame.len());
        assert_eq!(outcome, DecodeOutcome::Telegram(telegram));
    }

    #[test]
    fn test_partial_frame_not_consumed() {
        let frame = sample().encode();
        let (outcome, consumed) = decode(&frame[..5]);
        assert_eq!(outcome, DecodeOutcome::NeedMoreBytes);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let mut data = vec![0xAA, 0xBB, 0xCC];
        let frame = sample().encode();
        data.extend_from_slice(&frame);
        let (outcome, consumed) = decode(&data);
        assert_eq!(outcome, DecodeOutcome::Telegram(sample()));
        assert_eq!(consumed, 3 + frame.len());
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut frame = sample().encode();
        let cks_pos = frame.len() - 2;
        frame[cks_pos] = frame[cks_pos].wrapping_add(1);
        let (outcome, consumed) = decode(&frame);
        assert!(matches!(
            outcome,
            DecodeOutcome::InvalidFrame(FrameError::ChecksumMismatch { .. })
        ));
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_resync_after_corrupt_frame() {
        // A corrupted frame followed by a valid one: the buffer must skip
        // the bad frame byte by byte and still produce the good telegram.
        let mut bad = sample().encode();
        let cks_pos = bad.len() - 2;
        bad[cks_pos] ^= 0xFF;
        let good = Telegram::confirm_ack();

        let mut fb = FrameBuffer::new();
        fb.extend(&bad);
        fb.extend(&good.encode());

        assert_eq!(fb.next_telegram(), Some(good));
        assert_eq!(fb.next_telegram(), None);
        assert!(fb.invalid_frames() >= 1);
    }

    #[test]
    fn test_frame_buffer_across_reads() {
        let telegram = sample();
        let frame = telegram.encode();
        let mut fb = FrameBuffer::new();
        let split = frame.len() / 2;

        fb.extend(&frame[..split]);
        assert_eq!(fb.next_telegram(), None);
        fb.extend(&frame[split..]);
        assert_eq!(fb.next_telegram(), Some(telegram));
        assert_eq!(fb.pending_bytes(), 0);
    }

    #[test]
    fn test_two_telegrams_in_one_read() {
        let a = sample();
        let b = Telegram::send_norm();
        let mut fb = FrameBuffer::new();
        let mut data = a.encode();
        data.extend_from_slice(&b.encode());
        fb.extend(&data);

        assert_eq!(fb.next_telegram(), Some(a));
        assert_eq!(fb.next_telegram(), Some(b));
        assert_eq!(fb.next_telegram(), None);
    }

    #[test]
    fn test_max_payload_encodes() {
        let telegram = Telegram::send_ndat(vec![0x00; MAX_PAYLOAD_LEN]);
        let frame = telegram.encode();
        assert_eq!(frame[1], 0xFF);
        let (outcome, _) = decode(&frame);
        assert_eq!(outcome, DecodeOutcome::Telegram(telegram));
    }

    #[test]
    #[should_panic(expected = "payload too long")]
    fn test_oversized_payload_rejected() {
        Telegram::send_ndat(vec![0x00; MAX_PAYLOAD_LEN + 1]).encode();
    }

    #[test]
    fn test_control_field_round_trip() {
        for b in [0x40u8, 0x73, 0x00, 0x01, 0x7F] {
            assert_eq!(ControlField::from_byte(b).as_byte(), b);
        }
    }
}
