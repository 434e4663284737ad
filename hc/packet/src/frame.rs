//! Frame codec
//!
//! Wire layout of one frame:
//!
//! ```text
//! ESC | mask | payload ^ mask | crc32_le ^ mask | ESC | END
//! ```
//!
//! The mask is picked so the scrambled region never contains `ESC`, which
//! makes the next `ESC` an unambiguous end of frame for the receiver. `END`
//! is kept out of the region as well whenever some mask allows it. A mask of
//! zero means the region is sent as is. `ESC, END` with no content is a bare
//! end-of-stream marker.

use hc_core::{HcError, HcResult};

use crate::crc::crc32;
use crate::{CRC_SIZE, END, ESC, MAX_CONTENT, MAX_FRAME, MAX_PAYLOAD};

/// Header plus trailer bytes around the scrambled region
const OVERHEAD: usize = 4;

/// Set of byte values, one bit each
struct ByteSet([u32; 8]);

impl ByteSet {
    fn of<'a>(bytes: impl IntoIterator<Item = &'a u8>) -> Self {
        let mut set = Self([0; 8]);
        for &byte in bytes {
            set.0[usize::from(byte / 32)] |= 1 << (byte % 32);
        }
        set
    }

    fn contains(&self, byte: u8) -> bool {
        self.0[usize::from(byte / 32)] & (1 << (byte % 32)) != 0
    }
}

/// Smallest usable mask for the given payload and CRC bytes
fn choose_mask(present: &ByteSet) -> u8 {
    if !present.contains(ESC) && !present.contains(END) {
        return 0;
    }
    let usable = |mask: u8, avoid_end: bool| {
        mask != ESC
            && mask != END
            && !present.contains(ESC ^ mask)
            && !(avoid_end && present.contains(END ^ mask))
    };
    // At most 253 distinct values are present, so the ESC-only pass always finds a mask.
    (1..=u8::MAX)
        .find(|&mask| usable(mask, true))
        .or_else(|| (1..=u8::MAX).find(|&mask| usable(mask, false)))
        .unwrap_or(0)
}

/// Encoded size of a payload of `payload_len` bytes
pub const fn encoded_len(payload_len: usize) -> usize {
    payload_len + CRC_SIZE + OVERHEAD
}

/// Encode `payload` into `out`, returning the frame length
///
/// Payloads longer than `max_payload` (itself capped at [`MAX_PAYLOAD`]) are
/// rejected.
pub fn encode(payload: &[u8], max_payload: usize, out: &mut [u8]) -> HcResult<usize> {
    if payload.len() > max_payload.min(MAX_PAYLOAD) {
        return Err(HcError::PayloadTooLarge);
    }
    let total = encoded_len(payload.len());
    if out.len() < total {
        return Err(HcError::BufferTooSmall);
    }

    let crc = crc32(payload).to_le_bytes();
    let mask = choose_mask(&ByteSet::of(payload.iter().chain(&crc)));

    out[0] = ESC;
    out[1] = mask;
    for (dst, &src) in out[2..].iter_mut().zip(payload.iter().chain(&crc)) {
        *dst = src ^ mask;
    }
    out[total - 2] = ESC;
    out[total - 1] = END;

    trace!("encoded {} byte payload, mask {}", payload.len(), mask);
    Ok(total)
}

/// Decode one complete frame into `out`, returning the payload length
pub fn decode(frame: &[u8], out: &mut [u8]) -> HcResult<usize> {
    if frame.len() < encoded_len(0) || frame.len() > MAX_FRAME {
        return Err(HcError::Malformed);
    }
    let (header, rest) = frame.split_at(2);
    let (content, trailer) = rest.split_at(rest.len() - 2);
    let mask = header[1];
    if header[0] != ESC || *trailer != [ESC, END] || mask == ESC || mask == END {
        return Err(HcError::Malformed);
    }
    if content.len() > MAX_CONTENT || content.contains(&ESC) {
        return Err(HcError::Malformed);
    }

    let (payload, crc) = content.split_at(content.len() - CRC_SIZE);
    let out = out
        .get_mut(..payload.len())
        .ok_or(HcError::BufferTooSmall)?;
    for (dst, &src) in out.iter_mut().zip(payload) {
        *dst = src ^ mask;
    }

    let mask_word = u32::from_le_bytes([mask; 4]);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]) ^ mask_word;
    if crc32(out) != expected {
        return Err(HcError::CrcMismatch);
    }
    Ok(payload.len())
}

/// Owned encoded frame, ready to hand to a transmitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: heapless::Vec<u8, MAX_FRAME>,
}

impl Frame {
    /// Encode a payload of at most [`MAX_PAYLOAD`] bytes
    pub fn new(payload: &[u8]) -> HcResult<Self> {
        let mut bytes = heapless::Vec::new();
        bytes
            .resize(MAX_FRAME, 0)
            .map_err(|_| HcError::BufferTooSmall)?;
        let len = encode(payload, MAX_PAYLOAD, &mut bytes)?;
        bytes.truncate(len);
        Ok(Self { bytes })
    }

    /// The bare end-of-stream marker
    pub fn end_marker() -> Self {
        let mut bytes = heapless::Vec::new();
        // Two bytes always fit.
        let _ = bytes.extend_from_slice(&[ESC, END]);
        Self { bytes }
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true for a constructed frame
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Scrambling mask, `END` for the end marker
    pub fn mask(&self) -> u8 {
        self.bytes[1]
    }

    /// Length of the carried payload
    pub fn payload_len(&self) -> usize {
        self.bytes.len().saturating_sub(encoded_len(0))
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrambled_region(frame: &Frame) -> &[u8] {
        let bytes = frame.as_bytes();
        &bytes[2..bytes.len() - 2]
    }

    #[test]
    fn test_plain_payload_is_not_scrambled() {
        // CRC-32 of this payload is 0xF4990B47: no sentinel anywhere.
        let frame = Frame::new(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(frame.mask(), 0);
        assert_eq!(&frame.as_bytes()[..7], &[ESC, 0, 1, 2, 3, 4, 5]);
        assert_eq!(&frame.as_bytes()[7..11], &[0x47, 0x0B, 0x99, 0xF4]);
        assert_eq!(frame.len(), 5 + 8);
        assert_eq!(frame.payload_len(), 5);
        assert_eq!(&frame.as_bytes()[frame.len() - 2..], &[ESC, END]);
    }

    #[test]
    fn test_sentinels_are_scrambled_away() {
        let payload = [ESC, END, ESC, 0x00, ESC ^ 1, END ^ 1];
        let frame = Frame::new(&payload).unwrap();

        assert_ne!(frame.mask(), 0);
        assert_ne!(frame.mask(), ESC);
        assert_ne!(frame.mask(), END);
        assert!(!scrambled_region(&frame).contains(&ESC));
        assert!(!scrambled_region(&frame).contains(&END));

        let mut out = [0u8; MAX_PAYLOAD];
        let len = decode(frame.as_bytes(), &mut out).unwrap();
        assert_eq!(&out[..len], &payload);
    }

    #[test]
    fn test_dense_payload_never_contains_esc() {
        // Every value but a handful: only the ESC-only mask search can succeed.
        let payload: heapless::Vec<u8, MAX_PAYLOAD> = (0..=u8::MAX)
            .filter(|b| ![1u8, 2, 3, 4, 5, 6, 7].contains(b))
            .collect();
        let frame = Frame::new(&payload).unwrap();

        assert!(!scrambled_region(&frame).contains(&ESC));
        assert!(frame.mask() != ESC && frame.mask() != END);

        let mut out = [0u8; MAX_PAYLOAD];
        let len = decode(frame.as_bytes(), &mut out).unwrap();
        assert_eq!(&out[..len], &payload[..]);
    }

    #[test]
    fn test_payload_limits() {
        let big = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(Frame::new(&big), Err(HcError::PayloadTooLarge));
        assert!(Frame::new(&big[..MAX_PAYLOAD]).is_ok());

        let mut out = [0u8; 64];
        assert_eq!(encode(&[0; 20], 10, &mut out), Err(HcError::PayloadTooLarge));
        assert_eq!(encode(&[0; 60], 60, &mut out), Err(HcError::BufferTooSmall));
        assert_eq!(encode(&[], 10, &mut out), Ok(encoded_len(0)));
    }

    #[test]
    fn test_decode_rejects_damage() {
        let frame = Frame::new(b"status").unwrap();
        let mut out = [0u8; 16];

        let mut corrupt = frame.clone();
        corrupt.bytes[3] ^= 0x01;
        assert_eq!(decode(corrupt.as_bytes(), &mut out), Err(HcError::CrcMismatch));

        let mut cut = frame.clone();
        cut.bytes.truncate(cut.len() - 1);
        assert_eq!(decode(cut.as_bytes(), &mut out), Err(HcError::Malformed));

        assert_eq!(decode(frame.as_bytes(), &mut out[..3]), Err(HcError::BufferTooSmall));
        assert_eq!(decode(Frame::end_marker().as_bytes(), &mut out), Err(HcError::Malformed));
    }

    #[test]
    fn test_end_marker() {
        let marker = Frame::end_marker();
        assert_eq!(marker.as_bytes(), &[ESC, END]);
        assert_eq!(marker.mask(), END);
        assert_eq!(marker.payload_len(), 0);
    }
}
