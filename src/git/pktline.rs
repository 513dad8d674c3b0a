//! Packet-line framing used by the Git smart-HTTP advertisement.
//!
//! A packet is `<4 hex digits><payload>` where the length counts the four
//! header digits plus the payload. The special length `0000` is a flush
//! packet and carries no payload.

use bytes::{BufMut, Bytes, BytesMut};

/// Length of the hexadecimal length header.
pub const HEADER_LEN: usize = 4;

/// Largest packet git accepts, header included.
pub const MAX_PACKET_LEN: usize = 65520;

/// Encoded flush packet.
pub const FLUSH_PACKET: &[u8] = b"0000";

/// A single decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `0000`: end of a section.
    Flush,
    /// A data packet and its payload.
    Data(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PktLineError {
    #[error("packet header needs {HEADER_LEN} bytes, got {0}")]
    ShortHeader(usize),

    #[error("invalid packet length header {0:?}")]
    InvalidLength(String),

    #[error("packet declares {declared} bytes but only {available} are available")]
    Truncated { declared: usize, available: usize },

    #[error("payload of {0} bytes does not fit in a packet")]
    PayloadTooLong(usize),
}

/// Append one data packet carrying `payload` to `buf`.
pub fn encode_into(buf: &mut BytesMut, payload: &[u8]) -> Result<(), PktLineError> {
    let total = payload.len() + HEADER_LEN;
    if total > MAX_PACKET_LEN {
        return Err(PktLineError::PayloadTooLong(payload.len()));
    }
    buf.reserve(total);
    buf.put_slice(format!("{total:04x}").as_bytes());
    buf.put_slice(payload);
    Ok(())
}

/// Encode one data packet.
pub fn encode(payload: &[u8]) -> Result<Bytes, PktLineError> {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, payload)?;
    Ok(buf.freeze())
}

/// Append a flush packet to `buf`.
pub fn encode_flush(buf: &mut BytesMut) {
    buf.put_slice(FLUSH_PACKET);
}

/// Decode the packet at the start of `input`.
///
/// Returns the packet together with the number of bytes it occupied, which
/// equals the declared length for data packets.
pub fn decode(input: &[u8]) -> Result<(Packet, usize), PktLineError> {
    if input.len() < HEADER_LEN {
        return Err(PktLineError::ShortHeader(input.len()));
    }

    let header = &input[..HEADER_LEN];
    let declared = std::str::from_utf8(header)
        .ok()
        .filter(|digits| digits.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|digits| usize::from_str_radix(digits, 16).ok())
        .ok_or_else(|| PktLineError::InvalidLength(String::from_utf8_lossy(header).into_owned()))?;

    if declared == 0 {
        return Ok((Packet::Flush, HEADER_LEN));
    }
    if declared < HEADER_LEN {
        return Err(PktLineError::InvalidLength(format!("{declared:04x}")));
    }
    if declared > input.len() {
        return Err(PktLineError::Truncated {
            declared,
            available: input.len(),
        });
    }

    let payload = Bytes::copy_from_slice(&input[HEADER_LEN..declared]);
    Ok((Packet::Data(payload), declared))
}

/// The preamble sent ahead of an info-refs advertisement:
/// `# service=<name>\n` as a packet, then a flush packet.
pub fn service_preamble(service: &str) -> Result<Bytes, PktLineError> {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, format!("# service={service}\n").as_bytes())?;
    encode_flush(&mut buf);
    Ok(buf.freeze())
}
