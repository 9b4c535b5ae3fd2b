//! Frame codec for the task-executable pipe protocol.
//!
//! Every record on the pipe is `MAGIC (2 bytes) | LENGTH (2 bytes, unsigned
//! short) | PAYLOAD (LENGTH bytes)`. Text payloads are packed one character
//! per 16-bit word, emulating the peer's wide-character convention, so an
//! N-character string occupies `2 * N` payload bytes. All multi-byte values
//! use the configured [`ByteOrder`]; nothing is autodetected.

use corral_config::ByteOrder;

use crate::errors::WireError;

/// Magic constant opening every pipe record.
pub const FRAME_MAGIC: u16 = 0o1120;

/// Size of the record header in bytes.
pub const HEADER_LEN: usize = 4;

/// Encodes one 16-bit word in the given byte order.
#[must_use]
pub fn word_to_bytes(order: ByteOrder, word: u16) -> [u8; 2] {
    match order {
        ByteOrder::Big => word.to_be_bytes(),
        ByteOrder::Little => word.to_le_bytes(),
    }
}

/// Decodes one 16-bit word in the given byte order.
#[must_use]
pub fn bytes_to_word(order: ByteOrder, bytes: [u8; 2]) -> u16 {
    match order {
        ByteOrder::Big => u16::from_be_bytes(bytes),
        ByteOrder::Little => u16::from_le_bytes(bytes),
    }
}

/// Packs 8-bit characters into the peer's 16-bit word format.
///
/// Each byte is sign-extended into a word, matching the peer's conversion
/// between its character and short types, and [`unpack16`] recovers the
/// original bytes exactly.
#[must_use]
pub fn pack16(order: ByteOrder, ascii: &[u8]) -> Vec<u8> {
    let mut packed = Vec::with_capacity(ascii.len() * 2);
    for &byte in ascii {
        let word = byte as i8 as i16 as u16;
        packed.extend_from_slice(&word_to_bytes(order, word));
    }
    packed
}

/// Unpacks 16-bit words back into 8-bit characters.
///
/// # Errors
///
/// Returns [`WireError::OddPayload`] when the byte count is not a multiple
/// of the word size.
pub fn unpack16(order: ByteOrder, packed: &[u8]) -> Result<Vec<u8>, WireError> {
    let words = words16(order, packed)?;
    Ok(words.iter().map(|&word| (word as u16 & 0xff) as u8).collect())
}

/// Reinterprets a packed payload as a sequence of signed 16-bit words.
///
/// Control sub-messages are addressed and parsed at the word level, so this
/// is the raw view used by the graphics channels.
///
/// # Errors
///
/// Returns [`WireError::OddPayload`] when the byte count is not a multiple
/// of the word size.
pub fn words16(order: ByteOrder, packed: &[u8]) -> Result<Vec<i16>, WireError> {
    if packed.len() % 2 != 0 {
        return Err(WireError::OddPayload { len: packed.len() });
    }
    Ok(packed
        .chunks_exact(2)
        .map(|pair| bytes_to_word(order, [pair[0], pair[1]]) as i16)
        .collect())
}

/// Builds a record header announcing `nbytes` of payload.
#[must_use]
pub fn encode_header(order: ByteOrder, nbytes: u16) -> [u8; 4] {
    let magic = word_to_bytes(order, FRAME_MAGIC);
    let length = word_to_bytes(order, nbytes);
    [magic[0], magic[1], length[0], length[1]]
}

/// Validates a record header and extracts the payload length.
///
/// # Errors
///
/// Returns [`WireError::TruncatedHeader`] when fewer than four bytes are
/// available and [`WireError::BadMagic`] when the magic constant does not
/// match. A bad magic is unrecoverable: the stream position is unknown and
/// the whole session must be discarded.
pub fn decode_header(order: ByteOrder, header: &[u8]) -> Result<u16, WireError> {
    if header.len() < HEADER_LEN {
        return Err(WireError::TruncatedHeader { got: header.len() });
    }
    let magic = bytes_to_word(order, [header[0], header[1]]);
    if magic != FRAME_MAGIC {
        return Err(WireError::BadMagic { found: magic });
    }
    Ok(bytes_to_word(order, [header[2], header[3]]))
}

/// Wraps already-packed payload bytes in a single record.
#[must_use]
pub fn frame_record(order: ByteOrder, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&encode_header(order, payload.len() as u16));
    record.extend_from_slice(payload);
    record
}

/// Packs a text payload and wraps it in a single record.
#[must_use]
pub fn encode_frame(order: ByteOrder, text: &str) -> Vec<u8> {
    frame_record(order, &pack16(order, text.as_bytes()))
}
