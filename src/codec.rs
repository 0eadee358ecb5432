//! Conversions between raw 16-bit register words, payload bytes and typed values.
//!
//! Everything in here is pure. The byte accessors never panic on short input:
//! the device occasionally returns truncated or garbled log payloads and a bad
//! entry must not abort decoding of the rest of a page.

/// Order of the two 16-bit words that make up a 32-bit register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    /// Most significant word first.
    Big,
    /// Least significant word first.
    Little,
}

/// Byte order of a 16-bit value inside a byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

macro_rules! read_bit {
    ($value:expr,$position:expr) => {
        ($value >> $position) & 1 != 0
    };
}
pub(crate) use read_bit;

/// Splits a register into its high and low byte.
pub fn split_byte(word: u16) -> (u8, u8) {
    ((word >> 8) as u8, (word & 0xFF) as u8)
}

/// Splits the low byte of a register into its high and low nibble.
pub fn split_nibble(word: u16) -> (u8, u8) {
    (((word >> 4) & 0x0F) as u8, (word & 0x0F) as u8)
}

pub fn to_i16(word: u16) -> i16 {
    word as i16
}

/// Assembles a 32-bit value from the first two words of `words`.
///
/// Missing words count as zero.
pub fn to_u32(words: &[u16], order: WordOrder) -> u32 {
    let first = u32::from(words.first().copied().unwrap_or(0));
    let second = u32::from(words.get(1).copied().unwrap_or(0));
    match order {
        WordOrder::Big => first << 16 | second,
        WordOrder::Little => second << 16 | first,
    }
}

pub fn to_i32(words: &[u16], order: WordOrder) -> i32 {
    to_u32(words, order) as i32
}

/// Packs registers into big-endian byte pairs.
pub fn to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_be_bytes()).collect()
}

/// Decodes registers as a NUL padded UTF-8 string.
pub fn to_string(words: &[u16]) -> String {
    let mut bytes = to_bytes(words);
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Returns the byte at `pos`, or 0 past the end of the payload.
pub fn byte_at(bytes: &[u8], pos: usize) -> u8 {
    bytes.get(pos).copied().unwrap_or(0)
}

/// Reads an unsigned 16-bit value at `pos`, 0 if the payload is too short.
pub fn uint16_from_bytes(bytes: &[u8], pos: usize, endian: Endian) -> u16 {
    let (Some(&first), Some(&second)) =
        (bytes.get(pos), pos.checked_add(1).and_then(|next| bytes.get(next)))
    else {
        return 0;
    };
    match endian {
        Endian::Big => u16::from_be_bytes([first, second]),
        Endian::Little => u16::from_le_bytes([first, second]),
    }
}

/// Reads a two's complement 16-bit value at `pos`, 0 if the payload is too short.
pub fn int16_from_bytes(bytes: &[u8], pos: usize, endian: Endian) -> i16 {
    uint16_from_bytes(bytes, pos, endian) as i16
}

/// Formats a packed version number as `"{major}.{minor}"`.
pub fn version(major: u8, minor: u8) -> String {
    format!("{major}.{minor}")
}

/// Rounds `value` to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Maps every set bit of `bitmask` to its label.
///
/// Bits without a label in `labels` are reported as `bit {n} undefined`.
pub fn bitmask_to_strings(bitmask: u16, labels: &[&str]) -> Vec<String> {
    (0..16usize)
        .filter(|&bit| read_bit!(bitmask, bit))
        .map(|bit| match labels.get(bit) {
            Some(label) => label.to_string(),
            None => format!("bit {bit} undefined"),
        })
        .collect()
}

/// Joins labels with `,`, cut to `max_length` characters, or `default` if empty.
pub fn strings_to_string(strings: &[String], default: &str, max_length: usize) -> String {
    if strings.is_empty() {
        return default.to_string();
    }
    strings.join(",").chars().take(max_length).collect()
}

pub fn bitmask_to_string(bitmask: u16, labels: &[&str], default: &str) -> String {
    strings_to_string(&bitmask_to_strings(bitmask, labels), default, 255)
}

/// Looks up `index` in a label table, falling back to `default`.
pub fn label_or(labels: &[&'static str], index: u8, default: &'static str) -> &'static str {
    labels.get(usize::from(index)).copied().unwrap_or(default)
}
