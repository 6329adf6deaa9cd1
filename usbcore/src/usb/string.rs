//! String descriptors (USB 2.0 section 9.6.7).

/// The fixed header of a string descriptor. The UTF-16LE payload, or the
/// LANGID table for string index zero, follows directly in the buffer.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct StringDescriptor {
    pub length: u8,
    pub kind: u8,
}

unsafe impl plain::Plain for StringDescriptor {}

/// Upper bound on a string descriptor: the length field is one byte.
pub const STRING_DESCRIPTOR_MAX_SIZE: usize = 0xFF;

/// Decodes the payload of a string descriptor read. `raw` is the whole
/// transfer buffer starting at the descriptor header. Only the low byte of
/// each UTF-16 unit is kept, which covers the ASCII strings devices report.
pub fn decode_string(raw: &[u8]) -> Option<String> {
    let length = *raw.first()? as usize;
    if length < 2 || length % 2 != 0 || length > raw.len() {
        return None;
    }
    Some(
        raw[2..length]
            .chunks_exact(2)
            .map(|pair| pair[0] as char)
            .collect(),
    )
}

/// Extracts the supported LANGIDs from a read of string descriptor zero.
pub fn decode_languages(raw: &[u8]) -> Vec<u16> {
    let length = match raw.first() {
        Some(&length) if (2..=raw.len()).contains(&(length as usize)) => length as usize,
        _ => return Vec::new(),
    };
    raw[2..length]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf16() {
        // "Hub" as a string descriptor.
        let raw = [8, 3, b'H', 0, b'u', 0, b'b', 0];
        assert_eq!(decode_string(&raw).as_deref(), Some("Hub"));
    }

    #[test]
    fn rejects_odd_or_short_lengths() {
        assert_eq!(decode_string(&[1, 3]), None);
        assert_eq!(decode_string(&[5, 3, 0, 0, 0]), None);
        assert_eq!(decode_string(&[10, 3, 0, 0]), None);
    }

    #[test]
    fn keeps_only_low_bytes() {
        // A unit outside of ASCII decodes to its low byte.
        let raw = [6, 3, 0x41, 0x01, b'b', 0];
        assert_eq!(decode_string(&raw).as_deref(), Some("Ab"));
    }

    #[test]
    fn language_table() {
        let raw = [6, 3, 0x09, 0x04, 0x07, 0x04];
        assert_eq!(decode_languages(&raw), vec![0x0409, 0x0407]);
    }

    #[test]
    fn language_table_rejects_short_lengths() {
        assert_eq!(decode_languages(&[1, 3]), Vec::<u16>::new());
        assert_eq!(decode_languages(&[0, 3]), Vec::<u16>::new());
        assert_eq!(decode_languages(&[8, 3, 0x09, 0x04]), Vec::<u16>::new());
    }
}
