use serde::{Deserialize, Serialize};

/// Character encodings a buffer cell may be expressed in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Printable 7-bit ASCII.
    Ascii,
    /// ISO-8859-1 printable range.
    Latin1,
    /// EBCDIC code page 037, the usual host encoding.
    Cp037,
}

impl Encoding {
    /// Decode one code, `None` when it is not printable in this encoding.
    #[must_use]
    pub fn decode(self, code: u8) -> Option<char> {
        match self {
            Self::Ascii => (0x20..=0x7e).contains(&code).then_some(char::from(code)),
            Self::Latin1 => {
                ((0x20..=0x7e).contains(&code) || code >= 0xa0).then_some(char::from(code))
            }
            Self::Cp037 => cp037(code),
        }
    }
}

/// Decode through an ordered list of encodings. Never fails: NUL is a blank and
/// anything no encoding accepts becomes `placeholder`.
#[must_use]
pub fn decode_code(code: u8, encodings: &[Encoding], placeholder: char) -> char {
    decode_ranked(code, encodings).map_or(placeholder, |(_, ch)| ch)
}

/// Decoded character and the position in `encodings` that produced it
/// (0 for NUL). `None` when no encoding accepts the code.
#[must_use]
pub fn decode_ranked(code: u8, encodings: &[Encoding]) -> Option<(usize, char)> {
    if code == 0 {
        return Some((0, ' '));
    }
    encodings
        .iter()
        .enumerate()
        .find_map(|(rank, encoding)| encoding.decode(code).map(|ch| (rank, ch)))
}

fn cp037(code: u8) -> Option<char> {
    let ch = match code {
        0x40 => ' ',
        0x81..=0x89 => offset_char(b'a', code - 0x81),
        0x91..=0x99 => offset_char(b'j', code - 0x91),
        0xa2..=0xa9 => offset_char(b's', code - 0xa2),
        0xc1..=0xc9 => offset_char(b'A', code - 0xc1),
        0xd1..=0xd9 => offset_char(b'J', code - 0xd1),
        0xe2..=0xe9 => offset_char(b'S', code - 0xe2),
        0xf0..=0xf9 => offset_char(b'0', code - 0xf0),
        0x4a => '¢',
        0x4b => '.',
        0x4c => '<',
        0x4d => '(',
        0x4e => '+',
        0x4f => '|',
        0x50 => '&',
        0x5a => '!',
        0x5b => '$',
        0x5c => '*',
        0x5d => ')',
        0x5e => ';',
        0x5f => '¬',
        0x60 => '-',
        0x61 => '/',
        0x6a => '¦',
        0x6b => ',',
        0x6c => '%',
        0x6d => '_',
        0x6e => '>',
        0x6f => '?',
        0x79 => '`',
        0x7a => ':',
        0x7b => '#',
        0x7c => '@',
        0x7d => '\'',
        0x7e => '=',
        0x7f => '"',
        0xa1 => '~',
        0xb0 => '^',
        0xba => '[',
        0xbb => ']',
        0xc0 => '{',
        0xd0 => '}',
        0xe0 => '\\',
        _ => return None,
    };
    Some(ch)
}

fn offset_char(base: u8, offset: u8) -> char {
    char::from(base.saturating_add(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_first_then_ebcdic() {
        let order = [Encoding::Ascii, Encoding::Cp037];
        assert_eq!(decode_code(0x41, &order, '?'), 'A');
        assert_eq!(decode_code(0xc1, &order, '?'), 'A');
        assert_eq!(decode_code(0xf5, &order, '?'), '5');
    }

    #[test]
    fn undecodable_becomes_placeholder() {
        assert_eq!(decode_code(0x07, &[Encoding::Ascii], '\u{FFFD}'), '\u{FFFD}');
        assert_eq!(decode_code(0x00, &[Encoding::Ascii], '\u{FFFD}'), ' ');
    }

    #[test]
    fn latin1_accepts_high_half() {
        assert_eq!(Encoding::Latin1.decode(0xe9), Some('é'));
        assert_eq!(Encoding::Ascii.decode(0xe9), None);
    }
}
