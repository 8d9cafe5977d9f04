use std::str::FromStr;

use crate::error::EncodingError;

/// Character encoding used to turn selected header values into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    Utf8,
    Utf16Be,
    Utf16Le,
    /// UTF-16 with an optional byte order mark, big endian without one
    Utf16,
    Latin1,
    Ascii,
}

impl FromStr for HeaderEncoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('_', "-");
        match normalized.as_str() {
            "UTF-8" | "UTF8" => Ok(Self::Utf8),
            "UTF-16BE" => Ok(Self::Utf16Be),
            "UTF-16LE" => Ok(Self::Utf16Le),
            "UTF-16" => Ok(Self::Utf16),
            "ISO-8859-1" | "LATIN1" => Ok(Self::Latin1),
            "US-ASCII" | "ASCII" => Ok(Self::Ascii),
            _ => Err(EncodingError::Unsupported(s.to_string())),
        }
    }
}

impl HeaderEncoding {
    pub fn decode(&self, bytes: &[u8]) -> Result<String, EncodingError> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| EncodingError::Malformed("UTF-8")),
            Self::Utf16Be => decode_utf16(bytes, u16::from_be_bytes, "UTF-16BE"),
            Self::Utf16Le => decode_utf16(bytes, u16::from_le_bytes, "UTF-16LE"),
            Self::Utf16 => match bytes {
                [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes, "UTF-16"),
                [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes, "UTF-16"),
                _ => decode_utf16(bytes, u16::from_be_bytes, "UTF-16"),
            },
            Self::Latin1 => Ok(bytes.iter().map(|b| char::from(*b)).collect()),
            Self::Ascii => {
                if bytes.is_ascii() {
                    Ok(bytes.iter().map(|b| char::from(*b)).collect())
                } else {
                    Err(EncodingError::Malformed("US-ASCII"))
                }
            }
        }
    }
}

fn decode_utf16(
    bytes: &[u8],
    to_unit: fn([u8; 2]) -> u16,
    name: &'static str,
) -> Result<String, EncodingError> {
    if bytes.len() % 2 != 0 {
        return Err(EncodingError::Malformed(name));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| EncodingError::Malformed(name))
}

/// How a message key is rendered into output unit metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Utf8,
    Hex,
    DoNotAdd,
}

impl FromStr for KeyEncoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "hex" => Ok(Self::Hex),
            "do-not-add" => Ok(Self::DoNotAdd),
            _ => Err(EncodingError::Unsupported(s.to_string())),
        }
    }
}

impl KeyEncoding {
    pub fn encode(&self, key: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => Some(String::from_utf8_lossy(key).into_owned()),
            Self::Hex => Some(hex::encode(key)),
            Self::DoNotAdd => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("UTF-8", HeaderEncoding::Utf8)]
    #[test_case("utf8", HeaderEncoding::Utf8)]
    #[test_case("UTF-16LE", HeaderEncoding::Utf16Le)]
    #[test_case("utf_16be", HeaderEncoding::Utf16Be)]
    #[test_case("ISO-8859-1", HeaderEncoding::Latin1)]
    #[test_case("US-ASCII", HeaderEncoding::Ascii)]
    fn test_parse_header_encoding(name: &str, expected: HeaderEncoding) {
        assert_eq!(name.parse::<HeaderEncoding>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_encoding() {
        assert_eq!(
            "EBCDIC".parse::<HeaderEncoding>(),
            Err(EncodingError::Unsupported("EBCDIC".to_string()))
        );
    }

    #[test_case(HeaderEncoding::Utf8, b"caf\xc3\xa9", "café")]
    #[test_case(HeaderEncoding::Latin1, b"caf\xe9", "café" ; "latin1_cafe")]
    #[test_case(HeaderEncoding::Utf16Be, b"\x00h\x00i", "hi")]
    #[test_case(HeaderEncoding::Utf16Le, b"h\x00i\x00", "hi")]
    #[test_case(HeaderEncoding::Utf16, b"\xff\xfeh\x00i\x00", "hi")]
    #[test_case(HeaderEncoding::Ascii, b"web", "web")]
    fn test_decode(encoding: HeaderEncoding, bytes: &[u8], expected: &str) {
        assert_eq!(encoding.decode(bytes).unwrap(), expected);
    }

    #[test_case(HeaderEncoding::Utf8, b"\xff\xfe")]
    #[test_case(HeaderEncoding::Utf16Be, b"\x00h\x00")]
    #[test_case(HeaderEncoding::Ascii, b"caf\xe9")]
    fn test_decode_malformed(encoding: HeaderEncoding, bytes: &[u8]) {
        assert!(matches!(
            encoding.decode(bytes),
            Err(EncodingError::Malformed(_))
        ));
    }

    #[test]
    fn test_key_encoding() {
        assert_eq!(KeyEncoding::Utf8.encode(b"user-1"), Some("user-1".to_string()));
        assert_eq!(KeyEncoding::Hex.encode(&[0xde, 0xad]), Some("dead".to_string()));
        assert_eq!(KeyEncoding::DoNotAdd.encode(b"user-1"), None);
        assert_eq!("do-not-add".parse::<KeyEncoding>().unwrap(), KeyEncoding::DoNotAdd);
    }
}
