//! Client encodings the transport knows how to decode.

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
    SqlAscii,
    /// Any other server encoding. Decoded as lossy UTF-8, the name is kept for display.
    Other(String),
}

impl Encoding {
    /// Map a server-side encoding name (as reported by `client_encoding`).
    pub fn for_database_name(name: &str) -> Encoding {
        match name.to_ascii_uppercase().as_str() {
            "UTF8" | "UTF-8" | "UNICODE" => Encoding::Utf8,
            "LATIN1" | "ISO_8859_1" | "ISO-8859-1" | "ISO88591" => Encoding::Latin1,
            "SQL_ASCII" => Encoding::SqlAscii,
            _ => Encoding::Other(name.to_string()),
        }
    }

    pub fn is_utf8(&self) -> bool {
        matches!(self, Encoding::Utf8)
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::SqlAscii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect(),
            Encoding::Utf8 | Encoding::Other(_) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn encode(&self, value: &str) -> Vec<u8> {
        match self {
            Encoding::Latin1 => value
                .chars()
                .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
                .collect(),
            Encoding::SqlAscii => value
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Encoding::Utf8 | Encoding::Other(_) => value.as_bytes().to_vec(),
        }
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Utf8 => write!(f, "UTF8"),
            Encoding::Latin1 => write!(f, "LATIN1"),
            Encoding::SqlAscii => write!(f, "SQL_ASCII"),
            Encoding::Other(name) => write!(f, "{name}"),
        }
    }
}
