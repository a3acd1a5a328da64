//! Wire codec
//!
//! One JSON object per socket read/write, no length prefix and no
//! delimiter. Text encoding is fixed per deployment.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use crate::error::{ConfigError, DecodeError};
use crate::message::Message;

/// Supported text encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
}

impl TextEncoding {
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Ascii => "ascii",
            TextEncoding::Latin1 => "latin-1",
        }
    }

    fn can_represent(self, c: char) -> bool {
        match self {
            TextEncoding::Utf8 => true,
            TextEncoding::Ascii => c.is_ascii(),
            TextEncoding::Latin1 => (c as u32) <= 0xFF,
        }
    }

    fn decode(self, bytes: &[u8]) -> Result<Cow<'_, str>, DecodeError> {
        let invalid = || DecodeError::Encoding {
            encoding: self.name(),
        };
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(Cow::Borrowed)
                .map_err(|_| invalid()),
            TextEncoding::Ascii if bytes.is_ascii() => std::str::from_utf8(bytes)
                .map(Cow::Borrowed)
                .map_err(|_| invalid()),
            TextEncoding::Ascii => Err(invalid()),
            TextEncoding::Latin1 => Ok(Cow::Owned(bytes.iter().map(|&b| b as char).collect())),
        }
    }

    /// Encode JSON text; characters outside the repertoire become `\uXXXX` escapes
    ///
    /// Such characters can only occur inside JSON strings, so the escaped
    /// form is equivalent JSON.
    fn encode(self, json: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => json.as_bytes().to_vec(),
            TextEncoding::Ascii | TextEncoding::Latin1 => {
                let mut out = String::with_capacity(json.len());
                for c in json.chars() {
                    if self.can_represent(c) {
                        out.push(c);
                    } else {
                        let mut units = [0u16; 2];
                        for unit in c.encode_utf16(&mut units) {
                            let _ = write!(out, "\\u{:04x}", unit);
                        }
                    }
                }
                // Every remaining char is <= 0xFF
                out.chars().map(|c| c as u8).collect()
            }
        }
    }
}

impl FromStr for TextEncoding {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized: String = name
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "utf8" => Ok(TextEncoding::Utf8),
            "ascii" | "usascii" => Ok(TextEncoding::Ascii),
            "latin1" | "iso88591" => Ok(TextEncoding::Latin1),
            _ => Err(ConfigError::UnsupportedEncoding(name.to_string())),
        }
    }
}

/// Message codec bound to one encoding and input limit
#[derive(Debug, Clone)]
pub struct Codec {
    encoding: TextEncoding,
    input_limit: usize,
}

impl Codec {
    pub fn new(encoding: TextEncoding, input_limit: usize) -> Self {
        Self {
            encoding,
            input_limit,
        }
    }

    /// Maximum accepted size of a single payload in bytes
    pub fn input_limit(&self) -> usize {
        self.input_limit
    }

    /// Decode a payload into an unvalidated JSON object
    pub fn decode_value(&self, bytes: &[u8]) -> Result<Value, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() > self.input_limit {
            return Err(DecodeError::Oversized {
                limit: self.input_limit,
            });
        }

        let text = self.encoding.decode(bytes)?;
        match serde_json::from_str::<Value>(&text)? {
            value @ Value::Object(_) => Ok(value),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    /// Decode a payload straight into a typed message, skipping validation
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, DecodeError> {
        let value = self.decode_value(bytes)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Encode a message or response
    ///
    /// Only fails if `item`'s `Serialize` impl does, which the protocol
    /// types never do.
    pub fn encode<T: Serialize>(&self, item: &T) -> Result<Vec<u8>, serde_json::Error> {
        let json = serde_json::to_string(item)?;
        Ok(self.encoding.encode(&json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, Presence, Response, User};

    fn codec() -> Codec {
        Codec::new(TextEncoding::Utf8, 1024)
    }

    fn chat(text: &str) -> Message {
        Message::Chat(ChatMessage {
            time: Some(1_700_000_000.25),
            to: "bob".to_string(),
            from: "alice".to_string(),
            encoding: Some("utf-8".to_string()),
            message: text.to_string(),
        })
    }

    #[test]
    fn test_roundtrip() {
        let codec = codec();
        let messages = [
            chat("hello"),
            Message::Presence(Presence::status(User {
                account_name: "alice".to_string(),
                status: Some("hi".to_string()),
            })),
            Message::Probe { time: None },
            Message::Quit { time: Some(5.0) },
        ];
        for msg in messages {
            let bytes = codec.encode(&msg).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("UTF-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("utf8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("ISO-8859-1".parse::<TextEncoding>().unwrap(), TextEncoding::Latin1);
        assert_eq!("us-ascii".parse::<TextEncoding>().unwrap(), TextEncoding::Ascii);
        assert!(matches!(
            "koi8-r".parse::<TextEncoding>(),
            Err(ConfigError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn test_unrepresentable_chars_are_escaped() {
        for encoding in [TextEncoding::Ascii, TextEncoding::Latin1] {
            let codec = Codec::new(encoding, 1024);
            let msg = chat("привет 😀 café");
            let bytes = codec.encode(&msg).unwrap();
            assert!(bytes.iter().all(|b| encoding != TextEncoding::Ascii || b.is_ascii()));
            assert_eq!(codec.decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_latin1_keeps_high_bytes() {
        let codec = Codec::new(TextEncoding::Latin1, 1024);
        let bytes = codec.encode(&chat("café")).unwrap();
        assert!(bytes.contains(&0xE9));
    }

    #[test]
    fn test_ascii_rejects_high_bytes() {
        let codec = Codec::new(TextEncoding::Ascii, 1024);
        let err = codec
            .decode_value("{\"message\":\"café\"}".as_bytes())
            .unwrap_err();
        assert!(matches!(err, DecodeError::Encoding { encoding: "ascii" }));
    }

    #[test]
    fn test_invalid_utf8() {
        let err = codec().decode_value(&[b'{', 0xFF, b'}']).unwrap_err();
        assert!(matches!(err, DecodeError::Encoding { .. }));
    }

    #[test]
    fn test_malformed_and_truncated() {
        assert!(matches!(
            codec().decode_value(b"{not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            codec().decode_value(br#"{"action":"msg","to":"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_two_objects_in_one_read_is_malformed() {
        assert!(matches!(
            codec().decode_value(br#"{"action":"probe"}{"action":"probe"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(
            codec().decode_value(b"[1, 2]"),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn test_empty_and_oversized() {
        let codec = Codec::new(TextEncoding::Utf8, 8);
        assert!(matches!(codec.decode_value(b""), Err(DecodeError::Empty)));
        assert!(matches!(
            codec.decode_value(br#"{"a":"bcdefgh"}"#),
            Err(DecodeError::Oversized { limit: 8 })
        ));
    }

    #[test]
    fn test_encode_response() {
        let bytes = codec().encode(&Response::ok(Some("Welcome"))).unwrap();
        assert_eq!(bytes, br#"{"response":200,"alert":"Welcome"}"#);
    }
}
