//! Byte codecs for keys and values.
//!
//! Each table is handed its codecs at construction; nothing in the pipeline
//! reaches for a global default.

use std::marker::PhantomData;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CodecError, ConfigError};

pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        Ok(std::str::from_utf8(bytes)?.to_string())
    }
}

#[derive(Debug)]
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 8-byte big-endian signed integer, the layout Kafka's long serializer writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongCodec;

impl Codec<i64> for LongCodec {
    fn encode(&self, value: &i64) -> Result<Vec<u8>, CodecError> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<i64, CodecError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| CodecError::LongWidth {
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(i64::from_be_bytes(raw))
    }
}

/// Integer rendered as ASCII decimal, for consumers that read the sink as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalCodec;

impl Codec<i64> for DecimalCodec {
    fn encode(&self, value: &i64) -> Result<Vec<u8>, CodecError> {
        Ok(value.to_string().into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<i64, CodecError> {
        Ok(std::str::from_utf8(bytes)?.trim().parse()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFormat {
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountFormat {
    Long,
    Decimal,
}

impl FromStr for KeyFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" => Ok(KeyFormat::String),
            _ => Err(ConfigError::UnknownFormat {
                option: "KEY_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for ProfileFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ProfileFormat::Json),
            _ => Err(ConfigError::UnknownFormat {
                option: "PROFILE_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for CountFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(CountFormat::Long),
            "decimal" => Ok(CountFormat::Decimal),
            _ => Err(ConfigError::UnknownFormat {
                option: "COUNT_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

impl KeyFormat {
    pub fn codec(self) -> Box<dyn Codec<String>> {
        match self {
            KeyFormat::String => Box::new(StringCodec),
        }
    }
}

impl ProfileFormat {
    pub fn codec<T>(self) -> Box<dyn Codec<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        match self {
            ProfileFormat::Json => Box::new(JsonCodec::<T>::new()),
        }
    }
}

impl CountFormat {
    pub fn codec(self) -> Box<dyn Codec<i64>> {
        match self {
            CountFormat::Long => Box::new(LongCodec),
            CountFormat::Decimal => Box::new(DecimalCodec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_long_codec_matches_kafka_layout() {
        let bytes = LongCodec.encode(&10_000_001).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0x00, 0x98, 0x96, 0x81]);
        assert_eq!(LongCodec.decode(&bytes).unwrap(), 10_000_001);
    }

    #[test]
    fn test_long_codec_rejects_short_payload() {
        let err = LongCodec.decode(&[0, 1, 2]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::LongWidth {
                expected: 8,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        assert!(StringCodec.decode(&[0xff, 0xfe]).is_err());
        assert_eq!(StringCodec.decode(b"user-1").unwrap(), "user-1");
    }

    #[test]
    fn test_decimal_codec_tolerates_whitespace() {
        assert_eq!(DecimalCodec.decode(b" 42\n").unwrap(), 42);
        assert_eq!(DecimalCodec.encode(&-7).unwrap(), b"-7".to_vec());
    }

    #[test_case("long", Ok(CountFormat::Long); "long")]
    #[test_case("Decimal", Ok(CountFormat::Decimal); "decimal mixed case")]
    #[test_case("avro", Err(ConfigError::UnknownFormat { option: "COUNT_FORMAT", value: "avro".to_string() }); "unknown")]
    fn test_count_format_parsing(input: &str, expected: Result<CountFormat, ConfigError>) {
        assert_eq!(input.parse::<CountFormat>(), expected);
    }
}
