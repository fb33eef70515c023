//! Pluggable payload codec.
//!
//! Grounded on `original_source/src/easymesh/codec.py`'s `Codec[T]`
//! abstraction. The original defaults to pickle, which can carry arbitrary
//! executable types; this port instead defaults to a self-describing,
//! language-neutral format (JSON) and offers an opt-in same-binary-pair
//! fast path (bincode) for deployments where every node is a known build —
//! the same trade-off `codec.py`'s `MsgpackCodec` draws against
//! `PickleCodec`, without reintroducing an executable-carrying format.

use serde::{de::DeserializeOwned, Serialize};
use serde::{Deserialize, Serializer};

use crate::mesh::error::{Error, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PayloadCodecKind {
    Json,
    #[cfg(feature = "payload_codec_bincode")]
    Bincode,
}

impl Serialize for PayloadCodecKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = match self {
            PayloadCodecKind::Json => "json",
            #[cfg(feature = "payload_codec_bincode")]
            PayloadCodecKind::Bincode => "bincode",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for PayloadCodecKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "json" => Ok(PayloadCodecKind::Json),
            #[cfg(feature = "payload_codec_bincode")]
            "bincode" => Ok(PayloadCodecKind::Bincode),
            other => Err(serde::de::Error::custom(format!(
                "unknown payload codec {:?}",
                other
            ))),
        }
    }
}

/// Encodes/decodes arbitrary `serde`-compatible values to/from opaque bytes.
pub trait PayloadCodec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Codec, "json encode failed", e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Codec, "json decode failed", e))
    }
}

#[cfg(feature = "payload_codec_bincode")]
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

#[cfg(feature = "payload_codec_bincode")]
impl PayloadCodec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Codec, "bincode encode failed", e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Codec, "bincode decode failed", e))
    }
}

/// Dynamic dispatch wrapper selected by `PayloadCodecKind`, for code (e.g.
/// `NodeBuilder`) that only knows the codec choice at runtime.
#[derive(Clone, Copy, Debug)]
pub enum DynPayloadCodec {
    Json(JsonCodec),
    #[cfg(feature = "payload_codec_bincode")]
    Bincode(BincodeCodec),
}

impl DynPayloadCodec {
    pub fn from_kind(kind: PayloadCodecKind) -> Self {
        match kind {
            PayloadCodecKind::Json => DynPayloadCodec::Json(JsonCodec),
            #[cfg(feature = "payload_codec_bincode")]
            PayloadCodecKind::Bincode => DynPayloadCodec::Bincode(BincodeCodec),
        }
    }
}

impl PayloadCodec for DynPayloadCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            DynPayloadCodec::Json(c) => c.encode(value),
            #[cfg(feature = "payload_codec_bincode")]
            DynPayloadCodec::Bincode(c) => c.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            DynPayloadCodec::Json(c) => c.decode(bytes),
            #[cfg(feature = "payload_codec_bincode")]
            DynPayloadCodec::Bincode(c) => c.decode(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize as SerdeDeserialize};

    #[derive(Serialize, SerdeDeserialize, Debug, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn json_round_trip() {
        let codec = JsonCodec;
        let value = Sample { a: 1, b: "hi".into() };
        let bytes = codec.encode(&value).unwrap();
        let decoded: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
