//! Application envelope carried inside a transport message's payload.

use crate::errors::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed, optionally signed application envelope.
///
/// Serialized as UTF-8 JSON with fields `type`, `payload`, `timestamp`,
/// `signature`, `signer`; absent optionals are omitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing key for handler lookup
    #[serde(rename = "type")]
    pub message_type: String,
    /// Application payload
    pub payload: Value,
    /// Sender clock, milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// `0x` hex of the 65-byte recoverable signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// `0x` hex address of the claimed signer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

impl Envelope {
    /// Unsigned envelope without a timestamp.
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            timestamp: None,
            signature: None,
            signer: None,
        }
    }

    /// The bytes a signature covers: this envelope's JSON with `signature` cleared.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let unsigned = Envelope {
            signature: None,
            ..self.clone()
        };
        serde_json::to_vec(&unsigned).map_err(CodecError::Serialize)
    }

    /// Whether both `signature` and `signer` are present.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some() && self.signer.is_some()
    }
}

/// Serde helper for map-valued payload fields.
///
/// Encodes `HashMap<K, V>` as `{"dataType":"Map","entries":[[k,v],...]}`
/// so keys of any serializable type survive the JSON round trip.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Roster {
///     #[serde(with = "courier_dispatch::domain::map_entries")]
///     members: HashMap<u32, String>,
/// }
/// ```
pub mod map_entries {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::hash::Hash;

    const MAP_TAG: &str = "Map";

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct TaggedRef<'a, K, V> {
        data_type: &'static str,
        entries: Vec<(&'a K, &'a V)>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Tagged<K, V> {
        data_type: String,
        entries: Vec<(K, V)>,
    }

    /// Serialize a map as tagged entries.
    pub fn serialize<S, K, V>(map: &HashMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        TaggedRef {
            data_type: MAP_TAG,
            entries: map.iter().collect(),
        }
        .serialize(serializer)
    }

    /// Restore a map from tagged entries.
    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<HashMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Eq + Hash,
        V: Deserialize<'de>,
    {
        let tagged = Tagged::<K, V>::deserialize(deserializer)?;
        if tagged.data_type != MAP_TAG {
            return Err(D::Error::custom(format!(
                "expected dataType \"{MAP_TAG}\", found \"{}\"",
                tagged.data_type
            )));
        }
        Ok(tagged.entries.into_iter().collect())
    }
}
