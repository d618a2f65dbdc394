use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use seedkeeper_engine::{AddSource, MagnetLink, Metainfo};

use crate::error::TransferError;

/// What a caller submitted: literal descriptor-file bytes or a magnet URI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContentDescriptor {
    DirectFile(#[serde(with = "b64")] Vec<u8>),
    PeerDiscovery(String),
}

impl ContentDescriptor {
    pub fn direct(bytes: impl Into<Vec<u8>>) -> Self {
        ContentDescriptor::DirectFile(bytes.into())
    }

    /// Accept a magnet URI after checking it names a content hash.
    pub fn magnet(uri: &str) -> Result<Self, TransferError> {
        MagnetLink::parse(uri.trim())?;
        Ok(ContentDescriptor::PeerDiscovery(uri.trim().to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContentDescriptor::DirectFile(_) => "direct_file",
            ContentDescriptor::PeerDiscovery(_) => "peer_discovery",
        }
    }

    /// Stable identity of the content, available before metadata is resolved.
    pub fn digest(&self) -> Result<String, TransferError> {
        match self {
            ContentDescriptor::DirectFile(bytes) => Ok(Metainfo::from_bytes(bytes)?.info_hash),
            ContentDescriptor::PeerDiscovery(uri) => Ok(MagnetLink::parse(uri)?.info_hash),
        }
    }

    /// Name hint carried by the descriptor itself, if any.
    pub fn display_hint(&self) -> Option<String> {
        match self {
            ContentDescriptor::DirectFile(bytes) => Metainfo::from_bytes(bytes).ok().map(|m| m.name),
            ContentDescriptor::PeerDiscovery(uri) => {
                MagnetLink::parse(uri).ok().and_then(|m| m.display_name)
            }
        }
    }

    pub(crate) fn add_source(&self) -> AddSource {
        match self {
            ContentDescriptor::DirectFile(bytes) => AddSource::Metainfo(bytes.clone()),
            ContentDescriptor::PeerDiscovery(uri) => AddSource::Magnet(uri.clone()),
        }
    }
}

mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        B64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
