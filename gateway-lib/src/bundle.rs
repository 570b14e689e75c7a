//! Bundle unpacking seam.
//!
//! A transaction tagged `Bundle-Type` is a compressed container of further
//! transactions. The container format itself is external; the engine only
//! needs the unpacked items, attributed to the containing block's height.

use serde::Deserialize;

use crate::node_client::ChainTag;

/// Marker tag naming the bundle format of a container transaction.
pub const BUNDLE_TYPE_TAG: &str = "Bundle-Type";

/// One transaction unpacked from a bundle payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleItem {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub tags: Vec<ChainTag>,
}

pub trait BundleCodec: Send + Sync {
    /// Unpacks a raw bundle payload into its member transactions.
    fn unpack(&self, payload: &[u8]) -> anyhow::Result<Vec<BundleItem>>;
}

/// Codec for bundles carrying a JSON `{"items": [...]}` payload.
#[derive(Debug, Default)]
pub struct JsonBundleCodec;

#[derive(Debug, Deserialize)]
struct JsonBundle {
    items: Vec<BundleItem>,
}

impl BundleCodec for JsonBundleCodec {
    fn unpack(&self, payload: &[u8]) -> anyhow::Result<Vec<BundleItem>> {
        let bundle: JsonBundle = serde_json::from_slice(payload)?;
        Ok(bundle.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_item_list() {
        let payload = br#"{"items":[{"id":"b1","owner":"o1","tags":[{"name":"n","value":"v"}]},{"id":"b2"}]}"#;
        let items = JsonBundleCodec.unpack(payload).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "b1");
        assert_eq!(items[0].tags[0].name, "n");
        assert!(items[1].owner.is_empty());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(JsonBundleCodec.unpack(b"not json").is_err());
    }
}
