use serde::{Deserialize, Serialize};

/// One entry of the IPTV playlist. Consumed as input, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistChannel {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    pub stream_url: String,
}

/// Parsed playlist: channels in document order plus the EPG hint from the
/// `#EXTM3U` header (`url-tvg` and variants), when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistParseResult {
    pub channels: Vec<PlaylistChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_url: Option<String>,
}
