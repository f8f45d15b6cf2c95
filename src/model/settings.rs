use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_PAST_DAYS: u32 = 7;
pub const DEFAULT_FUTURE_DAYS: u32 = 3;
pub const DEFAULT_HISTORY_RETENTION_DAYS: u32 = 21;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftMode {
    /// DST-aware wall-clock shift in the mapped zone.
    #[default]
    Wall,
    /// Wall digits preserved, numeric offset adjusted.
    Offset,
}

impl fmt::Display for ShiftMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wall => write!(f, "wall"),
            Self::Offset => write!(f, "offset"),
        }
    }
}

/// Per playlist-channel override, keyed by the playlist channel id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// EPG-side id to pull; defaults to the playlist id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epg_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset_minutes: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub shift_mode: ShiftMode,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl ChannelMapping {
    pub fn is_noop(&self) -> bool {
        self.source_id.is_none()
            && self.epg_channel_id.is_none()
            && self.offset_minutes == 0
            && self.zone_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scanned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epg_url: Option<String>,
    #[serde(default = "default_true")]
    pub use_playlist_epg: bool,
    #[serde(default = "default_past_days")]
    pub past_days: u32,
    #[serde(default = "default_future_days")]
    pub future_days: u32,
    #[serde(default = "default_true")]
    pub history_backfill: bool,
    #[serde(default = "default_retention_days")]
    pub history_retention_days: u32,
    #[serde(default = "default_true")]
    pub force_zero_offset: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            playlist_url: None,
            epg_url: None,
            use_playlist_epg: true,
            past_days: DEFAULT_PAST_DAYS,
            future_days: DEFAULT_FUTURE_DAYS,
            history_backfill: true,
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
            force_zero_offset: true,
        }
    }
}

/// The whole persisted state: defaults, sources and mappings, written as one
/// JSON document and swapped as one snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    #[serde(default)]
    pub settings: AppSettings,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub mappings: HashMap<String, ChannelMapping>,
}

impl SettingsDocument {
    pub fn source_by_id(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }
}

const fn default_true() -> bool {
    true
}

const fn default_past_days() -> u32 {
    DEFAULT_PAST_DAYS
}

const fn default_future_days() -> u32 {
    DEFAULT_FUTURE_DAYS
}

const fn default_retention_days() -> u32 {
    DEFAULT_HISTORY_RETENTION_DAYS
}

#[cfg(test)]
mod tests {
    use super::{ChannelMapping, SettingsDocument, ShiftMode};

    #[test]
    fn test_mapping_defaults() {
        let mapping: ChannelMapping = serde_json::from_str("{}").unwrap();
        assert_eq!(mapping.shift_mode, ShiftMode::Wall);
        assert_eq!(mapping.offset_minutes, 0);
        assert!(mapping.is_noop());
    }

    #[test]
    fn test_document_roundtrip() {
        let json = r#"{
            "settings": {"playlistUrl": "http://example.com/list.m3u", "pastDays": 2},
            "sources": [{"id": "a1", "url": "http://example.com/epg.xml", "priority": 1}],
            "mappings": {"BBC1": {"epgChannelId": "bbc1", "offsetMinutes": -30, "shiftMode": "offset"}}
        }"#;
        let doc: SettingsDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.settings.past_days, 2);
        assert_eq!(doc.settings.future_days, super::DEFAULT_FUTURE_DAYS);
        assert!(doc.sources[0].enabled);
        let mapping = &doc.mappings["BBC1"];
        assert_eq!(mapping.offset_minutes, -30);
        assert_eq!(mapping.shift_mode, ShiftMode::Offset);
        assert!(doc.source_by_id("a1").is_some());
        assert!(doc.source_by_id("nope").is_none());
    }
}
