use serde::Serialize;

use crate::model::{ChannelMapping, ShiftMode, TimeWindow};
use crate::utils::hash_string_as_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintKind {
    Epg,
    ExportGz,
    ExportXml,
    Channel,
}

/// Mirror state that can change an output: validators plus size/mtime of the
/// current file, and the recent snapshot names so history rotation
/// invalidates backfilled results.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSignature {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub size: u64,
    pub mtime_ms: i64,
    pub snapshots: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSignature {
    pub channel_id: String,
    pub source_id: Option<String>,
    pub epg_channel_id: Option<String>,
    pub offset_minutes: i32,
    pub zone_id: Option<String>,
    pub shift_mode: ShiftMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSignature {
    pub full: bool,
    pub from_ms: i64,
    pub to_ms: i64,
}

impl From<&TimeWindow> for WindowSignature {
    fn from(window: &TimeWindow) -> Self {
        match window.bounds() {
            None => Self { full: true, from_ms: 0, to_ms: 0 },
            Some((from_ms, to_ms)) => Self { full: false, from_ms, to_ms },
        }
    }
}

/// Canonical record of everything that can affect a cached artifact.
/// All vectors are sorted before hashing; serialization order is the struct
/// declaration order, so equal inputs always produce equal keys.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintKey {
    pub kind: FingerprintKind,
    pub mirrors: Vec<MirrorSignature>,
    pub playlist_ids: Vec<String>,
    pub mappings: Vec<MappingSignature>,
    pub window: WindowSignature,
}

impl FingerprintKey {
    pub fn new(
        kind: FingerprintKind,
        mut mirrors: Vec<MirrorSignature>,
        mut playlist_ids: Vec<String>,
        mappings: &[(String, ChannelMapping)],
        window: &TimeWindow,
    ) -> Self {
        mirrors.sort_by(|a, b| a.url.cmp(&b.url));
        playlist_ids.sort();
        let mut mapping_sigs: Vec<MappingSignature> = mappings
            .iter()
            .filter(|(_, m)| !m.is_noop())
            .map(|(channel_id, m)| MappingSignature {
                channel_id: channel_id.clone(),
                source_id: m.source_id.clone(),
                epg_channel_id: m.epg_channel_id.clone(),
                offset_minutes: m.offset_minutes,
                zone_id: m.zone_id.clone(),
                shift_mode: m.shift_mode,
            })
            .collect();
        mapping_sigs.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        Self {
            kind,
            mirrors,
            playlist_ids,
            mappings: mapping_sigs,
            window: WindowSignature::from(window),
        }
    }

    /// Content-addressed cache key.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        hash_string_as_hex(&canonical)
    }

    pub fn with_kind(&self, kind: FingerprintKind) -> Self {
        let mut clone = self.clone();
        clone.kind = kind;
        clone
    }
}
