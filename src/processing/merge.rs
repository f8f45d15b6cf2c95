use std::collections::{HashMap, HashSet};

use crate::model::{normalize_channel_id, PlaylistChannel, SettingsDocument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedIds {
    All,
    Ids(HashSet<String>),
}

impl AllowedIds {
    pub fn as_set(&self) -> Option<HashSet<String>> {
        match self {
            Self::All => None,
            Self::Ids(ids) => Some(ids.clone()),
        }
    }
}

/// All channels pulled from one source URL: which EPG-side ids to accept and
/// how their ids translate back to playlist ids.
#[derive(Debug, Clone)]
pub struct MergeGroup {
    pub source_url: String,
    pub allowed: AllowedIds,
    /// normalized EPG id -> playlist id
    pub id_map: HashMap<String, String>,
}

impl MergeGroup {
    fn new(source_url: String, allowed: AllowedIds) -> Self {
        Self { source_url, allowed, id_map: HashMap::new() }
    }

    /// Playlist id for a raw EPG channel id. Groups with `AllowedIds::All`
    /// carry no remapping, the EPG id doubles as the playlist id.
    pub fn playlist_id_for(&self, epg_channel_id: &str) -> Option<String> {
        if self.id_map.is_empty() {
            return matches!(self.allowed, AllowedIds::All).then(|| epg_channel_id.trim().to_string());
        }
        self.id_map.get(&normalize_channel_id(epg_channel_id)).cloned()
    }
}

/// Groups the playlist channel set by source URL, driven by the mappings.
///
/// A channel mapped to an enabled source joins that source's group under its
/// mapped EPG id; unmapped channels fall back to the default EPG URL when
/// one is set; everything else stays header-only. An empty playlist yields
/// one accept-all group per distinct configured URL.
pub fn plan_merge(
    playlist: &[PlaylistChannel],
    document: &SettingsDocument,
    default_epg_url: Option<&str>,
) -> Vec<MergeGroup> {
    let mut groups: Vec<MergeGroup> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();

    if playlist.is_empty() {
        let mut urls: Vec<&str> = Vec::new();
        if let Some(url) = default_epg_url {
            urls.push(url);
        }
        for source in document.sources.iter().filter(|s| s.enabled) {
            urls.push(source.url.as_str());
        }
        for url in urls {
            if !group_index.contains_key(url) {
                group_index.insert(url.to_string(), groups.len());
                groups.push(MergeGroup::new(url.to_string(), AllowedIds::All));
            }
        }
        return groups;
    }

    fn entry(groups: &mut Vec<MergeGroup>, group_index: &mut HashMap<String, usize>, url: &str) -> usize {
        if let Some(index) = group_index.get(url) {
            return *index;
        }
        group_index.insert(url.to_string(), groups.len());
        groups.push(MergeGroup::new(url.to_string(), AllowedIds::Ids(HashSet::new())));
        groups.len() - 1
    }

    for channel in playlist {
        let mapping = document.mappings.get(&channel.id);
        let mapped_source = mapping
            .and_then(|m| m.source_id.as_deref())
            .and_then(|source_id| document.source_by_id(source_id))
            .filter(|source| source.enabled);

        let (url, epg_id) = match mapped_source {
            Some(source) => {
                let epg_id = mapping
                    .and_then(|m| m.epg_channel_id.as_deref())
                    .unwrap_or(channel.id.as_str());
                (source.url.as_str(), epg_id)
            }
            None => match default_epg_url {
                Some(url) => {
                    let epg_id = mapping
                        .and_then(|m| m.epg_channel_id.as_deref())
                        .unwrap_or(channel.id.as_str());
                    (url, epg_id)
                }
                // no EPG coverage, channel header only
                None => continue,
            },
        };

        let index = entry(&mut groups, &mut group_index, url);
        let group = &mut groups[index];
        let normalized = normalize_channel_id(epg_id);
        if let AllowedIds::Ids(ids) = &mut group.allowed {
            ids.insert(normalized.clone());
        }
        group.id_map.insert(normalized, channel.id.clone());
    }

    groups
}
