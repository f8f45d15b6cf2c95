use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::HashSet;

use crate::error::{create_epg_error, EpgError, EpgErrorKind};
use crate::model::{
    AssembledEpg, ChannelMapping, ChannelSchedule, EpgChannel, FingerprintKey, FingerprintKind,
    MirrorSignature, PlaylistChannel, Programme, SettingsDocument, TimeWindow,
};
use crate::processing::{plan_merge, parse_xmltv_file, MergeGroup, ParseOptions, XmltvEvent};
use crate::repository::{ArtifactCache, MirrorFile, MirrorStore};
use crate::utils::now_millis;
use crate::utils::request::sanitize_sensitive_info;

/// Drives the pipeline for one request: mirror fetches per merge group,
/// concurrent streaming parse, id translation, offset pre-apply, history
/// backfill and the schedule cache.
pub struct EpgAssembler<'a> {
    pub client: &'a reqwest::Client,
    pub mirror: &'a MirrorStore,
    pub schedule_cache: &'a ArtifactCache,
}

pub struct AssembleOutcome {
    pub epg: AssembledEpg,
    /// Post-fetch fingerprint with kind `epg`; export kinds derive from it.
    pub fingerprint: FingerprintKey,
}

#[derive(Default)]
struct ChannelBuilder {
    display_name: Option<String>,
    icon_url: Option<String>,
    programmes: Vec<Programme>,
    seen_starts: HashSet<String>,
}

struct GroupParse {
    channels: Vec<EpgChannel>,
    programmes: Vec<Programme>,
}

impl EpgAssembler<'_> {
    pub async fn assemble(
        &self,
        document: &SettingsDocument,
        playlist: &[PlaylistChannel],
        default_epg_url: Option<&str>,
        window: &TimeWindow,
    ) -> Result<AssembleOutcome, EpgError> {
        let groups = plan_merge(playlist, document, default_epg_url);
        let retention_days = document.settings.history_retention_days;

        // fan out one mirror fetch per group; a failed group degrades to
        // nothing instead of aborting the assembly
        let fetches = join_all(groups.iter().map(|group| async {
            match self.mirror.fetch(self.client, &group.source_url, retention_days).await {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!("EPG source skipped {}: {err}", sanitize_sensitive_info(&group.source_url));
                    None
                }
            }
        }))
        .await;

        // partial failure degrades, total failure without any mirror surfaces
        if !groups.is_empty() && fetches.iter().all(Option::is_none) {
            return Err(create_epg_error!(EpgErrorKind::Upstream, "No EPG source reachable and no mirror on disk"));
        }

        let fingerprint = self
            .fingerprint_for(FingerprintKind::Epg, document, playlist, &groups, window)
            .await;

        let cache_key = fingerprint.hash();
        if let Some(epg) = self.schedule_cache.get::<AssembledEpg>(&cache_key).await {
            debug!("Schedule cache hit {cache_key}");
            return Ok(AssembleOutcome { epg, fingerprint });
        }

        let parses = join_all(groups.iter().zip(fetches.iter()).map(|(group, file)| async {
            match file {
                Some(file) => self.parse_group(group, file, window).await,
                None => None,
            }
        }))
        .await;

        let mut builders: IndexMap<String, ChannelBuilder> = IndexMap::new();
        for channel in playlist {
            builders.insert(
                channel.id.clone(),
                ChannelBuilder {
                    display_name: channel.name.clone(),
                    icon_url: channel.logo_url.clone(),
                    ..Default::default()
                },
            );
        }
        let discover_channels = playlist.is_empty();

        for (group, parse) in groups.iter().zip(parses.into_iter()) {
            let Some(parse) = parse else { continue };
            merge_group(&mut builders, group, parse, document, discover_channels);
        }

        if document.settings.history_backfill {
            self.backfill(&mut builders, &groups, document, window).await;
        }

        for builder in builders.values_mut() {
            builder.programmes.sort_by_key(|p| p.start_utc);
        }

        let epg = AssembledEpg {
            channels: builders
                .into_iter()
                .map(|(id, builder)| ChannelSchedule {
                    id,
                    display_name: builder.display_name,
                    icon_url: builder.icon_url,
                    programmes: builder.programmes,
                })
                .collect(),
        };

        self.schedule_cache.set(&cache_key, &epg, crate::repository::DEFAULT_CACHE_TTL).await;
        Ok(AssembleOutcome { epg, fingerprint })
    }

    /// Canonical fingerprint over the post-fetch mirror state, the playlist
    /// id set, the relevant mappings and the window.
    pub async fn fingerprint_for(
        &self,
        kind: FingerprintKind,
        document: &SettingsDocument,
        playlist: &[PlaylistChannel],
        groups: &[MergeGroup],
        window: &TimeWindow,
    ) -> FingerprintKey {
        let mut signatures: Vec<MirrorSignature> = Vec::with_capacity(groups.len());
        for group in groups {
            signatures.push(self.mirror.signature(&group.source_url).await);
        }
        let playlist_ids: Vec<String> = playlist.iter().map(|c| c.id.clone()).collect();
        let mappings: Vec<(String, ChannelMapping)> = playlist
            .iter()
            .filter_map(|c| document.mappings.get(&c.id).map(|m| (c.id.clone(), m.clone())))
            .collect();
        FingerprintKey::new(kind, signatures, playlist_ids, &mappings, window)
    }

    async fn parse_group(&self, group: &MergeGroup, file: &MirrorFile, window: &TimeWindow) -> Option<GroupParse> {
        let options = ParseOptions {
            allowed_ids: group.allowed.as_set(),
            window: *window,
            limit_programmes: None,
        };
        let mut channels = Vec::new();
        let mut programmes = Vec::new();
        let mut callback = |event: XmltvEvent| match event {
            XmltvEvent::Channel(c) => channels.push(c),
            XmltvEvent::Programme(p) => programmes.push(p),
        };
        debug!("Parsing mirror {} (gzip: {})", file.path.display(), file.is_gz);
        match parse_xmltv_file(&file.path, &options, &mut callback).await {
            Ok(()) => Some(GroupParse { channels, programmes }),
            Err(err) => {
                warn!("EPG parse failed for {}: {err}", sanitize_sensitive_info(&file.url));
                None
            }
        }
    }

    /// Reconstructs past days from rotated snapshots. Snapshots are walked
    /// newest-first per group and stop contributing once a snapshot adds
    /// nothing new or the past window is covered.
    async fn backfill(
        &self,
        builders: &mut IndexMap<String, ChannelBuilder>,
        groups: &[MergeGroup],
        document: &SettingsDocument,
        window: &TimeWindow,
    ) {
        let now = now_millis();
        let backfill_window = match window.bounds() {
            Some((from_ms, _)) if from_ms >= now => return,
            Some((from_ms, to_ms)) => TimeWindow::Range { from_ms, to_ms: to_ms.min(now) },
            None => TimeWindow::Range { from_ms: i64::MIN, to_ms: now },
        };
        let window_from = backfill_window.bounds().map(|(from, _)| from).unwrap_or(i64::MIN);

        for group in groups {
            let snapshots = self.mirror.list_snapshots(&group.source_url).await;
            if snapshots.is_empty() {
                continue;
            }

            let group_channel_ids: HashSet<String> = if group.id_map.is_empty() {
                builders.keys().cloned().collect()
            } else {
                group.id_map.values().cloned().collect()
            };
            let mut earliest = builders
                .iter()
                .filter(|(id, _)| group_channel_ids.contains(*id))
                .flat_map(|(_, b)| b.programmes.iter().map(|p| p.start_utc))
                .min()
                .unwrap_or(i64::MAX);

            for snapshot in snapshots {
                if earliest <= window_from {
                    break;
                }
                let options = ParseOptions {
                    allowed_ids: group.allowed.as_set(),
                    window: backfill_window,
                    limit_programmes: None,
                };
                let mut programmes = Vec::new();
                let mut callback = |event: XmltvEvent| {
                    if let XmltvEvent::Programme(p) = event {
                        programmes.push(p);
                    }
                };
                if let Err(err) = parse_xmltv_file(&snapshot.path, &options, &mut callback).await {
                    warn!("Snapshot parse failed {}: {err}", snapshot.path.display());
                    continue;
                }

                let mut added = 0usize;
                for programme in programmes {
                    let Some(playlist_id) = group.playlist_id_for(&programme.channel_id) else {
                        continue;
                    };
                    let Some(builder) = builders.get_mut(&playlist_id) else {
                        continue;
                    };
                    if builder.seen_starts.contains(&programme.start_raw) {
                        continue;
                    }
                    let programme = finalize_programme(programme, playlist_id, document);
                    earliest = earliest.min(programme.start_utc);
                    builder.seen_starts.insert(programme.start_raw.clone());
                    builder.programmes.push(programme);
                    added += 1;
                }

                debug!("Backfill snapshot {} added {added}", snapshot.timestamp);
                if added == 0 {
                    break;
                }
            }
        }
    }
}

fn merge_group(
    builders: &mut IndexMap<String, ChannelBuilder>,
    group: &MergeGroup,
    parse: GroupParse,
    document: &SettingsDocument,
    discover_channels: bool,
) {
    for channel in parse.channels {
        let Some(playlist_id) = group.playlist_id_for(&channel.id) else {
            continue;
        };
        let builder = if discover_channels {
            builders.entry(playlist_id).or_default()
        } else {
            match builders.get_mut(&playlist_id) {
                Some(builder) => builder,
                None => continue,
            }
        };
        if builder.display_name.is_none() {
            builder.display_name = channel.display_name;
        }
        if builder.icon_url.is_none() {
            builder.icon_url = channel.icon_url;
        }
    }

    for programme in parse.programmes {
        let Some(playlist_id) = group.playlist_id_for(&programme.channel_id) else {
            continue;
        };
        let builder = if discover_channels {
            builders.entry(playlist_id.clone()).or_default()
        } else {
            match builders.get_mut(&playlist_id) {
                Some(builder) => builder,
                None => continue,
            }
        };
        if builder.seen_starts.contains(&programme.start_raw) {
            continue;
        }
        let programme = finalize_programme(programme, playlist_id, document);
        builder.seen_starts.insert(programme.start_raw.clone());
        builder.programmes.push(programme);
    }
}

/// Rewrites the channel id to the playlist id and pre-applies the mapping
/// offset to the cached UTC instants. The raw timestamps stay untouched,
/// export rendering re-derives the formatted text from them.
fn finalize_programme(mut programme: Programme, playlist_id: String, document: &SettingsDocument) -> Programme {
    let offset_minutes = document
        .mappings
        .get(&playlist_id)
        .map_or(0, |m| m.offset_minutes);
    if offset_minutes != 0 {
        let shift = i64::from(offset_minutes) * 60_000;
        programme.start_utc += shift;
        programme.stop_utc = programme.stop_utc.map(|stop| stop + shift);
    }
    programme.channel_id = playlist_id;
    programme
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelMapping, Source};
    use crate::repository::{ArtifactCache, MirrorStore};
    use std::path::Path;

    const FEED: &str = r#"<tv>
<channel id="bbc1"><display-name>BBC 1</display-name></channel>
<programme channel="bbc1" start="20240610120000 +0100" stop="20240610130000 +0100"><title>News</title></programme>
<programme channel="bbc1" start="20240610130000 +0100" stop="20240610140000 +0100"><title>Drama</title></programme>
</tv>"#;

    fn write_mirror(dir: &Path, url: &str, content: &str) {
        let key = MirrorStore::url_key(url);
        std::fs::write(dir.join(format!("{key}.xmltv")), content).unwrap();
        std::fs::write(
            dir.join(format!("{key}.json")),
            r#"{"isGz": false, "savedAt": "2024-06-10T00:00:00Z"}"#,
        )
        .unwrap();
    }

    fn playlist_channel(id: &str, name: &str) -> PlaylistChannel {
        PlaylistChannel {
            id: id.to_string(),
            name: Some(name.to_string()),
            group: None,
            logo_url: None,
            stream_url: format!("http://stream/{id}"),
        }
    }

    struct Fixture {
        _mirror_dir: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
        mirror: MirrorStore,
        cache: ArtifactCache,
        client: reqwest::Client,
    }

    impl Fixture {
        fn new() -> Self {
            let mirror_dir = tempfile::tempdir().unwrap();
            let cache_dir = tempfile::tempdir().unwrap();
            let mirror = MirrorStore::new(mirror_dir.path().to_path_buf()).unwrap();
            let cache = ArtifactCache::new(cache_dir.path().to_path_buf()).unwrap();
            Self {
                mirror,
                cache,
                client: reqwest::Client::new(),
                _mirror_dir: mirror_dir,
                _cache_dir: cache_dir,
            }
        }

        fn mirror_dir(&self) -> &Path {
            self._mirror_dir.path()
        }

        fn assembler(&self) -> EpgAssembler {
            EpgAssembler { client: &self.client, mirror: &self.mirror, schedule_cache: &self.cache }
        }
    }

    #[tokio::test]
    async fn test_assemble_maps_epg_id_to_playlist_id() {
        let fixture = Fixture::new();
        let url = "http://upstream/epg.xml";
        write_mirror(fixture.mirror_dir(), url, FEED);

        let mut document = SettingsDocument::default();
        document.settings.history_backfill = false;
        document.mappings.insert(
            "BBC1".to_string(),
            ChannelMapping { epg_channel_id: Some("bbc1".to_string()), ..Default::default() },
        );
        let playlist = vec![playlist_channel("BBC1", "BBC One")];

        let outcome = fixture
            .assembler()
            .assemble(&document, &playlist, Some(url), &TimeWindow::Full)
            .await
            .unwrap();

        assert_eq!(outcome.epg.channels.len(), 1);
        let channel = &outcome.epg.channels[0];
        assert_eq!(channel.id, "BBC1");
        assert_eq!(channel.display_name.as_deref(), Some("BBC One"));
        assert_eq!(channel.programmes.len(), 2);
        assert!(channel.programmes.iter().all(|p| p.channel_id == "BBC1"));
        assert!(channel.programmes.windows(2).all(|w| w[0].start_utc <= w[1].start_utc));
    }

    #[tokio::test]
    async fn test_offset_is_preapplied_to_utc_only() {
        let fixture = Fixture::new();
        let url = "http://upstream/epg.xml";
        write_mirror(fixture.mirror_dir(), url, FEED);

        let mut document = SettingsDocument::default();
        document.settings.history_backfill = false;
        document.mappings.insert(
            "BBC1".to_string(),
            ChannelMapping {
                epg_channel_id: Some("bbc1".to_string()),
                offset_minutes: 30,
                ..Default::default()
            },
        );
        let playlist = vec![playlist_channel("BBC1", "BBC One")];

        let outcome = fixture
            .assembler()
            .assemble(&document, &playlist, Some(url), &TimeWindow::Full)
            .await
            .unwrap();

        let programme = &outcome.epg.channels[0].programmes[0];
        // 12:00 +0100 is 11:00Z, plus 30 minutes pre-applied
        assert_eq!(programme.start_utc, 1718017200000 + 30 * 60_000);
        assert_eq!(programme.start_raw, "20240610120000 +0100");
    }

    #[tokio::test]
    async fn test_failed_group_degrades() {
        let fixture = Fixture::new();
        let good_url = "http://good/epg.xml";
        write_mirror(fixture.mirror_dir(), good_url, FEED);

        let mut document = SettingsDocument::default();
        document.settings.history_backfill = false;
        document.sources.push(Source {
            id: "bad".to_string(),
            url: "http://127.0.0.1:1/unreachable.xml".to_string(),
            enabled: true,
            priority: 0,
            last_scanned_at: None,
            channel_count: None,
        });
        document.mappings.insert(
            "A".to_string(),
            ChannelMapping { source_id: Some("bad".to_string()), ..Default::default() },
        );
        document.mappings.insert(
            "BBC1".to_string(),
            ChannelMapping { epg_channel_id: Some("bbc1".to_string()), ..Default::default() },
        );
        let playlist = vec![playlist_channel("A", "Alpha"), playlist_channel("BBC1", "BBC One")];

        let outcome = fixture
            .assembler()
            .assemble(&document, &playlist, Some(good_url), &TimeWindow::Full)
            .await
            .unwrap();

        // the unreachable group contributes nothing, the request still succeeds
        assert_eq!(outcome.epg.channels.len(), 2);
        assert!(outcome.epg.channels[0].programmes.is_empty());
        assert_eq!(outcome.epg.channels[1].programmes.len(), 2);
    }

    #[tokio::test]
    async fn test_multi_source_merge_has_no_cross_contamination() {
        let fixture = Fixture::new();
        let s1_url = "http://s1/epg.xml";
        let default_url = "http://default/epg.xml";
        // both feeds carry a programme at the same wall time
        write_mirror(
            fixture.mirror_dir(),
            s1_url,
            r#"<tv><programme channel="a1" start="20240610200000 +0000"><title>From S1</title></programme></tv>"#,
        );
        write_mirror(
            fixture.mirror_dir(),
            default_url,
            r#"<tv><programme channel="b" start="20240610200000 +0000"><title>From Default</title></programme></tv>"#,
        );

        let mut document = SettingsDocument::default();
        document.settings.history_backfill = false;
        document.sources.push(Source {
            id: "s1".to_string(),
            url: s1_url.to_string(),
            enabled: true,
            priority: 0,
            last_scanned_at: None,
            channel_count: None,
        });
        document.mappings.insert(
            "A".to_string(),
            ChannelMapping {
                source_id: Some("s1".to_string()),
                epg_channel_id: Some("a1".to_string()),
                ..Default::default()
            },
        );
        let playlist = vec![playlist_channel("A", "Alpha"), playlist_channel("B", "Beta")];

        let outcome = fixture
            .assembler()
            .assemble(&document, &playlist, Some(default_url), &TimeWindow::Full)
            .await
            .unwrap();

        let a = &outcome.epg.channels[0];
        let b = &outcome.epg.channels[1];
        assert_eq!(a.id, "A");
        assert_eq!(a.programmes.len(), 1);
        assert_eq!(a.programmes[0].title.as_deref(), Some("From S1"));
        assert_eq!(b.id, "B");
        assert_eq!(b.programmes.len(), 1);
        assert_eq!(b.programmes[0].title.as_deref(), Some("From Default"));
    }

    #[tokio::test]
    async fn test_all_sources_unreachable_is_an_error() {
        let fixture = Fixture::new();
        let mut document = SettingsDocument::default();
        document.settings.history_backfill = false;
        let playlist = vec![playlist_channel("A", "Alpha")];
        let result = fixture
            .assembler()
            .assemble(&document, &playlist, Some("http://127.0.0.1:1/epg.xml"), &TimeWindow::Full)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_backfill_from_snapshot() {
        let fixture = Fixture::new();
        let url = "http://upstream/epg.xml";
        write_mirror(fixture.mirror_dir(), url, FEED);

        // snapshot with a programme three days in the past relative to the feed
        let key = MirrorStore::url_key(url);
        let old_feed = r#"<tv>
<programme channel="bbc1" start="20240607120000 +0100" stop="20240607130000 +0100"><title>Old</title></programme>
</tv>"#;
        std::fs::write(
            fixture.mirror_dir().join(format!("{key}.20240608000000.xmltv")),
            old_feed,
        )
        .unwrap();

        let mut document = SettingsDocument::default();
        document.settings.history_backfill = true;
        document.mappings.insert(
            "BBC1".to_string(),
            ChannelMapping { epg_channel_id: Some("bbc1".to_string()), ..Default::default() },
        );
        let playlist = vec![playlist_channel("BBC1", "BBC One")];

        let window = TimeWindow::Range {
            from_ms: 1717200000000, // 2024-06-01
            to_ms: 1718150400000,   // 2024-06-12
        };
        let outcome = fixture
            .assembler()
            .assemble(&document, &playlist, Some(url), &window)
            .await
            .unwrap();

        let programmes = &outcome.epg.channels[0].programmes;
        assert_eq!(programmes.len(), 3);
        assert_eq!(programmes[0].title.as_deref(), Some("Old"));
        assert!(programmes.windows(2).all(|w| w[0].start_utc <= w[1].start_utc));
    }

    #[tokio::test]
    async fn test_backfill_dedups_on_raw_start() {
        let fixture = Fixture::new();
        let url = "http://upstream/epg.xml";
        write_mirror(fixture.mirror_dir(), url, FEED);

        // snapshot holding the same programme as the current mirror
        let key = MirrorStore::url_key(url);
        std::fs::write(fixture.mirror_dir().join(format!("{key}.20240609000000.xmltv")), FEED).unwrap();

        let mut document = SettingsDocument::default();
        document.settings.history_backfill = true;
        document.mappings.insert(
            "BBC1".to_string(),
            ChannelMapping { epg_channel_id: Some("bbc1".to_string()), ..Default::default() },
        );
        let playlist = vec![playlist_channel("BBC1", "BBC One")];

        let outcome = fixture
            .assembler()
            .assemble(&document, &playlist, Some(url), &TimeWindow::Full)
            .await
            .unwrap();

        assert_eq!(outcome.epg.channels[0].programmes.len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_cache_reuse() {
        let fixture = Fixture::new();
        let url = "http://upstream/epg.xml";
        write_mirror(fixture.mirror_dir(), url, FEED);

        let mut document = SettingsDocument::default();
        document.settings.history_backfill = false;
        let playlist = vec![playlist_channel("bbc1", "BBC One")];

        let assembler = fixture.assembler();
        let first = assembler.assemble(&document, &playlist, Some(url), &TimeWindow::Full).await.unwrap();
        let second = assembler.assemble(&document, &playlist, Some(url), &TimeWindow::Full).await.unwrap();
        assert_eq!(first.fingerprint.hash(), second.fingerprint.hash());
        assert_eq!(
            serde_json::to_string(&first.epg).unwrap(),
            serde_json::to_string(&second.epg).unwrap()
        );
    }
}
