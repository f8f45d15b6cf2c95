use std::collections::HashMap;

use crate::model::{PlaylistChannel, PlaylistParseResult};

// EPG hint attribute names on the #EXTM3U header line, in lookup order.
const EPG_HINT_KEYS: &[&str] = &["url-tvg", "x-tvg-url", "tvg-url"];

/// Attribute map of an `#EXTM3U` or `#EXTINF` line plus the trailing title.
/// Attributes are `key="value"` pairs; the title follows the first comma
/// after the last quoted value, so commas inside values stay intact.
fn parse_attributes(content: &str) -> (HashMap<String, String>, Option<String>) {
    let mut attributes = HashMap::new();
    // skip the duration field
    let mut rest = content
        .trim_start()
        .trim_start_matches(|c: char| c == '+' || c == '-' || c.is_ascii_digit());

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return (attributes, None);
        }
        if let Some(title) = rest.strip_prefix(',') {
            let title = title.trim();
            return (attributes, (!title.is_empty()).then(|| title.to_string()));
        }

        let Some((key, after_eq)) = rest.split_once('=') else {
            // stray token without a value; a title may still follow
            let title = rest
                .split_once(',')
                .map(|(_, title)| title.trim())
                .filter(|title| !title.is_empty());
            return (attributes, title.map(ToString::to_string));
        };
        let Some(value_and_rest) = after_eq.trim_start().strip_prefix('"') else {
            return (attributes, None);
        };
        let Some(end) = value_and_rest.find('"') else {
            return (attributes, None);
        };
        let value = &value_and_rest[..end];
        if !value.is_empty() {
            attributes.insert(key.trim().to_lowercase(), value.to_string());
        }
        rest = &value_and_rest[end + 1..];
    }
}

fn epg_hint_from_header(line: &str) -> Option<String> {
    let (attributes, _) = parse_attributes(line.trim_start_matches("#EXTM3U"));
    for key in EPG_HINT_KEYS {
        if let Some(value) = attributes.get(*key) {
            // the hint may carry a comma separated list, the first entry wins
            let first = value.split(',').next().unwrap_or(value).trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    None
}

fn channel_from_extinf(content: &str, group_hint: Option<&str>, url: String) -> Option<PlaylistChannel> {
    let (mut attributes, title) = parse_attributes(content);
    let name = attributes.remove("tvg-name").filter(|v| !v.is_empty()).or(title);
    let id = attributes
        .remove("tvg-id")
        .filter(|v| !v.is_empty())
        .or_else(|| name.clone())?;
    let group = attributes
        .remove("group-title")
        .filter(|v| !v.is_empty())
        .or_else(|| group_hint.map(ToString::to_string));
    let logo_url = attributes.remove("tvg-logo").filter(|v| !v.is_empty());
    Some(PlaylistChannel {
        id,
        name,
        group,
        logo_url,
        stream_url: url,
    })
}

/// Parses an M3U playlist, yielding channels in document order and the EPG
/// hint carried by the `#EXTM3U` header.
pub fn parse_m3u(content: &str) -> PlaylistParseResult {
    let mut result = PlaylistParseResult::default();
    let mut header: Option<String> = None;
    let mut group: Option<String> = None;

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("#EXTM3U") {
            if result.epg_url.is_none() {
                result.epg_url = epg_hint_from_header(line);
            }
            continue;
        }
        if line.starts_with("#EXTINF") {
            header = Some(line.trim_start_matches("#EXTINF:").to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTGRP:") {
            group = Some(rest.trim().to_string());
            continue;
        }
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if let Some(header_value) = header.take() {
            if let Some(channel) = channel_from_extinf(&header_value, group.as_deref(), line.to_string()) {
                result.channels.push(channel);
            }
            group = None;
        }
    }
    result
}
