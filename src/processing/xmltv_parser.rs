use quick_xml::events::Event;
use std::collections::HashSet;
use std::path::Path;
use tokio::io::AsyncRead;

use crate::error::{EpgError, EpgErrorKind};
use crate::model::{
    normalize_channel_id, EpgChannel, Programme, TimeWindow, EPG_ATTRIB_CHANNEL, EPG_ATTRIB_ID,
    EPG_ATTRIB_SRC, EPG_ATTRIB_START, EPG_ATTRIB_STOP, EPG_TAG_CATEGORY, EPG_TAG_CHANNEL,
    EPG_TAG_DESC, EPG_TAG_DISPLAY_NAME, EPG_TAG_ICON, EPG_TAG_PROGRAMME, EPG_TAG_TITLE,
};
use crate::utils::{async_file_reader, parse_xmltv_timestamp, CompressedFileReader};

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Normalized EPG-side ids; `None` or empty accepts every channel.
    pub allowed_ids: Option<HashSet<String>>,
    pub window: TimeWindow,
    /// Stop parsing once this many `programme` elements have been observed,
    /// counted before any filter. `Some(0)` yields channels only.
    pub limit_programmes: Option<u64>,
}

impl ParseOptions {
    pub fn channels_only() -> Self {
        Self { allowed_ids: None, window: TimeWindow::Full, limit_programmes: Some(0) }
    }

    fn accepts_channel(&self, raw_id: &str) -> bool {
        match &self.allowed_ids {
            None => true,
            Some(ids) if ids.is_empty() => true,
            Some(ids) => ids.contains(&normalize_channel_id(raw_id)),
        }
    }
}

#[derive(Debug)]
pub enum XmltvEvent {
    Channel(EpgChannel),
    Programme(Programme),
}

/// Streams an XMLTV document and emits accepted channels and programmes in
/// document order. Element and attribute names match case-insensitively.
/// A malformed document is fatal; everything emitted before stays valid.
pub async fn parse_xmltv<R, F>(reader: R, options: &ParseOptions, callback: &mut F) -> Result<(), EpgError>
where
    R: AsyncRead + Unpin + Send,
    F: FnMut(XmltvEvent),
{
    let mut xml_reader = quick_xml::reader::Reader::from_reader(async_file_reader(reader));
    let mut buf = Vec::new();

    let mut current_channel: Option<EpgChannel> = None;
    let mut current_programme: Option<Programme> = None;
    let mut current_tag = String::new();
    let mut text_buffer = String::new();
    let mut observed_programmes: u64 = 0;

    loop {
        match xml_reader.read_event_into_async(&mut buf).await {
            Ok(Event::Start(e)) => {
                flush_text_buffer(&current_tag, &mut text_buffer, &mut current_channel, &mut current_programme);
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                match tag.as_str() {
                    EPG_TAG_CHANNEL => {
                        current_channel = attr_value(&e, EPG_ATTRIB_ID)
                            .filter(|id| !id.is_empty())
                            .map(EpgChannel::new);
                    }
                    EPG_TAG_PROGRAMME => {
                        if let Some(limit) = options.limit_programmes {
                            if observed_programmes >= limit {
                                return Ok(());
                            }
                        }
                        observed_programmes += 1;
                        current_programme = programme_from_attributes(&e, options);
                    }
                    EPG_TAG_ICON => {
                        apply_icon(&e, &mut current_channel, &mut current_programme);
                    }
                    _ => {}
                }
                current_tag = tag;
            }
            Ok(Event::Empty(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                if tag == EPG_TAG_ICON {
                    apply_icon(&e, &mut current_channel, &mut current_programme);
                }
            }
            Ok(Event::Text(e)) => {
                if let Ok(decoded) = e.decode() {
                    text_buffer.push_str(&decoded);
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if let Ok(Some(ch)) = e.resolve_char_ref() {
                    text_buffer.push(ch);
                } else if let Ok(name) = e.decode() {
                    if let Some(resolved) = quick_xml::escape::resolve_predefined_entity(&name) {
                        text_buffer.push_str(resolved);
                    }
                }
            }
            Ok(Event::End(e)) => {
                flush_text_buffer(&current_tag, &mut text_buffer, &mut current_channel, &mut current_programme);
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                match tag.as_str() {
                    EPG_TAG_CHANNEL => {
                        if let Some(channel) = current_channel.take() {
                            if options.accepts_channel(&channel.id) {
                                callback(XmltvEvent::Channel(channel));
                            }
                        }
                    }
                    EPG_TAG_PROGRAMME => {
                        if let Some(programme) = current_programme.take() {
                            callback(XmltvEvent::Programme(programme));
                        }
                    }
                    _ => {}
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(EpgError::new(EpgErrorKind::Upstream, format!("XMLTV parse error: {err}")));
            }
            _ => {}
        }

        buf.clear();
    }

    Ok(())
}

/// Flushes accumulated text/entity fragments for the current element into
/// the active channel or programme, then clears the buffer.
fn flush_text_buffer(
    current_tag: &str,
    text_buffer: &mut String,
    current_channel: &mut Option<EpgChannel>,
    current_programme: &mut Option<Programme>,
) {
    let text = text_buffer.trim();
    if !text.is_empty() {
        apply_text(current_tag, text, current_channel, current_programme);
    }
    text_buffer.clear();
}

/// Parses a mirror or snapshot file, decompressing transparently.
pub async fn parse_xmltv_file<F>(path: &Path, options: &ParseOptions, callback: &mut F) -> Result<(), EpgError>
where
    F: FnMut(XmltvEvent),
{
    let reader = CompressedFileReader::new(path).await.map_err(|err| {
        EpgError::new(EpgErrorKind::Io, format!("Failed to open {}: {err}", path.display()))
    })?;
    parse_xmltv(reader, options, callback).await
}

fn attr_value(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().filter_map(Result::ok).find_map(|attr| {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_lowercase();
        if key == name {
            attr.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

/// Builds the programme when its attributes pass the id and window filters.
/// An unparseable `start` drops the record; a `stop` before `start` is
/// discarded while the record survives.
fn programme_from_attributes(e: &quick_xml::events::BytesStart, options: &ParseOptions) -> Option<Programme> {
    let channel_id = attr_value(e, EPG_ATTRIB_CHANNEL).filter(|id| !id.is_empty())?;
    if !options.accepts_channel(&channel_id) {
        return None;
    }

    let start_raw = attr_value(e, EPG_ATTRIB_START)?;
    let start = parse_xmltv_timestamp(&start_raw)?;

    let stop_raw = attr_value(e, EPG_ATTRIB_STOP);
    let stop = stop_raw.as_deref().and_then(parse_xmltv_timestamp).filter(|s| s.utc_ms >= start.utc_ms);
    let stop_raw = stop.is_some().then_some(stop_raw).flatten();

    if !options.window.overlaps(start.utc_ms, stop.map(|s| s.utc_ms)) {
        return None;
    }

    Some(Programme {
        channel_id,
        start_utc: start.utc_ms,
        stop_utc: stop.map(|s| s.utc_ms),
        start_raw,
        stop_raw,
        title: None,
        description: None,
        category: None,
        icon_url: None,
    })
}

fn apply_icon(
    e: &quick_xml::events::BytesStart,
    current_channel: &mut Option<EpgChannel>,
    current_programme: &mut Option<Programme>,
) {
    let Some(src) = attr_value(e, EPG_ATTRIB_SRC).filter(|v| !v.is_empty()) else {
        return;
    };
    if let Some(programme) = current_programme {
        if programme.icon_url.is_none() {
            programme.icon_url = Some(src);
        }
    } else if let Some(channel) = current_channel {
        if channel.icon_url.is_none() {
            channel.icon_url = Some(src);
        }
    }
}

fn apply_text(
    current_tag: &str,
    text: &str,
    current_channel: &mut Option<EpgChannel>,
    current_programme: &mut Option<Programme>,
) {
    match current_tag {
        EPG_TAG_DISPLAY_NAME => {
            if let Some(channel) = current_channel {
                if channel.display_name.is_none() {
                    channel.display_name = Some(text.to_string());
                }
            }
        }
        EPG_TAG_TITLE => {
            if let Some(programme) = current_programme {
                if programme.title.is_none() {
                    programme.title = Some(text.to_string());
                }
            }
        }
        EPG_TAG_DESC => {
            if let Some(programme) = current_programme {
                if programme.description.is_none() {
                    programme.description = Some(text.to_string());
                }
            }
        }
        EPG_TAG_CATEGORY => {
            if let Some(programme) = current_programme {
                if programme.category.is_none() {
                    programme.category = Some(text.to_string());
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeWindow;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="test">
  <channel id="bbc1">
    <display-name>BBC 1</display-name>
    <icon src="http://logo/bbc1.png"/>
  </channel>
  <channel id="itv">
    <display-name>ITV</display-name>
  </channel>
  <programme channel="bbc1" start="20240610120000 +0100" stop="20240610130000 +0100">
    <title>News</title>
    <desc>Evening news</desc>
    <category>News</category>
  </programme>
  <programme channel="itv" start="20240610140000 +0000">
    <title>Afternoon Show</title>
  </programme>
  <programme channel="bbc1" start="garbage">
    <title>Broken</title>
  </programme>
</tv>"#;

    async fn collect(feed: &str, options: &ParseOptions) -> (Vec<EpgChannel>, Vec<Programme>) {
        let mut channels = Vec::new();
        let mut programmes = Vec::new();
        let mut callback = |event: XmltvEvent| match event {
            XmltvEvent::Channel(c) => channels.push(c),
            XmltvEvent::Programme(p) => programmes.push(p),
        };
        parse_xmltv(feed.as_bytes(), options, &mut callback).await.unwrap();
        (channels, programmes)
    }

    #[tokio::test]
    async fn test_parse_full_document() {
        let (channels, programmes) = collect(FEED, &ParseOptions::default()).await;
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].display_name.as_deref(), Some("BBC 1"));
        assert_eq!(channels[0].icon_url.as_deref(), Some("http://logo/bbc1.png"));
        // the record with an unparseable start is dropped
        assert_eq!(programmes.len(), 2);
        assert_eq!(programmes[0].title.as_deref(), Some("News"));
        assert_eq!(programmes[0].start_raw, "20240610120000 +0100");
        assert_eq!(programmes[0].start_utc, 1718017200000);
        assert_eq!(programmes[1].stop_utc, None);
    }

    #[tokio::test]
    async fn test_allowed_ids_filter_is_normalized() {
        let options = ParseOptions {
            allowed_ids: Some(HashSet::from(["bbc1".to_string()])),
            ..Default::default()
        };
        let feed = FEED.replace("channel id=\"bbc1\"", "channel id=\" BBC1 \"")
            .replace("channel=\"bbc1\"", "channel=\" BBC1 \"");
        let (channels, programmes) = collect(&feed, &options).await;
        assert_eq!(channels.len(), 1);
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].channel_id, " BBC1 ");
    }

    #[tokio::test]
    async fn test_window_filter() {
        // window covering only the itv programme at 14:00 UTC
        let options = ParseOptions {
            window: TimeWindow::Range { from_ms: 1718028000000, to_ms: 1718031600000 },
            ..Default::default()
        };
        let (_, programmes) = collect(FEED, &options).await;
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].channel_id, "itv");
    }

    #[tokio::test]
    async fn test_limit_zero_yields_channels_only() {
        let (channels, programmes) = collect(FEED, &ParseOptions::channels_only()).await;
        assert_eq!(channels.len(), 2);
        assert!(programmes.is_empty());
    }

    #[tokio::test]
    async fn test_case_insensitive_tags() {
        let feed = r#"<TV><CHANNEL ID="x"><DISPLAY-NAME>X</DISPLAY-NAME></CHANNEL>
<PROGRAMME CHANNEL="x" START="20240610120000"><TITLE>T</TITLE></PROGRAMME></TV>"#;
        let (channels, programmes) = collect(feed, &ParseOptions::default()).await;
        assert_eq!(channels.len(), 1);
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].title.as_deref(), Some("T"));
    }

    #[tokio::test]
    async fn test_entities_are_unescaped() {
        let feed = r#"<tv><programme channel="x" start="20240610120000"><title>Tom &amp; Jerry</title></programme></tv>"#;
        let (_, programmes) = collect(feed, &ParseOptions::default()).await;
        assert_eq!(programmes[0].title.as_deref(), Some("Tom & Jerry"));
    }

    #[tokio::test]
    async fn test_malformed_document_is_fatal_but_keeps_prior_events() {
        let feed = "<tv><channel id=\"a\"><display-name>A</display-name></channel><programme start=";
        let mut channels = Vec::new();
        let mut callback = |event: XmltvEvent| {
            if let XmltvEvent::Channel(c) = event {
                channels.push(c);
            }
        };
        let result = parse_xmltv(feed.as_bytes(), &ParseOptions::default(), &mut callback).await;
        assert!(result.is_err());
        assert_eq!(channels.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_discarded() {
        let feed = r#"<tv><programme channel="x" start="20240610120000" stop="20240610110000"><title>T</title></programme></tv>"#;
        let (_, programmes) = collect(feed, &ParseOptions::default()).await;
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].stop_utc, None);
        assert_eq!(programmes[0].stop_raw, None);
    }
}
