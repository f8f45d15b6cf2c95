use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EpgError, EpgErrorKind};
use crate::model::{AssembledEpg, SettingsDocument, EPG_TAG_CATEGORY, EPG_TAG_CHANNEL, EPG_TAG_DESC, EPG_TAG_DISPLAY_NAME, EPG_TAG_ICON, EPG_TAG_PROGRAMME, EPG_TAG_TITLE, EPG_TAG_TV};
use crate::processing::{render_timestamp, ShiftSpec};
use crate::utils::{file_writer, temp_path};

pub const GENERATOR_INFO_NAME: &str = "epg-viewer export";
const GZIP_LEVEL: u32 = 6;

/// Anything at or below this size is a broken artifact and gets rebuilt.
pub const MIN_ARTIFACT_SIZE: u64 = 100;

pub fn artifact_is_valid(path: &Path) -> bool {
    std::fs::metadata(path).map(|md| md.len() > MIN_ARTIFACT_SIZE).unwrap_or(false)
}

/// Writes the XMLTV document for the assembled schedules, optionally gzip
/// compressed, into `sink`.
pub fn write_export<W: Write>(sink: W, epg: &AssembledEpg, document: &SettingsDocument, gzip: bool) -> Result<(), EpgError> {
    if gzip {
        let encoder = GzEncoder::new(sink, Compression::new(GZIP_LEVEL));
        let encoder = write_document(encoder, epg, document)?;
        let mut inner = encoder.finish().map_err(EpgError::from)?;
        inner.flush().map_err(EpgError::from)?;
    } else {
        let mut sink = write_document(sink, epg, document)?;
        sink.flush().map_err(EpgError::from)?;
    }
    Ok(())
}

// Writing the doctype through a DocType event escapes the inner quotes and
// produces an invalid document, so preamble and doctype go out as raw bytes.
fn write_document<W: Write>(mut sink: W, epg: &AssembledEpg, document: &SettingsDocument) -> Result<W, EpgError> {
    sink.write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n").map_err(EpgError::from)?;
    sink.write_all(b"<!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n").map_err(EpgError::from)?;

    let mut writer = Writer::new(sink);
    let mut tv = BytesStart::new(EPG_TAG_TV);
    tv.push_attribute(("generator-info-name", GENERATOR_INFO_NAME));
    writer.write_event(Event::Start(tv)).map_err(write_err)?;

    for channel in &epg.channels {
        let mut elem = BytesStart::new(EPG_TAG_CHANNEL);
        elem.push_attribute(("id", channel.id.as_str()));
        writer.write_event(Event::Start(elem)).map_err(write_err)?;

        writer.write_event(Event::Start(BytesStart::new(EPG_TAG_DISPLAY_NAME))).map_err(write_err)?;
        let display_name = channel.display_name.as_deref().unwrap_or(channel.id.as_str());
        writer.write_event(Event::Text(BytesText::new(display_name))).map_err(write_err)?;
        writer.write_event(Event::End(BytesEnd::new(EPG_TAG_DISPLAY_NAME))).map_err(write_err)?;

        if let Some(icon) = channel.icon_url.as_deref() {
            let mut icon_elem = BytesStart::new(EPG_TAG_ICON);
            icon_elem.push_attribute(("src", icon));
            writer.write_event(Event::Empty(icon_elem)).map_err(write_err)?;
        }

        writer.write_event(Event::End(BytesEnd::new(EPG_TAG_CHANNEL))).map_err(write_err)?;
    }

    let force_zero_offset = document.settings.force_zero_offset;
    for channel in &epg.channels {
        let spec = ShiftSpec::from_mapping(document.mappings.get(&channel.id), force_zero_offset);
        for programme in &channel.programmes {
            let mut elem = BytesStart::new(EPG_TAG_PROGRAMME);
            elem.push_attribute(("channel", channel.id.as_str()));
            elem.push_attribute(("start", render_timestamp(&programme.start_raw, &spec).as_str()));
            if let Some(stop_raw) = programme.stop_raw.as_deref() {
                elem.push_attribute(("stop", render_timestamp(stop_raw, &spec).as_str()));
            }
            writer.write_event(Event::Start(elem)).map_err(write_err)?;

            write_text_tag(&mut writer, EPG_TAG_TITLE, programme.title.as_deref())?;
            write_text_tag(&mut writer, EPG_TAG_DESC, programme.description.as_deref())?;
            write_text_tag(&mut writer, EPG_TAG_CATEGORY, programme.category.as_deref())?;
            if let Some(icon) = programme.icon_url.as_deref() {
                let mut icon_elem = BytesStart::new(EPG_TAG_ICON);
                icon_elem.push_attribute(("src", icon));
                writer.write_event(Event::Empty(icon_elem)).map_err(write_err)?;
            }

            writer.write_event(Event::End(BytesEnd::new(EPG_TAG_PROGRAMME))).map_err(write_err)?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new(EPG_TAG_TV))).map_err(write_err)?;
    Ok(writer.into_inner())
}

fn write_text_tag<W: Write>(writer: &mut Writer<W>, tag: &str, text: Option<&str>) -> Result<(), EpgError> {
    let Some(text) = text else {
        return Ok(());
    };
    writer.write_event(Event::Start(BytesStart::new(tag))).map_err(write_err)?;
    writer.write_event(Event::Text(BytesText::new(text))).map_err(write_err)?;
    writer.write_event(Event::End(BytesEnd::new(tag))).map_err(write_err)?;
    Ok(())
}

fn write_err<E: std::fmt::Display>(err: E) -> EpgError {
    EpgError::new(EpgErrorKind::Io, format!("failed to write epg: {err}"))
}

/// Renders the export into `path` via `*.tmp` and rename. A failed or
/// cancelled build leaves the final path untouched. The tmp name carries a
/// nanosecond suffix so concurrent builds of the same fingerprint cannot
/// interleave; whichever rename lands last wins with identical bytes.
pub async fn render_export_to_file(
    path: PathBuf,
    epg: Arc<AssembledEpg>,
    document: Arc<SettingsDocument>,
    gzip: bool,
) -> Result<(), EpgError> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp = temp_path(&path).with_extension(format!("tmp.{nanos}"));
    let render_tmp = tmp.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<(), EpgError> {
        let file = std::fs::File::create(&render_tmp).map_err(EpgError::from)?;
        write_export(file_writer(file), &epg, &document, gzip)
    })
    .await
    .map_err(|err| EpgError::new(EpgErrorKind::Io, format!("export task failed: {err}")))?;

    match result {
        Ok(()) => {
            tokio::fs::rename(&tmp, &path).await.map_err(EpgError::from)?;
            debug!("Export written to {}", path.display());
            Ok(())
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelMapping, ChannelSchedule, Programme, ShiftMode};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn programme(start_raw: &str, stop_raw: Option<&str>, title: &str) -> Programme {
        let start = crate::utils::parse_xmltv_timestamp(start_raw).unwrap();
        Programme {
            channel_id: "BBC1".to_string(),
            start_utc: start.utc_ms,
            stop_utc: stop_raw.and_then(crate::utils::parse_xmltv_timestamp).map(|s| s.utc_ms),
            start_raw: start_raw.to_string(),
            stop_raw: stop_raw.map(ToString::to_string),
            title: Some(title.to_string()),
            description: None,
            category: None,
            icon_url: None,
        }
    }

    fn minimal_epg() -> AssembledEpg {
        AssembledEpg {
            channels: vec![ChannelSchedule {
                id: "BBC1".to_string(),
                display_name: Some("BBC One".to_string()),
                icon_url: None,
                programmes: vec![programme(
                    "20240610120000 +0100",
                    Some("20240610130000 +0100"),
                    "News",
                )],
            }],
        }
    }

    fn render(epg: &AssembledEpg, document: &SettingsDocument, gzip: bool) -> Vec<u8> {
        let mut out = Vec::new();
        write_export(&mut out, epg, document, gzip).unwrap();
        out
    }

    #[test]
    fn test_minimal_export() {
        let mut document = SettingsDocument::default();
        document.mappings.insert(
            "BBC1".to_string(),
            ChannelMapping { epg_channel_id: Some("bbc1".to_string()), ..Default::default() },
        );
        let xml = String::from_utf8(render(&minimal_epg(), &document, false)).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE tv SYSTEM \"xmltv.dtd\">"));
        assert!(xml.contains(r#"<tv generator-info-name="epg-viewer export">"#));
        assert!(xml.contains(r#"<channel id="BBC1"><display-name>BBC One</display-name></channel>"#));
        assert!(xml.contains(r#"start="20240610120000 +0000""#));
        assert!(xml.contains(r#"stop="20240610130000 +0000""#));
        assert!(xml.contains("<title>News</title>"));
    }

    #[test]
    fn test_escaping() {
        let mut epg = minimal_epg();
        epg.channels[0].display_name = Some("Tom & Jerry <Kids>".to_string());
        epg.channels[0].icon_url = Some("http://logo/a?x=\"1\"&y=2".to_string());
        epg.channels[0].programmes[0].title = Some("1 < 2 & 3 > 2".to_string());
        let xml = String::from_utf8(render(&epg, &SettingsDocument::default(), false)).unwrap();

        assert!(xml.contains("Tom &amp; Jerry &lt;Kids&gt;"));
        assert!(xml.contains("<title>1 &lt; 2 &amp; 3 &gt; 2</title>"));
        assert!(xml.contains("&quot;1&quot;"));
    }

    #[test]
    fn test_channel_without_name_uses_id() {
        let mut epg = minimal_epg();
        epg.channels[0].display_name = None;
        let xml = String::from_utf8(render(&epg, &SettingsDocument::default(), false)).unwrap();
        assert!(xml.contains("<display-name>BBC1</display-name>"));
    }

    #[test]
    fn test_gzip_contains_same_bytes() {
        let document = SettingsDocument::default();
        let epg = minimal_epg();
        let plain = render(&epg, &document, false);
        let compressed = render(&epg, &document, true);

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, plain);
    }

    #[test]
    fn test_output_is_deterministic() {
        let document = SettingsDocument::default();
        let epg = minimal_epg();
        assert_eq!(render(&epg, &document, true), render(&epg, &document, true));
    }

    #[tokio::test]
    async fn test_emit_parse_roundtrip() {
        use crate::processing::{parse_xmltv, ParseOptions, XmltvEvent};

        let mut document = SettingsDocument::default();
        document.settings.force_zero_offset = false;
        document.mappings.insert(
            "BBC1".to_string(),
            ChannelMapping { shift_mode: ShiftMode::Offset, ..Default::default() },
        );

        let mut epg = minimal_epg();
        epg.channels[0].programmes.push(programme("20240610140000 +0100", None, "Later"));
        let xml = render(&epg, &document, false);

        let mut programmes = Vec::new();
        let mut callback = |event: XmltvEvent| {
            if let XmltvEvent::Programme(p) = event {
                programmes.push(p);
            }
        };
        parse_xmltv(xml.as_slice(), &ParseOptions::default(), &mut callback).await.unwrap();

        assert_eq!(programmes.len(), 2);
        for (parsed, original) in programmes.iter().zip(&epg.channels[0].programmes) {
            assert_eq!(parsed.start_raw, original.start_raw);
            assert_eq!(parsed.stop_raw, original.stop_raw);
            assert_eq!(parsed.start_utc, original.start_utc);
            assert_eq!(parsed.title, original.title);
        }
    }

    #[tokio::test]
    async fn test_render_to_file_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.xml.gz");
        let document = Arc::new(SettingsDocument::default());
        render_export_to_file(path.clone(), Arc::new(minimal_epg()), document, true).await.unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        // no abandoned tmp files next to the artifact
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["export.xml.gz".to_string()]);
    }
}
