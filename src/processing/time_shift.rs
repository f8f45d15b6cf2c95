use chrono::{Duration, Offset, TimeZone};
use chrono_tz::Tz;
use log::warn;

use crate::model::{ChannelMapping, ShiftMode};
use crate::utils::{format_xmltv, parse_xmltv_timestamp, with_zero_offset};

/// Numeric offsets are capped at ±14:00, the widest offset in use anywhere.
const OFFSET_CLAMP_MINUTES: i32 = 840;

/// Resolved shift parameters for one channel.
#[derive(Debug, Clone, Default)]
pub struct ShiftSpec {
    pub offset_minutes: i32,
    pub zone: Option<Tz>,
    pub mode: ShiftMode,
    pub force_zero_offset: bool,
}

impl ShiftSpec {
    pub fn from_mapping(mapping: Option<&ChannelMapping>, force_zero_offset: bool) -> Self {
        let Some(mapping) = mapping else {
            return Self { force_zero_offset, ..Self::default() };
        };
        let zone = mapping.zone_id.as_deref().and_then(|zone_id| {
            let parsed = zone_id.parse::<Tz>().ok();
            if parsed.is_none() {
                warn!("Ignoring unknown time zone {zone_id}");
            }
            parsed
        });
        Self {
            offset_minutes: mapping.offset_minutes,
            zone,
            mode: mapping.shift_mode,
            force_zero_offset,
        }
    }

    /// The original bytes can pass through untouched, except for the global
    /// zero-offset rewrite.
    fn is_passthrough(&self) -> bool {
        self.offset_minutes == 0 && (self.zone.is_none() || self.mode == ShiftMode::Offset)
    }
}

/// Renders one XMLTV timestamp under the channel's shift parameters.
///
/// `wall` shifts the absolute instant and re-renders it in the mapped zone
/// (or the original fixed offset), so DST at the shifted instant is honored.
/// `offset` keeps the wall digits and only adjusts the numeric offset.
pub fn render_timestamp(raw: &str, spec: &ShiftSpec) -> String {
    if spec.is_passthrough() {
        return finish(raw.trim().to_string(), spec);
    }

    let Some(ts) = parse_xmltv_timestamp(raw) else {
        return finish(raw.trim().to_string(), spec);
    };

    let rendered = match spec.mode {
        ShiftMode::Wall => match spec.zone {
            Some(tz) => {
                let shifted_ms = ts.utc_ms + i64::from(spec.offset_minutes) * 60_000;
                match tz.timestamp_millis_opt(shifted_ms).single() {
                    Some(dt) => {
                        let offset_minutes = dt.offset().fix().local_minus_utc() / 60;
                        format_xmltv(&dt.naive_local(), offset_minutes)
                    }
                    None => format_xmltv(&(ts.wall + Duration::minutes(i64::from(spec.offset_minutes))), ts.offset_minutes),
                }
            }
            None => {
                // the original fixed offset plays the role of the zone
                let shifted = ts.wall + Duration::minutes(i64::from(spec.offset_minutes));
                format_xmltv(&shifted, ts.offset_minutes)
            }
        },
        ShiftMode::Offset => {
            let (wall, input_offset) = match spec.zone {
                Some(tz) => match tz.timestamp_millis_opt(ts.utc_ms).single() {
                    Some(dt) => (dt.naive_local(), dt.offset().fix().local_minus_utc() / 60),
                    None => (ts.wall, ts.offset_minutes),
                },
                None => (ts.wall, ts.offset_minutes),
            };
            let adjusted = (input_offset + spec.offset_minutes).clamp(-OFFSET_CLAMP_MINUTES, OFFSET_CLAMP_MINUTES);
            format_xmltv(&wall, adjusted)
        }
    };

    finish(rendered, spec)
}

fn finish(rendered: String, spec: &ShiftSpec) -> String {
    if spec.force_zero_offset {
        with_zero_offset(&rendered)
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShiftMode;

    fn spec(offset: i32, zone: Option<&str>, mode: ShiftMode, force_zero: bool) -> ShiftSpec {
        ShiftSpec {
            offset_minutes: offset,
            zone: zone.map(|z| z.parse().unwrap()),
            mode,
            force_zero_offset: force_zero,
        }
    }

    #[test]
    fn test_passthrough_is_verbatim() {
        let s = spec(0, None, ShiftMode::Wall, false);
        assert_eq!(render_timestamp("20240610120000 +0100", &s), "20240610120000 +0100");
    }

    #[test]
    fn test_passthrough_with_zero_normalization() {
        let s = spec(0, None, ShiftMode::Wall, true);
        assert_eq!(render_timestamp("20240610120000 +0100", &s), "20240610120000 +0000");
    }

    #[test]
    fn test_wall_shift_without_zone_moves_digits() {
        let s = spec(60, None, ShiftMode::Wall, false);
        assert_eq!(render_timestamp("20240610120000 +0100", &s), "20240610130000 +0100");
    }

    #[test]
    fn test_wall_shift_without_zone_or_offset_is_utc() {
        let s = spec(-30, None, ShiftMode::Wall, false);
        assert_eq!(render_timestamp("20240610120000", &s), "20240610113000 +0000");
    }

    #[test]
    fn test_wall_shift_across_dst_boundary() {
        // 2024-03-31T00:30:00Z is GMT; one hour later London is on BST
        let s = spec(60, Some("Europe/London"), ShiftMode::Wall, false);
        assert_eq!(render_timestamp("20240331003000 +0000", &s), "20240331023000 +0100");
    }

    #[test]
    fn test_wall_zone_zero_offset_renders_local_wall() {
        let s = spec(0, Some("Europe/London"), ShiftMode::Wall, false);
        // 12:00 +0100 is 11:00Z, London summer time renders as 12:00 +0100
        assert_eq!(render_timestamp("20240610120000 +0100", &s), "20240610120000 +0100");
        // winter instant renders with the GMT offset
        assert_eq!(render_timestamp("20240110120000 +0000", &s), "20240110120000 +0000");
    }

    #[test]
    fn test_offset_mode_keeps_digits() {
        let s = spec(30, None, ShiftMode::Offset, false);
        assert_eq!(render_timestamp("20240610120000 +0200", &s), "20240610120000 +0230");
    }

    #[test]
    fn test_offset_mode_clamps() {
        let s = spec(600, None, ShiftMode::Offset, false);
        assert_eq!(render_timestamp("20240610120000 +1000", &s), "20240610120000 +1400");
        let s = spec(-600, None, ShiftMode::Offset, false);
        assert_eq!(render_timestamp("20240610120000 -1000", &s), "20240610120000 -1400");
    }

    #[test]
    fn test_offset_mode_collapses_under_zero_normalization() {
        let s = spec(30, None, ShiftMode::Offset, true);
        assert_eq!(render_timestamp("20240610120000 +0200", &s), "20240610120000 +0000");
    }

    #[test]
    fn test_unknown_zone_is_ignored() {
        let mapping = ChannelMapping {
            zone_id: Some("Mars/Olympus".to_string()),
            offset_minutes: 15,
            ..Default::default()
        };
        let s = ShiftSpec::from_mapping(Some(&mapping), false);
        assert!(s.zone.is_none());
        assert_eq!(s.offset_minutes, 15);
    }
}
