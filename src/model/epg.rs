use serde::{Deserialize, Serialize};

// https://github.com/XMLTV/xmltv/blob/master/xmltv.dtd

pub const EPG_TAG_TV: &str = "tv";
pub const EPG_TAG_PROGRAMME: &str = "programme";
pub const EPG_TAG_CHANNEL: &str = "channel";
pub const EPG_ATTRIB_ID: &str = "id";
pub const EPG_ATTRIB_CHANNEL: &str = "channel";
pub const EPG_ATTRIB_START: &str = "start";
pub const EPG_ATTRIB_STOP: &str = "stop";
pub const EPG_ATTRIB_SRC: &str = "src";
pub const EPG_TAG_DISPLAY_NAME: &str = "display-name";
pub const EPG_TAG_ICON: &str = "icon";
pub const EPG_TAG_TITLE: &str = "title";
pub const EPG_TAG_DESC: &str = "desc";
pub const EPG_TAG_CATEGORY: &str = "category";

/// Channel ids are compared after Unicode trim and lowercase, both on the
/// EPG side and the playlist side.
#[inline]
pub fn normalize_channel_id(id: &str) -> String {
    id.trim().to_lowercase()
}

/// One schedule entry for one channel. `start_raw`/`stop_raw` keep the
/// original XMLTV timestamp text so pass-through rendering stays bit-exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Programme {
    pub channel_id: String,
    pub start_utc: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_utc: Option<i64>,
    pub start_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgChannel {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

impl EpgChannel {
    pub fn new(id: String) -> Self {
        Self { id, display_name: None, icon_url: None }
    }
}

/// Requested time range in milliseconds since epoch, `[from, to)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeWindow {
    #[default]
    Full,
    Range { from_ms: i64, to_ms: i64 },
}

impl TimeWindow {
    pub fn bounds(&self) -> Option<(i64, i64)> {
        match self {
            Self::Full => None,
            Self::Range { from_ms, to_ms } => Some((*from_ms, *to_ms)),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Overlap of `[start, stop)` with the window, half-open on both sides.
    /// Programmes without a stop pass on `start < to` alone.
    pub fn overlaps(&self, start_ms: i64, stop_ms: Option<i64>) -> bool {
        match self {
            Self::Full => true,
            Self::Range { from_ms, to_ms } => {
                start_ms < *to_ms && stop_ms.is_none_or(|stop| stop > *from_ms)
            }
        }
    }
}

/// One channel with its merged, sorted programmes, in export order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSchedule {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub programmes: Vec<Programme>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledEpg {
    pub channels: Vec<ChannelSchedule>,
}
