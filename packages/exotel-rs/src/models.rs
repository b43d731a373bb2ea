use serde::{Deserialize, Serialize};

/// A single call resource as returned by the Exotel REST API.
///
/// Exotel serializes fields in PascalCase; durations arrive as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResource {
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
    #[serde(rename = "Duration", default)]
    pub duration: Option<String>,
    #[serde(rename = "RecordingUrl", default)]
    pub recording_url: Option<String>,
    #[serde(rename = "StartTime", default)]
    pub start_time: Option<String>,
    #[serde(rename = "EndTime", default)]
    pub end_time: Option<String>,
}

impl CallResource {
    /// Duration in whole seconds, if the API reported one.
    pub fn duration_secs(&self) -> Option<i64> {
        self.duration.as_deref().and_then(|d| d.parse().ok())
    }
}

/// Envelope for single-call responses (`{"Call": {...}}`).
#[derive(Debug, Clone, Deserialize)]
pub struct CallEnvelope {
    #[serde(rename = "Call")]
    pub call: CallResource,
}
