//! Wire formats: the generation request body and the JSON payloads carried in
//! stream frames.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::frame::StreamFrame;

/// Request body sent to the generation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequestBody {
    #[serde(rename = "programId", skip_serializing_if = "Option::is_none")]
    pub program_id: Option<String>,
    pub name: String,
    pub description: String,
    pub goal: String,
    pub difficulty: String,
    pub focus_area: String,
    pub personalization: String,
    #[serde(rename = "referenceInput", default)]
    pub reference_input: String,
    #[serde(rename = "trainingMethodology")]
    pub training_methodology: String,
    pub duration_weeks: u8,
    pub days_per_week: u8,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub gym_details: GymDetails,
    pub periodization: Periodization,
    pub calendar_data: CalendarData,
    pub session_details: serde_json::Value,
    pub program_overview: serde_json::Value,
    #[serde(default)]
    pub workout_format: Vec<String>,
    #[serde(rename = "forceRegenerate")]
    pub force_regenerate: bool,
}

/// Training environment; unknown keys pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GymDetails {
    pub equipment: Vec<String>,
    pub gym_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Periodization {
    pub program_type: String,
}

/// Schedule window. `days_of_week` uses 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarData {
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
    pub days_per_week: u8,
    pub days_of_week: Vec<u8>,
}

/// One generated workout delivered during streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultUnit {
    /// Numeric ids from the service are kept in their decimal form.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// In-band payload of a frame's `data`, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    Status {
        #[serde(default)]
        message: Option<String>,
    },
    Workout(ResultUnit),
    Metadata(serde_json::Map<String, serde_json::Value>),
    Warning {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Complete {
        #[serde(default)]
        total: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

impl StreamPayload {
    /// Parses a frame's data. Non-JSON or shapeless data yields `None`.
    pub fn from_frame(frame: &StreamFrame) -> Option<Self> {
        match serde_json::from_str(&frame.data) {
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!(error = %e, "frame data is not a known payload");
                None
            }
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(id) => id,
        RawId::Number(id) => id.to_string(),
    })
}
