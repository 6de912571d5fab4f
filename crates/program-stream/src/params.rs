//! Job parameters and their normalization into a request body.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::GenerationError;
use crate::payload::{CalendarData, GenerationRequestBody, GymDetails, Periodization};

pub const MIN_WEEKS: u8 = 1;
pub const MAX_WEEKS: u8 = 8;

/// Monday, Wednesday, Friday.
pub const DEFAULT_SCHEDULE: [u8; 3] = [1, 3, 5];

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

const EQUIPMENT_LABELS: &[(&str, &str)] = &[
    ("bodyweight", "Bodyweight"),
    ("dumbbells", "Dumbbells"),
    ("barbell", "Barbell"),
    ("kettlebells", "Kettlebells"),
    ("resistance_bands", "Resistance Bands"),
    ("pull_up_bar", "Pull-up Bar"),
    ("bench", "Bench"),
    ("squat_rack", "Squat Rack"),
    ("cable_machine", "Cable Machine"),
    ("smith_machine", "Smith Machine"),
    ("medicine_ball", "Medicine Ball"),
    ("trx", "TRX / Suspension Trainer"),
    ("cardio_machines", "Cardio Machines"),
    ("plyo_box", "Plyo Box"),
];

/// Form-level input for one generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParameters {
    /// Existing program to fill; absent for a brand-new program.
    pub program_id: Option<String>,
    /// Client the program is for.
    pub entity_id: String,
    pub name: String,
    pub description: String,
    pub goal: String,
    pub difficulty: String,
    pub focus_area: String,
    pub training_methodology: String,
    /// Weekday names such as `"monday"` or `"Friday"`.
    pub days_of_week: Vec<String>,
    /// Overrides the day count derived from `days_of_week`.
    pub days_per_week: Option<u8>,
    pub number_of_weeks: u8,
    pub start_date: Option<NaiveDate>,
    /// Equipment identifiers such as `"dumbbells"`.
    pub equipment: Vec<String>,
    pub gym_type: String,
    pub gym_extra: serde_json::Map<String, serde_json::Value>,
    pub personalization: String,
    pub reference_input: String,
    pub session_details: serde_json::Value,
    pub program_overview: serde_json::Value,
    pub workout_format: Vec<String>,
    /// Replace previously generated workouts instead of adding to them.
    pub regenerate: bool,
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            program_id: None,
            entity_id: String::new(),
            name: String::new(),
            description: String::new(),
            goal: String::new(),
            difficulty: String::new(),
            focus_area: String::new(),
            training_methodology: String::new(),
            days_of_week: Vec::new(),
            days_per_week: None,
            number_of_weeks: 4,
            start_date: None,
            equipment: Vec::new(),
            gym_type: String::new(),
            gym_extra: serde_json::Map::new(),
            personalization: String::new(),
            reference_input: String::new(),
            session_details: serde_json::Value::Object(serde_json::Map::new()),
            program_overview: serde_json::Value::Object(serde_json::Map::new()),
            workout_format: Vec::new(),
            regenerate: false,
        }
    }
}

/// Parameters after the preparing step, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedJob {
    pub weeks: u8,
    pub days_of_week: Vec<u8>,
    pub days_per_week: u8,
    pub equipment_labels: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub expected_units: u32,
    pub deadline: Duration,
    pub body: GenerationRequestBody,
}

impl JobParameters {
    /// Normalizes the schedule and equipment and builds the wire body.
    pub fn prepare(&self, today: NaiveDate) -> Result<PreparedJob, GenerationError> {
        let weeks = clamp_weeks(self.number_of_weeks);
        let days_of_week = normalize_weekdays(&self.days_of_week);
        let days_per_week = resolve_days_per_week(self.days_per_week, &days_of_week);
        let equipment_labels = equipment_labels(&self.equipment);
        let start_date = self.start_date.unwrap_or(today);
        let end_date = start_date
            .checked_add_days(chrono::Days::new(u64::from(weeks) * 7 - 1))
            .ok_or_else(|| {
                GenerationError::Validation(format!(
                    "a {weeks}-week program starting {start_date} ends past the last representable date"
                ))
            })?;

        // the normalized values own these keys
        let mut gym_extra = self.gym_extra.clone();
        for key in ["equipment", "gym_type"] {
            if gym_extra.remove(key).is_some() {
                warn!(key, "dropping pass-through gym field that shadows a normalized one");
            }
        }

        let body = GenerationRequestBody {
            program_id: self.program_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            goal: self.goal.clone(),
            difficulty: self.difficulty.clone(),
            focus_area: self.focus_area.clone(),
            personalization: self.personalization.clone(),
            reference_input: self.reference_input.clone(),
            training_methodology: self.training_methodology.clone(),
            duration_weeks: weeks,
            days_per_week,
            entity_id: self.entity_id.clone(),
            gym_details: GymDetails {
                equipment: equipment_labels.clone(),
                gym_type: self.gym_type.clone(),
                extra: gym_extra,
            },
            periodization: Periodization {
                program_type: self.training_methodology.clone(),
            },
            calendar_data: CalendarData {
                start_date,
                end_date,
                days_per_week,
                days_of_week: days_of_week.clone(),
            },
            session_details: object_or_empty(&self.session_details),
            program_overview: object_or_empty(&self.program_overview),
            workout_format: self.workout_format.clone(),
            force_regenerate: self.regenerate,
        };

        Ok(PreparedJob {
            weeks,
            expected_units: expected_unit_count(weeks, days_per_week),
            deadline: deadline_for_weeks(weeks),
            days_of_week,
            days_per_week,
            equipment_labels,
            start_date,
            end_date,
            body,
        })
    }
}

fn resolve_days_per_week(requested: Option<u8>, days_of_week: &[u8]) -> u8 {
    let scheduled = days_of_week.len() as u8;
    match requested {
        Some(days) if (1..=7).contains(&days) => {
            if days != scheduled {
                warn!(
                    requested = days,
                    scheduled,
                    "days_per_week differs from the weekday schedule, keeping the requested count"
                );
            }
            days
        }
        Some(days) => {
            warn!(requested = days, used = scheduled, "days_per_week out of range, using the schedule");
            scheduled
        }
        None => scheduled,
    }
}

fn clamp_weeks(weeks: u8) -> u8 {
    let clamped = weeks.clamp(MIN_WEEKS, MAX_WEEKS);
    if clamped != weeks {
        warn!(requested = weeks, used = clamped, "week count out of range, clamped");
    }
    clamped
}

fn object_or_empty(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(_) => value.clone(),
        _ => serde_json::Value::Object(serde_json::Map::new()),
    }
}

/// Maps weekday names to codes (0 = Sunday). Unknown names are skipped; an
/// empty result falls back to [`DEFAULT_SCHEDULE`].
pub fn normalize_weekdays(names: &[String]) -> Vec<u8> {
    let mut days: Vec<u8> = names.iter().filter_map(|name| weekday_code(name)).collect();
    days.sort_unstable();
    days.dedup();
    if days.is_empty() {
        return DEFAULT_SCHEDULE.to_vec();
    }
    days
}

fn weekday_code(name: &str) -> Option<u8> {
    let name = name.trim();
    if let Some(idx) = WEEKDAYS.iter().position(|d| d.eq_ignore_ascii_case(name)) {
        return Some(idx as u8);
    }
    let capitalized = capitalize_first(name);
    WEEKDAYS
        .iter()
        .position(|d| *d == capitalized)
        .map(|idx| idx as u8)
}

fn capitalize_first(value: &str) -> String {
    let lower = value.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Maps equipment identifiers to the labels the generation service expects.
/// Unlisted identifiers are title-cased.
pub fn equipment_labels(ids: &[String]) -> Vec<String> {
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(|id| {
            EQUIPMENT_LABELS
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(id))
                .map(|(_, label)| (*label).to_string())
                .unwrap_or_else(|| {
                    id.split(['_', '-', ' '])
                        .filter(|w| !w.is_empty())
                        .map(capitalize_first)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
        })
        .collect()
}

/// Expected number of generated workouts.
pub fn expected_unit_count(weeks: u8, days_per_week: u8) -> u32 {
    u32::from(weeks) * u32::from(days_per_week)
}

/// Deadline tier by program length: under 5 weeks 5 min, under 8 weeks
/// 7.5 min, otherwise 30 min.
pub fn deadline_for_weeks(weeks: u8) -> Duration {
    match weeks {
        0..=4 => Duration::from_secs(5 * 60),
        5..=7 => Duration::from_secs(450),
        _ => Duration::from_secs(30 * 60),
    }
}
