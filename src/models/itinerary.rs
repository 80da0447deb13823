use serde::{ Serialize, Deserialize };

/// Coarse slot an activity occupies within a day. The backend declares the
/// same three values in the tool schema, so serde must round-trip them
/// byte-for-byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub time_of_day: TimeOfDay,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DayPlan {
    pub day_number: u32,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

/// Structured trip proposal delivered through the `propose_itinerary`
/// function call. Immutable once attached to a message; regeneration
/// replaces it wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub trip_title: String,
    pub destination: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub budget_estimate: String,
    pub vibe: String,
    pub summary: String,
    pub days: Vec<DayPlan>,
}

/// Persisted AI rows carry no content-type tag: an itinerary is stored as
/// its serialized JSON and recognized on reload by shape. Rows written by
/// older clients use the same encoding, so the sniff has to stay.
pub fn looks_like_persisted_itinerary(content: &str) -> bool {
    let trimmed = content.trim_start();
    trimmed.starts_with('{') && trimmed.contains("\"trip_title\"")
}
