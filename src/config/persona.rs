use once_cell::sync::Lazy;
use serde_json::{ json, Value as JsonValue };

/// Name of the single tool the session advertises. The accumulator matches
/// function calls against this exact string.
pub const TOOL_NAME: &str = "propose_itinerary";

/// Kept low to bias the model toward consistent tool invocation over free
/// creative text.
pub const TEMPERATURE: f32 = 0.5;

pub const SYSTEM_INSTRUCTION: &str = r#"
You are an elite "Agentic Travel Planner". Your goal is to design bespoke, highly detailed travel itineraries.

**CORE DIRECTIVE:**
You MUST use the provided tool `propose_itinerary` to present the final plan. Do not write the itinerary in plain text.

**WORKFLOW:**
1.  **Analyze Request:** Identify destination, duration, budget, and "Vibe".
2.  **Analyze Image (if present):** Extract the aesthetic (e.g., "Minimalist Nordic", "Chaotic Cyberpunk", "Rustic Italian") and apply this mood to the activity choices.
3.  **Construct Itinerary:** Call the `propose_itinerary` function with specific, real-world locations and activities.
4.  **Fallback:** If the user just says "Hello", reply conversationally in text. Only call the function when planning a trip.

**TONE:**
Sophisticated, enthusiastic, and highly organized.
"#;

/// Function declaration advertised to the backend: nested day objects each
/// holding activity objects with an enumerated time-of-day.
pub static ITINERARY_TOOL: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "name": TOOL_NAME,
        "description": "Generates a structured travel itinerary based on user preferences.",
        "parameters": {
            "type": "OBJECT",
            "properties": {
                "trip_title": { "type": "STRING", "description": "A catchy name for the trip" },
                "destination": { "type": "STRING" },
                "duration": { "type": "STRING" },
                "budget_estimate": { "type": "STRING" },
                "vibe": { "type": "STRING", "description": "The detected mood/aesthetic of the trip" },
                "summary": { "type": "STRING", "description": "A simplified 2-sentence overview of the experience" },
                "days": {
                    "type": "ARRAY",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "day_number": { "type": "INTEGER" },
                            "theme": { "type": "STRING" },
                            "activities": {
                                "type": "ARRAY",
                                "items": {
                                    "type": "OBJECT",
                                    "properties": {
                                        "time_of_day": { "type": "STRING", "enum": ["Morning", "Afternoon", "Evening"] },
                                        "title": { "type": "STRING" },
                                        "description": { "type": "STRING" },
                                        "location": { "type": "STRING" }
                                    }
                                }
                            }
                        }
                    }
                }
            },
            "required": ["trip_title", "destination", "days", "summary", "vibe"]
        }
    })
});
