//! Weather tool: deterministic offline weather report for a city.
//!
//! The report is derived from a hash of the city name so the agent loop can
//! be exercised end-to-end without network access.

use async_trait::async_trait;
use toolpilot_core::error::ToolError;
use toolpilot_core::tool::{Tool, ToolResult};

pub struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather for a city. Returns temperature, conditions, humidity, and wind."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "city": {
                    "type": "string",
                    "description": "Name of the city, e.g. \"Paris\""
                },
                "units": {
                    "type": "string",
                    "enum": ["metric", "imperial"],
                    "description": "Temperature units (default: metric)"
                }
            },
            "required": ["city"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let city = arguments["city"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'city' argument".into()))?;

        let units = arguments["units"].as_str().unwrap_or("metric");
        let report = weather_for(city.trim(), units);
        let data = serde_json::to_value(&report).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "get_weather".into(),
            reason: e.to_string(),
        })?;

        Ok(ToolResult::ok(report.summary()).with_data(data))
    }
}

#[derive(serde::Serialize)]
struct WeatherReport {
    city: String,
    temperature: f64,
    units: String,
    conditions: String,
    humidity: u32,
    wind_kph: f64,
}

impl WeatherReport {
    fn summary(&self) -> String {
        format!(
            "{}: {}{}, {}, humidity {}%, wind {} km/h",
            self.city, self.temperature, self.units, self.conditions, self.humidity, self.wind_kph
        )
    }
}

fn weather_for(city: &str, units: &str) -> WeatherReport {
    let hash: u32 = city
        .to_lowercase()
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));

    const CONDITIONS: [&str; 6] = [
        "Clear skies",
        "Partly cloudy",
        "Overcast",
        "Light rain",
        "Thunderstorms",
        "Fog",
    ];

    let celsius = ((hash % 40) as f64) - 5.0;
    let (temperature, unit_label) = if units == "imperial" {
        (celsius * 9.0 / 5.0 + 32.0, "°F")
    } else {
        (celsius, "°C")
    };

    WeatherReport {
        city: city.to_string(),
        temperature: (temperature * 10.0).round() / 10.0,
        units: unit_label.to_string(),
        conditions: CONDITIONS[(hash as usize / 7) % CONDITIONS.len()].to_string(),
        humidity: 30 + (hash % 60),
        wind_kph: ((hash % 30) as f64) + 5.0,
    }
}
