//! Clock tool: current date and time.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use toolpilot_core::error::ToolError;
use toolpilot_core::tool::{Tool, ToolResult};

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally shifted by a UTC offset in hours."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "number",
                    "description": "Offset from UTC in hours, e.g. 2 or -5.5 (default: 0)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let offset_hours = arguments["utc_offset_hours"].as_f64().unwrap_or(0.0);
        if !(-14.0..=14.0).contains(&offset_hours) {
            return Err(ToolError::InvalidArguments(format!(
                "utc_offset_hours must be between -14 and 14, got {offset_hours}"
            )));
        }

        let offset = FixedOffset::east_opt((offset_hours * 3600.0).round() as i32)
            .ok_or_else(|| ToolError::InvalidArguments("invalid UTC offset".into()))?;
        let now = Utc::now().with_timezone(&offset);

        Ok(ToolResult::ok(now.format("%A, %B %-d, %Y %H:%M:%S %:z").to_string()).with_data(
            serde_json::json!({
                "iso8601": now.to_rfc3339(),
                "unix": now.timestamp(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_offset_time() {
        let result = ClockTool
            .execute(serde_json::json!({"utc_offset_hours": 5.5}))
            .await
            .unwrap();
        assert!(result.output.contains("+05:30"));
        assert!(result.data.unwrap()["unix"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn defaults_to_utc() {
        let result = ClockTool.execute(serde_json::json!({})).await.unwrap();
        assert!(result.output.ends_with("+00:00"));
    }

    #[tokio::test]
    async fn rejects_out_of_range_offset() {
        let err = ClockTool
            .execute(serde_json::json!({"utc_offset_hours": 30}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
