use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;

use gatehouse_core::error::Result;
use gatehouse_core::traits::Tool;
use gatehouse_core::types::{ToolContext, ToolResult};

pub struct CurrentTimeTool;

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Return the current UTC time as an RFC 3339 timestamp."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Ok(ToolResult::success(
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ))
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }
}
