use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Why the agent loop stopped. Reported in the `x-termination-reason`
/// response header and in the SSE `end` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completion,
    CacheHit,
    StepLimit,
    ToolLimitReached,
    DurationLimit,
    ProviderError,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Completion => "completion",
            TerminationReason::CacheHit => "cache_hit",
            TerminationReason::StepLimit => "step_limit",
            TerminationReason::ToolLimitReached => "tool_limit_reached",
            TerminationReason::DurationLimit => "duration_limit",
            TerminationReason::ProviderError => "provider_error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&TerminationReason::ToolLimitReached).unwrap();
        assert_eq!(json, "\"tool_limit_reached\"");
        assert_eq!(TerminationReason::CacheHit.to_string(), "cache_hit");
    }
}
