//! Quota model: per-process ceilings over the five usage counters.

use serde::{Deserialize, Serialize};

use crate::process::ResourceUsage;

/// Optional per-process ceilings sent with `CreateProcess`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_llm_calls: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_agent_hops: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

impl QuotaOverrides {
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Present overrides as `(wire key, value)` pairs.
    pub fn entries(&self) -> Vec<(&'static str, u64)> {
        [
            ("max_llm_calls", self.max_llm_calls),
            ("max_tool_calls", self.max_tool_calls),
            ("max_agent_hops", self.max_agent_hops),
            ("max_input_tokens", self.max_input_tokens),
            ("max_output_tokens", self.max_output_tokens),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect()
    }
}

/// Verdict of `CheckQuota`. On the wire the usage counters sit beside
/// `within_bounds` and `exceeded_reason` in one flat map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub within_bounds: bool,
    #[serde(default)]
    pub exceeded_reason: String,
    #[serde(flatten)]
    pub usage: ResourceUsage,
}

impl QuotaCheckResult {
    pub fn within(usage: ResourceUsage) -> Self {
        Self {
            within_bounds: true,
            exceeded_reason: String::new(),
            usage,
        }
    }

    pub fn exceeded_by(reason: impl Into<String>, usage: ResourceUsage) -> Self {
        Self {
            within_bounds: false,
            exceeded_reason: reason.into(),
            usage,
        }
    }

    /// The first-exceeded reason, or `None` when within bounds.
    pub fn exceeded(&self) -> Option<&str> {
        if self.within_bounds {
            None
        } else {
            Some(self.exceeded_reason.as_str())
        }
    }
}

/// Effective ceilings for one process, as applied by the in-process kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_llm_calls: u64,
    pub max_tool_calls: u64,
    pub max_agent_hops: u64,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_llm_calls: 10,
            max_tool_calls: 50,
            max_agent_hops: 21,
            max_input_tokens: 4096,
            max_output_tokens: 2048,
        }
    }
}

impl QuotaLimits {
    pub fn apply(mut self, overrides: &QuotaOverrides) -> Self {
        if let Some(v) = overrides.max_llm_calls {
            self.max_llm_calls = v;
        }
        if let Some(v) = overrides.max_tool_calls {
            self.max_tool_calls = v;
        }
        if let Some(v) = overrides.max_agent_hops {
            self.max_agent_hops = v;
        }
        if let Some(v) = overrides.max_input_tokens {
            self.max_input_tokens = v;
        }
        if let Some(v) = overrides.max_output_tokens {
            self.max_output_tokens = v;
        }
        self
    }

    /// Checks dimensions in a fixed order and reports the first one over its
    /// ceiling. Reaching a ceiling exactly is still within bounds.
    pub fn evaluate(&self, usage: &ResourceUsage) -> QuotaCheckResult {
        let checks = [
            (usage.llm_calls, self.max_llm_calls, "max_llm_calls exceeded"),
            (usage.tool_calls, self.max_tool_calls, "max_tool_calls exceeded"),
            (usage.agent_hops, self.max_agent_hops, "max_agent_hops exceeded"),
            (usage.tokens_in, self.max_input_tokens, "max_input_tokens exceeded"),
            (usage.tokens_out, self.max_output_tokens, "max_output_tokens exceeded"),
        ];
        match checks.iter().find(|(used, max, _)| used > max) {
            Some((_, _, reason)) => QuotaCheckResult::exceeded_by(*reason, *usage),
            None => QuotaCheckResult::within(*usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_flat_quota_result() {
        let result: QuotaCheckResult = serde_json::from_value(json!({
            "within_bounds": false,
            "exceeded_reason": "max_llm_calls exceeded",
            "llm_calls": 11,
            "tool_calls": 0,
            "agent_hops": 0,
            "tokens_in": 1100,
            "tokens_out": 550
        }))
        .unwrap();
        assert_eq!(result.exceeded(), Some("max_llm_calls exceeded"));
        assert_eq!(result.usage.llm_calls, 11);
        assert_eq!(result.usage.tokens_in, 1100);
    }

    #[test]
    fn encodes_flat_quota_result() {
        let value =
            serde_json::to_value(QuotaCheckResult::within(ResourceUsage::llm_call(100, 50)))
                .unwrap();
        assert_eq!(value["within_bounds"], true);
        assert_eq!(value["exceeded_reason"], "");
        assert_eq!(value["llm_calls"], 1);
        assert_eq!(value["tokens_out"], 50);
    }

    #[test]
    fn ceiling_reached_is_within_bounds() {
        let limits = QuotaLimits::default();
        let usage = ResourceUsage {
            llm_calls: 10,
            ..ResourceUsage::default()
        };
        assert!(limits.evaluate(&usage).within_bounds);

        let usage = ResourceUsage {
            llm_calls: 11,
            ..ResourceUsage::default()
        };
        assert_eq!(
            limits.evaluate(&usage).exceeded(),
            Some("max_llm_calls exceeded")
        );
    }

    #[test]
    fn first_exceeded_dimension_wins() {
        let limits = QuotaLimits::default().apply(&QuotaOverrides {
            max_tool_calls: Some(1),
            max_output_tokens: Some(10),
            ..QuotaOverrides::default()
        });
        let usage = ResourceUsage {
            tool_calls: 2,
            tokens_out: 11,
            ..ResourceUsage::default()
        };
        assert_eq!(
            limits.evaluate(&usage).exceeded(),
            Some("max_tool_calls exceeded")
        );
    }

    #[test]
    fn overrides_list_only_present_values() {
        let overrides = QuotaOverrides {
            max_agent_hops: Some(3),
            ..QuotaOverrides::default()
        };
        assert_eq!(overrides.entries(), vec![("max_agent_hops", 3)]);
        assert!(QuotaOverrides::default().is_empty());
    }
}
