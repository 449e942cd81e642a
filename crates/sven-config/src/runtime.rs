// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration for the session/runner/agent lifecycle coordinator.

use serde::{Deserialize, Serialize};

/// What the approval broker does when a tool proposal's timer expires
/// without a user response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTimeoutPolicy {
    /// Synthesize `approved = true` and resolve the pending future.
    AutoApprove,
    /// Synthesize `approved = false` and resolve the pending future.
    AutoCancel,
    /// Leave the approval pending for external resolution; log once.
    Manual,
}

impl Default for ApprovalTimeoutPolicy {
    fn default() -> Self {
        Self::AutoCancel
    }
}

/// Tunables for the runner pool, approval broker, and idle sweeper.
///
/// Field names mirror the configuration keys enumerated by the runtime
/// specification so a YAML file can be written directly against this
/// struct via `sven_config::load`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of engine sessions a single runner may hold before
    /// new work for the same config hash spawns a fresh agent+runner pair.
    pub max_sessions_per_agent: usize,
    /// How long a tool proposal waits for a user decision before the
    /// fallback policy fires.
    pub tool_approval_timeout_seconds: f64,
    pub tool_approval_timeout_policy: ApprovalTimeoutPolicy,
    /// Idle thresholds consumed by the idle sweeper, in ascending order of
    /// eviction (sessions first, then runners, then agents).
    pub session_idle_timeout_seconds: u64,
    pub runner_idle_timeout_seconds: u64,
    pub agent_idle_timeout_seconds: u64,
    /// How often the idle sweeper runs a pass.
    pub sweep_interval_seconds: u64,
    pub default_user_id: String,
    pub default_app_name: String,
    pub runner_id_prefix: String,
    pub session_id_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_agent: 100,
            tool_approval_timeout_seconds: 90.0,
            tool_approval_timeout_policy: ApprovalTimeoutPolicy::default(),
            session_idle_timeout_seconds: 30 * 60,
            runner_idle_timeout_seconds: 60 * 60,
            agent_idle_timeout_seconds: 2 * 60 * 60,
            sweep_interval_seconds: 60,
            default_user_id: "default_user".to_string(),
            default_app_name: "sven".to_string(),
            runner_id_prefix: "runner".to_string(),
            session_id_prefix: "session".to_string(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_sessions_per_agent, 100);
        assert_eq!(cfg.tool_approval_timeout_policy, ApprovalTimeoutPolicy::AutoCancel);
    }

    #[test]
    fn round_trips_through_yaml() {
        let cfg = RuntimeConfig {
            max_sessions_per_agent: 3,
            tool_approval_timeout_policy: ApprovalTimeoutPolicy::AutoApprove,
            ..RuntimeConfig::default()
        };
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_yaml_overlay_keeps_defaults() {
        let yaml = "max_sessions_per_agent: 2\n";
        let cfg: RuntimeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.max_sessions_per_agent, 2);
        assert_eq!(cfg.default_app_name, "sven");
    }
}
