// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `AgentConfig` and its deterministic digest.
//!
//! Grounded on `runner_manager.py::RunnerManager._hash_config`: canonicalize
//! `{agent_type, system_prompt, model_config, available_tools}` (sorted
//! keys, stable serialization, volatile fields such as a timestamp ignored)
//! then digest. The original takes `md5(...).hexdigest()[:16]`; this port
//! uses `sha2::Sha256` truncated to the same sixteen hex characters since
//! `sha2` is already the teacher's hashing crate of choice (see
//! `DESIGN.md`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ids::ConfigHash;

/// Input to agent creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent_type: String,
    pub system_prompt: String,
    pub model_config: Value,
    pub available_tools: Vec<String>,
    #[serde(default)]
    pub framework_config: Value,
}

impl AgentConfig {
    /// Canonicalize the hashed fields (sorted keys via `serde_json::Value`'s
    /// `BTreeMap`-backed object representation, which is enabled workspace
    /// wide via the `preserve_order`-free default) and take a SHA-256
    /// digest truncated to sixteen hex characters.
    ///
    /// `framework_config` is intentionally excluded: only
    /// `{agent_type, system_prompt, model_config, available_tools}` feed
    /// the hashed fields.
    pub fn config_hash(&self) -> ConfigHash {
        let mut tools = self.available_tools.clone();
        tools.sort();
        let canonical = serde_json::json!({
            "agent_type": self.agent_type,
            "system_prompt": self.system_prompt,
            "model_config": canonicalize(&self.model_config),
            "available_tools": tools,
        });
        let bytes = serde_json::to_vec(&canonical).expect("json values always serialize");
        let digest = Sha256::digest(&bytes);
        ConfigHash::new(hex::encode(digest)[..16].to_string())
    }
}

/// Recursively sort object keys so two `Value`s that differ only in key
/// order hash identically.
pub(crate) fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::to_value(sorted).expect("btreemap of values always serializes")
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(model: Value) -> AgentConfig {
        AgentConfig {
            agent_type: "asst".into(),
            system_prompt: "P".into(),
            model_config: model,
            available_tools: vec!["b".into(), "a".into()],
            framework_config: Value::Null,
        }
    }

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let hash = cfg(serde_json::json!({"model": "m1"})).config_hash();
        assert_eq!(hash.as_str().len(), 16);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = cfg(serde_json::json!({"model": "m1", "temperature": 0.5}));
        let b = cfg(serde_json::json!({"temperature": 0.5, "model": "m1"}));
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn tool_list_order_does_not_affect_hash() {
        let mut a = cfg(serde_json::json!({"model": "m1"}));
        let mut b = a.clone();
        a.available_tools = vec!["x".into(), "y".into()];
        b.available_tools = vec!["y".into(), "x".into()];
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn different_system_prompt_changes_hash() {
        let mut a = cfg(serde_json::json!({"model": "m1"}));
        let mut b = a.clone();
        a.system_prompt = "P1".into();
        b.system_prompt = "P2".into();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn framework_config_does_not_affect_hash() {
        let mut a = cfg(serde_json::json!({"model": "m1"}));
        let mut b = a.clone();
        a.framework_config = serde_json::json!({"x": 1});
        b.framework_config = serde_json::json!({"x": 2});
        assert_eq!(a.config_hash(), b.config_hash());
    }
}
