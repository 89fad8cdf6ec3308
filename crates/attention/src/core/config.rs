//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs that callers can tune without
//! swapping implementations. It deserializes with serde (missing fields fall
//! back to defaults) and accepts `ATTN_*` environment overrides:
//!
//! - `ATTN_CAUSAL` (`true|false|1|0`) toggles the causal mask.
//! - `ATTN_NEED_WEIGHTS` (`true|false|1|0`) requests the softmax weights.
//! - `ATTN_PRECISION` (`f32|inherit`) selects the matmul precision.
//! - `ATTN_DEGENERATE` (`zero|error`) selects the fully-masked row policy.

use serde::{Deserialize, Serialize};

/// Dtype used for the score and value matmuls.
///
/// Softmax and mask arithmetic run in `f32`, or `f64` for `f64` inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionPolicy {
    /// Widen half-precision inputs to `f32` (`f64` stays `f64`), cast the
    /// result back to the input dtype.
    #[default]
    ForceF32,
    /// Keep the input dtype throughout the matmuls.
    Inherit,
}

/// Behaviour for query rows whose every key position is masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateRowPolicy {
    /// Emit an all-zero weight row, hence an all-zero output row.
    #[default]
    ZeroWeights,
    /// Fail with [`AttentionError::NumericDegenerate`](super::AttentionError::NumericDegenerate).
    Error,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mask key `j` for query `i` whenever `j > i`.
    pub is_causal: bool,
    /// Return the `[batch, heads, q_len, k_len]` softmax weights alongside the output.
    pub need_weights: bool,
    /// Dtype of the score and value matmuls.
    pub precision: PrecisionPolicy,
    /// What a query row with every key masked produces.
    pub degenerate_rows: DegenerateRowPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_causal: true,
            need_weights: false,
            precision: PrecisionPolicy::default(),
            degenerate_rows: DegenerateRowPolicy::default(),
        }
    }
}

impl Config {
    /// Full bidirectional attention.
    pub fn bidirectional() -> Self {
        Self {
            is_causal: false,
            ..Self::default()
        }
    }

    pub fn with_weights(mut self) -> Self {
        self.need_weights = true;
        self
    }

    /// Layer `ATTN_*` variables from the process environment on top of this config.
    ///
    /// Kernels never call this themselves; callers opt in before passing the config.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Layer overrides resolved through `lookup`, keyed like the environment.
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ATTN_CAUSAL") {
            match parse_flag(&raw) {
                Some(flag) => self.is_causal = flag,
                None => log::warn!("ignoring ATTN_CAUSAL={raw:?}: expected a boolean"),
            }
        }
        if let Some(raw) = lookup("ATTN_NEED_WEIGHTS") {
            match parse_flag(&raw) {
                Some(flag) => self.need_weights = flag,
                None => log::warn!("ignoring ATTN_NEED_WEIGHTS={raw:?}: expected a boolean"),
            }
        }
        if let Some(raw) = lookup("ATTN_PRECISION") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "f32" | "force_f32" => self.precision = PrecisionPolicy::ForceF32,
                "inherit" => self.precision = PrecisionPolicy::Inherit,
                _ => log::warn!("ignoring ATTN_PRECISION={raw:?}: expected `f32` or `inherit`"),
            }
        }
        if let Some(raw) = lookup("ATTN_DEGENERATE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "zero" | "zero_weights" => self.degenerate_rows = DegenerateRowPolicy::ZeroWeights,
                "error" => self.degenerate_rows = DegenerateRowPolicy::Error,
                _ => log::warn!("ignoring ATTN_DEGENERATE={raw:?}: expected `zero` or `error`"),
            }
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_calling_convention() {
        let cfg = Config::default();
        assert!(cfg.is_causal);
        assert!(!cfg.need_weights);
        assert_eq!(cfg.precision, PrecisionPolicy::ForceF32);
        assert_eq!(cfg.degenerate_rows, DegenerateRowPolicy::ZeroWeights);
        assert!(!Config::bidirectional().is_causal);
        assert!(Config::bidirectional().with_weights().need_weights);
    }

    #[test]
    fn overrides_are_layered() {
        let mut cfg = Config::default();
        cfg.apply_overrides_from(lookup(&[
            ("ATTN_CAUSAL", "0"),
            ("ATTN_NEED_WEIGHTS", "yes"),
            ("ATTN_PRECISION", "inherit"),
            ("ATTN_DEGENERATE", "error"),
        ]));
        assert!(!cfg.is_causal);
        assert!(cfg.need_weights);
        assert_eq!(cfg.precision, PrecisionPolicy::Inherit);
        assert_eq!(cfg.degenerate_rows, DegenerateRowPolicy::Error);
    }

    #[test]
    fn malformed_overrides_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_overrides_from(lookup(&[("ATTN_CAUSAL", "maybe"), ("ATTN_PRECISION", "f8")]));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn deserializes_partial_documents() {
        let cfg: Config =
            serde_json::from_str(r#"{ "is_causal": false, "degenerate_rows": "error" }"#).unwrap();
        assert!(!cfg.is_causal);
        assert_eq!(cfg.degenerate_rows, DegenerateRowPolicy::Error);
        assert_eq!(cfg.precision, PrecisionPolicy::ForceF32);
    }
}
