//! Layered YAML configuration.
//!
//! Files merge in order (later files win, objects deep-merge, arrays and
//! scalars replace), the merged document is canonicalized (sorted keys,
//! compact JSON) and hashed, and the result deserializes into [`AppConfig`].
//! The hash ties a monitoring session to the exact configuration it ran
//! with.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Mock,
    Browser,
    DirectHttp,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Browser
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub max_streak: u32,
    pub min_streak_for_backoff: u32,
    pub backoff_factor: f64,
    pub cadence_ceiling_s: f64,
    pub inactivity_ceiling_min: i64,
    pub ignore_transient_timeout: bool,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            max_streak: 10,
            min_streak_for_backoff: 2,
            backoff_factor: 2.0,
            cadence_ceiling_s: 30.0,
            inactivity_ceiling_min: 5,
            ignore_transient_timeout: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: Mode,
    pub db_path: String,
    /// Required in mock mode.
    pub scenario_path: Option<String>,
    pub webdriver_url: String,
    pub listing_url: String,

    pub base_cadence_seconds: f64,
    /// Defaults to max(1.0, base).
    pub relaxed_cadence_seconds: Option<f64>,
    pub concurrent_requests: usize,
    pub request_timeout_intensive_s: f64,
    pub request_timeout_relaxed_s: f64,
    pub auth_failures_max: u32,

    pub security: SecuritySection,

    pub agg_window_seconds: i64,
    pub default_min_margin_pct: f64,
    pub default_hide_below_threshold: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            db_path: "data/subastas.db".into(),
            scenario_path: None,
            webdriver_url: "http://localhost:4444".into(),
            listing_url:
                "https://webecommerce.cba.gov.ar/VistaPublica/OportunidadProveedores.aspx".into(),
            base_cadence_seconds: 1.0,
            relaxed_cadence_seconds: None,
            concurrent_requests: 5,
            request_timeout_intensive_s: 2.5,
            request_timeout_relaxed_s: 5.0,
            auth_failures_max: 5,
            security: SecuritySection::default(),
            agg_window_seconds: 30,
            default_min_margin_pct: 10.0,
            default_hide_below_threshold: false,
        }
    }
}

impl AppConfig {
    /// Clamp every knob into its documented range.
    pub fn validated(mut self) -> Result<Self> {
        if self.mode == Mode::Mock && self.scenario_path.is_none() {
            bail!("mock mode requires scenario_path");
        }
        self.base_cadence_seconds = self.base_cadence_seconds.max(0.2);
        self.concurrent_requests = self.concurrent_requests.clamp(1, 30);
        self.request_timeout_intensive_s = self.request_timeout_intensive_s.max(0.5);
        self.request_timeout_relaxed_s = self.request_timeout_relaxed_s.max(1.0);
        self.auth_failures_max = self.auth_failures_max.max(1);
        self.agg_window_seconds = self.agg_window_seconds.max(1);
        Ok(self)
    }

    pub fn relaxed_cadence(&self) -> f64 {
        self.relaxed_cadence_seconds
            .unwrap_or_else(|| self.base_cadence_seconds.max(1.0))
            .max(1.0)
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load + merge YAML files in order, canonicalize, hash, deserialize.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let config: AppConfig =
        serde_json::from_str(&canonical).context("config does not match schema")?;

    Ok(LoadedConfig {
        config: config.validated()?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn defaults_cover_every_knob() {
        let cfg = AppConfig::default().validated().unwrap();
        assert_eq!(cfg.base_cadence_seconds, 1.0);
        assert_eq!(cfg.relaxed_cadence(), 1.0);
        assert_eq!(cfg.concurrent_requests, 5);
        assert_eq!(cfg.security.max_streak, 10);
        assert_eq!(cfg.default_min_margin_pct, 10.0);
    }

    #[test]
    fn later_layers_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(
            &dir,
            "base.yaml",
            "mode: mock\nscenario_path: s.json\nbase_cadence_seconds: 1.0\nsecurity:\n  max_streak: 10\n",
        );
        let env = write_yaml(
            &dir,
            "env.yaml",
            "base_cadence_seconds: 0.5\nsecurity:\n  max_streak: 4\n",
        );

        let loaded = load_layered_yaml(&[&base, &env]).unwrap();
        assert_eq!(loaded.config.base_cadence_seconds, 0.5);
        // Deep merge keeps untouched security defaults.
        assert_eq!(loaded.config.security.max_streak, 4);
        assert_eq!(loaded.config.security.backoff_factor, 2.0);
        assert_eq!(loaded.config.mode, Mode::Mock);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "agg_window_seconds: 30\nconcurrent_requests: 5\n");
        let b = write_yaml(&dir, "b.yaml", "concurrent_requests: 5\nagg_window_seconds: 30\n");

        let ha = load_layered_yaml(&[&a]).unwrap().config_hash;
        let hb = load_layered_yaml(&[&b]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn mock_mode_requires_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, "m.yaml", "mode: mock\n");
        assert!(load_layered_yaml(&[&path]).is_err());
    }

    #[test]
    fn clamps_out_of_range_values() {
        let cfg = AppConfig {
            base_cadence_seconds: 0.05,
            concurrent_requests: 99,
            request_timeout_intensive_s: 0.01,
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert_eq!(cfg.base_cadence_seconds, 0.2);
        assert_eq!(cfg.concurrent_requests, 30);
        assert_eq!(cfg.request_timeout_intensive_s, 0.5);
    }
}
