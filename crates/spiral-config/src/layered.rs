// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Layer that produced a configuration value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigLayer {
    Base,
    Site,
    Run,
}

/// A single field that changed while a layer was merged.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDiffEvent {
    pub layer: ConfigLayer,
    pub path: String,
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

/// Collection of configuration layers that are merged in order.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    pub base: Option<PathBuf>,
    pub site: Option<PathBuf>,
    pub run: Option<PathBuf>,
}

impl ConfigLayering {
    /// Discovers configuration files from `SPIRAL_CONFIG_*` variables or the
    /// default root. Files that do not exist are ignored.
    pub fn discover() -> Self {
        let root = std::env::var("SPIRAL_CONFIG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_root());

        let base = std::env::var("SPIRAL_CONFIG_BASE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(root.join("base.toml")))
            .and_then(existing_path);

        let site = std::env::var("SPIRAL_CONFIG_SITE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(root.join("site.toml")))
            .and_then(existing_path);

        let run = std::env::var("SPIRAL_CONFIG_RUN")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(root.join("run.json")))
            .and_then(existing_path);

        ConfigLayering { base, site, run }
    }

    pub fn with_base<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base = Some(path.into());
        self
    }

    pub fn with_site<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.site = Some(path.into());
        self
    }

    pub fn with_run<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.run = Some(path.into());
        self
    }
}

fn existing_path(path: PathBuf) -> Option<PathBuf> {
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn default_root() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".spiraltorch").join("unlearn"),
        None => PathBuf::from("."),
    }
}

/// Result of merging layered configuration files.
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    layering: ConfigLayering,
    value: Value,
    events: Vec<ConfigDiffEvent>,
}

impl LayeredConfig {
    /// Loads the configured layers, merging base → site → run.
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut value = Value::Object(Default::default());
        let mut events = Vec::new();

        if let Some(base_path) = layering.base.as_ref() {
            if let Some(layer) = load_toml(base_path)? {
                apply_layer(&mut value, &layer, ConfigLayer::Base, &mut events);
            }
        }
        if let Some(site_path) = layering.site.as_ref() {
            if let Some(layer) = load_toml(site_path)? {
                apply_layer(&mut value, &layer, ConfigLayer::Site, &mut events);
            }
        }
        if let Some(run_path) = layering.run.as_ref() {
            if let Some(layer) = load_json(run_path)? {
                apply_layer(&mut value, &layer, ConfigLayer::Run, &mut events);
            }
        }

        for event in &events {
            debug!(layer = ?event.layer, path = %event.path, "config value set");
        }

        Ok(LayeredConfig {
            layering,
            value,
            events,
        })
    }

    /// Returns the merged configuration as a `serde_json::Value`.
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn layering(&self) -> &ConfigLayering {
        &self.layering
    }

    /// Returns the diff events emitted while applying the layers.
    pub fn events(&self) -> &[ConfigDiffEvent] {
        &self.events
    }

    /// Deserialises the whole merged document.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }

    /// Extracts a typed view of a nested configuration section.
    pub fn section<T>(&self, path: &[&str]) -> Result<Option<T>, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        let mut node = &self.value;
        for key in path {
            match node {
                Value::Object(map) => match map.get(*key) {
                    Some(value) => node = value,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        serde_json::from_value(node.clone()).map(Some)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn read_text(path: &Path) -> Result<Option<String>, LayeredConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|source| LayeredConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_toml(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    let Some(text) = read_text(path)? else {
        return Ok(None);
    };
    let value: toml::Value = toml::from_str(&text).map_err(|source| LayeredConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_value(value)
        .map(Some)
        .map_err(|source| LayeredConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn load_json(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    let Some(text) = read_text(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| LayeredConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn apply_layer(
    dest: &mut Value,
    layer: &Value,
    kind: ConfigLayer,
    events: &mut Vec<ConfigDiffEvent>,
) {
    let before = dest.clone();
    merge(dest, layer);
    diff(&before, dest, &mut Vec::new(), kind, events);
}

fn merge(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dest_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        dest_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest_slot, src_value) => {
            *dest_slot = src_value.clone();
        }
    }
}

fn diff(
    before: &Value,
    after: &Value,
    path: &mut Vec<String>,
    layer: ConfigLayer,
    out: &mut Vec<ConfigDiffEvent>,
) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            let mut keys: Vec<&String> = before_map.keys().chain(after_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(key.clone());
                let before_child = before_map.get(key).unwrap_or(&Value::Null);
                let after_child = after_map.get(key).unwrap_or(&Value::Null);
                diff(before_child, after_child, path, layer, out);
                path.pop();
            }
        }
        _ => {
            out.push(ConfigDiffEvent {
                layer,
                path: path.join("."),
                previous: (!before.is_null()).then(|| before.clone()),
                current: (!after.is_null()).then(|| after.clone()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Train {
        lr: f64,
        epochs: usize,
    }

    #[test]
    fn run_layer_overrides_base() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.toml");
        fs::write(
            &base,
            r#"
            [train]
            lr = 0.01
            epochs = 3
            "#,
        )
        .unwrap();
        let run = dir.path().join("run.json");
        fs::write(&run, r#"{"train": {"epochs": 5}}"#).unwrap();

        let layered =
            LayeredConfig::load(ConfigLayering::default().with_base(&base).with_run(&run))
                .unwrap();
        let train: Train = layered.section(&["train"]).unwrap().unwrap();
        assert_eq!(train, Train { lr: 0.01, epochs: 5 });

        let overridden = layered
            .events()
            .iter()
            .find(|event| event.layer == ConfigLayer::Run)
            .unwrap();
        assert_eq!(overridden.path, "train.epochs");
        assert_eq!(overridden.previous, Some(Value::from(3)));
    }

    #[test]
    fn missing_layers_are_ignored() {
        let dir = tempdir().unwrap();
        let layered = LayeredConfig::load(
            ConfigLayering::default().with_base(dir.path().join("absent.toml")),
        )
        .unwrap();
        assert!(layered.events().is_empty());
        assert_eq!(layered.section::<Train>(&["train"]).unwrap(), None);
    }

    #[test]
    fn malformed_toml_is_reported() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.toml");
        fs::write(&base, "train = [").unwrap();
        let err = LayeredConfig::load(ConfigLayering::default().with_base(&base)).unwrap_err();
        assert!(matches!(err, LayeredConfigError::Toml { .. }));
    }
}
