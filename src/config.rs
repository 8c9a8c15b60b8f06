//! YAML configuration (spec §6). The top-level document names the server's
//! identity and ambient settings plus one entry list per component kind;
//! each entry is a single-key mapping from an instance name to a class plus
//! class-specific parameters, matched against the registry in
//! [`crate::router_core::registry`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_name: String,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_trace_dir")]
    pub trace_dir: String,
    #[serde(default)]
    pub agent_address: Option<String>,
    #[serde(default)]
    pub profiling: bool,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_module: HashMap<String, String>,
    #[serde(default)]
    pub features: Vec<String>,

    #[serde(default)]
    pub servers: Vec<ComponentEntry>,
    #[serde(default)]
    pub couplers: Vec<ComponentEntry>,
    #[serde(default)]
    pub publishers: Vec<ComponentEntry>,
    #[serde(default)]
    pub services: Vec<ComponentEntry>,
    #[serde(default)]
    pub filters: Vec<ComponentEntry>,
    #[serde(default)]
    pub applications: Vec<ComponentEntry>,
    #[serde(default)]
    pub functions: Vec<ComponentEntry>,
    #[serde(default)]
    pub processes: Vec<ComponentEntry>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_trace_dir() -> String {
    "./trace".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One `{ instance_name: { class, factory?, ...params } }` mapping, deserialized
/// as a single-key YAML map and then flattened into a name plus a bag of
/// class-specific parameters.
#[derive(Debug, Clone)]
pub struct ComponentEntry {
    pub name: String,
    pub class: String,
    pub factory: Option<String>,
    pub params: HashMap<String, Value>,
}

impl<'de> Deserialize<'de> for ComponentEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let outer: HashMap<String, HashMap<String, Value>> = HashMap::deserialize(deserializer)?;
        let (name, mut params) = outer
            .into_iter()
            .next()
            .ok_or_else(|| serde::de::Error::custom("component entry must have exactly one key"))?;

        let class = params
            .remove("class")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| serde::de::Error::custom(format!("component '{name}' is missing 'class'")))?;
        let factory = params.remove("factory").and_then(|v| v.as_str().map(str::to_string));

        Ok(ComponentEntry { name, class, factory, params })
    }
}

impl Serialize for ComponentEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut params = self.params.clone();
        params.insert("class".to_string(), Value::String(self.class.clone()));
        if let Some(factory) = &self.factory {
            params.insert("factory".to_string(), Value::String(factory.clone()));
        }
        let mut outer = HashMap::new();
        outer.insert(self.name.clone(), params);
        outer.serialize(serializer)
    }
}

impl ComponentEntry {
    pub fn string(&self, field: &str) -> Result<String, ConfigError> {
        self.params
            .get(field)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ConfigError::MissingField { name: self.name.clone(), field: field.to_string() })
    }

    pub fn string_or(&self, field: &str, default: &str) -> String {
        self.params.get(field).and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| default.to_string())
    }

    pub fn u64_or(&self, field: &str, default: u64) -> u64 {
        self.params.get(field).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn f64_or(&self, field: &str, default: f64) -> f64 {
        self.params.get(field).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn bool_or(&self, field: &str, default: bool) -> bool {
        self.params.get(field).and_then(Value::as_bool).unwrap_or(default)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path_str, source })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
server_name: test-router
couplers:
  - can0:
      class: DirectCanCoupler
      interface: vcan0
      bandwidth_percent: 25
publishers:
  - tcp_out:
      class: ClientPublisher
      port: 4001
      encoding: stfmt
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server_name, "test-router");
        assert_eq!(config.couplers.len(), 1);
        assert_eq!(config.couplers[0].name, "can0");
        assert_eq!(config.couplers[0].class, "DirectCanCoupler");
        assert_eq!(config.couplers[0].string("interface").unwrap(), "vcan0");
        assert_eq!(config.couplers[0].u64_or("bandwidth_percent", 100), 25);
        assert_eq!(config.publishers[0].string_or("encoding", "transparent"), "stfmt");
    }

    #[test]
    fn missing_class_is_an_error() {
        let yaml = r#"
server_name: test-router
couplers:
  - can0:
      interface: vcan0
"#;
        let err = serde_yaml::from_str::<Config>(yaml).unwrap_err();
        assert!(err.to_string().contains("class"));
    }
}
