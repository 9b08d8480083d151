use std::path::PathBuf;

use serde::de::value::MapDeserializer;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

pub trait EnvVars {
    const PREFIX: &'static str;
}

/// Runtime configuration, read from `MARROW_*` variables of the process
/// environment at attach time.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HostVars {
    /// Append runtime logs to this file.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Mirror logs to the process stderr.
    #[serde(default)]
    pub console: bool,
}

impl EnvVars for HostVars {
    const PREFIX: &'static str = "MARROW_";
}

pub fn deserialize_from_env<'de, T: serde::Deserialize<'de> + EnvVars>()
-> Result<T, serde_json::Error> {
    deserialize(
        std::env::vars()
            .filter(|(k, _)| k.starts_with(T::PREFIX))
            .map(|(k, v)| (k.trim_start_matches(T::PREFIX).to_ascii_lowercase(), v)),
    )
}

pub fn deserialize<'de, T: serde::Deserialize<'de>>(
    input: impl IntoIterator<Item = (String, String)>,
) -> Result<T, serde_json::Error> {
    T::deserialize(MapDeserializer::new(input.into_iter().map(|(k, v)| {
        // Values that parse as JSON keep their type; bare text stays a
        // string so unquoted paths work.
        let value = serde_json::from_str::<Value>(&v).unwrap_or(Value::String(v));
        (k, value)
    })))
}
