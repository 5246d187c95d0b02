//! Generic TOML configuration loading, following the same `serdeconv` pattern the logging
//! setup uses. `ManagerConfig` (in the `meshnet` crate) is deserialized through this.

use serde::de::DeserializeOwned;
use std::path::Path;

/// Loads and deserializes a TOML config file. Configuration errors are surfaced here, at
/// startup, rather than as a runtime condition.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, serdeconv::Error> {
    serdeconv::from_toml_file(path.as_ref())
}

/// Deserializes a TOML fragment directly, used by tests and by callers that assemble config
/// in-process rather than from a file on disk.
pub fn from_toml_str<T: DeserializeOwned>(toml: &str) -> Result<T, serdeconv::Error> {
    serdeconv::from_toml_str(toml)
}
