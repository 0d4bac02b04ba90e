use serde::{Deserialize, Serialize};

/// `lockctl` configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/lockctl
/// collection: indexing
/// owner: worker-1
/// ttl-ms: 15000
/// before-expiry-ms: 5000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, alias = "ttl-ms")]
    pub ttl_ms: Option<u64>,
    #[serde(default, alias = "before-expiry-ms")]
    pub before_expiry_ms: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
