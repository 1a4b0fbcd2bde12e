use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Deserialize)]
pub struct HeadfullConfig {
    pub service: ServiceSection,
    pub chrome: ChromeSection,
    pub display: DisplaySection,
    pub devtools: DevtoolsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    pub max_concurrent_sessions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromeSection {
    pub binary: String,
    pub profile_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplaySection {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevtoolsSection {
    pub port_base: u16,
}

pub fn load_headfull_config<P: AsRef<Path>>(path: P) -> ConfigResult<HeadfullConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
