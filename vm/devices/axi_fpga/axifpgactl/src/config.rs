// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device description read from the `--config` file.

use axi_fpga::resources::PhysicalResources;
use serde::Deserialize;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The UIO node that delivers the device interrupt.
    pub uio: PathBuf,
    pub resources: PhysicalResources,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Read(#[source] std::io::Error),
    #[error("failed to parse config file")]
    Parse(#[source] serde_json::Error),
    #[error("invalid device resources")]
    Resources(#[source] axi_fpga::resources::ResourceError),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs_err::read_to_string(path).map_err(ConfigError::Read)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(data).map_err(ConfigError::Parse)?;
        config
            .resources
            .validate()
            .map_err(ConfigError::Resources)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use super::ConfigError;
    use test_with_tracing::test;

    const CONFIG: &str = r#"{
        "uio": "/dev/uio0",
        "resources": {
            "name": "axi_fpga",
            "control_base": 1073741824,
            "control_len": 65536,
            "buffer_base": 520093696,
            "buffer_order": 4,
            "irq": 61
        }
    }"#;

    #[test]
    fn parse() {
        let config = Config::parse(CONFIG).unwrap();
        assert_eq!(config.uio.to_str(), Some("/dev/uio0"));
        assert_eq!(config.resources.buffer_len(), 0x10000);
    }

    #[test]
    fn rejects_bad_resources() {
        let data = CONFIG.replace("65536", "100");
        assert!(matches!(
            Config::parse(&data),
            Err(ConfigError::Resources(_))
        ));
        let data = CONFIG.replace("\"irq\"", "\"line\"");
        assert!(matches!(Config::parse(&data), Err(ConfigError::Parse(_))));
    }
}
