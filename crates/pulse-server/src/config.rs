//! Server configuration: defaults, optional TOML file, `PULSE_` environment
//! overrides, in that order.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the server listens on.
    pub listen: String,
    /// Default log filter, overridable via RUST_LOG.
    pub log_level: String,
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("listen", "127.0.0.1:8080")?
            .set_default("log_level", "info")?;

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("PULSE"));

        builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", self.listen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let cfg = ServerConfig::load(None).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:8080");
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.listen_addr().is_ok());
    }

    #[test]
    fn rejects_unparseable_listen_address() {
        let cfg = ServerConfig {
            listen: "not-an-addr".into(),
            log_level: "info".into(),
        };
        assert!(cfg.listen_addr().is_err());
    }
}
