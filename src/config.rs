//! Layered runtime configuration.
//!
//! Every binary built on the engine exposes the same surface: defaults,
//! overridden by an optional `lattice.toml`, overridden by `LATTICE_`
//! environment variables, overridden by CLI flags. The CLI flags are
//! declared as options so that only flags the operator actually passed
//! shadow the lower layers.

use clap::Args;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "lattice.toml";

/// A configured remote service to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    /// Service provider name the remote belongs to.
    pub spn: String,
    /// TCP address to dial.
    pub addr: String,
}

/// Parse a `SPN=ADDR` remote declaration.
///
/// # Errors
/// Returns a `Parsing` error if either side of the pair is missing.
pub fn parse_remote(s: &str) -> Result<Remote, NetError> {
    let Some((spn, addr)) = s.split_once('=') else {
        return Err(NetError::parsing(format!(
            "remote '{s}' is not of the form SPN=ADDR"
        )));
    };
    if spn.is_empty() || addr.is_empty() {
        return Err(NetError::parsing(format!(
            "remote '{s}' is not of the form SPN=ADDR"
        )));
    }
    Ok(Remote {
        spn: spn.to_owned(),
        addr: addr.to_owned(),
    })
}

/// Runtime configuration of one mesh node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Entity id of this process; must be unique in the mesh.
    pub eid: String,
    /// Service provider name of this process.
    pub spn: String,
    /// Accept-side bind address; empty disables the listener.
    pub bind: String,
    /// Remote services to dial, as `SPN=ADDR` pairs.
    pub remotes: Vec<String>,
    /// Seconds between keepalive pings on active sessions.
    pub ping_interval_secs: u64,
    /// Seconds allowed for one TCP dial attempt.
    pub dial_timeout_secs: u64,
    /// Seconds between redial attempts.
    pub redial_delay_secs: u64,
    /// Seconds a request may remain unanswered.
    pub request_timeout_secs: u64,
    /// Milliseconds between pending-table sweeps.
    pub sweep_interval_ms: u64,
    /// Seconds redial stays suppressed after `Die` or a rejected handshake.
    pub grace_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            eid: String::new(),
            spn: String::new(),
            bind: String::new(),
            remotes: Vec::new(),
            ping_interval_secs: 30,
            dial_timeout_secs: 5,
            redial_delay_secs: 3,
            request_timeout_secs: 10,
            sweep_interval_ms: 100,
            grace_secs: 10,
        }
    }
}

impl NodeConfig {
    /// Load configuration from defaults, `lattice.toml`, and the
    /// environment.
    ///
    /// # Errors
    /// Returns a figment error when a layer fails to parse.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration with an explicit file path.
    ///
    /// # Errors
    /// Returns a figment error when a layer fails to parse.
    pub fn load_from(file: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("LATTICE_"))
            .extract()
    }

    /// Shadow this configuration with flags the operator passed.
    #[must_use]
    pub fn apply(mut self, overrides: CliOverrides) -> Self {
        if let Some(eid) = overrides.eid {
            self.eid = eid;
        }
        if let Some(spn) = overrides.spn {
            self.spn = spn;
        }
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if !overrides.remotes.is_empty() {
            self.remotes = overrides.remotes;
        }
        if let Some(v) = overrides.ping_interval_secs {
            self.ping_interval_secs = v;
        }
        if let Some(v) = overrides.dial_timeout_secs {
            self.dial_timeout_secs = v;
        }
        if let Some(v) = overrides.redial_delay_secs {
            self.redial_delay_secs = v;
        }
        if let Some(v) = overrides.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = overrides.grace_secs {
            self.grace_secs = v;
        }
        self
    }

    /// Check the fields a node cannot start without.
    ///
    /// # Errors
    /// Returns a `Parsing` error naming the missing field, or the first
    /// malformed remote declaration.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.eid.is_empty() {
            return Err(NetError::parsing("configuration missing eid"));
        }
        for remote in &self.remotes {
            parse_remote(remote)?;
        }
        Ok(())
    }

    /// Remote declarations parsed into `(spn, addr)` pairs.
    ///
    /// # Errors
    /// Returns a `Parsing` error for a malformed declaration.
    pub fn parsed_remotes(&self) -> Result<Vec<Remote>, NetError> {
        self.remotes.iter().map(|s| parse_remote(s)).collect()
    }

    /// Interval between keepalive pings.
    #[must_use]
    pub const fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ping_interval_secs)
    }

    /// Timeout for one TCP dial attempt.
    #[must_use]
    pub const fn dial_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.dial_timeout_secs)
    }

    /// Delay before a redial attempt.
    #[must_use]
    pub const fn redial_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.redial_delay_secs)
    }

    /// Deadline applied to every outstanding request.
    #[must_use]
    pub const fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    /// Period of the pending-table sweeper.
    #[must_use]
    pub const fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }

    /// Redial suppression window after `Die` or a rejected handshake.
    #[must_use]
    pub const fn grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grace_secs)
    }
}

/// CLI flags shared by every binary; `None` means "not passed".
#[derive(Args, Debug, Clone, Default)]
pub struct CliOverrides {
    /// Entity id of this process.
    #[arg(long)]
    pub eid: Option<String>,
    /// Service provider name of this process.
    #[arg(long)]
    pub spn: Option<String>,
    /// Accept-side bind address.
    #[arg(long)]
    pub bind: Option<String>,
    /// Remote service to dial, as `SPN=ADDR`; repeatable.
    #[arg(long = "remote")]
    pub remotes: Vec<String>,
    /// Seconds between keepalive pings.
    #[arg(long)]
    pub ping_interval_secs: Option<u64>,
    /// Seconds allowed for one TCP dial attempt.
    #[arg(long)]
    pub dial_timeout_secs: Option<u64>,
    /// Seconds between redial attempts.
    #[arg(long)]
    pub redial_delay_secs: Option<u64>,
    /// Seconds a request may remain unanswered.
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    /// Seconds redial stays suppressed after Die or a rejected handshake.
    #[arg(long)]
    pub grace_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn env_config_loading() {
        Jail::expect_with(|j| {
            j.set_env("LATTICE_EID", "gate1");
            j.set_env("LATTICE_REQUEST_TIMEOUT_SECS", "2");
            let cfg = NodeConfig::load().expect("load");
            assert_eq!(cfg.eid, "gate1");
            assert_eq!(cfg.request_timeout_secs, 2);
            assert_eq!(cfg.ping_interval_secs, 30);
            Ok(())
        });
    }

    #[rstest]
    fn loads_from_toml_file() {
        Jail::expect_with(|j| {
            j.create_file(
                "lattice.toml",
                r#"
                    eid = "gate1"
                    bind = "127.0.0.1:7700"
                    remotes = ["ChatRoom=127.0.0.1:7711"]
                "#,
            )?;
            let cfg = NodeConfig::load().expect("load");
            assert_eq!(cfg.bind, "127.0.0.1:7700");
            assert_eq!(cfg.remotes, vec!["ChatRoom=127.0.0.1:7711".to_string()]);
            Ok(())
        });
    }

    #[rstest]
    fn env_overrides_file() {
        Jail::expect_with(|j| {
            j.create_file("lattice.toml", "eid = \"from-file\"")?;
            j.set_env("LATTICE_EID", "from-env");
            let cfg = NodeConfig::load().expect("load");
            assert_eq!(cfg.eid, "from-env");
            Ok(())
        });
    }

    #[rstest]
    fn cli_overrides_shadow_everything() {
        let cfg = NodeConfig {
            eid: "old".into(),
            ..NodeConfig::default()
        }
        .apply(CliOverrides {
            eid: Some("new".into()),
            request_timeout_secs: Some(1),
            ..CliOverrides::default()
        });
        assert_eq!(cfg.eid, "new");
        assert_eq!(cfg.request_timeout_secs, 1);
        assert_eq!(cfg.ping_interval_secs, 30);
    }

    #[rstest]
    #[case("ChatRoom=127.0.0.1:7711", Some(("ChatRoom", "127.0.0.1:7711")))]
    #[case("NoAddress", None)]
    #[case("=127.0.0.1:7711", None)]
    #[case("ChatRoom=", None)]
    fn remote_declarations_parse(
        #[case] input: &str,
        #[case] expected: Option<(&str, &str)>,
    ) {
        match expected {
            Some((spn, addr)) => {
                let remote = parse_remote(input).expect("parse");
                assert_eq!(remote.spn, spn);
                assert_eq!(remote.addr, addr);
            }
            None => {
                assert!(parse_remote(input).is_err());
            }
        }
    }

    #[rstest]
    fn validation_requires_an_eid() {
        let err = NodeConfig::default().validate().expect_err("must fail");
        assert!(err.text.contains("eid"));
    }
}
