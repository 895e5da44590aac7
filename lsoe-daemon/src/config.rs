//
// Copyright (c) The LSOE Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use lsoe_utils::mac_addr::MacAddr;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    // 10-octet router identifier, e.g. "00:25:90:ab:cd:ef:00:00:00:01".
    pub local_id: Option<String>,
    pub ethertype: u16,
    pub hello_multicast_macaddr: String,
    // Timer parameters, in seconds.
    pub hello_interval: u64,
    pub keepalive_interval: u64,
    pub hold_time: u16,
    pub retransmit_base: u64,
    pub retransmit_cap: u64,
    pub max_attempts: u8,
    pub reassembly_ttl: u64,
    pub report_rfc7752_url: Option<String>,
    pub interfaces: Option<Vec<String>>,
    pub include_loopback: bool,
    pub logging: Logging,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub file: LoggingFile,
    pub stdout: LoggingStdout,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingFile {
    pub enabled: bool,
    pub dir: String,
    pub name: String,
    pub rotation: LoggingFileRotation,
    pub style: LoggingFmtStyle,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingStdout {
    pub enabled: bool,
    pub style: LoggingFmtStyle,
    pub colors: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFileRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFmtStyle {
    Compact,
    #[default]
    Full,
    Json,
    Pretty,
}

// Configuration file errors, fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(String, std::io::Error),
    FileParse(toml::de::Error),
    MissingLocalId,
    InvalidLocalId(String),
    InvalidMacAddr(String),
    NotMulticast(String),
    InvalidTimer(&'static str),
}

// ===== impl Config =====

impl Config {
    const DFLT_FILEPATH: &'static str = "/etc/lsoed.toml";

    pub(crate) fn load(
        config_file: Option<&str>,
    ) -> Result<Config, ConfigError> {
        let path = config_file.unwrap_or(Config::DFLT_FILEPATH);

        match std::fs::read_to_string(path) {
            Ok(config_str) => {
                toml::from_str(&config_str).map_err(ConfigError::FileParse)
            }
            // A missing file is only acceptable for the default path.
            Err(error) if config_file.is_some() => {
                Err(ConfigError::FileRead(path.to_owned(), error))
            }
            Err(error) => {
                eprintln!("failed to load configuration file: {error}");
                eprintln!("falling back to default configuration...");
                Ok(Config::default())
            }
        }
    }

    // Validates the configuration and converts it into the protocol
    // parameters handed to the engine.
    pub(crate) fn protocol(&self) -> Result<lsoe::Config, ConfigError> {
        let local_id = self
            .local_id
            .as_ref()
            .ok_or(ConfigError::MissingLocalId)?
            .parse()
            .map_err(|_| {
                ConfigError::InvalidLocalId(
                    self.local_id.clone().unwrap_or_default(),
                )
            })?;

        let hello_dst: MacAddr =
            self.hello_multicast_macaddr.parse().map_err(|_| {
                ConfigError::InvalidMacAddr(
                    self.hello_multicast_macaddr.clone(),
                )
            })?;
        if !hello_dst.is_multicast() {
            return Err(ConfigError::NotMulticast(
                self.hello_multicast_macaddr.clone(),
            ));
        }

        for (value, name) in [
            (self.hello_interval, "hello-interval"),
            (self.keepalive_interval, "keepalive-interval"),
            (self.hold_time as u64, "hold-time"),
            (self.retransmit_base, "retransmit-base"),
            (self.retransmit_cap, "retransmit-cap"),
            (self.max_attempts as u64, "max-attempts"),
            (self.reassembly_ttl, "reassembly-ttl"),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidTimer(name));
            }
        }

        Ok(lsoe::Config {
            local_id,
            ethertype: self.ethertype,
            hello_dst,
            hello_interval: Duration::from_secs(self.hello_interval),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            hold_time: self.hold_time,
            retransmit_base: Duration::from_secs(self.retransmit_base),
            retransmit_cap: Duration::from_secs(self.retransmit_cap),
            max_attempts: self.max_attempts,
            reassembly_ttl: Duration::from_secs(self.reassembly_ttl),
            report_url: self.report_rfc7752_url.clone(),
            interfaces: self.interfaces.clone(),
            include_loopback: self.include_loopback,
        })
    }
}

impl Default for Config {
    fn default() -> Config {
        let defaults = lsoe::Config::default();
        Config {
            local_id: None,
            ethertype: defaults.ethertype,
            hello_multicast_macaddr: defaults.hello_dst.to_string(),
            hello_interval: defaults.hello_interval.as_secs(),
            keepalive_interval: defaults.keepalive_interval.as_secs(),
            hold_time: defaults.hold_time,
            retransmit_base: defaults.retransmit_base.as_secs(),
            retransmit_cap: defaults.retransmit_cap.as_secs(),
            max_attempts: defaults.max_attempts,
            reassembly_ttl: defaults.reassembly_ttl.as_secs(),
            report_rfc7752_url: None,
            interfaces: None,
            include_loopback: false,
            logging: Default::default(),
        }
    }
}

// ===== impl LoggingFile =====

impl Default for LoggingFile {
    fn default() -> LoggingFile {
        LoggingFile {
            enabled: false,
            dir: "/var/log".to_owned(),
            name: "lsoed.log".to_owned(),
            rotation: Default::default(),
            style: Default::default(),
        }
    }
}

// ===== impl LoggingStdout =====

impl Default for LoggingStdout {
    fn default() -> LoggingStdout {
        LoggingStdout {
            enabled: true,
            style: Default::default(),
            colors: false,
        }
    }
}

// ===== impl ConfigError =====

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, error) => {
                write!(f, "failed to read {path}: {error}")
            }
            ConfigError::FileParse(error) => {
                write!(f, "failed to parse configuration: {error}")
            }
            ConfigError::MissingLocalId => {
                write!(f, "local-id is required")
            }
            ConfigError::InvalidLocalId(value) => {
                write!(f, "invalid local-id: {value}")
            }
            ConfigError::InvalidMacAddr(value) => {
                write!(f, "invalid hello-multicast-macaddr: {value}")
            }
            ConfigError::NotMulticast(value) => {
                write!(
                    f,
                    "hello-multicast-macaddr is not a multicast address: {value}"
                )
            }
            ConfigError::InvalidTimer(name) => {
                write!(f, "{name} must be non-zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ===== unit tests =====
