//! Error types shared across the core library.

use std::time::Duration;

use thiserror::Error;

/// Why a single poll of the status command did not produce a new status.
///
/// These never escape `VpnStatusModel::poll`; they are logged and kept as the
/// model's last failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// The binary is missing or could not be spawned.
    #[error("failed to execute `{command}`: {reason}")]
    Execution { command: String, reason: String },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The command ran but reported failure; its output is not trusted.
    #[error("`{command}` exited with code {code}: {stderr}")]
    ExitStatus {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Output was present but does not look like VPN status output.
    #[error("unrecognized status output: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
