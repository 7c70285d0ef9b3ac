//! Endpoint discovery and process configuration.
//!
//! Resolution order for the host socket: `--socket <path>` on the command
//! line, then the `SOCKET_PATH` environment variable, then
//! `<temp-dir>/mlx-host.sock`. `AUTH_TOKEN` and `DEVICE` come from the
//! environment only.

use std::path::PathBuf;

pub const DEFAULT_SOCKET_FILE: &str = "mlx-host.sock";

/// Engine device preference. Interpretation is engine-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }

    pub fn parse(s: &str) -> Option<Device> {
        match s {
            "cpu" => Some(Device::Cpu),
            "gpu" => Some(Device::Gpu),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("missing value for {0}")]
    MissingValue(&'static str),
    #[error("unknown argument: {0}")]
    Unknown(String),
}

/// Host-side configuration, resolved from argv and the environment.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub socket_path: PathBuf,
    pub auth_token: Option<String>,
    pub device: Option<Device>,
}

impl HostConfig {
    /// Parse host command-line arguments (everything after argv[0]).
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<HostConfig, ArgError> {
        let mut socket_arg: Option<PathBuf> = None;
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--socket" => {
                    let value = iter.next().ok_or(ArgError::MissingValue("--socket"))?;
                    socket_arg = Some(PathBuf::from(value));
                }
                other => return Err(ArgError::Unknown(other.to_string())),
            }
        }
        Ok(Self::resolve(socket_arg))
    }

    /// Apply the environment fallbacks. `SOCKET_PATH` only applies when no
    /// `--socket` argument was given.
    pub fn resolve(socket_arg: Option<PathBuf>) -> HostConfig {
        let socket_path = socket_arg
            .or_else(|| std::env::var("SOCKET_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(default_host_socket_path);
        let auth_token = std::env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty());
        let device = std::env::var("DEVICE")
            .ok()
            .and_then(|d| Device::parse(&d));
        HostConfig {
            socket_path,
            auth_token,
            device,
        }
    }
}

/// The host's default endpoint.
pub fn default_host_socket_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_SOCKET_FILE)
}

/// The endpoint a client uses for a host it spawns itself, parameterized by
/// the client pid so concurrent clients don't collide.
pub fn default_client_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("mlx-host-{}.sock", std::process::id()))
}

/// What to do with the spawned host's stdout/stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioPolicy {
    /// Host logs flow to the client's stderr/stdout.
    #[default]
    Inherit,
    /// Host output is discarded.
    Null,
}

/// Client-side configuration.
///
/// With a `host_binary` set, [`crate::client::HostClient::connect`] spawns
/// the host as a supervised child; otherwise it connects to an already
/// running host at `socket_path`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub host_binary: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub auth_token: Option<String>,
    pub device: Option<Device>,
    pub stdio: StdioPolicy,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_binary = Some(path.into());
        self
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn stdio(mut self, policy: StdioPolicy) -> Self {
        self.stdio = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_flag_wins_over_default() {
        let config =
            HostConfig::from_args(["--socket".to_string(), "/tmp/x.sock".to_string()]).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn missing_socket_value_is_an_error() {
        let err = HostConfig::from_args(["--socket".to_string()]).unwrap_err();
        assert!(matches!(err, ArgError::MissingValue("--socket")));
    }

    #[test]
    fn unknown_argument_is_an_error() {
        let err = HostConfig::from_args(["--nope".to_string()]).unwrap_err();
        assert!(matches!(err, ArgError::Unknown(_)));
    }

    #[test]
    fn device_parses_known_values_only() {
        assert_eq!(Device::parse("cpu"), Some(Device::Cpu));
        assert_eq!(Device::parse("gpu"), Some(Device::Gpu));
        assert_eq!(Device::parse("tpu"), None);
    }

    #[test]
    fn client_socket_default_includes_pid() {
        let path = default_client_socket_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains(&std::process::id().to_string()));
    }
}
