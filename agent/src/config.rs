//! Configuration types for the agent

use crate::error::AgentError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vigil_shared::utils::parse_duration;

/// How long shutdown waits for the producer and exposition server
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Remote endpoint receiving every merged snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    /// Scheme and host, e.g. `http://169.254.169.254`
    pub url: String,
    pub port: u16,
    /// Path without leading slash, e.g. `v1/gpu_metrics`
    pub path: String,
    /// Upper bound for one POST, enforced by the transport
    pub timeout: Duration,
}

impl ForwardConfig {
    /// Full endpoint, `<url>:<port>/<path>`
    pub fn endpoint(&self) -> String {
        format!(
            "{}:{}/{}",
            self.url.trim_end_matches('/'),
            self.port,
            self.path.trim_start_matches('/')
        )
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            url: "http://169.254.169.254".to_string(),
            port: 80,
            path: "v1/gpu_metrics".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Optional CSV file with additional fields to collect
    pub collectors_path: Option<PathBuf>,

    /// Listen address of the local exposition server
    pub listen_addr: String,

    /// How often the producer reads watched fields
    pub collect_interval: Duration,

    /// Address of the standalone hostengine
    pub remote_hostengine: String,

    /// Path or name of the `dcgmi` binary used to read field values
    pub dcgmi_path: PathBuf,

    pub forward: ForwardConfig,

    /// Time window of the XID errors count metric
    pub xid_window: Duration,

    /// Time window of the clock events count metric
    pub clock_events_window: Duration,

    /// Omit the Hostname label
    pub no_hostname: bool,

    /// Bound on waiting for pipeline tasks at shutdown
    pub shutdown_timeout: Duration,

    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let collect_interval = Duration::from_secs(20);
        Self {
            collectors_path: None,
            listen_addr: "0.0.0.0:9401".to_string(),
            collect_interval,
            remote_hostengine: "localhost:5555".to_string(),
            dcgmi_path: PathBuf::from("dcgmi"),
            forward: ForwardConfig::default(),
            // windows match the collection interval
            xid_window: collect_interval,
            clock_events_window: collect_interval,
            no_hostname: false,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            debug: false,
        }
    }
}

/// Optional TOML file layered under command-line options
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub collectors: Option<PathBuf>,
    pub listen_addr: Option<String>,
    pub collect_interval: Option<String>,
    pub remote_hostengine: Option<String>,
    pub dcgmi_path: Option<PathBuf>,
    pub forward_url: Option<String>,
    pub forward_port: Option<u16>,
    pub forward_path: Option<String>,
    pub xid_window: Option<String>,
    pub clock_events_window: Option<String>,
    pub no_hostname: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            AgentError::config(format!("malformed config file {}: {}", path.display(), e))
        })
    }
}

fn duration_field(name: &str, value: &str) -> Result<Duration, AgentError> {
    parse_duration(value).map_err(|e| AgentError::config(format!("{}: {:?}: {}", name, value, e)))
}

impl AgentConfig {
    /// Apply values present in `file` on top of `self`.
    ///
    /// The derived windows follow `collect_interval` unless set explicitly.
    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), AgentError> {
        if let Some(path) = file.collectors {
            self.collectors_path = Some(path);
        }
        if let Some(addr) = file.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(interval) = file.collect_interval {
            self.set_collect_interval(duration_field("collect_interval", &interval)?);
        }
        if let Some(addr) = file.remote_hostengine {
            self.remote_hostengine = addr;
        }
        if let Some(path) = file.dcgmi_path {
            self.dcgmi_path = path;
        }
        if let Some(url) = file.forward_url {
            self.forward.url = url;
        }
        if let Some(port) = file.forward_port {
            self.forward.port = port;
        }
        if let Some(path) = file.forward_path {
            self.forward.path = path;
        }
        if let Some(window) = file.xid_window {
            self.xid_window = duration_field("xid_window", &window)?;
        }
        if let Some(window) = file.clock_events_window {
            self.clock_events_window = duration_field("clock_events_window", &window)?;
        }
        if let Some(no_hostname) = file.no_hostname {
            self.no_hostname = no_hostname;
        }
        Ok(())
    }

    /// Set the collection interval and move both derived windows with it
    pub fn set_collect_interval(&mut self, interval: Duration) {
        self.collect_interval = interval;
        self.xid_window = interval;
        self.clock_events_window = interval;
    }

    /// Parsed listen address of the exposition server
    pub fn listen_socket(&self) -> Result<SocketAddr, AgentError> {
        self.listen_addr
            .parse()
            .map_err(|e| AgentError::config(format!("invalid listen address {:?}: {}", self.listen_addr, e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.collect_interval.is_zero() {
            return Err(AgentError::config("collect interval must be greater than 0"));
        }

        if self.xid_window.is_zero() || self.clock_events_window.is_zero() {
            return Err(AgentError::config("derived metric windows must be greater than 0"));
        }

        if self.forward.url.trim().is_empty() {
            return Err(AgentError::config("forward url must not be empty"));
        }

        if self.forward.port == 0 {
            return Err(AgentError::config("forward port must be greater than 0"));
        }

        if self.remote_hostengine.trim().is_empty() {
            return Err(AgentError::config("remote hostengine address must not be empty"));
        }

        self.listen_socket()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_endpoint() {
        let config = AgentConfig::default();
        assert_eq!(
            config.forward.endpoint(),
            "http://169.254.169.254:80/v1/gpu_metrics"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_normalises_slashes() {
        let forward = ForwardConfig {
            url: "http://proxy.local/".to_string(),
            port: 8080,
            path: "/ingest".to_string(),
            ..ForwardConfig::default()
        };
        assert_eq!(forward.endpoint(), "http://proxy.local:8080/ingest");
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut config = AgentConfig::default();
        config.set_collect_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_validation_bad_listen_addr() {
        let config = AgentConfig {
            listen_addr: ":9401".to_string(),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_port() {
        let mut config = AgentConfig::default();
        config.forward.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collect_interval_moves_windows() {
        let mut config = AgentConfig::default();
        config.set_collect_interval(Duration::from_secs(10));
        assert_eq!(config.xid_window, Duration::from_secs(10));
        assert_eq!(config.clock_events_window, Duration::from_secs(10));
    }

    #[test]
    fn test_apply_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "collect_interval = \"10s\"\nclock_events_window = \"30s\"\nforward_port = 8080\nno_hostname = true"
        )
        .unwrap();

        let mut config = AgentConfig::default();
        config.apply_file(FileConfig::load(file.path()).unwrap()).unwrap();

        assert_eq!(config.collect_interval, Duration::from_secs(10));
        assert_eq!(config.xid_window, Duration::from_secs(10));
        assert_eq!(config.clock_events_window, Duration::from_secs(30));
        assert_eq!(config.forward.port, 8080);
        assert!(config.no_hostname);
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "colect_interval = \"10s\"").unwrap();
        assert!(matches!(
            FileConfig::load(file.path()),
            Err(AgentError::Config(_))
        ));
    }
}
