use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `RENTD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("RENTD_TLS_CERT and RENTD_TLS_KEY must be set together")]
    TlsPair,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "rentd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let max_connections = parsed(&lookup, "RENTD_MAX_CONNECTIONS")?
            .unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "RENTD_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let tls_cert = lookup("RENTD_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("RENTD_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            bind: lookup("RENTD_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "RENTD_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("RENTD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("RENTD_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold: parsed(&lookup, "RENTD_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            tls_cert,
            tls_key,
            metrics_port: parsed(&lookup, "RENTD_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rentd.wal")
    }
}
