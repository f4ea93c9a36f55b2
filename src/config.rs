//! Configuration management
//!
//! Sources, later ones winning: an optional YAML file, then `VERTERA_*`
//! environment variables. `env_files` listed in the YAML are loaded into
//! the process environment before the environment is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::controlplane::dispatch::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::pki::tls::DEFAULT_SERVER_NAME;
use crate::{Error, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "VERTERA_";

const DAY: u64 = 24 * 3600;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files loaded before `VERTERA_*` variables are read.
    pub env_files: Vec<String>,

    /// HS256 secret for enrollment tokens. Unset disables enrollment.
    #[serde(with = "lenient::opt_string")]
    pub enroll_jwt_secret: Option<String>,
    /// Managed PKI directory.
    pub pki_dir: PathBuf,

    /// Bring-your-own CA certificate.
    #[serde(with = "lenient::opt_path")]
    pub ca_cert: Option<PathBuf>,
    /// Bring-your-own CA key, used for CSR signing.
    #[serde(with = "lenient::opt_path")]
    pub ca_key: Option<PathBuf>,
    /// Bring-your-own controller certificate.
    #[serde(with = "lenient::opt_path")]
    pub server_cert: Option<PathBuf>,
    /// Bring-your-own controller key.
    #[serde(with = "lenient::opt_path")]
    pub server_key: Option<PathBuf>,
    /// Bring-your-own agent certificate.
    #[serde(with = "lenient::opt_path")]
    pub client_cert: Option<PathBuf>,
    /// Bring-your-own agent key.
    #[serde(with = "lenient::opt_path")]
    pub client_key: Option<PathBuf>,

    /// Controller HTTP listen address.
    pub http_addr: String,
    /// Controller agent-session listen address.
    pub grpc_addr: String,

    /// Session address agents dial.
    pub controller_addr: String,
    /// HTTP base URL agents enroll against.
    pub controller_http: String,
    /// Name the controller certificate must carry.
    pub controller_server_name: String,
    /// Agent id; defaults to the hostname.
    #[serde(with = "lenient::opt_string")]
    pub agent_id: Option<String>,
    /// Hostname override.
    #[serde(with = "lenient::opt_string")]
    pub hostname: Option<String>,
    /// Token for automatic enrollment.
    #[serde(with = "lenient::opt_string")]
    pub enroll_token: Option<String>,
    /// Package download cache.
    pub cache_dir: PathBuf,

    /// Lifetime of a newly created CA.
    #[serde(with = "duration_serde")]
    pub ca_validity: Duration,
    /// Lifetime of issued leaf certificates.
    #[serde(with = "duration_serde")]
    pub cert_validity: Duration,
    /// TTL of tokens requested without one.
    #[serde(with = "duration_serde")]
    pub default_token_ttl: Duration,
    /// Live channel capacity per agent session.
    pub subscriber_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            enroll_jwt_secret: None,
            pki_dir: PathBuf::from("/tmp/vertera/pki"),
            ca_cert: None,
            ca_key: None,
            server_cert: None,
            server_key: None,
            client_cert: None,
            client_key: None,
            http_addr: "0.0.0.0:8080".to_string(),
            grpc_addr: "0.0.0.0:9090".to_string(),
            controller_addr: "localhost:9090".to_string(),
            controller_http: "http://localhost:8080".to_string(),
            controller_server_name: DEFAULT_SERVER_NAME.to_string(),
            agent_id: None,
            hostname: None,
            enroll_token: None,
            cache_dir: PathBuf::from("/tmp/vertera/packages"),
            ca_validity: Duration::from_secs(365 * DAY),
            cert_validity: Duration::from_secs(365 * DAY),
            default_token_ttl: Duration::from_secs(15 * 60),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// A complete set of bring-your-own TLS files for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByoIdentity {
    /// Trust anchor.
    pub ca_cert: PathBuf,
    /// Leaf certificate.
    pub cert: PathBuf,
    /// Leaf key.
    pub key: PathBuf,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // env files must be in the environment before Env is read
        let file_only: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        load_env_files(&file_only.env_files);

        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// The enrollment secret, if one is configured.
    pub fn enroll_secret(&self) -> Option<&[u8]> {
        self.enroll_jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
    }

    /// BYO CA certificate and key, when both are set.
    pub fn byo_ca(&self) -> Option<(&Path, &Path)> {
        Some((self.ca_cert.as_deref()?, self.ca_key.as_deref()?))
    }

    /// BYO controller identity, when all three paths are set.
    pub fn byo_server_identity(&self) -> Option<ByoIdentity> {
        byo(
            self.ca_cert.as_deref(),
            self.server_cert.as_deref(),
            self.server_key.as_deref(),
        )
    }

    /// BYO agent identity, when all three paths are set.
    pub fn byo_client_identity(&self) -> Option<ByoIdentity> {
        byo(
            self.ca_cert.as_deref(),
            self.client_cert.as_deref(),
            self.client_key.as_deref(),
        )
    }
}

fn byo(ca: Option<&Path>, cert: Option<&Path>, key: Option<&Path>) -> Option<ByoIdentity> {
    Some(ByoIdentity {
        ca_cert: ca?.to_path_buf(),
        cert: cert?.to_path_buf(),
        key: key?.to_path_buf(),
    })
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are skipped.
fn load_env_files(files: &[String]) {
    for path_str in files {
        let expanded = match (path_str.strip_prefix('~'), std::env::var_os("HOME")) {
            (Some(rest), Some(home)) => format!("{}{rest}", home.to_string_lossy()),
            _ => path_str.clone(),
        };

        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}

/// Parse a Go-style duration: `500ms`, `90s`, `15m`, `1.5h`, `7d`, `1h30m`,
/// or a bare number of seconds. Each component may be fractional.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || format!("invalid duration '{raw}'");
    let is_number = |c: char| c.is_ascii_digit() || c == '.';

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest.find(is_number).unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86_400.0,
            "" => return Err(format!("missing unit in duration '{raw}'")),
            other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
        };
        let part = Duration::try_from_secs_f64(value * seconds_per_unit).map_err(|_| invalid())?;
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Serde adapter for [`Duration`] fields written as [`parse_duration`]
/// strings or integer seconds.
pub mod duration_serde {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    /// Serialize as whole seconds, e.g. `"900s"`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize from a duration string or a number of seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value is not a valid duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"15m\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }
}

/// Optional values where an empty string means unset and numbers or
/// booleans (as parsed from env variables) are taken as text.
mod lenient {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serialize, Serializer};

    struct TextVisitor;

    impl Visitor<'_> for TextVisitor {
        type Value = Option<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let v = v.trim();
            Ok((!v.is_empty()).then(|| v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    pub mod opt_string {
        use super::{Deserializer, Serialize, Serializer, TextVisitor};

        pub fn serialize<S: Serializer>(v: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
            v.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
            d.deserialize_any(TextVisitor)
        }
    }

    pub mod opt_path {
        use std::path::PathBuf;

        use super::{Deserializer, Serialize, Serializer, TextVisitor};

        pub fn serialize<S: Serializer>(v: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
            v.serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
            Ok(d.deserialize_any(TextVisitor)?.map(PathBuf::from))
        }
    }
}
