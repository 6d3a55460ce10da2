pub mod env;

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use url::Url;

use crate::tls::TlsConfig;

/// Environment variables the Proxmox credentials fall back to when the
/// configuration file does not set them.
pub const ENDPOINT_ENV: &str = "PROXMOX_URL";
pub const USERNAME_ENV: &str = "USER";
pub const PASSWORD_ENV: &str = "PASS";

fn default_endpoint() -> String {
    "https://default-proxmox-url:8006/api2/json".to_string()
}

fn default_username() -> String {
    "default-user".to_string()
}

fn default_password() -> String {
    "default-password".to_string()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_subnet() -> Ipv4Net {
    Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 210, 0), 24)
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/shared/scraper.output")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9108))
}

const fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxmoxConfig {
    /// Base URL of the API, e.g. `https://pve:8006/api2/json`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// User to authenticate as, including the realm, e.g. `monitor@pve`.
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Timeout of every single API request.
    #[serde(default = "default_timeout", with = "humanize::duration::serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            username: default_username(),
            password: default_password(),
            timeout: default_timeout(),
            tls: TlsConfig::default(),
        }
    }
}

impl fmt::Debug for ProxmoxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxmoxConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"**REDACTED**")
            .field("timeout", &self.timeout)
            .field("tls", &self.tls)
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// How often the VM list is refreshed.
    #[serde(default = "default_interval", with = "humanize::duration::serde")]
    pub interval: Duration,

    /// Only guest addresses inside this network become targets.
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Net,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            subnet: default_subnet(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// File shared by the discovery loop and the responder.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResponderConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// How long to wait for the client's request before answering anyway.
    #[serde(default = "default_io_timeout", with = "humanize::duration::serde")]
    pub read_timeout: Duration,

    #[serde(default = "default_io_timeout", with = "humanize::duration::serde")]
    pub write_timeout: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxmox: ProxmoxConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub responder: ResponderConfig,
}

impl Config {
    /// Load the config file if there is one, the environment fills in the
    /// Proxmox credentials the file leaves out, then built-in defaults apply.
    pub fn load(path: Option<&Path>, vars: &HashMap<String, String>) -> Result<Config, Vec<String>> {
        let text = match path {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|err| vec![format!("read config file {path:?} failed, {err}")])?,
            None => String::new(),
        };

        Config::parse(&text, vars)
    }

    pub fn parse(text: &str, vars: &HashMap<String, String>) -> Result<Config, Vec<String>> {
        let text = env::interpolate(text, vars)?;

        let mut value = match serde_yaml::from_str::<Value>(&text)
            .map_err(|err| vec![format!("parse config failed, {err}")])?
        {
            Value::Null => Value::Mapping(Mapping::new()),
            value => value,
        };

        fill_from_env(&mut value, vars);

        let config: Config =
            serde_yaml::from_value(value).map_err(|err| vec![format!("invalid config, {err}")])?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errs = Vec::new();

        match Url::parse(&self.proxmox.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errs.push(format!(
                "proxmox.endpoint must be http or https, got {:?}",
                url.scheme()
            )),
            Err(err) => errs.push(format!(
                "proxmox.endpoint {:?} is not a valid URL, {err}",
                self.proxmox.endpoint
            )),
        }

        if self.proxmox.timeout.is_zero() {
            errs.push("proxmox.timeout must be positive".to_string());
        }

        if self.discovery.interval.is_zero() {
            errs.push("discovery.interval must be positive".to_string());
        }

        if self.cache.path.file_name().is_none() {
            errs.push(format!("cache.path {:?} must name a file", self.cache.path));
        }

        if errs.is_empty() { Ok(()) } else { Err(errs) }
    }
}

fn fill_from_env(value: &mut Value, vars: &HashMap<String, String>) {
    let Value::Mapping(root) = value else {
        // not a mapping, let the deserializer complain
        return;
    };

    let proxmox = root
        .entry(Value::from("proxmox"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if proxmox.is_null() {
        *proxmox = Value::Mapping(Mapping::new());
    }

    let Value::Mapping(proxmox) = proxmox else {
        return;
    };

    for (field, name) in [
        ("endpoint", ENDPOINT_ENV),
        ("username", USERNAME_ENV),
        ("password", PASSWORD_ENV),
    ] {
        let key = Value::from(field);
        if proxmox.contains_key(&key) {
            continue;
        }

        if let Some(value) = vars.get(name) {
            proxmox.insert(key, Value::from(value.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = Config::parse("", &HashMap::new()).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(
            config.proxmox.endpoint,
            "https://default-proxmox-url:8006/api2/json"
        );
        assert_eq!(config.proxmox.username, "default-user");
        assert_eq!(config.proxmox.password, "default-password");
        assert_eq!(config.discovery.interval, Duration::from_secs(60));
        assert_eq!(config.discovery.subnet.to_string(), "192.168.210.0/24");
        assert_eq!(config.cache.path, PathBuf::from("/shared/scraper.output"));
        assert_eq!(config.responder.listen, SocketAddr::from(([0, 0, 0, 0], 9108)));
        assert!(!config.proxmox.tls.verify_certificate);
    }

    #[test]
    fn credentials_from_env() {
        let vars = vars(&[
            (ENDPOINT_ENV, "https://10.0.0.1:8006/api2/json"),
            (USERNAME_ENV, "monitor@pve"),
            (PASSWORD_ENV, "secret"),
        ]);

        let config = Config::parse("", &vars).unwrap();
        assert_eq!(config.proxmox.endpoint, "https://10.0.0.1:8006/api2/json");
        assert_eq!(config.proxmox.username, "monitor@pve");
        assert_eq!(config.proxmox.password, "secret");
    }

    #[test]
    fn file_wins_over_env() {
        let vars = vars(&[(USERNAME_ENV, "root"), (PASSWORD_ENV, "secret")]);
        let text = r#"
proxmox:
  username: monitor@pve
  timeout: 3s
discovery:
  interval: 30s
  subnet: 10.10.0.0/16
cache:
  path: /tmp/targets.json
responder:
  listen: 127.0.0.1:19108
"#;

        let config = Config::parse(text, &vars).unwrap();
        assert_eq!(config.proxmox.username, "monitor@pve");
        assert_eq!(config.proxmox.password, "secret");
        assert_eq!(config.proxmox.timeout, Duration::from_secs(3));
        assert_eq!(config.discovery.interval, Duration::from_secs(30));
        assert_eq!(config.discovery.subnet.to_string(), "10.10.0.0/16");
        assert_eq!(config.cache.path, PathBuf::from("/tmp/targets.json"));
        assert_eq!(
            config.responder.listen,
            SocketAddr::from(([127, 0, 0, 1], 19108))
        );
    }

    #[test]
    fn interpolated() {
        let vars = vars(&[("PVE_HOST", "pve1"), ("PVE_PASSWORD", "hunter2")]);
        let text = r#"
proxmox:
  endpoint: https://${PVE_HOST}:8006/api2/json
  password: ${PVE_PASSWORD:?password required}
"#;

        let config = Config::parse(text, &vars).unwrap();
        assert_eq!(config.proxmox.endpoint, "https://pve1:8006/api2/json");
        assert_eq!(config.proxmox.password, "hunter2");

        let errs = Config::parse("proxmox:\n  password: ${NOPE:?required}\n", &vars)
            .unwrap_err();
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn invalid() {
        let vars = HashMap::new();

        let errs = Config::parse("proxmox:\n  endpoint: ftp://pve\n", &vars).unwrap_err();
        assert!(errs[0].contains("http or https"), "{errs:?}");

        let errs = Config::parse("discovery:\n  interval: 0s\n", &vars).unwrap_err();
        assert!(errs[0].contains("interval"), "{errs:?}");

        let errs = Config::parse("unknown: true\n", &vars).unwrap_err();
        assert!(errs[0].contains("unknown"), "{errs:?}");

        assert!(Config::parse("discovery:\n  subnet: fe80::/64\n", &vars).is_err());
    }

    #[test]
    fn password_redacted() {
        let config = ProxmoxConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };

        let output = format!("{config:?}");
        assert!(!output.contains("hunter2"), "{output}");
    }
}
