// Environment-driven configuration, parsed once at startup. Anything
// unparseable is fatal before any socket binds (exit code 1).

use base64::Engine;
use std::time::Duration;

/// Well-known public channel key, base64 `1PG7OiApB1nwvP+rz05pAQ==`.
pub const DEFAULT_CHANNEL_KEY: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name}: invalid value `{value}`: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub root_topic: String,
    pub tls_enabled: bool,
    pub tls_insecure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RadioEndpoint {
    Tcp { host: String, port: u16 },
    Serial { device: String },
}

#[derive(Debug, Clone)]
pub struct RadioConfig {
    pub endpoint: Option<RadioEndpoint>,
    pub commands_enabled: bool,
    pub stats_channel: u32,
    pub dm_byte_cap: usize,
    pub inter_chunk_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub subscription_hour: u32,
    pub subscription_minute: u32,
    pub broadcast_enabled: bool,
    pub broadcast_hour: u32,
    pub broadcast_minute: u32,
    pub broadcast_channel: u32,
}

#[derive(Debug, Clone)]
pub struct GrouperConfig {
    pub window: Duration,
    pub quiescence: Duration,
    pub late_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database_url: String,
    pub api_host: String,
    pub api_port: u16,
    pub radio: RadioConfig,
    pub schedule: ScheduleConfig,
    pub grouper: GrouperConfig,
    /// Decoded decryption keys, in configured order. 16 or 32 bytes each.
    pub decryption_keys: Vec<Vec<u8>>,
    pub include_default_key: bool,
    pub log_level: String,
}

fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value,
        reason: e.to_string(),
    })
}

fn var_parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(v) => parse(name, v),
        None => Ok(default),
    }
}

fn var_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: v,
                reason: "expected a boolean".into(),
            }),
        },
    }
}

/// Expands a configured key to cipher length. Single-byte keys are the
/// shorthand for the default channel key family: `0x01` is the default key
/// itself, `0x02`..`0x0a` replace its last byte with `last + (n - 1)`.
fn expand_key(name: &'static str, raw: &str, bytes: Vec<u8>) -> Result<Vec<u8>, ConfigError> {
    match bytes.len() {
        16 | 32 => Ok(bytes),
        1 if (1..=10).contains(&bytes[0]) => {
            let mut k = DEFAULT_CHANNEL_KEY.to_vec();
            let last = k.len() - 1;
            k[last] = k[last].wrapping_add(bytes[0] - 1);
            Ok(k)
        }
        n => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
            reason: format!("decoded to {n} bytes, expected 16 or 32"),
        }),
    }
}

fn parse_keys(name: &'static str, csv: &str) -> Result<Vec<Vec<u8>>, ConfigError> {
    let mut keys = Vec::new();
    for part in csv.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(part)
            .map_err(|e| ConfigError::Invalid {
                name,
                value: part.to_string(),
                reason: format!("bad base64: {e}"),
            })?;
        keys.push(expand_key(name, part, decoded)?);
    }
    Ok(keys)
}

fn parse_radio_url(raw: &str) -> Result<RadioEndpoint, ConfigError> {
    const NAME: &str = "MESHTASTIC_CONNECTION_URL";
    if let Some(rest) = raw.strip_prefix("tcp://") {
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), parse::<u16>(NAME, p.to_string())?),
            None => (rest.to_string(), 4403),
        };
        if host.is_empty() {
            return Err(ConfigError::Invalid {
                name: NAME,
                value: raw.to_string(),
                reason: "empty host".into(),
            });
        }
        Ok(RadioEndpoint::Tcp { host, port })
    } else if let Some(dev) = raw.strip_prefix("serial://") {
        Ok(RadioEndpoint::Serial {
            device: dev.to_string(),
        })
    } else {
        Err(ConfigError::Invalid {
            name: NAME,
            value: raw.to_string(),
            reason: "expected tcp://host[:port] or serial:///dev/...".into(),
        })
    }
}

/// `MQTT_SERVER` may be a bare host or `host:port`.
fn split_host_port(raw: &str) -> (String, Option<u16>) {
    match raw.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(p) => (host.to_string(), Some(p)),
            Err(_) => (raw.to_string(), None),
        },
        None => (raw.to_string(), None),
    }
}

fn check_clock(name: &'static str, value: u32, max: u32) -> Result<u32, ConfigError> {
    if value > max {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: format!("must be <= {max}"),
        });
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = var("MQTT_SERVER").ok_or(ConfigError::Missing("MQTT_SERVER"))?;
        let (host, server_port) = split_host_port(&server);
        let mqtt = MqttConfig {
            host,
            port: var_parsed("MQTT_PORT", server_port.unwrap_or(1883))?,
            username: var("MQTT_USERNAME"),
            password: var("MQTT_PASSWORD"),
            root_topic: var("MQTT_ROOT_TOPIC").unwrap_or_else(|| "msh".into()),
            tls_enabled: var_bool("MQTT_TLS_ENABLED", false)?,
            tls_insecure: var_bool("MQTT_TLS_INSECURE", false)?,
        };

        let radio = RadioConfig {
            endpoint: var("MESHTASTIC_CONNECTION_URL")
                .map(|v| parse_radio_url(&v))
                .transpose()?,
            commands_enabled: var_bool("MESHTASTIC_COMMANDS_ENABLED", false)?,
            stats_channel: check_clock(
                "MESHTASTIC_STATS_CHANNEL_ID",
                var_parsed("MESHTASTIC_STATS_CHANNEL_ID", 0u32)?,
                7,
            )?,
            dm_byte_cap: var_parsed("MESHTASTIC_DM_BYTE_CAP", 200usize)?,
            inter_chunk_delay: Duration::from_secs(var_parsed(
                "MESHTASTIC_INTER_CHUNK_DELAY_SECONDS",
                5u64,
            )?),
        };
        if radio.commands_enabled && radio.endpoint.is_none() {
            return Err(ConfigError::Missing("MESHTASTIC_CONNECTION_URL"));
        }

        let schedule = ScheduleConfig {
            subscription_hour: check_clock(
                "SUBSCRIPTION_SEND_HOUR",
                var_parsed("SUBSCRIPTION_SEND_HOUR", 9u32)?,
                23,
            )?,
            subscription_minute: check_clock(
                "SUBSCRIPTION_SEND_MINUTE",
                var_parsed("SUBSCRIPTION_SEND_MINUTE", 0u32)?,
                59,
            )?,
            broadcast_enabled: var_bool("DAILY_BROADCAST_ENABLED", false)?,
            broadcast_hour: check_clock(
                "DAILY_BROADCAST_HOUR",
                var_parsed("DAILY_BROADCAST_HOUR", 21u32)?,
                23,
            )?,
            broadcast_minute: check_clock(
                "DAILY_BROADCAST_MINUTE",
                var_parsed("DAILY_BROADCAST_MINUTE", 0u32)?,
                59,
            )?,
            broadcast_channel: check_clock(
                "DAILY_BROADCAST_CHANNEL",
                var_parsed("DAILY_BROADCAST_CHANNEL", 0u32)?,
                7,
            )?,
        };

        let grouper = GrouperConfig {
            window: Duration::from_secs(var_parsed("GROUPING_WINDOW_SECONDS", 10u64)?),
            quiescence: Duration::from_secs(var_parsed("GROUPING_QUIESCENCE_SECONDS", 2u64)?),
            late_retention: Duration::from_secs(
                var_parsed("LATE_RETENTION_HOURS", 24u64)? * 3600,
            ),
        };

        Ok(Config {
            mqtt,
            database_url: var("DATABASE_URL").unwrap_or_else(|| "meshcover.db".into()),
            api_host: var("API_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            api_port: var_parsed("API_PORT", 8080u16)?,
            radio,
            schedule,
            grouper,
            decryption_keys: match var("MESHTASTIC_DECRYPTION_KEYS") {
                Some(csv) => parse_keys("MESHTASTIC_DECRYPTION_KEYS", &csv)?,
                None => Vec::new(),
            },
            include_default_key: var_bool("MESHTASTIC_INCLUDE_DEFAULT_KEY", true)?,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        })
    }

    /// Path portion of `DATABASE_URL`. Accepts a bare path, `sqlite://PATH`
    /// or `:memory:`; anything else is a config error at open time.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_matches_wellknown_base64() {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode("1PG7OiApB1nwvP+rz05pAQ==")
            .unwrap();
        assert_eq!(decoded, DEFAULT_CHANNEL_KEY);
    }

    #[test]
    fn single_byte_key_expands_to_default_family() {
        let k = expand_key("K", "AQ==", vec![1]).unwrap();
        assert_eq!(k, DEFAULT_CHANNEL_KEY.to_vec());
        let k2 = expand_key("K", "Ag==", vec![2]).unwrap();
        assert_eq!(k2[15], DEFAULT_CHANNEL_KEY[15] + 1);
        assert_eq!(&k2[..15], &DEFAULT_CHANNEL_KEY[..15]);
    }

    #[test]
    fn rejects_odd_key_lengths() {
        assert!(expand_key("K", "xx", vec![0u8; 7]).is_err());
        assert!(expand_key("K", "xx", vec![0u8; 24]).is_err());
    }

    #[test]
    fn parses_key_csv_with_whitespace() {
        let keys = parse_keys("K", "1PG7OiApB1nwvP+rz05pAQ==, AQ==").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
    }

    #[test]
    fn radio_url_tcp_default_port() {
        assert_eq!(
            parse_radio_url("tcp://radio.local").unwrap(),
            RadioEndpoint::Tcp {
                host: "radio.local".into(),
                port: 4403
            }
        );
        assert_eq!(
            parse_radio_url("tcp://10.0.0.5:4404").unwrap(),
            RadioEndpoint::Tcp {
                host: "10.0.0.5".into(),
                port: 4404
            }
        );
    }

    #[test]
    fn radio_url_serial_and_garbage() {
        assert_eq!(
            parse_radio_url("serial:///dev/ttyUSB0").unwrap(),
            RadioEndpoint::Serial {
                device: "/dev/ttyUSB0".into()
            }
        );
        assert!(parse_radio_url("udp://nope").is_err());
    }

    #[test]
    fn mqtt_server_accepts_host_and_host_port() {
        assert_eq!(split_host_port("broker.example.net"), ("broker.example.net".into(), None));
        assert_eq!(
            split_host_port("broker.example.net:8883"),
            ("broker.example.net".into(), Some(8883))
        );
        // A stray colon with a non-numeric tail is left alone.
        assert_eq!(split_host_port("weird:host"), ("weird:host".into(), None));
    }
}
