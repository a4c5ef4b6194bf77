use std::{path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};

use crate::dispatcher::InjectionPolicy;

/// Thermowatt's cloud IoT endpoint.
const DEFAULT_IOT_HOST: &str = "a29wru6dvi3p6q-ats.iot.eu-west-1.amazonaws.com";

/// Upper bound for every interval and window setting, in seconds.
const MAX_WINDOW_SECS: u64 = 86_400;

/// How authoritative status reaches the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// Poll `GET /status` for every device on a fixed interval.
    Pull,
    /// Subscribe to the cloud IoT endpoint over TLS.
    Push,
}

impl FromStr for StatusMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pull" => Ok(Self::Pull),
            "push" => Ok(Self::Push),
            other => bail!("unknown status mode: {other:?} (expected pull or push)"),
        }
    }
}

/// Client certificate material for the push channel.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub host: String,
    pub port: u16,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub thermowatt_email: String,
    pub thermowatt_password: String,
    pub thermowatt_base_url: String,
    /// Skip TLS verification for the cloud REST API.
    pub thermowatt_insecure_tls: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    /// Both set or both absent.
    pub mqtt_credentials: Option<(String, String)>,
    pub status_mode: StatusMode,
    /// Status polling interval in seconds (pull mode)
    pub poll_interval_secs: u64,
    /// Status suppression window after a command, in seconds
    pub cooldown_secs: u64,
    /// Extra suppression for Holiday commands, in seconds
    pub holiday_cooldown_buffer_secs: u64,
    pub injection_policy: InjectionPolicy,
    pub state_path: PathBuf,
    /// Present only in push mode
    pub push: Option<PushConfig>,
    pub server_host: String,
    pub server_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("missing required env var: {key}"))
        };
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let status_mode: StatusMode = optional("STATUS_MODE", "pull").parse()?;

        let mqtt_credentials = match (lookup("MQTT_USER"), lookup("MQTT_PASSWORD")) {
            (Some(user), Some(password)) => Some((user, password)),
            (None, None) => None,
            _ => bail!("MQTT_USER and MQTT_PASSWORD must be set together"),
        };

        let push = match status_mode {
            StatusMode::Pull => None,
            StatusMode::Push => Some(PushConfig {
                host: optional("AWS_IOT_HOST", DEFAULT_IOT_HOST),
                port: parse(&optional("AWS_IOT_PORT", "8883"), "AWS_IOT_PORT")?,
                ca_path: optional("AWS_IOT_CA", "root.pem").into(),
                cert_path: optional("AWS_IOT_CERT", "client.crt").into(),
                key_path: optional("AWS_IOT_KEY", "client.key").into(),
            }),
        };

        let config = Self {
            thermowatt_email: required("THERMOWATT_EMAIL")?,
            thermowatt_password: required("THERMOWATT_PASSWORD")?,
            thermowatt_base_url: optional("THERMOWATT_BASE_URL", "https://myapp-connectivity.com"),
            thermowatt_insecure_tls: parse(
                &optional("THERMOWATT_INSECURE_TLS", "false"),
                "THERMOWATT_INSECURE_TLS",
            )?,
            mqtt_host: optional("MQTT_HOST", "core-mosquitto"),
            mqtt_port: parse(&optional("MQTT_PORT", "1883"), "MQTT_PORT")?,
            mqtt_credentials,
            status_mode,
            poll_interval_secs: parse(&optional("POLL_INTERVAL_SECS", "60"), "POLL_INTERVAL_SECS")?,
            cooldown_secs: parse(&optional("COOLDOWN_SECS", "60"), "COOLDOWN_SECS")?,
            holiday_cooldown_buffer_secs: parse(
                &optional("HOLIDAY_COOLDOWN_BUFFER_SECS", "30"),
                "HOLIDAY_COOLDOWN_BUFFER_SECS",
            )?,
            injection_policy: optional("INJECTION_POLICY", "always").parse()?,
            state_path: optional("STATE_PATH", "thermowatt_state.json").into(),
            push,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: parse(&optional("SERVER_PORT", "8080"), "SERVER_PORT")?,
        };

        if config.poll_interval_secs == 0 {
            bail!("POLL_INTERVAL_SECS must be a positive integer");
        }
        for (key, value) in [
            ("POLL_INTERVAL_SECS", config.poll_interval_secs),
            ("COOLDOWN_SECS", config.cooldown_secs),
            ("HOLIDAY_COOLDOWN_BUFFER_SECS", config.holiday_cooldown_buffer_secs),
        ] {
            if value > MAX_WINDOW_SECS {
                bail!("{key} must not exceed {MAX_WINDOW_SECS} seconds, got {value}");
            }
        }
        Ok(config)
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} has an invalid value: {value:?}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    const CREDS: [(&str, &str); 2] = [
        ("THERMOWATT_EMAIL", "op@example.com"),
        ("THERMOWATT_PASSWORD", "secret"),
    ];

    #[test]
    fn defaults_apply_when_only_credentials_set() {
        let c = config(&CREDS).unwrap();
        assert_eq!(c.thermowatt_base_url, "https://myapp-connectivity.com");
        assert_eq!(c.mqtt_host, "core-mosquitto");
        assert_eq!(c.mqtt_port, 1883);
        assert_eq!(c.mqtt_credentials, None);
        assert_eq!(c.status_mode, StatusMode::Pull);
        assert_eq!(c.poll_interval_secs, 60);
        assert_eq!(c.cooldown_secs, 60);
        assert_eq!(c.holiday_cooldown_buffer_secs, 30);
        assert_eq!(c.injection_policy, InjectionPolicy::Always);
        assert_eq!(c.state_path, PathBuf::from("thermowatt_state.json"));
        assert!(c.push.is_none());
        assert_eq!(c.server_port, 8080);
        assert!(!c.thermowatt_insecure_tls);
    }

    #[test]
    fn missing_credentials_are_reported_by_name() {
        let err = config(&[("THERMOWATT_EMAIL", "op@example.com")]).unwrap_err();
        assert!(err.to_string().contains("THERMOWATT_PASSWORD"));
    }

    #[test]
    fn mqtt_credentials_must_come_in_pairs() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("MQTT_USER", "ha"));
        assert!(config(&pairs).is_err());

        pairs.push(("MQTT_PASSWORD", "pw"));
        let c = config(&pairs).unwrap();
        assert_eq!(c.mqtt_credentials, Some(("ha".into(), "pw".into())));
    }

    #[test]
    fn push_mode_defaults_to_vendor_endpoint_and_local_certificates() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("STATUS_MODE", "push"));
        let push = config(&pairs).unwrap().push.unwrap();
        assert_eq!(push.host, DEFAULT_IOT_HOST);
        assert_eq!(push.port, 8883);
        assert_eq!(push.ca_path, PathBuf::from("root.pem"));
        assert_eq!(push.cert_path, PathBuf::from("client.crt"));
        assert_eq!(push.key_path, PathBuf::from("client.key"));

        pairs.extend([
            ("AWS_IOT_HOST", "iot.example"),
            ("AWS_IOT_KEY", "/certs/client.key"),
        ]);
        let push = config(&pairs).unwrap().push.unwrap();
        assert_eq!(push.host, "iot.example");
        assert_eq!(push.key_path, PathBuf::from("/certs/client.key"));
    }

    #[test]
    fn invalid_numbers_and_enums_are_rejected() {
        for (key, value) in [
            ("MQTT_PORT", "not-a-port"),
            ("COOLDOWN_SECS", "-5"),
            ("POLL_INTERVAL_SECS", "0"),
            ("STATUS_MODE", "stream"),
            ("INJECTION_POLICY", "never"),
        ] {
            let mut pairs = CREDS.to_vec();
            pairs.push((key, value));
            assert!(config(&pairs).is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn oversized_windows_are_rejected() {
        for key in ["COOLDOWN_SECS", "HOLIDAY_COOLDOWN_BUFFER_SECS", "POLL_INTERVAL_SECS"] {
            let mut pairs = CREDS.to_vec();
            pairs.push((key, "18446744073709551615"));
            let err = config(&pairs).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }

        let mut pairs = CREDS.to_vec();
        pairs.push(("COOLDOWN_SECS", "86400"));
        assert_eq!(config(&pairs).unwrap().cooldown_secs, 86_400);
    }

    #[test]
    fn status_mode_is_case_insensitive() {
        assert_eq!("PUSH".parse::<StatusMode>().unwrap(), StatusMode::Push);
    }
}
