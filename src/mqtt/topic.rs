use crate::error::TopicError;

/// Root segment shared by every per-device topic.
pub const DEVICE_PREFIX: &str = "P";
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// What a per-device topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// `P/{serial}/STATUS`
    Status,
    /// `P/{serial}/CMD/TEMP`
    SetTemperature,
    /// `P/{serial}/CMD/MODE`
    SetMode,
    /// `P/{serial}/CMD/GET_STATUS` (cloud channel only)
    GetStatus,
}

/// Parsed per-device topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub serial: String,
    pub kind: TopicKind,
}

impl ParsedTopic {
    pub fn is_command(&self) -> bool {
        matches!(self.kind, TopicKind::SetTemperature | TopicKind::SetMode)
    }
}

/// Parse `P/{serial}/STATUS` or `P/{serial}/CMD/{TEMP|MODE|GET_STATUS}`.
pub fn parse_topic(topic: &str) -> Result<ParsedTopic, TopicError> {
    let malformed = |reason| TopicError::Malformed {
        topic: topic.to_owned(),
        reason,
    };

    let mut parts = topic.split('/');
    if parts.next() != Some(DEVICE_PREFIX) {
        return Err(malformed("expected 'P' prefix"));
    }

    let serial = parts.next().unwrap_or_default();
    if serial.is_empty() {
        return Err(malformed("serial cannot be empty"));
    }
    if serial.contains(['+', '#']) {
        return Err(malformed("serial cannot contain wildcards"));
    }

    let rest: Vec<&str> = parts.collect();
    let kind = match rest.as_slice() {
        ["STATUS"] => TopicKind::Status,
        ["CMD", "TEMP"] => TopicKind::SetTemperature,
        ["CMD", "MODE"] => TopicKind::SetMode,
        ["CMD", "GET_STATUS"] => TopicKind::GetStatus,
        [] => return Err(malformed("missing message kind")),
        _ => return Err(malformed("unknown message kind")),
    };

    Ok(ParsedTopic {
        serial: serial.to_owned(),
        kind,
    })
}

pub fn status_topic(serial: &str) -> String {
    format!("{DEVICE_PREFIX}/{serial}/STATUS")
}

pub fn temperature_command_topic(serial: &str) -> String {
    format!("{DEVICE_PREFIX}/{serial}/CMD/TEMP")
}

pub fn mode_command_topic(serial: &str) -> String {
    format!("{DEVICE_PREFIX}/{serial}/CMD/MODE")
}

pub fn get_status_topic(serial: &str) -> String {
    format!("{DEVICE_PREFIX}/{serial}/CMD/GET_STATUS")
}

pub fn discovery_topic(serial: &str) -> String {
    format!("{DISCOVERY_PREFIX}/water_heater/{serial}/config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_topic() {
        let parsed = parse_topic("P/A1/STATUS").unwrap();
        assert_eq!(parsed.serial, "A1");
        assert_eq!(parsed.kind, TopicKind::Status);
        assert!(!parsed.is_command());
    }

    #[test]
    fn parses_command_topics() {
        let temp = parse_topic("P/A1/CMD/TEMP").unwrap();
        assert_eq!(temp.kind, TopicKind::SetTemperature);
        assert!(temp.is_command());

        let mode = parse_topic("P/0012AB/CMD/MODE").unwrap();
        assert_eq!(mode.serial, "0012AB");
        assert_eq!(mode.kind, TopicKind::SetMode);

        assert_eq!(parse_topic("P/A1/CMD/GET_STATUS").unwrap().kind, TopicKind::GetStatus);
    }

    #[test]
    fn builders_round_trip_through_parser() {
        assert_eq!(parse_topic(&status_topic("X9")).unwrap().kind, TopicKind::Status);
        assert_eq!(
            parse_topic(&temperature_command_topic("X9")).unwrap().kind,
            TopicKind::SetTemperature
        );
        assert_eq!(
            parse_topic(&mode_command_topic("X9")).unwrap().kind,
            TopicKind::SetMode
        );
        assert_eq!(
            discovery_topic("X9"),
            "homeassistant/water_heater/X9/config"
        );
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert!(parse_topic("Q/A1/STATUS").is_err());
        assert!(parse_topic("").is_err());
    }

    #[test]
    fn rejects_empty_serial() {
        let err = parse_topic("P//STATUS").unwrap_err();
        assert!(err.to_string().contains("serial cannot be empty"));
        assert!(parse_topic("P").is_err());
    }

    #[test]
    fn rejects_missing_or_unknown_kind() {
        assert!(parse_topic("P/A1").is_err());
        assert!(parse_topic("P/A1/CMD").is_err());
        assert!(parse_topic("P/A1/CMD/SET_STATUS").is_err());
        assert!(parse_topic("P/A1/STATUS/extra").is_err());
    }

    #[test]
    fn rejects_wildcard_serial() {
        assert!(parse_topic("P/+/STATUS").is_err());
        assert!(parse_topic("P/#/CMD/TEMP").is_err());
    }
}
