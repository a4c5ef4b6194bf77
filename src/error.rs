use thiserror::Error;

/// Network or HTTP-level failure talking to the Thermowatt cloud.
///
/// Never fatal on its own: the caller abandons the current cycle and tries
/// again on the next tick or message. Boot discovery is the one exception.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloud returned HTTP {status}")]
    Status { status: u16 },

    #[error("failed to decode cloud response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid request URL: {0}")]
    Url(String),
}

/// Authentication failures. Fatal at boot, halting in steady state.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cloud rejected the operator credentials")]
    LoginRejected,

    #[error("no session tokens available; login required")]
    NotAuthenticated,

    #[error("refresh token rejected by the cloud")]
    RefreshRejected,

    #[error("request still unauthorized after a token refresh")]
    StillUnauthorized,

    #[error("cloud calls halted after an unrecoverable authentication failure")]
    Halted,
}

/// Outcome of any call routed through the auth session.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl CloudError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }
}

/// A local broker topic that does not match any shape the bridge handles.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("invalid topic {topic:?}: {reason}")]
    Malformed { topic: String, reason: &'static str },
}

/// Why a local command message was not applied.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("topic {0:?} is not a command topic")]
    NotACommand(String),

    #[error("invalid temperature payload {0:?}")]
    InvalidTemperature(String),

    #[error("unknown mode {0:?}")]
    UnknownMode(String),
}

/// Why a cloud status event was not forwarded.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("topic {0:?} is not a status topic")]
    NotAStatus(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Failure handing a message to an MQTT broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("timed out waiting for the broker connection")]
    ConnectTimeout,
}

/// Device inventory could not be established.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("cloud inventory lists no water heaters")]
    Empty,
}

/// Fatal boot failures, each mapped to its own process exit status.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("local broker unavailable: {0}")]
    LocalBroker(BrokerError),

    #[error("cloud login failed: {0}")]
    Auth(CloudError),

    #[error("device discovery failed: {0}")]
    Discovery(DiscoveryError),

    #[error("cloud push channel setup failed: {0:#}")]
    PushChannel(anyhow::Error),

    #[error("operator API failed to bind: {0}")]
    Api(std::io::Error),
}

impl BootError {
    pub fn exit_code(&self) -> u8 {
        match self {
            BootError::Config(_) => 2,
            BootError::LocalBroker(_) => 3,
            BootError::Auth(_) => 4,
            BootError::Discovery(_) => 5,
            BootError::PushChannel(_) => 6,
            BootError::Api(_) => 7,
        }
    }
}

impl From<DiscoveryError> for BootError {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::Cloud(e @ CloudError::Auth(_)) => BootError::Auth(e),
            other => BootError::Discovery(other),
        }
    }
}
