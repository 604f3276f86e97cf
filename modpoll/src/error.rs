use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    MQTTClientError(#[from] rumqttc::ClientError),

    #[cfg(feature = "rtu")]
    #[error(transparent)]
    SerialError(#[from] tokio_serial::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error(transparent)]
    CSVError(#[from] csv::Error),

    #[error(transparent)]
    HTTPError(#[from] reqwest::Error),

    #[error("No device found in the configuration")]
    ConfigEmpty,

    #[error("Invalid topic pattern {pattern:?}: {reason}")]
    InvalidTopicPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("Modbus transport {0:?} is not supported by this build")]
    UnsupportedTransport(&'static str),

    #[error("No Modbus transport selected (use --tcp, --udp or --rtu)")]
    NoTransport,

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}
