//! Gateway Error Types

use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that stop the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid command-line or file configuration
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// The MQTT task has stopped and takes no more requests
    #[error("MQTT connection task has stopped")]
    MqttStopped,

    /// Broker refused the connection (bad credentials, client id, ...)
    #[error("MQTT broker refused the connection: {code}\n  Hint: check --mqtt-username / MQTT_PASSWORD")]
    MqttRefused { code: String },

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_names_the_code() {
        let err = GatewayError::MqttRefused {
            code: "NotAuthorized".into(),
        };
        assert!(err.to_string().contains("NotAuthorized"));
    }
}
