use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Actuator {actuator_id} not found on device {device_id}")]
    ActuatorNotFound {
        device_id: String,
        actuator_id: String,
    },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Transport unavailable")]
    TransportUnavailable,

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotFound(_) | Error::ActuatorNotFound { .. } | Error::CommandNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
