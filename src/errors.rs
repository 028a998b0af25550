use thiserror::Error;

#[derive(Error, Debug)]
pub enum EdgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Device error: {message}")]
    Device { message: String },

    #[error("FFmpeg error: {message}")]
    Ffmpeg { message: String },

    #[error("Vision service error: {message}")]
    Vision { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Invariant violated: {message}")]
    Invariant { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("Network address parse error: {source}")]
    AddrParse {
        #[from]
        source: std::net::AddrParseError,
    },

    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },

    #[error("MQTT client error: {source}")]
    MqttClient {
        #[from]
        source: rumqttc::ClientError,
    },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },
}

impl EdgeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device { message: message.into() }
    }

    pub fn ffmpeg(message: impl Into<String>) -> Self {
        Self::Ffmpeg { message: message.into() }
    }

    pub fn vision(message: impl Into<String>) -> Self {
        Self::Vision { message: message.into() }
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant { message: message.into() }
    }

    /// Transient device errors are retried on the next probe cycle and never escalated
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Device { .. } | Self::Http { .. } | Self::Io { .. })
    }
}

pub type Result<T> = std::result::Result<T, EdgeError>;
