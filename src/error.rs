use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    // Admission errors
    #[error("Connection capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    // Room errors
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),
    #[error("Room is full: {0}")]
    RoomFull(String),
    #[error("Room is still referenced by live connections: {0}")]
    RoomInUse(String),

    // Routing rejections
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Rate limited for message type {0}")]
    RateLimited(String),
    #[error("Content blocked: {0}")]
    ContentBlocked(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // Infrastructure errors
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HubError {
    /// Stable reason code reported to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::AuthenticationFailed(_) => "UNAUTHORIZED",
            Self::RoomNotFound(_) => "ROOM_NOT_FOUND",
            Self::RoomAlreadyExists(_) => "ROOM_ALREADY_EXISTS",
            Self::RoomFull(_) => "ROOM_FULL",
            Self::RoomInUse(_) => "ROOM_IN_USE",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::ContentBlocked(_) => "CONTENT_BLOCKED",
            Self::InvalidFrame(_) => "INVALID_FRAME",
            Self::UpstreamUnavailable(_) | Self::Serialization(_) | Self::Config(_) => "TRY_AGAIN",
        }
    }

    /// Whether the error is an infrastructure failure rather than a rejected action
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::Serialization(_) | Self::Config(_)
        )
    }

    /// Text safe to hand to a client; infrastructure detail never leaves the process
    pub fn client_message(&self) -> String {
        if self.is_infrastructure() {
            "Temporary server problem, please try again".to_string()
        } else {
            self.to_string()
        }
    }
}

// Generic result type for the hub
pub type Result<T> = std::result::Result<T, HubError>;
