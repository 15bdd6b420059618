mod settings;

pub use settings::{
    AuthConfig, ConnectionConfig, EndpointConfig, LogFormat, LoggingConfig, NotificationsConfig,
    Settings, VideoConfig,
};
