//! Client configuration.
//!
//! Construct in code with `Default` plus struct update, or deserialize from a
//! config file; every field has a serde default so partial configs work.
//!
//! ```rust
//! use tmi_sdk::{ClientOptions, IdentityOptions};
//!
//! let opts = ClientOptions {
//!     channels: vec!["#mychannel".into()],
//!     identity: IdentityOptions {
//!         username: Some("mybot".into()),
//!         password: Some("oauth:abcdef".into()),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Channels to join after login; normalized on ingestion.
    pub channels: Vec<String>,
    pub connection: ConnectionOptions,
    pub identity: IdentityOptions,
    pub logging: LoggingOptions,
    /// Channel used as the PRIVMSG target for account-scoped commands
    /// (whisper, color).
    pub global_default_channel: String,
    /// Skip the `twitch.tv/membership` capability entirely.
    pub skip_membership: bool,
    pub request_tags: bool,
    pub request_commands: bool,
    pub request_membership: bool,
    /// Join `channels` automatically when the connection comes up.
    pub join_existing_channels: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            connection: ConnectionOptions::default(),
            identity: IdentityOptions::default(),
            logging: LoggingOptions::default(),
            global_default_channel: "#tmijs".to_string(),
            skip_membership: false,
            request_tags: true,
            request_commands: true,
            request_membership: true,
            join_existing_channels: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub server: String,
    pub port: u16,
    /// TLS on the connection; plaintext is only useful against test servers.
    pub secure: bool,
    pub reconnect: bool,
    /// Base reconnect interval in milliseconds.
    pub reconnect_interval: u64,
    /// Multiplier applied to the backoff delay after each failed attempt.
    pub reconnect_decay: f64,
    /// Backoff ceiling in milliseconds.
    pub max_reconnect_interval: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Login handshake timeout in milliseconds.
    pub timeout: u64,
    /// How long a command waits for its correlated NOTICE, in milliseconds.
    pub command_timeout: u64,
    /// Keepalive PING cadence in seconds (floor 30).
    pub ping_interval: f64,
    /// How long to wait for the matching PONG, in seconds.
    pub ping_timeout: f64,
    /// Seconds between JOINs.
    pub join_interval: f64,
    /// Seconds between PRIVMSGs.
    pub message_interval: f64,
    /// Seconds between moderation commands.
    pub command_interval: f64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            server: "irc.chat.twitch.tv".to_string(),
            port: 6697,
            secure: true,
            reconnect: true,
            reconnect_interval: 1200,
            reconnect_decay: 1.5,
            max_reconnect_interval: 30_000,
            max_reconnect_attempts: None,
            timeout: 9999,
            command_timeout: 10_000,
            ping_interval: 240.0,
            ping_timeout: 10.0,
            join_interval: 2.0,
            message_interval: 1.5,
            command_interval: 0.15,
        }
    }
}

impl ConnectionOptions {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval)
    }

    pub fn join_interval(&self) -> Duration {
        Duration::from_secs_f64(self.join_interval)
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_secs_f64(self.message_interval)
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_secs_f64(self.command_interval)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityOptions {
    /// Login name; omitted for an anonymous (`justinfan`) connection.
    pub username: Option<String>,
    /// OAuth token, with or without the `oauth:` prefix.
    pub password: Option<String>,
    /// Unused by the connection runtime; carried for API consumers.
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Minimum level the client considers interesting. Subscriber setup is
    /// left to the application.
    pub level: LogLevel,
    /// Level chat lines are logged at.
    pub messages_level: LogLevel,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: LogLevel::Error,
            messages_level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Mapped to `error` when emitted through `tracing`.
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_twitch() {
        let opts = ClientOptions::default();
        assert_eq!(opts.connection.server, "irc.chat.twitch.tv");
        assert_eq!(opts.connection.port, 6697);
        assert!(opts.connection.secure);
        assert_eq!(opts.connection.command_timeout(), Duration::from_secs(10));
        assert_eq!(opts.global_default_channel, "#tmijs");
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let opts: ClientOptions = serde_json::from_str(
            r##"{"channels": ["#a"], "connection": {"secure": false, "port": 6667}}"##,
        )
        .unwrap();
        assert_eq!(opts.channels, vec!["#a"]);
        assert!(!opts.connection.secure);
        assert_eq!(opts.connection.port, 6667);
        assert_eq!(opts.connection.server, "irc.chat.twitch.tv");
    }
}
