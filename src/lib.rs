//! Twitch Messaging Interface (TMI) chat client.
//!
//! Maintains a persistent, authenticated TLS connection to Twitch's IRC
//! endpoint, parses IRCv3 tagged messages into typed [`Event`]s, spaces
//! outbound traffic to stay inside Twitch's per-connection rate limits, and
//! turns the fire-and-forget NOTICE protocol into awaitable command results.
//!
//! # Example
//!
//! ```rust,no_run
//! use tmi_sdk::{Client, ClientOptions, Event, IdentityOptions};
//!
//! # async fn run() -> tmi_sdk::Result<()> {
//! let client = Client::new(ClientOptions {
//!     channels: vec!["#mychannel".into()],
//!     identity: IdentityOptions {
//!         username: Some("mybot".into()),
//!         password: Some("oauth:abcdef".into()),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! });
//!
//! client.on("chat", |event| {
//!     if let Event::Message { channel, text, .. } = event {
//!         println!("[{channel}] {text}");
//!     }
//! });
//!
//! client.connect().await?;
//! client.say("#mychannel", "hello chat").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Connecting without an identity uses a random `justinfan` login: read-only
//! chat, no speech or moderation.

mod commands;
mod handlers;

pub mod client;
pub mod emitter;
pub mod error;
pub mod event;
pub mod irc;
pub mod options;
pub mod queue;
pub mod tags;
pub mod utils;

pub use client::{ChannelState, Client, ReadyState};
pub use emitter::{EventEmitter, ListenerError, ListenerId};
pub use error::{Error, Result};
pub use event::{Event, SubMethods};
pub use irc::IrcMessage;
pub use options::{
    ClientOptions, ConnectionOptions, IdentityOptions, LogLevel, LoggingOptions,
};
pub use queue::{MessageQueue, Ticket};
pub use tags::{BadgeMap, EmoteMap, Tag, TagMap};
