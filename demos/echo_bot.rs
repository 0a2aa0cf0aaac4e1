//! Minimal Twitch chat bot.
//!
//! Demonstrates using the SDK to build a bot that:
//! - Connects to Twitch chat (anonymously, or with an oauth token)
//! - Joins a channel
//! - Responds to !echo and !ping commands
//! - Shows how to handle events
//!
//! Usage:
//!   cargo run --example echo_bot -- --channel "#somechannel"
//!   cargo run --example echo_bot -- --channel "#mychannel" \
//!       --username mybot --token oauth:abcdef
//!
//! Without credentials the bot connects read-only as a justinfan user.

use anyhow::Result;
use clap::Parser;
use tmi_sdk::{Client, ClientOptions, Event, IdentityOptions};

#[derive(Parser)]
#[command(name = "echo-bot", about = "Minimal Twitch chat echo bot")]
struct Args {
    /// Channel to join
    #[arg(long, default_value = "#twitchdev")]
    channel: String,

    /// Bot username (omit for anonymous read-only chat)
    #[arg(long)]
    username: Option<String>,

    /// OAuth token, e.g. oauth:abcdef
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let read_only = args.username.is_none();

    let client = Client::new(ClientOptions {
        channels: vec![args.channel.clone()],
        identity: IdentityOptions {
            username: args.username,
            password: args.token,
            ..Default::default()
        },
        ..Default::default()
    });

    client.on("connected", |event| {
        if let Event::Connected { server, port } = event {
            println!("* connected to {server}:{port}");
        }
    });
    client.on("join", |event| {
        if let Event::Join {
            channel,
            username,
            is_self,
        } = event
        {
            if *is_self {
                println!("* joined {channel} as {username}");
            }
        }
    });
    client.on("disconnected", |event| {
        if let Event::Disconnected { reason } = event {
            println!("* disconnected: {reason}");
        }
    });

    let responder = client.clone();
    client.on_async("chat", move |event| {
        let client = responder.clone();
        Box::pin(async move {
            let Event::Message {
                channel,
                userstate,
                text,
                is_self,
            } = event
            else {
                return Ok(());
            };
            let sender = userstate
                .get("display-name")
                .and_then(|t| t.as_str())
                .unwrap_or("?")
                .to_string();
            println!("[{channel}] <{sender}> {text}");

            if is_self || client.username().starts_with("justinfan") {
                return Ok(());
            }
            if let Some(rest) = text.strip_prefix("!echo ") {
                client.say(&channel, rest).await?;
            } else if text == "!ping" {
                let latency = client.ping().await?;
                client
                    .say(&channel, &format!("pong ({} ms)", latency.as_millis()))
                    .await?;
            }
            Ok(())
        })
    });

    client.connect().await?;
    if read_only {
        println!("* running read-only (no --username/--token given)");
    }

    tokio::signal::ctrl_c().await?;
    client.disconnect().await?;
    Ok(())
}
