//! The command API: speech, moderation, room modes, membership, diagnostics.
//!
//! Every primitive follows the same template: canonicalize the channel, check
//! the connection is OPEN, check the identity may issue the command, enqueue
//! the formatted line on the right queue, and (when Twitch answers the
//! command) await the correlated reply under `command_timeout`.

use std::time::Duration;

use tokio::time::Instant;

use crate::client::{Client, CommandKind, Reply, PING_PAYLOAD};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::tags::{Tag, TagMap};
use crate::utils;

impl Client {
    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_open() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Speech, whispers, and moderation are unavailable to `justinfan`
    /// identities; JOIN/PART stay open to them.
    fn ensure_identified(&self) -> Result<()> {
        self.ensure_open()?;
        if self.inner.is_anonymous() {
            Err(Error::Anonymous)
        } else {
            Ok(())
        }
    }

    // -- speech -------------------------------------------------------------

    /// Send a chat message. Resolves as soon as the chunks are queued; bodies
    /// over 500 bytes are split on UTF-8 boundaries and sent spaced apart.
    pub async fn say(&self, channel: &str, message: &str) -> Result<(String, String)> {
        self.say_with_tags(channel, message, TagMap::new()).await
    }

    async fn say_with_tags(
        &self,
        channel: &str,
        message: &str,
        tags: TagMap,
    ) -> Result<(String, String)> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;

        let is_command = (message.starts_with('.') && !message.starts_with(".."))
            || message.starts_with('/')
            || message.starts_with('\\');
        if is_command {
            if message.get(1..4) == Some("me ") {
                return self.action(&channel, &message[4..]).await;
            }
            self.inner
                .send_command(Some(&channel), message, Some(&tags))
                .await?;
            return Ok((channel, message.to_string()));
        }

        self.inner
            .send_privmsg(channel.clone(), message.to_string(), tags)
            .await?;
        Ok((channel, message.to_string()))
    }

    /// Send a `/me` action message.
    pub async fn action(&self, channel: &str, message: &str) -> Result<(String, String)> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        let wrapped = format!("\u{1}ACTION {message}\u{1}");
        self.inner
            .send_privmsg(channel.clone(), wrapped, TagMap::new())
            .await?;
        Ok((channel, message.to_string()))
    }

    /// Reply to another message by id.
    pub async fn reply(
        &self,
        channel: &str,
        message: &str,
        parent_msg_id: &str,
    ) -> Result<(String, String)> {
        if parent_msg_id.is_empty() {
            return Err(Error::BadArgument("reply requires a parent message id"));
        }
        let mut tags = TagMap::new();
        tags.insert(
            "reply-parent-msg-id".to_string(),
            Tag::Str(parent_msg_id.to_string()),
        );
        self.say_with_tags(channel, message, tags).await
    }

    /// Post an announcement.
    pub async fn announce(&self, channel: &str, message: &str) -> Result<(String, String)> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        self.inner
            .send_command(Some(&channel), &format!("/announce {message}"), None)
            .await?;
        Ok((channel, message.to_string()))
    }

    /// Whisper a user. Twitch only reports whisper *failures*, so a quiet
    /// interval after the send counts as success.
    pub async fn whisper(&self, username: &str, message: &str) -> Result<(String, String)> {
        let target = utils::username(username);
        self.ensure_identified()?;
        if target == self.inner.username() {
            return Err(Error::BadArgument("cannot whisper the same account"));
        }
        let command = format!("/w {target} {message}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Whisper, None, &command);
        let global = self.inner.global_default_channel.clone();
        self.inner
            .send_command(Some(&global), &command, None)
            .await?;
        let quiet = Duration::from_secs(5).min(self.inner.opts.connection.command_timeout());
        match wait.wait_with_timeout(quiet).await {
            Ok(_) | Err(Error::Timeout { .. }) => {}
            Err(err) => return Err(err),
        }

        // No echo from the server; synthesize the self whisper events.
        let mut userstate = {
            let st = self.inner.state.lock().unwrap();
            st.globaluserstate.clone()
        };
        userstate.insert("message-type".to_string(), Tag::Str("whisper".to_string()));
        userstate.insert(
            "username".to_string(),
            Tag::Str(self.inner.username()),
        );
        self.inner.emitter.emit_many(
            &["whisper", "message"],
            &Event::Whisper {
                from: target.clone(),
                userstate,
                text: message.to_string(),
                is_self: true,
            },
        );
        Ok((target, message.to_string()))
    }

    // -- moderation ---------------------------------------------------------

    pub async fn ban(
        &self,
        channel: &str,
        username: &str,
        reason: Option<&str>,
    ) -> Result<(String, String, String)> {
        let channel = utils::channel(channel);
        let username = utils::username(username);
        let reason = reason.unwrap_or_default().to_string();
        self.ensure_identified()?;
        let command = format!("/ban {username} {reason}").trim_end().to_string();
        let wait = self
            .inner
            .expect_reply(CommandKind::Ban, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, username, reason))
    }

    pub async fn unban(&self, channel: &str, username: &str) -> Result<(String, String)> {
        let channel = utils::channel(channel);
        let username = utils::username(username);
        self.ensure_identified()?;
        let command = format!("/unban {username}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Unban, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, username))
    }

    pub async fn timeout(
        &self,
        channel: &str,
        username: &str,
        seconds: u64,
        reason: Option<&str>,
    ) -> Result<(String, String, u64, String)> {
        let channel = utils::channel(channel);
        let username = utils::username(username);
        let reason = reason.unwrap_or_default().to_string();
        self.ensure_identified()?;
        let command = format!("/timeout {username} {seconds} {reason}")
            .trim_end()
            .to_string();
        let wait = self
            .inner
            .expect_reply(CommandKind::Timeout, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, username, seconds, reason))
    }

    pub async fn untimeout(&self, channel: &str, username: &str) -> Result<(String, String)> {
        let channel = utils::channel(channel);
        let username = utils::username(username);
        self.ensure_identified()?;
        let command = format!("/untimeout {username}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Unban, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, username))
    }

    pub async fn clear(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/clear", CommandKind::Clear).await
    }

    pub async fn deletemessage(&self, channel: &str, message_uuid: &str) -> Result<String> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        let command = format!("/delete {message_uuid}");
        let wait = self
            .inner
            .expect_reply(CommandKind::DeleteMessage, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok(channel)
    }

    pub async fn mod_user(&self, channel: &str, username: &str) -> Result<(String, String)> {
        self.user_command(channel, username, "mod", CommandKind::Mod)
            .await
    }

    pub async fn unmod_user(&self, channel: &str, username: &str) -> Result<(String, String)> {
        self.user_command(channel, username, "unmod", CommandKind::Unmod)
            .await
    }

    pub async fn vip(&self, channel: &str, username: &str) -> Result<(String, String)> {
        self.user_command(channel, username, "vip", CommandKind::Vip)
            .await
    }

    pub async fn unvip(&self, channel: &str, username: &str) -> Result<(String, String)> {
        self.user_command(channel, username, "unvip", CommandKind::Unvip)
            .await
    }

    /// Query the moderator list. Best-effort: an unrecognized reply resolves
    /// to an empty list.
    pub async fn mods(&self, channel: &str) -> Result<Vec<String>> {
        self.name_list_command(channel, "/mods", CommandKind::Mods)
            .await
    }

    /// Query the VIP list.
    pub async fn vips(&self, channel: &str) -> Result<Vec<String>> {
        self.name_list_command(channel, "/vips", CommandKind::Vips)
            .await
    }

    // -- room modes ---------------------------------------------------------

    pub async fn slow(&self, channel: &str, seconds: u64) -> Result<(String, u64)> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        let command = format!("/slow {seconds}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Slow, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, seconds))
    }

    pub async fn slowoff(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/slowoff", CommandKind::SlowOff)
            .await
    }

    pub async fn followersonly(&self, channel: &str, minutes: u64) -> Result<(String, u64)> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        let command = format!("/followers {minutes}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Followers, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, minutes))
    }

    pub async fn followersonlyoff(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/followersoff", CommandKind::FollowersOff)
            .await
    }

    pub async fn emoteonly(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/emoteonly", CommandKind::EmoteOnly)
            .await
    }

    pub async fn emoteonlyoff(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/emoteonlyoff", CommandKind::EmoteOnlyOff)
            .await
    }

    pub async fn subscribers(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/subscribers", CommandKind::Subscribers)
            .await
    }

    pub async fn subscribersoff(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/subscribersoff", CommandKind::SubscribersOff)
            .await
    }

    pub async fn r9kbeta(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/r9kbeta", CommandKind::R9kBeta)
            .await
    }

    pub async fn r9kbetaoff(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/r9kbetaoff", CommandKind::R9kBetaOff)
            .await
    }

    // -- hosting & misc -----------------------------------------------------

    pub async fn host(&self, channel: &str, target: &str) -> Result<(String, String, u64)> {
        let channel = utils::channel(channel);
        let target = utils::username(target);
        self.ensure_identified()?;
        let command = format!("/host {target}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Host, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        let remaining = match wait.wait().await? {
            Reply::Remaining(n) => n,
            _ => 0,
        };
        Ok((channel, target, remaining))
    }

    pub async fn unhost(&self, channel: &str) -> Result<String> {
        self.room_command(channel, "/unhost", CommandKind::Unhost)
            .await
    }

    pub async fn commercial(&self, channel: &str, seconds: u64) -> Result<(String, u64)> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        let command = format!("/commercial {seconds}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Commercial, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, seconds))
    }

    /// Change the account's chat color.
    pub async fn color(&self, color: &str) -> Result<String> {
        self.ensure_identified()?;
        let command = format!("/color {color}");
        let wait = self.inner.expect_reply(CommandKind::Color, None, &command);
        let global = self.inner.global_default_channel.clone();
        self.inner
            .send_command(Some(&global), &command, None)
            .await?;
        wait.wait().await?;
        Ok(color.to_string())
    }

    // -- membership ---------------------------------------------------------

    /// Join a channel; resolves when the room state snapshot arrives.
    pub async fn join(&self, channel: &str) -> Result<String> {
        let channel = utils::channel(channel);
        self.ensure_open()?;
        let wait = self.inner.expect_reply(
            CommandKind::Join,
            Some(channel.clone()),
            &format!("JOIN {channel}"),
        );
        self.inner.state.lock().unwrap().last_joined = channel.clone();
        self.inner.enqueue_join(&channel);
        match wait.wait().await? {
            Reply::Channel(confirmed) => Ok(confirmed),
            _ => Ok(channel),
        }
    }

    /// Part a channel; resolves on the server's PART echo.
    pub async fn part(&self, channel: &str) -> Result<String> {
        let channel = utils::channel(channel);
        self.ensure_open()?;
        let command = format!("PART {channel}");
        let wait = self
            .inner
            .expect_reply(CommandKind::Part, Some(channel.clone()), &command);
        self.inner.send_command(None, &command, None).await?;
        wait.wait().await?;
        Ok(channel)
    }

    // -- diagnostics --------------------------------------------------------

    /// Measure round-trip latency with an explicit PING.
    pub async fn ping(&self) -> Result<Duration> {
        self.ensure_open()?;
        let wait = self.inner.expect_reply(CommandKind::Ping, None, "PING");
        self.inner.state.lock().unwrap().latency_sent = Some(Instant::now());
        self.inner.write_raw(PING_PAYLOAD).await?;
        match wait.wait().await? {
            Reply::Latency(latency) => Ok(latency),
            _ => Ok(Duration::ZERO),
        }
    }

    /// Write a raw IRC line, bypassing formatting (but not the write mutex).
    pub async fn raw(&self, line: &str) -> Result<String> {
        self.ensure_open()?;
        self.inner.send_command(None, line, None).await?;
        Ok(line.to_string())
    }

    // -- shared templates ---------------------------------------------------

    async fn room_command(
        &self,
        channel: &str,
        command: &str,
        kind: CommandKind,
    ) -> Result<String> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        let wait = self
            .inner
            .expect_reply(kind, Some(channel.clone()), command);
        self.inner
            .send_command(Some(&channel), command, None)
            .await?;
        wait.wait().await?;
        Ok(channel)
    }

    async fn user_command(
        &self,
        channel: &str,
        username: &str,
        verb: &str,
        kind: CommandKind,
    ) -> Result<(String, String)> {
        let channel = utils::channel(channel);
        let username = utils::username(username);
        self.ensure_identified()?;
        let command = format!("/{verb} {username}");
        let wait = self
            .inner
            .expect_reply(kind, Some(channel.clone()), &command);
        self.inner
            .send_command(Some(&channel), &command, None)
            .await?;
        wait.wait().await?;
        Ok((channel, username))
    }

    async fn name_list_command(
        &self,
        channel: &str,
        command: &str,
        kind: CommandKind,
    ) -> Result<Vec<String>> {
        let channel = utils::channel(channel);
        self.ensure_identified()?;
        let wait = self
            .inner
            .expect_reply(kind, Some(channel.clone()), command);
        self.inner
            .send_command(Some(&channel), command, None)
            .await?;
        match wait.wait().await? {
            Reply::Names(names) => Ok(names),
            _ => Ok(Vec::new()),
        }
    }

    // -- aliases (pure renamings; identical wire behavior) -------------------

    pub async fn followersmode(&self, channel: &str, minutes: u64) -> Result<(String, u64)> {
        self.followersonly(channel, minutes).await
    }

    pub async fn followersmodeoff(&self, channel: &str) -> Result<String> {
        self.followersonlyoff(channel).await
    }

    pub async fn slowmode(&self, channel: &str, seconds: u64) -> Result<(String, u64)> {
        self.slow(channel, seconds).await
    }

    pub async fn slowmodeoff(&self, channel: &str) -> Result<String> {
        self.slowoff(channel).await
    }

    pub async fn r9kmode(&self, channel: &str) -> Result<String> {
        self.r9kbeta(channel).await
    }

    pub async fn r9kmodeoff(&self, channel: &str) -> Result<String> {
        self.r9kbetaoff(channel).await
    }

    pub async fn uniquechat(&self, channel: &str) -> Result<String> {
        self.r9kbeta(channel).await
    }

    pub async fn uniquechatoff(&self, channel: &str) -> Result<String> {
        self.r9kbetaoff(channel).await
    }

    pub async fn leave(&self, channel: &str) -> Result<String> {
        self.part(channel).await
    }
}
