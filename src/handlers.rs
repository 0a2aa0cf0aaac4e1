//! Message dispatch: converts parsed IRC messages into typed events and
//! resolves pending commands.
//!
//! One function per server command, all fed from [`handle_message`]. Tag
//! post-processing happens here, before any event carrying the tag map is
//! emitted.

use std::sync::Arc;

use tokio::time::Instant;

use crate::client::{initial_backoff, ClientInner, CommandKind, ReadyState, Reply};
use crate::error::Error;
use crate::event::{Event, SubMethods};
use crate::irc::IrcMessage;
use crate::tags::{self, Tag};
use crate::utils;

pub(crate) async fn handle_message(inner: &Arc<ClientInner>, mut msg: IrcMessage) {
    tags::post_process(&mut msg.tags);
    match msg.command.as_str() {
        "001" => handle_welcome(inner),
        "PONG" => handle_pong(inner),
        // PING is answered in the reader loop.
        "PING" => {}
        "JOIN" => handle_join(inner, &msg),
        "PART" => handle_part(inner, &msg),
        "PRIVMSG" => handle_privmsg(inner, &mut msg),
        "WHISPER" => handle_whisper(inner, &mut msg),
        "NOTICE" => handle_notice(inner, &msg).await,
        "USERNOTICE" => handle_usernotice(inner, &mut msg),
        "ROOMSTATE" => handle_roomstate(inner, &msg),
        "USERSTATE" => handle_userstate(inner, &mut msg),
        "GLOBALUSERSTATE" => handle_globaluserstate(inner, &msg),
        "CLEARCHAT" => handle_clearchat(inner, &msg),
        "CLEARMSG" => handle_clearmsg(inner, &msg),
        "HOSTTARGET" => handle_hosttarget(inner, &msg),
        "MODE" => handle_mode(inner, &msg),
        "353" => handle_names(inner, &msg),
        "RECONNECT" => {
            tracing::info!("server requested reconnect");
            inner.handle_disconnect("Server requested reconnect", true).await;
        }
        "421" => handle_unknown_command_reply(inner, &msg),
        // Login banner and end-of-names noise.
        "002" | "003" | "004" | "372" | "375" | "376" | "366" | "CAP" => {}
        _ => {
            inner
                .emitter
                .emit("raw_message", &Event::RawMessage { message: msg });
        }
    }
}

fn sender_nick(msg: &IrcMessage) -> String {
    utils::username(
        msg.prefix
            .as_deref()
            .and_then(|p| p.split('!').next())
            .unwrap_or(""),
    )
}

fn tag_str(msg: &IrcMessage, key: &str) -> Option<String> {
    msg.tags
        .get(key)
        .and_then(Tag::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn tag_int(msg: &IrcMessage, key: &str) -> Option<i64> {
    msg.tags.get(key).and_then(Tag::as_int)
}

// -- connection lifecycle ---------------------------------------------------

fn handle_welcome(inner: &Arc<ClientInner>) {
    let connection = &inner.opts.connection;
    let (was_reconnecting, join_targets) = {
        let mut st = inner.state.lock().unwrap();
        st.ready_state = ReadyState::Open;
        st.reconnect_attempts = 0;
        st.reconnect_delay = initial_backoff(
            connection.reconnect_interval(),
            connection.reconnect_decay,
            connection.max_reconnect_interval(),
        );
        let was = st.reconnecting;
        st.reconnecting = false;
        (was, st.join_targets.clone())
    };
    if let Some(tx) = inner.take_welcome() {
        let _ = tx.send(Ok(()));
    }
    tracing::info!(server = %inner.server, port = inner.port, "logged in");
    let payload = Event::Connected {
        server: inner.server.clone(),
        port: inner.port,
    };
    inner.emitter.emit("connected", &payload);
    if was_reconnecting {
        inner.emitter.emit(
            "reconnected",
            &Event::Reconnected {
                server: inner.server.clone(),
                port: inner.port,
            },
        );
    }
    if was_reconnecting || inner.opts.join_existing_channels {
        for channel in join_targets {
            inner.enqueue_join(&channel);
        }
    }
}

fn handle_pong(inner: &Arc<ClientInner>) {
    let latency = {
        let mut st = inner.state.lock().unwrap();
        st.last_pong = Some(Instant::now());
        if let Some(sent) = st.latency_sent.take() {
            st.current_latency = sent.elapsed();
        }
        st.current_latency
    };
    inner
        .pending
        .resolve(CommandKind::Ping, None, Ok(Reply::Latency(latency)));
    inner.emitter.emit("pong", &Event::Pong { latency });
}

// -- membership -------------------------------------------------------------

fn handle_join(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let username = sender_nick(msg);
    let is_self = username == inner.username();
    if is_self {
        // The self join event waits for the ROOMSTATE/USERSTATE snapshot so
        // no channel-scoped event precedes the room state.
        let mut st = inner.state.lock().unwrap();
        if !st.join_targets.contains(&channel) {
            st.join_targets.push(channel.clone());
        }
        st.last_joined = channel;
    } else {
        inner.emitter.emit(
            "join",
            &Event::Join {
                channel,
                username,
                is_self: false,
            },
        );
    }
}

fn handle_part(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let username = sender_nick(msg);
    let is_self = username == inner.username();
    if is_self {
        {
            let mut st = inner.state.lock().unwrap();
            st.channels.remove(&channel);
            st.moderators.remove(&channel);
            st.join_targets.retain(|c| c != &channel);
        }
        tracing::info!(%channel, "left channel");
        inner.pending.resolve(
            CommandKind::Part,
            Some(&channel),
            Ok(Reply::Channel(channel.clone())),
        );
    }
    inner.emitter.emit(
        "part",
        &Event::Part {
            channel,
            username,
            is_self,
        },
    );
}

// -- chat -------------------------------------------------------------------

fn handle_privmsg(inner: &Arc<ClientInner>, msg: &mut IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let text = msg.param(1).unwrap_or_default().to_string();
    let username = sender_nick(msg);

    // jtv delivers host notifications as plain chat lines.
    if username == "jtv" {
        handle_jtv_message(inner, &channel, &text);
        return;
    }

    let action = utils::action_message(&text).map(str::to_string);
    msg.tags
        .insert("username".to_string(), Tag::Str(username.clone()));
    msg.tags.insert(
        "message-type".to_string(),
        Tag::Str(if action.is_some() { "action" } else { "chat" }.to_string()),
    );
    let clean = action.clone().unwrap_or(text);
    let is_self = username == inner.username();
    inner.log_chat(&channel, &username, &clean, action.is_some());

    let message = Event::Message {
        channel: channel.clone(),
        userstate: msg.tags.clone(),
        text: clean.clone(),
        is_self,
    };
    if action.is_some() {
        inner.emitter.emit_many(&["action", "message"], &message);
    } else if msg.tags.contains_key("bits") {
        inner.emitter.emit(
            "cheer",
            &Event::Cheer {
                channel,
                userstate: msg.tags.clone(),
                text: clean,
            },
        );
        inner.emitter.emit("message", &message);
    } else if let Some(reward) = redeem_id(msg) {
        inner.emitter.emit(
            "redeem",
            &Event::Redeem {
                channel,
                username,
                reward,
                userstate: msg.tags.clone(),
                text: clean,
            },
        );
        inner.emitter.emit("message", &message);
    } else {
        inner.emitter.emit_many(&["chat", "message"], &message);
    }
}

fn redeem_id(msg: &IrcMessage) -> Option<String> {
    if let Some(id) = tag_str(msg, "msg-id") {
        if id == "highlighted-message" || id == "skip-subs-mode-message" {
            return Some(id);
        }
    }
    tag_str(msg, "custom-reward-id")
}

fn handle_jtv_message(inner: &Arc<ClientInner>, channel: &str, text: &str) {
    let host = utils::username(text.split(' ').next().unwrap_or_default());
    let auto = text.contains("auto");
    let viewers = if text.contains("hosting you for") {
        text.split_whitespace()
            .find_map(|word| word.parse::<i64>().ok())
            .unwrap_or(0)
    } else if text.contains("hosting you") {
        0
    } else {
        return;
    };
    inner.emitter.emit(
        "hosted",
        &Event::Hosted {
            channel: channel.to_string(),
            host,
            viewers,
            auto,
        },
    );
}

fn handle_whisper(inner: &Arc<ClientInner>, msg: &mut IrcMessage) {
    let from = sender_nick(msg);
    let text = msg.param(1).unwrap_or_default().to_string();
    msg.tags
        .insert("message-type".to_string(), Tag::Str("whisper".to_string()));
    msg.tags
        .insert("username".to_string(), Tag::Str(from.clone()));
    tracing::info!(%from, "whisper received");
    let is_self = from == inner.username();
    inner.emitter.emit_many(
        &["whisper", "message"],
        &Event::Whisper {
            from,
            userstate: msg.tags.clone(),
            text,
            is_self,
        },
    );
}

// -- NOTICE and command correlation -----------------------------------------

enum NoticeAction {
    Success(CommandKind),
    Failure(CommandKind),
    ModsList,
    VipsList,
    HostsRemaining,
    /// Fails every pending command on the channel.
    GlobalFailure,
    Automod,
    /// Informational; the public `notice` event is all there is.
    Info,
    Unknown,
}

fn classify_notice(id: &str) -> NoticeAction {
    use CommandKind::*;
    use NoticeAction::*;
    match id {
        "ban_success" => Success(Ban),
        "timeout_success" => Success(Timeout),
        "untimeout_success" | "unban_success" => Success(Unban),
        "mod_success" => Success(Mod),
        "unmod_success" => Success(Unmod),
        "vip_success" => Success(Vip),
        "unvip_success" => Success(Unvip),
        "commercial_success" => Success(Commercial),
        "delete_message_success" => Success(DeleteMessage),
        "color_changed" => Success(Color),
        "slow_on" => Success(Slow),
        "slow_off" => Success(SlowOff),
        "followers_on" | "followers_on_zero" => Success(Followers),
        "followers_off" => Success(FollowersOff),
        "subs_on" => Success(Subscribers),
        "subs_off" => Success(SubscribersOff),
        "emote_only_on" => Success(EmoteOnly),
        "emote_only_off" => Success(EmoteOnlyOff),
        "r9k_on" => Success(R9kBeta),
        "r9k_off" => Success(R9kBetaOff),

        "room_mods" | "no_mods" => ModsList,
        "vips_success" | "no_vips" => VipsList,
        "hosts_remaining" => HostsRemaining,

        "already_banned" | "bad_ban_admin" | "bad_ban_anon" | "bad_ban_broadcaster"
        | "bad_ban_global_mod" | "bad_ban_mod" | "bad_ban_self" | "bad_ban_staff"
        | "usage_ban" => Failure(Ban),
        "usage_timeout" | "bad_timeout_admin" | "bad_timeout_anon" | "bad_timeout_broadcaster"
        | "bad_timeout_duration" | "bad_timeout_global_mod" | "bad_timeout_mod"
        | "bad_timeout_self" | "bad_timeout_staff" => Failure(Timeout),
        "usage_unban" | "bad_unban_no_ban" => Failure(Unban),
        "usage_clear" => Failure(Clear),
        "usage_mods" => Failure(Mods),
        "usage_mod" | "bad_mod_banned" | "bad_mod_mod" => Failure(Mod),
        "usage_unmod" | "bad_unmod_mod" => Failure(Unmod),
        "usage_vips" => Failure(Vips),
        "usage_vip" | "bad_vip_grantee_banned" | "bad_vip_grantee_already_vip"
        | "bad_vip_max_vips_reached" | "bad_vip_achievement_incomplete" => Failure(Vip),
        "usage_unvip" | "bad_unvip_grantee_not_vip" => Failure(Unvip),
        "usage_color" | "turbo_only_color" => Failure(Color),
        "usage_commercial" | "bad_commercial_error" => Failure(Commercial),
        "usage_host" | "bad_host_hosting" | "bad_host_rate_exceeded" | "bad_host_error" => {
            Failure(Host)
        }
        "usage_unhost" | "not_hosting" => Failure(Unhost),
        "already_r9k_on" | "usage_r9k_on" => Failure(R9kBeta),
        "already_r9k_off" | "usage_r9k_off" => Failure(R9kBetaOff),
        "usage_slow_on" => Failure(Slow),
        "usage_slow_off" => Failure(SlowOff),
        "already_subs_on" | "usage_subs_on" => Failure(Subscribers),
        "already_subs_off" | "usage_subs_off" => Failure(SubscribersOff),
        "already_emote_only_on" | "usage_emote_only_on" => Failure(EmoteOnly),
        "already_emote_only_off" | "usage_emote_only_off" => Failure(EmoteOnlyOff),
        "usage_delete" | "bad_delete_message_error" | "bad_delete_message_broadcaster"
        | "bad_delete_message_mod" => Failure(DeleteMessage),
        "whisper_invalid_login" | "whisper_invalid_self" | "whisper_limit_per_min"
        | "whisper_limit_per_sec" | "whisper_restricted" | "whisper_restricted_recipient" => {
            Failure(Whisper)
        }

        "no_permission" | "msg_banned" | "msg_room_not_found" | "msg_channel_suspended"
        | "tos_ban" | "invalid_user" => GlobalFailure,

        "msg_rejected" | "msg_rejected_mandatory" => Automod,

        "cmds_available" | "host_target_went_offline" | "host_on" | "host_off"
        | "msg_censored_broadcaster" | "msg_duplicate" | "msg_emoteonly"
        | "msg_verified_email" | "msg_ratelimit" | "msg_subsonly" | "msg_timedout"
        | "msg_bad_characters" | "msg_channel_blocked" | "msg_facebook"
        | "msg_followersonly" | "msg_followersonly_followed" | "msg_followersonly_zero"
        | "msg_slowmode" | "msg_suspended" | "no_help" | "usage_disconnect" | "usage_help"
        | "usage_me" | "unavailable_command" | "unrecognized_cmd" => Info,

        _ => Unknown,
    }
}

async fn handle_notice(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let text = msg.param(1).unwrap_or_default().to_string();
    let msg_id = tag_str(msg, "msg-id");

    let Some(id) = msg_id else {
        if is_login_failure(&text) {
            inner.state.lock().unwrap().reconnect_enabled = false;
            if let Some(tx) = inner.take_welcome() {
                let _ = tx.send(Err(Error::Authentication));
            }
            tracing::error!(%text, "login rejected");
            inner.handle_disconnect(&text, true).await;
            return;
        }
        inner.emitter.emit(
            "notice",
            &Event::Notice {
                channel,
                msg_id: None,
                text,
            },
        );
        return;
    };

    inner.emitter.emit(
        "notice",
        &Event::Notice {
            channel: channel.clone(),
            msg_id: Some(id.clone()),
            text: text.clone(),
        },
    );
    tracing::debug!(msg_id = %id, %channel, "notice");

    match classify_notice(&id) {
        NoticeAction::Success(kind) => {
            inner.pending.resolve(kind, Some(&channel), Ok(Reply::Ack));
        }
        NoticeAction::Failure(kind) => {
            inner.pending.resolve(kind, Some(&channel), Err(id));
        }
        NoticeAction::ModsList => {
            let mods = parse_name_list(&text);
            {
                let mut st = inner.state.lock().unwrap();
                let known = st.moderators.entry(channel.clone()).or_default();
                for name in &mods {
                    if !known.contains(name) {
                        known.push(name.clone());
                    }
                }
            }
            inner.pending.resolve(
                CommandKind::Mods,
                Some(&channel),
                Ok(Reply::Names(mods.clone())),
            );
            inner.emitter.emit("mods", &Event::Mods { channel, mods });
        }
        NoticeAction::VipsList => {
            let vips = parse_name_list(text.strip_suffix('.').unwrap_or(&text));
            inner.pending.resolve(
                CommandKind::Vips,
                Some(&channel),
                Ok(Reply::Names(vips.clone())),
            );
            inner.emitter.emit("vips", &Event::Vips { channel, vips });
        }
        NoticeAction::HostsRemaining => {
            let remaining: u64 = text
                .chars()
                .filter(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            inner.pending.resolve(
                CommandKind::Host,
                Some(&channel),
                Ok(Reply::Remaining(remaining)),
            );
        }
        NoticeAction::GlobalFailure => {
            inner.pending.fail_all(Some(&channel), &id);
        }
        NoticeAction::Automod => {
            inner.emitter.emit(
                "automod",
                &Event::Automod {
                    channel,
                    msg_id: id,
                    text,
                },
            );
        }
        NoticeAction::Info => {}
        NoticeAction::Unknown => {
            // Observed ids are enumerated above; anything new fails pending
            // commands with the id preserved verbatim.
            tracing::warn!(msg_id = %id, raw = %msg.raw, "unrecognized NOTICE msg-id");
            inner.pending.fail_all(Some(&channel), &id);
        }
    }
}

fn is_login_failure(text: &str) -> bool {
    text.contains("Login authentication failed")
        || text.contains("Login unsuccessful")
        || text.contains("Error logging in")
        || text.contains("Improperly formatted auth")
        || text.contains("Invalid NICK")
}

/// Best-effort parse of "The moderators of this channel are: a, b, c".
/// Unrecognized shapes produce an empty list.
fn parse_name_list(text: &str) -> Vec<String> {
    match text.split_once(": ") {
        Some((_, names)) => names
            .to_lowercase()
            .split(", ")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    }
}

// -- USERNOTICE -------------------------------------------------------------

fn sub_methods(msg: &IrcMessage) -> SubMethods {
    let plan = tag_str(msg, "msg-param-sub-plan");
    SubMethods {
        prime: plan.as_deref().is_some_and(|p| p.contains("Prime")),
        plan,
        plan_name: tag_str(msg, "msg-param-sub-plan-name"),
    }
}

fn handle_usernotice(inner: &Arc<ClientInner>, msg: &mut IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let text = msg.param(1).map(str::to_string);
    let Some(id) = tag_str(msg, "msg-id") else {
        return;
    };
    msg.tags
        .insert("message-type".to_string(), Tag::Str(id.clone()));

    let username = tag_str(msg, "display-name")
        .or_else(|| tag_str(msg, "login"))
        .unwrap_or_default();
    let methods = sub_methods(msg);
    let months = tag_int(msg, "msg-param-streak-months").unwrap_or(0);
    let recipient = tag_str(msg, "msg-param-recipient-display-name")
        .or_else(|| tag_str(msg, "msg-param-recipient-user-name"))
        .unwrap_or_default();
    let gift_count = tag_int(msg, "msg-param-mass-gift-count").unwrap_or(0);
    let tags = msg.tags.clone();

    inner.emitter.emit(
        "usernotice",
        &Event::UserNotice {
            msg_id: id.clone(),
            channel: channel.clone(),
            tags: tags.clone(),
            text: text.clone(),
        },
    );

    match id.as_str() {
        "sub" => inner.emitter.emit_many(
            &["subscription", "sub"],
            &Event::Sub {
                channel,
                username,
                methods,
                text,
                tags,
            },
        ),
        "resub" => inner.emitter.emit_many(
            &["resub", "subanniversary"],
            &Event::Resub {
                channel,
                username,
                months,
                text,
                tags,
                methods,
            },
        ),
        "subgift" => {
            inner.emitter.emit(
                "subgift",
                &Event::SubGift {
                    channel,
                    username,
                    months,
                    recipient,
                    methods,
                    tags,
                },
            );
        }
        "anonsubgift" => {
            inner.emitter.emit(
                "anonsubgift",
                &Event::AnonSubGift {
                    channel,
                    months,
                    recipient,
                    methods,
                    tags,
                },
            );
        }
        "submysterygift" => {
            inner.emitter.emit(
                "submysterygift",
                &Event::SubMysteryGift {
                    channel,
                    username,
                    count: gift_count,
                    methods,
                    tags,
                },
            );
        }
        "anonsubmysterygift" => {
            inner.emitter.emit(
                "anonsubmysterygift",
                &Event::AnonSubMysteryGift {
                    channel,
                    count: gift_count,
                    methods,
                    tags,
                },
            );
        }
        "primepaidupgrade" => {
            inner.emitter.emit(
                "primepaidupgrade",
                &Event::PrimePaidUpgrade {
                    channel,
                    username,
                    methods,
                    tags,
                },
            );
        }
        "giftpaidupgrade" => {
            let sender = tag_str(msg, "msg-param-sender-name")
                .or_else(|| tag_str(msg, "msg-param-sender-login"));
            inner.emitter.emit(
                "giftpaidupgrade",
                &Event::GiftPaidUpgrade {
                    channel,
                    username,
                    sender,
                    tags,
                },
            );
        }
        "anongiftpaidupgrade" => {
            inner.emitter.emit(
                "anongiftpaidupgrade",
                &Event::AnonGiftPaidUpgrade {
                    channel,
                    username,
                    tags,
                },
            );
        }
        "announcement" => {
            let color = tag_str(msg, "msg-param-color");
            inner.emitter.emit(
                "announcement",
                &Event::Announcement {
                    channel,
                    tags,
                    text,
                    color,
                },
            );
        }
        "raid" => {
            let raider = tag_str(msg, "msg-param-displayName")
                .or_else(|| tag_str(msg, "msg-param-login"));
            let viewers = tag_int(msg, "msg-param-viewerCount").unwrap_or(0);
            inner.emitter.emit(
                "raided",
                &Event::Raided {
                    channel,
                    raider,
                    viewers,
                    tags,
                },
            );
        }
        "ritual" => {
            let ritual = tag_str(msg, "msg-param-ritual-name").unwrap_or_default();
            inner.emitter.emit(
                "ritual",
                &Event::Ritual {
                    channel,
                    username,
                    ritual,
                    tags,
                },
            );
        }
        _ => {}
    }
}

// -- room/user state --------------------------------------------------------

const ROOMSTATE_FIELDS: &[&str] = &["slow", "followers-only", "subs-only", "emote-only", "r9k"];

fn handle_roomstate(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());

    // This snapshot is what a pending `join` for the channel waits for.
    inner.pending.resolve(
        CommandKind::Join,
        Some(&channel),
        Ok(Reply::Channel(channel.clone())),
    );

    let (changed, newly_seen) = {
        let mut st = inner.state.lock().unwrap();
        let newly_seen = !st.channels.contains_key(&channel);
        let entry = st.channels.entry(channel.clone()).or_default();
        let mut changed = Vec::new();
        for key in ROOMSTATE_FIELDS {
            if let Some(value) = msg.tags.get(*key) {
                if entry.roomstate.get(*key) != Some(value) {
                    changed.push((*key, value.clone()));
                }
            }
        }
        for (key, value) in &msg.tags {
            entry.roomstate.insert(key.clone(), value.clone());
        }
        (changed, newly_seen)
    };

    let mut tags = msg.tags.clone();
    tags.insert("channel".to_string(), Tag::Str(channel.clone()));
    inner.emitter.emit(
        "roomstate",
        &Event::RoomState {
            channel: channel.clone(),
            tags,
        },
    );

    for (key, value) in changed {
        emit_roomstate_change(inner, &channel, key, &value);
    }

    // Anonymous connections never receive USERSTATE; their self join fires
    // with the first room snapshot.
    if newly_seen && inner.is_anonymous() {
        {
            let mut st = inner.state.lock().unwrap();
            if !st.join_targets.contains(&channel) {
                st.join_targets.push(channel.clone());
            }
        }
        tracing::info!(%channel, "joined channel");
        inner.emitter.emit(
            "join",
            &Event::Join {
                channel,
                username: inner.username(),
                is_self: true,
            },
        );
    }
}

fn emit_roomstate_change(inner: &Arc<ClientInner>, channel: &str, key: &str, value: &Tag) {
    let channel = channel.to_string();
    match key {
        "slow" => {
            let seconds = value.as_int().unwrap_or(0);
            inner.emitter.emit_many(
                &["slow", "slowmode"],
                &Event::Slow {
                    channel,
                    enabled: seconds > 0,
                    seconds: seconds.max(0),
                },
            );
        }
        "followers-only" => {
            let minutes = value.as_int().unwrap_or(-1);
            inner.emitter.emit_many(
                &["followersonly", "followersmode"],
                &Event::FollowersOnly {
                    channel,
                    enabled: minutes >= 0,
                    minutes: minutes.max(0),
                },
            );
        }
        "subs-only" => {
            let enabled = value.as_bool().unwrap_or(false);
            inner
                .emitter
                .emit("subscribers", &Event::Subscribers { channel, enabled });
        }
        "emote-only" => {
            let enabled = value.as_bool().unwrap_or(false);
            inner
                .emitter
                .emit("emoteonly", &Event::EmoteOnly { channel, enabled });
        }
        "r9k" => {
            let enabled = value.as_bool().unwrap_or(false);
            inner.emitter.emit_many(
                &["r9kbeta", "r9kmode"],
                &Event::R9kBeta { channel, enabled },
            );
        }
        _ => {}
    }
}

fn handle_userstate(inner: &Arc<ClientInner>, msg: &mut IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let username = inner.username();
    msg.tags
        .insert("username".to_string(), Tag::Str(username.clone()));

    let (first_for_channel, changed_sets) = {
        let mut st = inner.state.lock().unwrap();
        if tag_str(msg, "user-type").as_deref() == Some("mod") {
            let mods = st.moderators.entry(channel.clone()).or_default();
            if !mods.contains(&username) {
                mods.push(username.clone());
            }
        }
        let first = st
            .channels
            .get(&channel)
            .map_or(true, |c| c.userstate.is_empty());
        let entry = st.channels.entry(channel.clone()).or_default();
        entry.userstate = msg.tags.clone();
        st.last_joined = channel.clone();
        if !st.join_targets.contains(&channel) {
            st.join_targets.push(channel.clone());
        }
        let changed_sets = tag_str(msg, "emote-sets").filter(|sets| *sets != st.emote_sets);
        if let Some(sets) = &changed_sets {
            st.emote_sets = sets.clone();
        }
        (first, changed_sets)
    };

    if first_for_channel && !inner.is_anonymous() {
        tracing::info!(%channel, "joined channel");
        inner.emitter.emit(
            "join",
            &Event::Join {
                channel: channel.clone(),
                username: username.clone(),
                is_self: true,
            },
        );
    }
    if let Some(sets) = changed_sets {
        inner.emitter.emit("emotesets", &Event::EmoteSets { sets });
    }
    inner.emitter.emit(
        "userstate",
        &Event::UserState {
            channel,
            tags: msg.tags.clone(),
        },
    );
}

fn handle_globaluserstate(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let changed_sets = {
        let mut st = inner.state.lock().unwrap();
        st.globaluserstate = msg.tags.clone();
        let changed = tag_str(msg, "emote-sets").filter(|sets| *sets != st.emote_sets);
        if let Some(sets) = &changed {
            st.emote_sets = sets.clone();
        }
        changed
    };
    inner.emitter.emit(
        "globaluserstate",
        &Event::GlobalUserState {
            tags: msg.tags.clone(),
        },
    );
    if let Some(sets) = changed_sets {
        inner.emitter.emit("emotesets", &Event::EmoteSets { sets });
    }
}

// -- moderation -------------------------------------------------------------

fn handle_clearchat(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    match msg.param(1) {
        Some(target) => {
            let username = utils::username(target);
            let reason = tag_str(msg, "ban-reason");
            match tag_int(msg, "ban-duration") {
                Some(seconds) => {
                    tracing::info!(%channel, %username, seconds, "user timed out");
                    inner.emitter.emit(
                        "timeout",
                        &Event::Timeout {
                            channel,
                            username,
                            reason,
                            seconds,
                            tags: msg.tags.clone(),
                        },
                    );
                }
                None => {
                    tracing::info!(%channel, %username, "user banned");
                    inner.emitter.emit(
                        "ban",
                        &Event::Ban {
                            channel,
                            username,
                            reason,
                            tags: msg.tags.clone(),
                        },
                    );
                }
            }
        }
        None => {
            tracing::info!(%channel, "chat cleared");
            inner.emitter.emit(
                "clearchat",
                &Event::ClearChat {
                    channel: channel.clone(),
                },
            );
            inner
                .pending
                .resolve(CommandKind::Clear, Some(&channel), Ok(Reply::Ack));
        }
    }
}

fn handle_clearmsg(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let text = msg.param(1).unwrap_or_default().to_string();
    let username = tag_str(msg, "login").unwrap_or_default();
    let mut tags = msg.tags.clone();
    tags.insert(
        "message-type".to_string(),
        Tag::Str("messagedeleted".to_string()),
    );
    inner.emitter.emit(
        "messagedeleted",
        &Event::MessageDeleted {
            channel,
            username,
            text,
            tags,
        },
    );
}

fn handle_hosttarget(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let channel = utils::channel(msg.param(0).unwrap_or_default());
    let payload = msg.param(1).unwrap_or_default();
    let mut parts = payload.split_whitespace();
    let target = parts.next().unwrap_or("-");
    let viewers: i64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    if target == "-" {
        tracing::info!(%channel, "exited host mode");
        inner.emitter.emit(
            "unhost",
            &Event::Unhost {
                channel: channel.clone(),
                viewers,
            },
        );
        inner
            .pending
            .resolve(CommandKind::Unhost, Some(&channel), Ok(Reply::Ack));
    } else {
        inner.emitter.emit(
            "hosting",
            &Event::Hosting {
                channel,
                target: utils::username(target),
                viewers,
            },
        );
    }
}

fn handle_mode(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let Some(channel) = msg.param(0).filter(|c| c.starts_with('#')) else {
        return;
    };
    let channel = utils::channel(channel);
    let (Some(mode), Some(target)) = (msg.param(1), msg.param(2)) else {
        return;
    };
    let username = utils::username(target);
    let granted = match mode {
        "+o" => true,
        "-o" => false,
        _ => return,
    };
    {
        let mut st = inner.state.lock().unwrap();
        let mods = st.moderators.entry(channel.clone()).or_default();
        if granted {
            if !mods.contains(&username) {
                mods.push(username.clone());
            }
        } else {
            mods.retain(|name| name != &username);
        }
    }
    if granted {
        inner
            .emitter
            .emit("mod", &Event::ModAdded { channel, username });
    } else {
        inner
            .emitter
            .emit("unmod", &Event::ModRemoved { channel, username });
    }
}

fn handle_names(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    // :tmi 353 <self> = <channel> :name1 @name2 ...
    let channel = utils::channel(msg.param(2).unwrap_or_default());
    let mut users = Vec::new();
    let mut mods = Vec::new();
    for raw in msg.param(3).unwrap_or_default().split_whitespace() {
        let name = utils::username(raw.trim_start_matches('@'));
        if raw.starts_with('@') && !mods.contains(&name) {
            mods.push(name.clone());
        }
        users.push(name);
    }
    if !mods.is_empty() {
        inner
            .state
            .lock()
            .unwrap()
            .moderators
            .insert(channel.clone(), mods);
    }
    inner
        .emitter
        .emit("names", &Event::Names { channel, users });
}

fn handle_unknown_command_reply(inner: &Arc<ClientInner>, msg: &IrcMessage) {
    let rejected = msg.param(1).unwrap_or_default();
    tracing::warn!(command = %rejected, "server rejected command");
    let word = rejected.trim_start_matches('/').to_lowercase();
    if let Some(kind) = kind_for_command_word(&word) {
        inner
            .pending
            .resolve(kind, None, Err("unrecognized_cmd".to_string()));
    }
}

pub(crate) fn kind_for_command_word(word: &str) -> Option<CommandKind> {
    use CommandKind::*;
    Some(match word {
        "ban" => Ban,
        "unban" | "untimeout" => Unban,
        "timeout" => Timeout,
        "clear" => Clear,
        "color" => Color,
        "commercial" => Commercial,
        "delete" => DeleteMessage,
        "emoteonly" => EmoteOnly,
        "emoteonlyoff" => EmoteOnlyOff,
        "followers" => Followers,
        "followersoff" => FollowersOff,
        "host" => Host,
        "unhost" => Unhost,
        "mod" => Mod,
        "unmod" => Unmod,
        "mods" => Mods,
        "vip" => Vip,
        "unvip" => Unvip,
        "vips" => Vips,
        "r9kbeta" => R9kBeta,
        "r9kbetaoff" => R9kBetaOff,
        "slow" => Slow,
        "slowoff" => SlowOff,
        "subscribers" => Subscribers,
        "subscribersoff" => SubscribersOff,
        "w" => Whisper,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::client::Client;
    use crate::error::Error;
    use crate::options::{ClientOptions, IdentityOptions};

    fn identified_client() -> Client {
        Client::new(ClientOptions {
            identity: IdentityOptions {
                username: Some("bot".to_string()),
                password: Some("oauth:token".to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn anonymous_client() -> Client {
        Client::new(ClientOptions::default())
    }

    fn capture(client: &Client, event: &str) -> Arc<Mutex<Vec<Event>>> {
        let store = Arc::new(Mutex::new(Vec::new()));
        let sink = store.clone();
        client.on(event, move |e| sink.lock().unwrap().push(e.clone()));
        store
    }

    async fn feed(client: &Client, line: &str) {
        let msg = IrcMessage::parse(line).expect("test line must parse");
        handle_message(&client.inner, msg).await;
    }

    #[tokio::test]
    async fn chat_line_dispatches_chat_and_message() {
        let client = identified_client();
        let chats = capture(&client, "chat");
        let messages = capture(&client, "message");
        feed(
            &client,
            "@badges=broadcaster/1;color=#FF0000;display-name=Alice;user-id=42 :alice!alice@alice.tmi.twitch.tv PRIVMSG #room :hi",
        )
        .await;

        let chats = chats.lock().unwrap();
        assert_eq!(chats.len(), 1);
        let Event::Message {
            channel,
            userstate,
            text,
            is_self,
        } = &chats[0]
        else {
            panic!("expected message payload");
        };
        assert_eq!(channel, "#room");
        assert_eq!(text, "hi");
        assert!(!is_self);
        let badges = userstate["badges"].as_badges().unwrap();
        assert_eq!(badges["broadcaster"].as_deref(), Some("1"));
        assert_eq!(userstate["username"].as_str(), Some("alice"));
        assert_eq!(messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn action_unwraps_ctcp_marker() {
        let client = identified_client();
        let actions = capture(&client, "action");
        let chats = capture(&client, "chat");
        feed(&client, ":b!b@b PRIVMSG #r :\u{1}ACTION waves\u{1}").await;

        let actions = actions.lock().unwrap();
        assert_eq!(actions.len(), 1);
        let Event::Message { text, .. } = &actions[0] else {
            panic!("expected message payload");
        };
        assert_eq!(text, "waves");
        assert!(!text.contains('\u{1}'));
        assert!(chats.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bits_dispatch_as_cheer() {
        let client = identified_client();
        let cheers = capture(&client, "cheer");
        let chats = capture(&client, "chat");
        let messages = capture(&client, "message");
        feed(&client, "@bits=100 :u!u@u PRIVMSG #r :cheer100 gg").await;
        assert_eq!(cheers.lock().unwrap().len(), 1);
        assert!(chats.lock().unwrap().is_empty());
        assert_eq!(messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reward_dispatches_as_redeem() {
        let client = identified_client();
        let redeems = capture(&client, "redeem");
        feed(
            &client,
            "@custom-reward-id=abc-123 :u!u@u PRIVMSG #r :claimed",
        )
        .await;
        let redeems = redeems.lock().unwrap();
        let Event::Redeem { reward, .. } = &redeems[0] else {
            panic!("expected redeem payload");
        };
        assert_eq!(reward, "abc-123");
    }

    #[tokio::test]
    async fn ban_success_resolves_pending_command() {
        let client = identified_client();
        let notices = capture(&client, "notice");
        let wait =
            client
                .inner
                .expect_reply(CommandKind::Ban, Some("#r".to_string()), "/ban victim");
        feed(
            &client,
            "@msg-id=ban_success :tmi.twitch.tv NOTICE #r :victim is now banned from this channel.",
        )
        .await;
        assert!(matches!(wait.wait().await, Ok(Reply::Ack)));
        assert_eq!(notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ban_failure_resolves_with_msg_id() {
        let client = identified_client();
        let wait =
            client
                .inner
                .expect_reply(CommandKind::Ban, Some("#r".to_string()), "/ban bot");
        feed(
            &client,
            "@msg-id=bad_ban_self :tmi.twitch.tv NOTICE #r :You cannot ban yourself.",
        )
        .await;
        match wait.wait().await {
            Err(Error::CommandFailed { reason, .. }) => assert_eq!(reason, "bad_ban_self"),
            other => panic!("expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn global_failure_fails_every_pending_kind() {
        let client = identified_client();
        let ban = client
            .inner
            .expect_reply(CommandKind::Ban, Some("#r".to_string()), "/ban x");
        let slow = client
            .inner
            .expect_reply(CommandKind::Slow, Some("#r".to_string()), "/slow 30");
        feed(
            &client,
            "@msg-id=no_permission :tmi.twitch.tv NOTICE #r :You don't have permission.",
        )
        .await;
        assert!(
            matches!(ban.wait().await, Err(Error::CommandFailed { reason, .. }) if reason == "no_permission")
        );
        assert!(
            matches!(slow.wait().await, Err(Error::CommandFailed { reason, .. }) if reason == "no_permission")
        );
    }

    #[tokio::test]
    async fn unknown_msg_id_fails_pending_verbatim() {
        let client = identified_client();
        let notices = capture(&client, "notice");
        let wait = client
            .inner
            .expect_reply(CommandKind::Ban, Some("#r".to_string()), "/ban x");
        feed(
            &client,
            "@msg-id=brand_new_failure :tmi.twitch.tv NOTICE #r :Something new.",
        )
        .await;
        assert!(
            matches!(wait.wait().await, Err(Error::CommandFailed { reason, .. }) if reason == "brand_new_failure")
        );
        assert_eq!(notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mods_notice_resolves_with_name_list() {
        let client = identified_client();
        let events = capture(&client, "mods");
        let wait = client
            .inner
            .expect_reply(CommandKind::Mods, Some("#r".to_string()), "/mods");
        feed(
            &client,
            "@msg-id=room_mods :tmi.twitch.tv NOTICE #r :The moderators of this channel are: Alpha, beta",
        )
        .await;
        match wait.wait().await {
            Ok(Reply::Names(names)) => assert_eq!(names, vec!["alpha", "beta"]),
            other => panic!("expected name list, got {other:?}"),
        }
        assert_eq!(events.lock().unwrap().len(), 1);
        assert!(client.is_mod("#r", "alpha"));
    }

    #[tokio::test]
    async fn unrecognized_mods_reply_is_empty_list() {
        let client = identified_client();
        let wait = client
            .inner
            .expect_reply(CommandKind::Mods, Some("#r".to_string()), "/mods");
        feed(
            &client,
            "@msg-id=room_mods :tmi.twitch.tv NOTICE #r :weird reply with no separator",
        )
        .await;
        match wait.wait().await {
            Ok(Reply::Names(names)) => assert!(names.is_empty()),
            other => panic!("expected empty list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clearchat_routes_ban_timeout_and_clear() {
        let client = identified_client();
        let bans = capture(&client, "ban");
        let timeouts = capture(&client, "timeout");
        let clears = capture(&client, "clearchat");

        feed(&client, "@ban-duration=600 :tmi.twitch.tv CLEARCHAT #r :victim").await;
        feed(&client, ":tmi.twitch.tv CLEARCHAT #r :villain").await;
        feed(&client, ":tmi.twitch.tv CLEARCHAT #r").await;

        let timeouts = timeouts.lock().unwrap();
        assert_eq!(timeouts.len(), 1);
        let Event::Timeout {
            username, seconds, ..
        } = &timeouts[0]
        else {
            panic!("expected timeout payload");
        };
        assert_eq!(username, "victim");
        assert_eq!(*seconds, 600);

        assert_eq!(bans.lock().unwrap().len(), 1);
        assert_eq!(clears.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn roomstate_emits_changed_field_subevents() {
        let client = identified_client();
        let rooms = capture(&client, "roomstate");
        let slows = capture(&client, "slow");
        let followers = capture(&client, "followersonly");

        feed(
            &client,
            "@slow=30;followers-only=-1;subs-only=0;emote-only=0;r9k=0 :tmi.twitch.tv ROOMSTATE #r",
        )
        .await;
        assert_eq!(rooms.lock().unwrap().len(), 1);
        {
            let slows = slows.lock().unwrap();
            let Event::Slow {
                enabled, seconds, ..
            } = &slows[0]
            else {
                panic!("expected slow payload");
            };
            assert!(*enabled);
            assert_eq!(*seconds, 30);
            let followers = followers.lock().unwrap();
            let Event::FollowersOnly { enabled, .. } = &followers[0] else {
                panic!("expected followersonly payload");
            };
            assert!(!enabled);
        }

        // Partial update: only the changed field fires again.
        feed(&client, "@slow=0 :tmi.twitch.tv ROOMSTATE #r").await;
        let slows = slows.lock().unwrap();
        assert_eq!(slows.len(), 2);
        let Event::Slow { enabled, .. } = &slows[1] else {
            panic!("expected slow payload");
        };
        assert!(!enabled);
        assert_eq!(followers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn roomstate_resolves_pending_join() {
        let client = identified_client();
        let wait = client.inner.expect_reply(
            CommandKind::Join,
            Some("#r".to_string()),
            "JOIN #r",
        );
        feed(&client, "@slow=0 :tmi.twitch.tv ROOMSTATE #r").await;
        match wait.wait().await {
            Ok(Reply::Channel(channel)) => assert_eq!(channel, "#r"),
            other => panic!("expected channel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn anonymous_self_join_fires_on_first_roomstate() {
        let client = anonymous_client();
        let joins = capture(&client, "join");
        feed(&client, ":tmi.twitch.tv ROOMSTATE #r").await;
        feed(&client, ":tmi.twitch.tv ROOMSTATE #r").await;
        let joins = joins.lock().unwrap();
        assert_eq!(joins.len(), 1);
        let Event::Join {
            channel, is_self, ..
        } = &joins[0]
        else {
            panic!("expected join payload");
        };
        assert_eq!(channel, "#r");
        assert!(is_self);
    }

    #[tokio::test]
    async fn first_userstate_emits_self_join() {
        let client = identified_client();
        let joins = capture(&client, "join");
        let states = capture(&client, "userstate");
        feed(&client, "@mod=1;user-type=mod :tmi.twitch.tv USERSTATE #r").await;
        feed(&client, "@mod=1;user-type=mod :tmi.twitch.tv USERSTATE #r").await;
        assert_eq!(joins.lock().unwrap().len(), 1);
        assert_eq!(states.lock().unwrap().len(), 2);
        assert!(client.is_mod("#r", "bot"));
    }

    #[tokio::test]
    async fn usernotice_emits_generic_and_specific() {
        let client = identified_client();
        let generic = capture(&client, "usernotice");
        let resubs = capture(&client, "resub");
        feed(
            &client,
            "@msg-id=resub;display-name=Sub;msg-param-streak-months=6;msg-param-sub-plan=1000 :tmi.twitch.tv USERNOTICE #r :six months!",
        )
        .await;
        assert_eq!(generic.lock().unwrap().len(), 1);
        let resubs = resubs.lock().unwrap();
        let Event::Resub {
            username, months, ..
        } = &resubs[0]
        else {
            panic!("expected resub payload");
        };
        assert_eq!(username, "Sub");
        assert_eq!(*months, 6);
    }

    #[tokio::test]
    async fn hosttarget_routes_hosting_and_unhost() {
        let client = identified_client();
        let hosting = capture(&client, "hosting");
        let unhost = capture(&client, "unhost");
        feed(&client, ":tmi.twitch.tv HOSTTARGET #r :Target 42").await;
        feed(&client, ":tmi.twitch.tv HOSTTARGET #r :- 0").await;
        let hosting = hosting.lock().unwrap();
        let Event::Hosting {
            target, viewers, ..
        } = &hosting[0]
        else {
            panic!("expected hosting payload");
        };
        assert_eq!(target, "target");
        assert_eq!(*viewers, 42);
        assert_eq!(unhost.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn welcome_marks_open_and_emits_connected() {
        let client = identified_client();
        let connected = capture(&client, "connected");
        feed(&client, ":tmi.twitch.tv 001 bot :Welcome, GLHF!").await;
        assert_eq!(client.ready_state(), crate::client::ReadyState::Open);
        assert_eq!(connected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn part_echo_resolves_pending_part() {
        let client = identified_client();
        let parts = capture(&client, "part");
        let wait = client.inner.expect_reply(
            CommandKind::Part,
            Some("#r".to_string()),
            "PART #r",
        );
        feed(&client, ":bot!bot@bot.tmi.twitch.tv PART #r").await;
        assert!(matches!(wait.wait().await, Ok(Reply::Channel(_))));
        let parts = parts.lock().unwrap();
        let Event::Part { is_self, .. } = &parts[0] else {
            panic!("expected part payload");
        };
        assert!(is_self);
    }

    #[tokio::test]
    async fn unhandled_command_emits_raw_message() {
        let client = identified_client();
        let raws = capture(&client, "raw_message");
        feed(&client, ":tmi.twitch.tv 366 bot #r :End of /NAMES list").await;
        assert!(raws.lock().unwrap().is_empty());
        feed(&client, ":tmi.twitch.tv 900 bot :something unusual").await;
        assert_eq!(raws.lock().unwrap().len(), 1);
    }

    #[test]
    fn command_words_map_to_kinds() {
        assert_eq!(kind_for_command_word("ban"), Some(CommandKind::Ban));
        assert_eq!(kind_for_command_word("untimeout"), Some(CommandKind::Unban));
        assert_eq!(kind_for_command_word("nonsense"), None);
    }
}
