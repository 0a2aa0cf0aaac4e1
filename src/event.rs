//! Events emitted by the client for consumers to observe.
//!
//! One variant per public event. Emission is name-keyed so a single payload
//! can fan out under several names (a PRIVMSG fires both `chat` and
//! `message`); [`Event::name`] gives the primary name of a variant.

use std::time::Duration;

use crate::irc::IrcMessage;
use crate::tags::TagMap;

/// Subscription method details carried by sub/resub/gift events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubMethods {
    pub prime: bool,
    /// Plan id, e.g. `1000`, `2000`, `3000` or `Prime`.
    pub plan: Option<String>,
    pub plan_name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Login completed (001 welcome).
    Connected { server: String, port: u16 },
    /// Connection re-established after a drop; follows `connected`.
    Reconnected { server: String, port: u16 },
    Disconnected { reason: String },

    /// Any chat line: emitted as `message` always, and as `chat` or `action`
    /// depending on the CTCP ACTION wrapper.
    Message {
        channel: String,
        userstate: TagMap,
        text: String,
        is_self: bool,
    },
    Whisper {
        from: String,
        userstate: TagMap,
        text: String,
        is_self: bool,
    },
    Cheer {
        channel: String,
        userstate: TagMap,
        text: String,
    },
    /// Channel-point redemption attached to a message.
    Redeem {
        channel: String,
        username: String,
        reward: String,
        userstate: TagMap,
        text: String,
    },

    Join {
        channel: String,
        username: String,
        is_self: bool,
    },
    Part {
        channel: String,
        username: String,
        is_self: bool,
    },

    Ban {
        channel: String,
        username: String,
        reason: Option<String>,
        tags: TagMap,
    },
    Timeout {
        channel: String,
        username: String,
        reason: Option<String>,
        seconds: i64,
        tags: TagMap,
    },
    ClearChat { channel: String },
    MessageDeleted {
        channel: String,
        username: String,
        text: String,
        tags: TagMap,
    },

    Notice {
        channel: String,
        msg_id: Option<String>,
        text: String,
    },
    /// Automod held or rejected a message.
    Automod {
        channel: String,
        msg_id: String,
        text: String,
    },

    /// Generic USERNOTICE; always emitted alongside the specific variant.
    UserNotice {
        msg_id: String,
        channel: String,
        tags: TagMap,
        text: Option<String>,
    },
    Sub {
        channel: String,
        username: String,
        methods: SubMethods,
        text: Option<String>,
        tags: TagMap,
    },
    Resub {
        channel: String,
        username: String,
        months: i64,
        text: Option<String>,
        tags: TagMap,
        methods: SubMethods,
    },
    SubGift {
        channel: String,
        username: String,
        months: i64,
        recipient: String,
        methods: SubMethods,
        tags: TagMap,
    },
    SubMysteryGift {
        channel: String,
        username: String,
        count: i64,
        methods: SubMethods,
        tags: TagMap,
    },
    AnonSubGift {
        channel: String,
        months: i64,
        recipient: String,
        methods: SubMethods,
        tags: TagMap,
    },
    AnonSubMysteryGift {
        channel: String,
        count: i64,
        methods: SubMethods,
        tags: TagMap,
    },
    PrimePaidUpgrade {
        channel: String,
        username: String,
        methods: SubMethods,
        tags: TagMap,
    },
    GiftPaidUpgrade {
        channel: String,
        username: String,
        sender: Option<String>,
        tags: TagMap,
    },
    AnonGiftPaidUpgrade {
        channel: String,
        username: String,
        tags: TagMap,
    },
    Announcement {
        channel: String,
        tags: TagMap,
        text: Option<String>,
        color: Option<String>,
    },
    Raided {
        channel: String,
        raider: Option<String>,
        viewers: i64,
        tags: TagMap,
    },
    Ritual {
        channel: String,
        username: String,
        ritual: String,
        tags: TagMap,
    },

    /// Room state snapshot or partial update, post-merge.
    RoomState { channel: String, tags: TagMap },
    Slow {
        channel: String,
        enabled: bool,
        seconds: i64,
    },
    FollowersOnly {
        channel: String,
        enabled: bool,
        minutes: i64,
    },
    Subscribers { channel: String, enabled: bool },
    EmoteOnly { channel: String, enabled: bool },
    R9kBeta { channel: String, enabled: bool },

    UserState { channel: String, tags: TagMap },
    GlobalUserState { tags: TagMap },
    EmoteSets { sets: String },

    Mods {
        channel: String,
        mods: Vec<String>,
    },
    Vips {
        channel: String,
        vips: Vec<String>,
    },
    /// A user gained moderator status (MODE +o).
    ModAdded { channel: String, username: String },
    /// A user lost moderator status (MODE -o).
    ModRemoved { channel: String, username: String },
    /// NAMES reply for a channel.
    Names {
        channel: String,
        users: Vec<String>,
    },

    Hosting {
        channel: String,
        target: String,
        viewers: i64,
    },
    Unhost { channel: String, viewers: i64 },
    /// Another channel is hosting us (jtv notification).
    Hosted {
        channel: String,
        host: String,
        viewers: i64,
        auto: bool,
    },

    /// A message the dispatcher has no specific handling for.
    RawMessage { message: IrcMessage },
    /// Keepalive PING sent to the server.
    Ping,
    /// PONG received; carries the measured round-trip latency.
    Pong { latency: Duration },
}

impl Event {
    /// Primary event name, used as the routing key for listeners.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Reconnected { .. } => "reconnected",
            Event::Disconnected { .. } => "disconnected",
            Event::Message { .. } => "message",
            Event::Whisper { .. } => "whisper",
            Event::Cheer { .. } => "cheer",
            Event::Redeem { .. } => "redeem",
            Event::Join { .. } => "join",
            Event::Part { .. } => "part",
            Event::Ban { .. } => "ban",
            Event::Timeout { .. } => "timeout",
            Event::ClearChat { .. } => "clearchat",
            Event::MessageDeleted { .. } => "messagedeleted",
            Event::Notice { .. } => "notice",
            Event::Automod { .. } => "automod",
            Event::UserNotice { .. } => "usernotice",
            Event::Sub { .. } => "sub",
            Event::Resub { .. } => "resub",
            Event::SubGift { .. } => "subgift",
            Event::SubMysteryGift { .. } => "submysterygift",
            Event::AnonSubGift { .. } => "anonsubgift",
            Event::AnonSubMysteryGift { .. } => "anonsubmysterygift",
            Event::PrimePaidUpgrade { .. } => "primepaidupgrade",
            Event::GiftPaidUpgrade { .. } => "giftpaidupgrade",
            Event::AnonGiftPaidUpgrade { .. } => "anongiftpaidupgrade",
            Event::Announcement { .. } => "announcement",
            Event::Raided { .. } => "raided",
            Event::Ritual { .. } => "ritual",
            Event::RoomState { .. } => "roomstate",
            Event::Slow { .. } => "slow",
            Event::FollowersOnly { .. } => "followersonly",
            Event::Subscribers { .. } => "subscribers",
            Event::EmoteOnly { .. } => "emoteonly",
            Event::R9kBeta { .. } => "r9kbeta",
            Event::UserState { .. } => "userstate",
            Event::GlobalUserState { .. } => "globaluserstate",
            Event::EmoteSets { .. } => "emotesets",
            Event::Mods { .. } => "mods",
            Event::Vips { .. } => "vips",
            Event::ModAdded { .. } => "mod",
            Event::ModRemoved { .. } => "unmod",
            Event::Names { .. } => "names",
            Event::Hosting { .. } => "hosting",
            Event::Unhost { .. } => "unhost",
            Event::Hosted { .. } => "hosted",
            Event::RawMessage { .. } => "raw_message",
            Event::Ping => "ping",
            Event::Pong { .. } => "pong",
        }
    }
}
