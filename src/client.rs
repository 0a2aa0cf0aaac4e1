//! Connection runtime: socket ownership, login, reader loop, keepalive, and
//! the reconnect supervisor.
//!
//! One [`Client`] owns one connection and all of its subcomponents (emitter,
//! queues, state, pending-reply registry). Two clients in a process share
//! nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

use crate::emitter::EventEmitter;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::irc::IrcMessage;
use crate::options::{ClientOptions, LogLevel};
use crate::queue::MessageQueue;
use crate::tags::TagMap;
use crate::utils;

pub(crate) const PING_PAYLOAD: &str = "PING :tmi.twitch.tv";

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    /// Socket writable and login complete.
    Open,
    Closing,
    Closed,
}

/// Per-channel state tracked while joined.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    /// Our own tags for the channel (USERSTATE).
    pub userstate: TagMap,
    /// Broadcast room settings (ROOMSTATE): slow, followers-only, ...
    pub roomstate: TagMap,
}

pub(crate) struct ClientState {
    pub ready_state: ReadyState,
    pub globaluserstate: TagMap,
    pub channels: HashMap<String, ChannelState>,
    pub moderators: HashMap<String, Vec<String>>,
    /// Channels to (re)join when a connection comes up.
    pub join_targets: Vec<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub reconnecting: bool,
    /// Cleared permanently on authentication failure.
    pub reconnect_enabled: bool,
    pub was_close_called: bool,
    pub current_latency: Duration,
    pub latency_sent: Option<Instant>,
    pub last_pong: Option<Instant>,
    pub last_joined: String,
    pub emote_sets: String,
}

// ---------------------------------------------------------------------------
// Command/reply correlation
// ---------------------------------------------------------------------------

/// The command kinds Twitch answers via NOTICE (or JOIN/PART echo, or PONG).
/// Correlation is keyed by kind, not per request: the NOTICEs carry no
/// request id, so a resolution wakes every waiter of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CommandKind {
    Ban,
    Unban,
    Timeout,
    Clear,
    Color,
    Commercial,
    DeleteMessage,
    EmoteOnly,
    EmoteOnlyOff,
    Followers,
    FollowersOff,
    Host,
    Unhost,
    Join,
    Part,
    Mod,
    Unmod,
    Mods,
    Vip,
    Unvip,
    Vips,
    Ping,
    R9kBeta,
    R9kBetaOff,
    Slow,
    SlowOff,
    Subscribers,
    SubscribersOff,
    Whisper,
}

impl CommandKind {
    pub(crate) const ALL: &'static [CommandKind] = &[
        CommandKind::Ban,
        CommandKind::Unban,
        CommandKind::Timeout,
        CommandKind::Clear,
        CommandKind::Color,
        CommandKind::Commercial,
        CommandKind::DeleteMessage,
        CommandKind::EmoteOnly,
        CommandKind::EmoteOnlyOff,
        CommandKind::Followers,
        CommandKind::FollowersOff,
        CommandKind::Host,
        CommandKind::Unhost,
        CommandKind::Join,
        CommandKind::Part,
        CommandKind::Mod,
        CommandKind::Unmod,
        CommandKind::Mods,
        CommandKind::Vip,
        CommandKind::Unvip,
        CommandKind::Vips,
        CommandKind::Ping,
        CommandKind::R9kBeta,
        CommandKind::R9kBetaOff,
        CommandKind::Slow,
        CommandKind::SlowOff,
        CommandKind::Subscribers,
        CommandKind::SubscribersOff,
        CommandKind::Whisper,
    ];
}

/// Successful reply payloads.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ack,
    /// `/mods`, `/vips` name lists.
    Names(Vec<String>),
    /// Hosts remaining after `/host`.
    Remaining(u64),
    /// Channel echoed back by a JOIN/PART resolution.
    Channel(String),
    Latency(Duration),
}

type ReplyResult = std::result::Result<Reply, String>;

struct Waiter {
    id: u64,
    /// When set, only resolutions for this channel wake the waiter.
    channel: Option<String>,
    tx: oneshot::Sender<ReplyResult>,
}

#[derive(Default)]
pub(crate) struct PendingReplies {
    waiters: Mutex<HashMap<CommandKind, Vec<Waiter>>>,
    next_id: AtomicU64,
}

impl PendingReplies {
    pub(crate) fn register(
        &self,
        kind: CommandKind,
        channel: Option<String>,
    ) -> (u64, oneshot::Receiver<ReplyResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Waiter { id, channel, tx });
        (id, rx)
    }

    pub(crate) fn remove(&self, kind: CommandKind, id: u64) {
        let mut map = self.waiters.lock().unwrap();
        if let Some(list) = map.get_mut(&kind) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                map.remove(&kind);
            }
        }
    }

    /// Wake every waiter of `kind` whose channel filter matches. A resolution
    /// with no channel matches all waiters. Waiters are consumed, so a second
    /// matching NOTICE finds nobody: resolution is exactly-once.
    pub(crate) fn resolve(&self, kind: CommandKind, channel: Option<&str>, result: ReplyResult) {
        let woken: Vec<Waiter> = {
            let mut map = self.waiters.lock().unwrap();
            let Some(list) = map.get_mut(&kind) else {
                return;
            };
            let (woken, kept) = list.drain(..).partition(|w| channel_matches(w, channel));
            *list = kept;
            if list.is_empty() {
                map.remove(&kind);
            }
            woken
        };
        for waiter in woken {
            let _ = waiter.tx.send(result.clone());
        }
    }

    /// Fail every pending command of every kind (global failure NOTICEs like
    /// `no_permission`, and unknown msg-ids).
    pub(crate) fn fail_all(&self, channel: Option<&str>, reason: &str) {
        for kind in CommandKind::ALL {
            self.resolve(*kind, channel, Err(reason.to_string()));
        }
    }

    #[cfg(test)]
    fn waiter_count(&self, kind: CommandKind) -> usize {
        self.waiters
            .lock()
            .unwrap()
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

fn channel_matches(waiter: &Waiter, channel: Option<&str>) -> bool {
    match (&waiter.channel, channel) {
        (None, _) | (_, None) => true,
        (Some(want), Some(got)) => want == got,
    }
}

/// In-flight command await. Dropping it (timeout, caller cancellation)
/// removes the registered waiter so nothing leaks.
pub(crate) struct ReplyWait {
    inner: Arc<ClientInner>,
    kind: CommandKind,
    id: u64,
    rx: Option<oneshot::Receiver<ReplyResult>>,
    command: String,
    channel: Option<String>,
}

impl ReplyWait {
    pub(crate) async fn wait(mut self) -> Result<Reply> {
        let rx = self.rx.take().expect("reply already awaited");
        let timeout = self.inner.opts.connection.command_timeout();
        self.finish(tokio::time::timeout(timeout, rx).await)
    }

    /// Like `wait`, but with an explicit bound (whisper uses a short one).
    pub(crate) async fn wait_with_timeout(mut self, timeout: Duration) -> Result<Reply> {
        let rx = self.rx.take().expect("reply already awaited");
        self.finish(tokio::time::timeout(timeout, rx).await)
    }

    fn finish(
        &self,
        outcome: std::result::Result<
            std::result::Result<ReplyResult, oneshot::error::RecvError>,
            tokio::time::error::Elapsed,
        >,
    ) -> Result<Reply> {
        match outcome {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(reason))) => Err(Error::CommandFailed {
                command: self.command.clone(),
                channel: self.channel.clone().unwrap_or_default(),
                reason,
            }),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout {
                command: self.command.clone(),
            }),
        }
    }
}

impl Drop for ReplyWait {
    fn drop(&mut self) {
        self.inner.pending.remove(self.kind, self.id);
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

pub(crate) fn initial_backoff(interval: Duration, decay: f64, max: Duration) -> Duration {
    interval.mul_f64(decay.max(1.0)).min(max)
}

pub(crate) fn next_backoff(previous: Duration, decay: f64, max: Duration) -> Duration {
    previous.mul_f64(decay.max(1.0)).min(max)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Twitch chat client. Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) opts: ClientOptions,
    pub(crate) server: String,
    pub(crate) port: u16,
    pub(crate) global_default_channel: String,
    pub(crate) username: Mutex<String>,
    pub(crate) emitter: EventEmitter,
    pub(crate) state: Mutex<ClientState>,
    /// Write half of the socket; the mutex serializes all writes.
    pub(crate) writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pub(crate) pending: PendingReplies,
    pub(crate) join_queue: MessageQueue,
    pub(crate) message_queue: MessageQueue,
    pub(crate) command_queue: MessageQueue,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    /// Signalled by the 001 handler (or a login-failure NOTICE) while
    /// `connect` waits for the handshake.
    welcome: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Self {
        let server = opts.connection.server.clone();
        let port = opts.connection.port;
        let join_targets: Vec<String> =
            opts.channels.iter().map(|c| utils::channel(c)).collect();
        let username = opts
            .identity
            .username
            .as_deref()
            .map(utils::username)
            .unwrap_or_else(utils::justinfan);
        let global_default_channel = utils::channel(&opts.global_default_channel);

        let connection = &opts.connection;
        let join_queue = MessageQueue::new(connection.join_interval());
        let message_queue = MessageQueue::new(connection.message_interval());
        let command_queue = MessageQueue::new(connection.command_interval());
        let initial_delay = initial_backoff(
            connection.reconnect_interval(),
            connection.reconnect_decay,
            connection.max_reconnect_interval(),
        );
        let reconnect_enabled = connection.reconnect;

        Client {
            inner: Arc::new(ClientInner {
                server,
                port,
                global_default_channel,
                username: Mutex::new(username),
                emitter: EventEmitter::new(),
                state: Mutex::new(ClientState {
                    ready_state: ReadyState::Closed,
                    globaluserstate: TagMap::new(),
                    channels: HashMap::new(),
                    moderators: HashMap::new(),
                    join_targets,
                    reconnect_attempts: 0,
                    reconnect_delay: initial_delay,
                    reconnecting: false,
                    reconnect_enabled,
                    was_close_called: false,
                    current_latency: Duration::ZERO,
                    latency_sent: None,
                    last_pong: None,
                    last_joined: String::new(),
                    emote_sets: String::new(),
                }),
                writer: tokio::sync::Mutex::new(None),
                pending: PendingReplies::default(),
                join_queue,
                message_queue,
                command_queue,
                reader_task: Mutex::new(None),
                ping_task: Mutex::new(None),
                welcome: Mutex::new(None),
                opts,
            }),
        }
    }

    // -- event registration -------------------------------------------------

    pub fn on<F>(&self, event: &str, listener: F) -> crate::emitter::ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.emitter.on(event, listener)
    }

    pub fn on_async<F>(&self, event: &str, listener: F) -> crate::emitter::ListenerId
    where
        F: Fn(
                Event,
            ) -> std::pin::Pin<
                Box<
                    dyn std::future::Future<
                            Output = std::result::Result<(), crate::emitter::ListenerError>,
                        > + Send,
                >,
            > + Send
            + Sync
            + 'static,
    {
        self.inner.emitter.on_async(event, listener)
    }

    pub fn once<F>(&self, event: &str, listener: F) -> crate::emitter::ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.emitter.once(event, listener)
    }

    pub fn off(&self, event: &str, id: crate::emitter::ListenerId) -> bool {
        self.inner.emitter.off(event, id)
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    // -- introspection ------------------------------------------------------

    pub fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().unwrap().ready_state
    }

    pub fn username(&self) -> String {
        self.inner.username.lock().unwrap().clone()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.opts
    }

    /// Channels we are currently in.
    pub fn channels(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .channels
            .keys()
            .cloned()
            .collect()
    }

    pub fn roomstate(&self, channel: &str) -> Option<ChannelState> {
        self.inner
            .state
            .lock()
            .unwrap()
            .channels
            .get(&utils::channel(channel))
            .cloned()
    }

    pub fn is_mod(&self, channel: &str, username: &str) -> bool {
        let channel = utils::channel(channel);
        let username = utils::username(username);
        self.inner
            .state
            .lock()
            .unwrap()
            .moderators
            .get(&channel)
            .is_some_and(|mods| mods.contains(&username))
    }

    /// Round-trip latency measured by the last keepalive PING.
    pub fn current_latency(&self) -> Duration {
        self.inner.state.lock().unwrap().current_latency
    }

    // -- lifecycle ----------------------------------------------------------

    /// Connect, log in, and join the configured channels. Resolves once the
    /// server acknowledges login (001), bounded by `connection.timeout`.
    pub async fn connect(&self) -> Result<(String, u16)> {
        {
            let mut st = self.inner.state.lock().unwrap();
            if matches!(st.ready_state, ReadyState::Open | ReadyState::Connecting) {
                return Ok((self.inner.server.clone(), self.inner.port));
            }
            st.ready_state = ReadyState::Connecting;
            st.was_close_called = false;
            st.reconnecting = false;
            st.reconnect_enabled = self.inner.opts.connection.reconnect;
            st.reconnect_attempts = 0;
            st.reconnect_delay = initial_backoff(
                self.inner.opts.connection.reconnect_interval(),
                self.inner.opts.connection.reconnect_decay,
                self.inner.opts.connection.max_reconnect_interval(),
            );
        }
        match self.inner.establish().await {
            Ok(()) => Ok((self.inner.server.clone(), self.inner.port)),
            Err(err) => {
                self.inner.state.lock().unwrap().ready_state = ReadyState::Closed;
                Err(err)
            }
        }
    }

    /// Close the connection. Suppresses the reconnect supervisor.
    pub async fn disconnect(&self) -> Result<(String, u16)> {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.ready_state == ReadyState::Closed {
                return Err(Error::NotConnected);
            }
            st.was_close_called = true;
        }
        self.inner
            .handle_disconnect("Client disconnect requested", false)
            .await;
        Ok((self.inner.server.clone(), self.inner.port))
    }
}

impl ClientInner {
    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().unwrap().ready_state == ReadyState::Open
    }

    pub(crate) fn username(&self) -> String {
        self.username.lock().unwrap().clone()
    }

    pub(crate) fn is_anonymous(&self) -> bool {
        utils::is_justinfan(&self.username())
    }

    pub(crate) fn expect_reply(
        self: &Arc<Self>,
        kind: CommandKind,
        channel: Option<String>,
        command: &str,
    ) -> ReplyWait {
        let (id, rx) = self.pending.register(kind, channel.clone());
        ReplyWait {
            inner: self.clone(),
            kind,
            id,
            rx: Some(rx),
            command: command.to_string(),
            channel,
        }
    }

    // -- connection establishment -------------------------------------------

    fn establish(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.establish_inner())
    }

    async fn establish_inner(self: &Arc<Self>) -> Result<()> {
        let connection = &self.opts.connection;
        let addr = format!("{}:{}", self.server, self.port);
        let handshake_timeout = connection.handshake_timeout();

        let tcp = tokio::time::timeout(handshake_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Connection(format!("timed out connecting to {addr}")))?
            .map_err(|e| Error::Connection(format!("TCP connect to {addr} failed: {e}")))?;

        let (reader, writer): (BoxedReader, BoxedWriter) = if connection.secure {
            let connector = TlsConnector::from(Arc::new(rustls_default_config()));
            let dns_name = rustls::pki_types::ServerName::try_from(self.server.clone())
                .map_err(|e| Error::Connection(format!("invalid server name: {e}")))?;
            let stream = connector
                .connect(dns_name, tcp)
                .await
                .map_err(|e| Error::Connection(format!("TLS handshake with {addr} failed: {e}")))?;
            let (r, w) = tokio::io::split(stream);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tokio::io::split(tcp);
            (Box::new(r), Box::new(w))
        };

        *self.writer.lock().await = Some(writer);
        tracing::info!(server = %self.server, port = self.port, "connected, logging in");

        let (welcome_tx, welcome_rx) = oneshot::channel();
        *self.welcome.lock().unwrap() = Some(welcome_tx);

        {
            let mut slot = self.reader_task.lock().unwrap();
            let inner = self.clone();
            *slot = Some(tokio::spawn(async move {
                inner.reader_loop(BufReader::new(reader)).await;
            }));
        }
        {
            let mut slot = self.ping_task.lock().unwrap();
            let inner = self.clone();
            *slot = Some(tokio::spawn(async move {
                inner.ping_loop().await;
            }));
        }

        let outcome = async {
            self.login().await?;
            match tokio::time::timeout(handshake_timeout, welcome_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::Connection(
                    "connection closed during login".to_string(),
                )),
                Err(_) => {
                    *self.welcome.lock().unwrap() = None;
                    Err(Error::Connection("login handshake timed out".to_string()))
                }
            }
        }
        .await;
        if outcome.is_err() {
            // Reader/keepalive were already running; take the half-open
            // connection down before reporting.
            self.teardown(false).await;
        }
        outcome
    }

    /// CAP REQ, PASS (non-anonymous only), NICK.
    async fn login(&self) -> Result<()> {
        let mut caps = Vec::new();
        if self.opts.request_tags {
            caps.push("twitch.tv/tags");
        }
        if self.opts.request_commands {
            caps.push("twitch.tv/commands");
        }
        if self.opts.request_membership && !self.opts.skip_membership {
            caps.push("twitch.tv/membership");
        }
        if !caps.is_empty() {
            self.write_raw(&format!("CAP REQ :{}", caps.join(" "))).await?;
        }

        let password = self
            .opts
            .identity
            .password
            .as_deref()
            .map(utils::password)
            .unwrap_or_default();
        if !password.is_empty() {
            self.write_raw(&format!("PASS {password}")).await?;
        }
        let username = self.username();
        self.write_raw(&format!("NICK {username}")).await?;
        Ok(())
    }

    // -- socket IO ----------------------------------------------------------

    /// Write one line, CRLF-framed. Serialized by the write mutex.
    pub(crate) async fn write_raw(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        tracing::trace!(%line, "send");
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, mut reader: BufReader<BoxedReader>) {
        let mut buf = String::new();
        loop {
            buf.clear();
            match reader.read_line(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = buf.trim_end_matches(['\r', '\n']);
                    if line.is_empty() {
                        continue;
                    }
                    tracing::trace!(%line, "recv");
                    // PING is answered inline, bypassing the queues, and is
                    // not dispatched as an event.
                    if line == "PING" || line.starts_with("PING ") {
                        let token = line[4..].trim_start().trim_start_matches(':');
                        let pong = if token.is_empty() {
                            "PONG".to_string()
                        } else {
                            format!("PONG :{token}")
                        };
                        if self.write_raw(&pong).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    match IrcMessage::parse(line) {
                        Some(msg) => crate::handlers::handle_message(&self, msg).await,
                        None => tracing::debug!(%line, "skipping unparseable line"),
                    }
                    // A handler may have torn the connection down (RECONNECT,
                    // login failure); stop reading the dead socket.
                    if matches!(
                        self.state.lock().unwrap().ready_state,
                        ReadyState::Closed | ReadyState::Closing
                    ) {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "socket read error");
                    break;
                }
            }
        }
        self.handle_disconnect("Connection closed", true).await;
    }

    /// Keepalive: periodic PING with latency measurement and stale-connection
    /// detection.
    async fn ping_loop(self: Arc<Self>) {
        let interval = Duration::from_secs_f64(self.opts.connection.ping_interval.max(30.0));
        let pong_timeout = Duration::from_secs_f64(self.opts.connection.ping_timeout);
        loop {
            tokio::time::sleep(interval).await;
            if !self.is_open() {
                continue;
            }
            let sent = Instant::now();
            self.state.lock().unwrap().latency_sent = Some(sent);
            if self.write_raw(PING_PAYLOAD).await.is_err() {
                continue;
            }
            self.emitter.emit("ping", &Event::Ping);

            tokio::time::sleep(pong_timeout).await;
            let stale = {
                let st = self.state.lock().unwrap();
                st.ready_state == ReadyState::Open
                    && st.last_pong.map_or(true, |pong| pong < sent)
            };
            if stale {
                tracing::warn!("no PONG within timeout, dropping connection");
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.handle_disconnect("Ping timeout", false).await;
                });
                return;
            }
        }
    }

    // -- supervisor ---------------------------------------------------------

    /// Tear the connection down and, when allowed, hand off to the reconnect
    /// supervisor. `from_reader` is set when the caller runs on the reader
    /// task (which must not abort itself).
    pub(crate) async fn handle_disconnect(self: &Arc<Self>, reason: &str, from_reader: bool) {
        {
            let mut st = self.state.lock().unwrap();
            if matches!(st.ready_state, ReadyState::Closed | ReadyState::Closing) {
                return;
            }
            st.ready_state = ReadyState::Closing;
        }
        self.teardown(from_reader).await;

        // When a connect/reconnect caller is still awaiting 001, the error is
        // theirs to handle; the supervisor must not start a second attempt.
        let login_in_flight = match self.welcome.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(Err(Error::Connection(reason.to_string())));
                true
            }
            None => false,
        };

        let should_reconnect = {
            let mut st = self.state.lock().unwrap();
            st.ready_state = ReadyState::Closed;
            !login_in_flight && !st.was_close_called && st.reconnect_enabled
        };

        tracing::info!(%reason, "disconnected");
        self.emitter.emit(
            "disconnected",
            &Event::Disconnected {
                reason: reason.to_string(),
            },
        );

        if should_reconnect {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.supervise().await;
            });
        }
    }

    /// Stop queues and background tasks, drain the write mutex, close the
    /// socket, and drop per-connection channel snapshots.
    async fn teardown(&self, from_reader: bool) {
        self.join_queue.stop();
        self.message_queue.stop();
        self.command_queue.stop();
        if let Some(handle) = self.ping_task.lock().unwrap().take() {
            handle.abort();
        }
        if !from_reader {
            if let Some(handle) = self.reader_task.lock().unwrap().take() {
                handle.abort();
            }
        }
        {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        }
        let mut st = self.state.lock().unwrap();
        st.channels.clear();
        st.latency_sent = None;
        st.last_pong = None;
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            let delay = {
                let mut st = self.state.lock().unwrap();
                if let Some(max) = self.opts.connection.max_reconnect_attempts {
                    if st.reconnect_attempts >= max {
                        drop(st);
                        tracing::error!("maximum reconnection attempts reached, giving up");
                        self.emitter.emit(
                            "disconnected",
                            &Event::Disconnected {
                                reason: "Maximum reconnection attempts reached".to_string(),
                            },
                        );
                        return;
                    }
                }
                st.reconnect_attempts += 1;
                st.reconnecting = true;
                let delay = st.reconnect_delay;
                st.reconnect_delay = next_backoff(
                    delay,
                    self.opts.connection.reconnect_decay,
                    self.opts.connection.max_reconnect_interval(),
                );
                delay
            };
            let attempt = self.state.lock().unwrap().reconnect_attempts;
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;

            self.state.lock().unwrap().ready_state = ReadyState::Connecting;
            match self.establish().await {
                // 001 resets the backoff and emits `reconnected`.
                Ok(()) => return,
                Err(Error::Authentication) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "reconnect attempt failed");
                    let enabled = {
                        let mut st = self.state.lock().unwrap();
                        st.ready_state = ReadyState::Closed;
                        st.reconnect_enabled && !st.was_close_called
                    };
                    if !enabled {
                        return;
                    }
                }
            }
        }
    }

    // -- outbound helpers ---------------------------------------------------

    /// Route a slash-command either through the command queue (channel
    /// target) or directly onto the socket (connection-scoped lines).
    pub(crate) async fn send_command(
        self: &Arc<Self>,
        channel: Option<&str>,
        command: &str,
        tags: Option<&TagMap>,
    ) -> Result<()> {
        let prefix = tags
            .and_then(crate::irc::format_tags)
            .map(|t| format!("{t} "))
            .unwrap_or_default();
        match channel {
            Some(channel) => {
                let line = format!("{prefix}PRIVMSG {channel} :{command}");
                let inner = self.clone();
                self.command_queue.add(async move {
                    if let Err(err) = inner.write_raw(&line).await {
                        tracing::warn!(error = %err, "queued command write failed");
                    }
                });
                Ok(())
            }
            None => self.write_raw(&format!("{prefix}{command}")).await,
        }
    }

    /// Enqueue a JOIN through the JOIN queue.
    pub(crate) fn enqueue_join(self: &Arc<Self>, channel: &str) {
        let line = format!("JOIN {channel}");
        let inner = self.clone();
        self.join_queue.add(async move {
            if let Err(err) = inner.write_raw(&line).await {
                tracing::warn!(error = %err, "queued JOIN write failed");
            }
        });
    }

    /// Send a PRIVMSG body through the message queue, splitting it into
    /// <=500-byte chunks, and emit the self-echo chat events after each
    /// chunk is written.
    pub(crate) async fn send_privmsg(
        self: &Arc<Self>,
        channel: String,
        message: String,
        tags: TagMap,
    ) -> Result<()> {
        let prefix = crate::irc::format_tags(&tags)
            .map(|t| format!("{t} "))
            .unwrap_or_default();
        let chunks: Vec<String> = utils::paginate(&message, utils::PRIVMSG_LIMIT)
            .into_iter()
            .map(str::to_string)
            .collect();
        for chunk in chunks {
            let line = format!("{prefix}PRIVMSG {channel} :{chunk}");
            let inner = self.clone();
            let channel = channel.clone();
            self.message_queue.add(async move {
                if inner.write_raw(&line).await.is_err() {
                    return;
                }
                inner.emit_self_message(&channel, &chunk);
            });
        }
        Ok(())
    }

    /// Self-echo: Twitch does not echo our own PRIVMSGs back, so the client
    /// emits `chat`/`action` + `message` with `self = true` itself.
    fn emit_self_message(&self, channel: &str, chunk: &str) {
        let action = utils::action_message(chunk);
        let mut userstate = {
            let st = self.state.lock().unwrap();
            st.channels
                .get(channel)
                .map(|c| c.userstate.clone())
                .unwrap_or_default()
        };
        userstate.insert(
            "message-type".to_string(),
            crate::tags::Tag::Str(if action.is_some() { "action" } else { "chat" }.to_string()),
        );
        let text = action.unwrap_or(chunk).to_string();
        let username = self.username();
        self.log_chat(channel, &username, &text, action.is_some());
        let event = Event::Message {
            channel: channel.to_string(),
            userstate,
            text,
            is_self: true,
        };
        let names: [&str; 2] = if action.is_some() {
            ["action", "message"]
        } else {
            ["chat", "message"]
        };
        self.emitter.emit_many(&names, &event);
    }

    /// Log a chat line at the configured `messages_level`. `tracing` levels
    /// are static per call site, hence the dispatch.
    pub(crate) fn log_chat(&self, channel: &str, username: &str, text: &str, action: bool) {
        let marker = if action { "*" } else { "" };
        match self.opts.logging.messages_level {
            LogLevel::Trace => tracing::trace!("[{channel}] {marker}<{username}>: {text}"),
            LogLevel::Debug => tracing::debug!("[{channel}] {marker}<{username}>: {text}"),
            LogLevel::Info => tracing::info!("[{channel}] {marker}<{username}>: {text}"),
            LogLevel::Warn => tracing::warn!("[{channel}] {marker}<{username}>: {text}"),
            LogLevel::Error | LogLevel::Fatal => {
                tracing::error!("[{channel}] {marker}<{username}>: {text}")
            }
        }
    }

    /// Take the handshake waiter, if a `connect` is in flight.
    pub(crate) fn take_welcome(&self) -> Option<oneshot::Sender<Result<()>>> {
        self.welcome.lock().unwrap().take()
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_clamped() {
        let max = Duration::from_millis(30_000);
        let mut delay = initial_backoff(Duration::from_millis(1200), 1.5, max);
        assert_eq!(delay, Duration::from_millis(1800));
        let mut previous = delay;
        for _ in 0..20 {
            delay = next_backoff(delay, 1.5, max);
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
        assert_eq!(delay, max);
    }

    #[test]
    fn backoff_ignores_shrinking_decay() {
        let max = Duration::from_secs(30);
        let delay = next_backoff(Duration::from_secs(2), 0.5, max);
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn pending_resolution_is_exactly_once() {
        let pending = PendingReplies::default();
        let (_, rx1) = pending.register(CommandKind::Ban, None);
        let (_, rx2) = pending.register(CommandKind::Ban, None);

        pending.resolve(CommandKind::Ban, Some("#chan"), Ok(Reply::Ack));
        assert!(matches!(rx1.await, Ok(Ok(Reply::Ack))));
        assert!(matches!(rx2.await, Ok(Ok(Reply::Ack))));

        // Nothing pending: a second NOTICE is a no-op.
        pending.resolve(CommandKind::Ban, Some("#chan"), Err("late".to_string()));
        assert_eq!(pending.waiter_count(CommandKind::Ban), 0);
    }

    #[tokio::test]
    async fn pending_channel_filter_matches() {
        let pending = PendingReplies::default();
        let (_, rx_a) = pending.register(CommandKind::Join, Some("#a".to_string()));
        let (_, rx_b) = pending.register(CommandKind::Join, Some("#b".to_string()));

        pending.resolve(
            CommandKind::Join,
            Some("#a"),
            Ok(Reply::Channel("#a".to_string())),
        );
        assert!(matches!(rx_a.await, Ok(Ok(Reply::Channel(c))) if c == "#a"));
        assert_eq!(pending.waiter_count(CommandKind::Join), 1);

        pending.resolve(
            CommandKind::Join,
            Some("#b"),
            Ok(Reply::Channel("#b".to_string())),
        );
        assert!(matches!(rx_b.await, Ok(Ok(Reply::Channel(c))) if c == "#b"));
    }

    #[tokio::test]
    async fn pending_remove_prevents_resolution() {
        let pending = PendingReplies::default();
        let (id, rx) = pending.register(CommandKind::Slow, None);
        pending.remove(CommandKind::Slow, id);
        pending.resolve(CommandKind::Slow, None, Ok(Reply::Ack));
        assert!(rx.await.is_err());
        assert_eq!(pending.waiter_count(CommandKind::Slow), 0);
    }

    #[tokio::test]
    async fn fail_all_reaches_every_kind() {
        let pending = PendingReplies::default();
        let (_, rx_ban) = pending.register(CommandKind::Ban, Some("#c".to_string()));
        let (_, rx_mods) = pending.register(CommandKind::Mods, None);
        pending.fail_all(Some("#c"), "no_permission");
        assert!(matches!(rx_ban.await, Ok(Err(reason)) if reason == "no_permission"));
        assert!(matches!(rx_mods.await, Ok(Err(reason)) if reason == "no_permission"));
    }

    #[tokio::test]
    async fn reply_wait_drop_removes_waiter() {
        let client = Client::new(ClientOptions::default());
        let wait = client
            .inner
            .expect_reply(CommandKind::Ban, None, "/ban test");
        assert_eq!(client.inner.pending.waiter_count(CommandKind::Ban), 1);
        drop(wait);
        assert_eq!(client.inner.pending.waiter_count(CommandKind::Ban), 0);
    }
}
