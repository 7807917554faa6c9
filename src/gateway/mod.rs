//! Gateway session engine.
//!
//! A supervisor task owns the connection lifecycle: open the socket, expect
//! HELLO, IDENTIFY (or RESUME), then run a single-threaded select loop over
//! inbound frames, the heartbeat timer and outbound user commands. Every
//! transient fault funnels back to the supervisor, which reconnects on an
//! exponential ladder; only the fatal close codes stop it.

mod commands;
mod payload;
mod session;

pub use commands::{CommandKind, CommandLimiter, GatewayCommand};
pub use payload::{
    can_resume_after, close_code_description, is_fatal_close, GatewayPayload, Identify,
    IdentifyProperties, Opcode, Resume,
};
pub use session::{ConnectionStatus, SessionState};

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::cache::Caches;
use crate::config::ClientConfig;
use crate::error::{Error, Result, TimeoutPhase};
use crate::events::{Event, EventBus};
use crate::model::{Channel, Guild, Hello, Message, Ready, Snowflake, UnavailableGuild, User};
use crate::rest::backoff::ExponentialBackoff;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Builds gateway connections. One engine instance drives one shard.
pub struct GatewayEngine {
    config: ClientConfig,
    events: Arc<EventBus>,
    caches: Arc<Caches>,
}

impl GatewayEngine {
    #[must_use]
    pub fn new(config: ClientConfig, events: Arc<EventBus>, caches: Arc<Caches>) -> Self {
        Self {
            config,
            events,
            caches,
        }
    }

    /// Spawn the supervisor task and hand back the control surface.
    #[must_use]
    pub fn spawn(self, gateway_url: impl Into<String>) -> GatewayHandle {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (command_tx, command_rx) = mpsc::channel(self.config.gateway.command_queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            config: self.config,
            events: self.events,
            caches: self.caches,
            base_url: gateway_url.into(),
            status: status_tx,
            commands: command_rx,
            commands_open: true,
            shutdown: shutdown_rx,
            session: SessionState::default(),
            limiter: CommandLimiter::discord_default(),
        };
        let task = tokio::spawn(supervisor.run());

        GatewayHandle {
            status: status_rx,
            commands: command_tx,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Control surface for a running gateway task.
#[derive(Debug)]
pub struct GatewayHandle {
    status: watch::Receiver<ConnectionStatus>,
    commands: mpsc::Sender<GatewayCommand>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl GatewayHandle {
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status() == ConnectionStatus::Ready
    }

    /// An independent status subscription.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Block until the session reaches READY.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` if `timeout` elapses first.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.status.clone();
        let waited = tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow() == ConnectionStatus::Ready {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::GatewayReconnect {
                message: "gateway task stopped before READY".into(),
            }),
            Err(_) => Err(Error::Timeout {
                route: "gateway".into(),
                phase: TimeoutPhase::Total,
            }),
        }
    }

    /// Queue a presence update (op 3). Dropped first under command-window
    /// pressure.
    pub async fn update_presence(&self, presence: Value) -> Result<()> {
        self.send(GatewayCommand::presence(presence)).await
    }

    /// Queue a voice-state update (op 4).
    pub async fn update_voice_state(
        &self,
        guild_id: Snowflake,
        channel_id: Option<Snowflake>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        self.send(GatewayCommand::voice_state(serde_json::json!({
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        })))
        .await
    }

    /// Queue a guild-members request (op 8).
    pub async fn request_guild_members(
        &self,
        guild_id: Snowflake,
        query: &str,
        limit: u32,
    ) -> Result<()> {
        self.send(GatewayCommand::request_guild_members(serde_json::json!({
            "guild_id": guild_id,
            "query": query,
            "limit": limit,
        })))
        .await
    }

    async fn send(&self, command: GatewayCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::GatewayReconnect {
                message: "gateway task not running".into(),
            })
    }

    /// Close the session (code 1000) and stop the supervisor.
    pub async fn disconnect(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Why a session loop returned.
enum SessionEnd {
    /// Reconnect, resuming when `resume` and the stored checkpoint allow.
    Reconnect {
        code: Option<u16>,
        resume: bool,
        delay: Option<Duration>,
    },
    /// User asked; stop entirely.
    Shutdown,
}

struct Supervisor {
    config: ClientConfig,
    events: Arc<EventBus>,
    caches: Arc<Caches>,
    base_url: String,
    status: watch::Sender<ConnectionStatus>,
    commands: mpsc::Receiver<GatewayCommand>,
    commands_open: bool,
    shutdown: watch::Receiver<bool>,
    session: SessionState,
    limiter: CommandLimiter,
}

impl Supervisor {
    async fn run(mut self) {
        let ladder = ExponentialBackoff::reconnect_ladder(
            self.config.gateway.reconnect_base,
            self.config.gateway.reconnect_cap,
        );
        let mut failed_attempts: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let resuming = self.session.can_resume();
            self.status.send_replace(ConnectionStatus::Connecting);
            let url = connect_url(
                self.session
                    .resume_url
                    .as_deref()
                    .unwrap_or(&self.base_url),
            );
            info!(%url, resuming, "connecting to gateway");

            match connect_async(&url).await {
                Ok((ws, _)) => {
                    self.events.emit(&Event::Open);
                    match self.run_session(ws).await {
                        Ok(SessionEnd::Shutdown) => {
                            self.status.send_replace(ConnectionStatus::Disconnected);
                            self.events.emit(&Event::Close { code: None });
                            return;
                        }
                        Ok(SessionEnd::Reconnect {
                            code,
                            resume,
                            delay,
                        }) => {
                            if *self.status.borrow() == ConnectionStatus::Ready {
                                failed_attempts = 0;
                            }
                            self.status.send_replace(ConnectionStatus::Reconnecting);
                            self.events.emit(&Event::Reconnect { code });
                            if !resume {
                                self.session.invalidate();
                            }
                            if let Some(delay) = delay {
                                debug!(?delay, "waiting before re-identify");
                                self.sleep_or_shutdown(delay).await;
                            }
                        }
                        Err(e) => {
                            if let Error::GatewayFatal { .. } = e {
                                error!(error = %e, "fatal gateway close, not reconnecting");
                                self.status.send_replace(ConnectionStatus::Disconnected);
                                self.events.emit(&Event::Error {
                                    message: e.to_string(),
                                });
                                return;
                            }
                            warn!(error = %e, "gateway session error");
                            self.status.send_replace(ConnectionStatus::Reconnecting);
                            self.events.emit(&Event::Reconnect { code: None });
                            let delay = ladder.delay(failed_attempts);
                            failed_attempts += 1;
                            self.sleep_or_shutdown(delay).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to open gateway socket");
                    self.status.send_replace(ConnectionStatus::Reconnecting);
                    let delay = ladder.delay(failed_attempts);
                    failed_attempts += 1;
                    self.sleep_or_shutdown(delay).await;
                }
            }
        }
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    async fn sleep_or_shutdown(&mut self, delay: Duration) {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// One connection, HELLO to close.
    async fn run_session(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<SessionEnd> {
        let (mut write, mut read) = ws.split();

        let hello = self.expect_hello(&mut read).await?;
        let interval = Duration::from_millis(hello.heartbeat_interval);
        debug!(interval_ms = hello.heartbeat_interval, "received HELLO");

        if self.session.can_resume() {
            self.status.send_replace(ConnectionStatus::Resuming);
            let resume = Resume {
                token: self.bare_token(),
                session_id: self.session.session_id.clone().unwrap_or_default(),
                seq: self.session.sequence.unwrap_or_default(),
            };
            info!(session_id = %resume.session_id, seq = resume.seq, "resuming session");
            send_payload(
                &mut write,
                &GatewayPayload::command(Opcode::Resume, serde_json::to_value(&resume)?),
            )
            .await?;
        } else {
            self.status.send_replace(ConnectionStatus::Identifying);
            let identify = Identify {
                token: self.bare_token(),
                intents: self.config.intents,
                properties: IdentifyProperties::default(),
                compress: None,
                large_threshold: Some(self.config.gateway.large_threshold),
                shard: self
                    .config
                    .shard
                    .map(|s| [s.shard_id, s.shard_count]),
                presence: self.config.presence.clone(),
            };
            send_payload(
                &mut write,
                &GatewayPayload::command(Opcode::Identify, serde_json::to_value(&identify)?),
            )
            .await?;
        }

        // First heartbeat is jittered across the interval to spread load.
        let first_delay = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        let mut heartbeat_at = tokio::time::Instant::now() + first_delay;
        let mut acked = true;

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(heartbeat_at) => {
                    if !acked {
                        warn!("no HEARTBEAT_ACK within an interval, closing zombie socket");
                        let _ = write.send(close_frame(4000, "heartbeat timeout")).await;
                        return Ok(SessionEnd::Reconnect {
                            code: Some(4000),
                            resume: true,
                            delay: None,
                        });
                    }
                    let heartbeat = GatewayPayload {
                        op: Opcode::Heartbeat as u8,
                        d: Some(sequence_value(self.session.sequence)),
                        s: None,
                        t: None,
                    };
                    send_payload(&mut write, &heartbeat).await?;
                    self.limiter.record(Instant::now());
                    acked = false;
                    heartbeat_at = tokio::time::Instant::now() + interval;
                    debug!("heartbeat sent");
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.status.send_replace(ConnectionStatus::Disconnecting);
                        let _ = write.send(close_frame(1000, "client disconnect")).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }

                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => {
                            send_command(&mut write, &mut self.limiter, command).await?;
                        }
                        None => self.commands_open = false,
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let payload: GatewayPayload = match serde_json::from_str(&text) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!(error = %e, "undecodable gateway frame");
                                    continue;
                                }
                            };
                            if let Some(end) =
                                self.handle_payload(&mut write, payload, &mut acked).await?
                            {
                                return Ok(end);
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            return self.handle_close(frame);
                        }
                        Some(Ok(_)) => {
                            // Ping/pong are transport-level; binary frames
                            // only appear with transport compression, which
                            // is never negotiated.
                        }
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => {
                            self.events.emit(&Event::Close { code: None });
                            return Ok(SessionEnd::Reconnect {
                                code: None,
                                resume: true,
                                delay: None,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn expect_hello(&mut self, read: &mut WsSource) -> Result<Hello> {
        let first = tokio::time::timeout(self.config.gateway.hello_timeout, read.next())
            .await
            .map_err(|_| Error::GatewayReconnect {
                message: "no HELLO within deadline".into(),
            })?;
        match first {
            Some(Ok(WsMessage::Text(text))) => {
                let payload: GatewayPayload = serde_json::from_str(&text)?;
                if Opcode::try_from(payload.op) != Ok(Opcode::Hello) {
                    return Err(Error::GatewayReconnect {
                        message: format!("expected HELLO, got op {}", payload.op),
                    });
                }
                Ok(serde_json::from_value(payload.d.unwrap_or_default())?)
            }
            Some(Ok(WsMessage::Close(frame))) => {
                // Server refused before HELLO; fatal codes surface as usual.
                match self.handle_close(frame) {
                    Ok(_) => Err(Error::GatewayReconnect {
                        message: "closed before HELLO".into(),
                    }),
                    Err(e) => Err(e),
                }
            }
            Some(Ok(_)) => Err(Error::GatewayReconnect {
                message: "unexpected first frame".into(),
            }),
            Some(Err(e)) => Err(Error::WebSocket(e)),
            None => Err(Error::GatewayReconnect {
                message: "socket closed before HELLO".into(),
            }),
        }
    }

    async fn handle_payload(
        &mut self,
        write: &mut WsSink,
        payload: GatewayPayload,
        acked: &mut bool,
    ) -> Result<Option<SessionEnd>> {
        if let Some(s) = payload.s {
            self.session.observe_sequence(s);
        }

        match Opcode::try_from(payload.op) {
            Ok(Opcode::Dispatch) => {
                let name = payload.t.unwrap_or_default();
                let data = payload.d.unwrap_or_default();
                self.handle_dispatch(&name, data)?;
                Ok(None)
            }
            Ok(Opcode::HeartbeatAck) => {
                *acked = true;
                debug!("heartbeat acknowledged");
                Ok(None)
            }
            Ok(Opcode::Heartbeat) => {
                // Server-requested beat, outside the timer cadence.
                let heartbeat = GatewayPayload {
                    op: Opcode::Heartbeat as u8,
                    d: Some(sequence_value(self.session.sequence)),
                    s: None,
                    t: None,
                };
                send_payload(write, &heartbeat).await?;
                self.limiter.record(Instant::now());
                Ok(None)
            }
            Ok(Opcode::Reconnect) => {
                info!("server requested reconnect");
                let _ = write.send(close_frame(4000, "reconnect requested")).await;
                Ok(Some(SessionEnd::Reconnect {
                    code: Some(4000),
                    resume: true,
                    delay: None,
                }))
            }
            Ok(Opcode::InvalidSession) => {
                let resumable = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                warn!(resumable, "session invalidated");
                if resumable {
                    Ok(Some(SessionEnd::Reconnect {
                        code: None,
                        resume: true,
                        delay: None,
                    }))
                } else {
                    // Fresh IDENTIFY after a polite 1-5s wait.
                    let delay =
                        Duration::from_secs_f64(rand::thread_rng().gen_range(1.0..5.0));
                    Ok(Some(SessionEnd::Reconnect {
                        code: None,
                        resume: false,
                        delay: Some(delay),
                    }))
                }
            }
            Ok(Opcode::Hello) => {
                debug!("unexpected HELLO mid-session");
                Ok(None)
            }
            Ok(op) => {
                debug!(?op, "unhandled opcode");
                Ok(None)
            }
            Err(()) => {
                debug!(op = payload.op, "unknown opcode");
                Ok(None)
            }
        }
    }

    /// Cache updates run before listeners for every dispatch.
    fn handle_dispatch(&mut self, name: &str, data: Value) -> Result<()> {
        match name {
            "READY" => {
                let ready: Ready = serde_json::from_value(data)?;
                self.session.on_ready(&ready);
                self.caches.apply_ready(&ready);
                self.status.send_replace(ConnectionStatus::Ready);
                info!(
                    user = %ready.user.username,
                    session_id = %ready.session_id,
                    "gateway ready"
                );
                self.events.emit(&Event::Ready(Box::new(ready)));
            }
            "RESUMED" => {
                self.status.send_replace(ConnectionStatus::Ready);
                info!("session resumed");
                self.events.emit(&Event::Resumed);
            }
            "MESSAGE_CREATE" => match serde_json::from_value::<Message>(data.clone()) {
                Ok(message) => {
                    if let Some(author) = &message.author {
                        self.caches.see_user(author);
                    }
                    self.events.emit(&Event::MessageCreate(Box::new(message)));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "MESSAGE_UPDATE" => match serde_json::from_value::<Message>(data.clone()) {
                Ok(message) => {
                    if let Some(author) = &message.author {
                        self.caches.see_user(author);
                    }
                    self.events.emit(&Event::MessageUpdate(Box::new(message)));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "MESSAGE_DELETE" => {
                #[derive(serde::Deserialize)]
                struct MessageDelete {
                    id: Snowflake,
                    channel_id: Snowflake,
                    guild_id: Option<Snowflake>,
                }
                match serde_json::from_value::<MessageDelete>(data.clone()) {
                    Ok(deleted) => {
                        self.events.emit(&Event::MessageDelete {
                            id: deleted.id,
                            channel_id: deleted.channel_id,
                            guild_id: deleted.guild_id,
                        });
                    }
                    Err(e) => self.emit_undecoded(name, data, &e),
                }
            }
            "GUILD_CREATE" => match serde_json::from_value::<Guild>(data.clone()) {
                Ok(guild) => {
                    self.caches.guild_create(&guild);
                    self.events.emit(&Event::GuildCreate(Box::new(guild)));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "GUILD_UPDATE" => match serde_json::from_value::<Guild>(data.clone()) {
                Ok(guild) => {
                    self.caches.guild_update(&guild);
                    self.events.emit(&Event::GuildUpdate(Box::new(guild)));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "GUILD_DELETE" => match serde_json::from_value::<UnavailableGuild>(data.clone()) {
                Ok(stub) => {
                    self.caches.guild_delete(&stub);
                    self.events.emit(&Event::GuildDelete(stub));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "CHANNEL_CREATE" => match serde_json::from_value::<Channel>(data.clone()) {
                Ok(channel) => {
                    self.caches.channel_create(&channel);
                    self.events.emit(&Event::ChannelCreate(Box::new(channel)));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "CHANNEL_UPDATE" => match serde_json::from_value::<Channel>(data.clone()) {
                Ok(channel) => {
                    self.caches.channel_update(&channel);
                    self.events.emit(&Event::ChannelUpdate(Box::new(channel)));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "CHANNEL_DELETE" => match serde_json::from_value::<Channel>(data.clone()) {
                Ok(channel) => {
                    self.caches.channel_delete(channel.id);
                    self.events.emit(&Event::ChannelDelete(Box::new(channel)));
                }
                Err(e) => self.emit_undecoded(name, data, &e),
            },
            "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => {
                if let Some(user) = data.get("user") {
                    if let Ok(user) = serde_json::from_value::<User>(user.clone()) {
                        self.caches.see_user(&user);
                    }
                }
                self.events.emit(&Event::Unknown {
                    name: name.to_owned(),
                    data,
                });
            }
            "TYPING_START" => {
                self.events.emit(&Event::TypingStart(data));
            }
            _ => {
                self.events.emit(&Event::Unknown {
                    name: name.to_owned(),
                    data,
                });
            }
        }
        Ok(())
    }

    fn emit_undecoded(&self, name: &str, data: Value, error: &serde_json::Error) {
        warn!(event = name, error = %error, "dispatch payload did not decode, forwarding raw");
        self.events.emit(&Event::Unknown {
            name: name.to_owned(),
            data,
        });
    }

    fn handle_close(&self, frame: Option<CloseFrame>) -> Result<SessionEnd> {
        let code = frame.as_ref().map(|f| u16::from(f.code));
        info!(?code, "gateway connection closed");
        self.events.emit(&Event::Close { code });

        if let Some(code) = code {
            if is_fatal_close(code) {
                return Err(Error::GatewayFatal {
                    code,
                    reason: close_code_description(code).into(),
                });
            }
        }
        Ok(SessionEnd::Reconnect {
            code,
            resume: can_resume_after(code),
            delay: None,
        })
    }

    fn bare_token(&self) -> String {
        self.config
            .token
            .strip_prefix("Bot ")
            .unwrap_or(&self.config.token)
            .to_owned()
    }
}

async fn send_payload(write: &mut WsSink, payload: &GatewayPayload) -> Result<()> {
    let text = serde_json::to_string(payload)?;
    write
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(Error::WebSocket)
}

async fn send_command(
    write: &mut WsSink,
    limiter: &mut CommandLimiter,
    command: GatewayCommand,
) -> Result<()> {
    let now = Instant::now();
    if !limiter.try_acquire(now) {
        if command.kind.droppable() {
            warn!("command window saturated, dropping presence update");
            return Ok(());
        }
        let wait = limiter.retry_in(now);
        debug!(?wait, "command window saturated, waiting");
        tokio::time::sleep(wait).await;
        limiter.record(Instant::now());
    }
    send_payload(write, &GatewayPayload::command(command.op, command.data)).await
}

fn close_frame(code: u16, reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

fn sequence_value(sequence: Option<u64>) -> Value {
    sequence.map_or(Value::Null, Into::into)
}

fn connect_url(base: &str) -> String {
    if base.contains('?') {
        base.to_owned()
    } else {
        format!("{}/?v=10&encoding=json", base.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_appends_protocol_query() {
        assert_eq!(
            connect_url("wss://gateway.discord.gg"),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            connect_url("wss://gateway.discord.gg/"),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        // Resume URLs that already carry a query pass through.
        assert_eq!(
            connect_url("wss://gw.example/?v=10&encoding=json"),
            "wss://gw.example/?v=10&encoding=json"
        );
    }

    #[test]
    fn heartbeat_sequence_is_null_before_first_dispatch() {
        assert_eq!(sequence_value(None), Value::Null);
        assert_eq!(sequence_value(Some(42)), Value::from(42));
    }
}
