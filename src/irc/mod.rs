pub mod parse;

use std::{
    collections::{HashSet, VecDeque},
    env,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, MissedTickBehavior},
};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig as TlsConfig, RootCertStore},
    TlsConnector,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    metrics::AppMetrics,
    models::{normalize_login, RawMessage},
};

/// Callbacks the client drives. `on_message` is invoked synchronously once
/// per PRIVMSG, so implementations must not block the reader.
pub trait ChatEvents: Send + Sync {
    fn on_message(&self, message: RawMessage);
    fn on_channel_change(&self, channel: &str, joined: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub auth_mode: AuthMode,
    pub username: Option<String>,
    pub oauth_token: Option<String>,
    pub channels: Vec<String>,
    pub join_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            server: "irc.chat.twitch.tv".to_owned(),
            port: 6697,
            use_tls: true,
            auth_mode: AuthMode::Anonymous,
            username: None,
            oauth_token: None,
            channels: Vec::new(),
            join_interval: Duration::from_millis(500),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
        }
    }
}

impl IrcConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        match env::var("TWITCH_AUTH_MODE").as_deref() {
            Ok("authenticated") => {
                let username = env::var("TWITCH_USERNAME")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .ok_or("TWITCH_USERNAME is required in authenticated mode")?;
                let token = env::var("TWITCH_OAUTH_TOKEN")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .ok_or("TWITCH_OAUTH_TOKEN is required in authenticated mode")?;
                config.auth_mode = AuthMode::Authenticated;
                config.username = Some(username.to_ascii_lowercase());
                config.oauth_token = Some(token);
            }
            Ok("anonymous") | Err(_) => {}
            Ok(other) => return Err(format!("unknown TWITCH_AUTH_MODE: {other}")),
        }

        if let Ok(channels) = env::var("TWITCH_CHANNELS") {
            config.channels = channels
                .split(',')
                .map(normalize_login)
                .filter(|channel| !channel.is_empty())
                .collect();
        }

        if let Ok(server) = env::var("TWITCH_IRC_SERVER") {
            if !server.trim().is_empty() {
                config.server = server;
            }
        }
        if let Some(port) = env::var("TWITCH_IRC_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            config.port = port;
        }
        if let Ok(value) = env::var("TWITCH_IRC_TLS") {
            config.use_tls = value != "0" && !value.eq_ignore_ascii_case("false");
        }
        if let Some(interval_ms) = env::var("TWITCH_JOIN_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.join_interval = Duration::from_millis(interval_ms);
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Joined,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientHealth {
    pub state: ConnectionState,
    pub connected: bool,
    pub channels: Vec<String>,
    pub reconnect_attempts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum IrcError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

enum SessionEnd {
    Shutdown,
    Disconnected { authenticated: bool },
}

enum Command {
    Join(String),
    Part(String),
}

#[derive(Clone)]
pub struct IrcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: IrcConfig,
    events: Arc<dyn ChatEvents>,
    metrics: Arc<AppMetrics>,
    desired: Mutex<HashSet<String>>,
    joined: Mutex<HashSet<String>>,
    connected: AtomicBool,
    state: Mutex<ConnectionState>,
    last_error: Mutex<Option<String>>,
    reconnects: AtomicU64,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    shutdown: CancellationToken,
}

impl IrcClient {
    pub fn spawn(config: IrcConfig, events: Arc<dyn ChatEvents>, metrics: Arc<AppMetrics>) -> Self {
        let desired = config
            .channels
            .iter()
            .map(|channel| normalize_login(channel))
            .filter(|channel| !channel.is_empty())
            .collect::<HashSet<_>>();

        let inner = Arc::new(ClientInner {
            config,
            events,
            metrics,
            desired: Mutex::new(desired),
            joined: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Disconnected),
            last_error: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            commands: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_client(inner.clone()));
        Self { inner }
    }

    pub fn join(&self, channel: &str) {
        let channel = normalize_login(channel);
        if channel.is_empty() {
            return;
        }
        self.inner
            .desired
            .lock()
            .expect("desired channels lock")
            .insert(channel.clone());
        self.inner.send_command(Command::Join(channel));
    }

    pub fn part(&self, channel: &str) {
        let channel = normalize_login(channel);
        self.inner
            .desired
            .lock()
            .expect("desired channels lock")
            .remove(&channel);
        self.inner.send_command(Command::Part(channel));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels = self
            .inner
            .joined
            .lock()
            .expect("joined channels lock")
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        channels.sort();
        channels
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> ClientHealth {
        ClientHealth {
            state: *self.inner.state.lock().expect("state lock"),
            connected: self.is_connected(),
            channels: self.channels(),
            reconnect_attempts: self.reconnect_attempts(),
            last_error: self.inner.last_error.lock().expect("last error lock").clone(),
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl ClientInner {
    fn send_command(&self, command: Command) {
        let guard = self.commands.lock().expect("command channel lock");
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(command);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock") = state;
    }
}

async fn run_client(inner: Arc<ClientInner>) {
    let mut backoff = inner.config.reconnect_base;

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        inner.set_state(ConnectionState::Connecting);
        let outcome = run_session(&inner).await;

        inner.connected.store(false, Ordering::SeqCst);
        inner.joined.lock().expect("joined channels lock").clear();
        *inner.commands.lock().expect("command channel lock") = None;

        match outcome {
            Ok(SessionEnd::Shutdown) => {
                inner.set_state(ConnectionState::Disconnected);
                break;
            }
            Ok(SessionEnd::Disconnected { authenticated }) => {
                inner.set_state(ConnectionState::Disconnected);
                if authenticated {
                    backoff = inner.config.reconnect_base;
                }
                info!("irc connection closed");
            }
            Err(error) => {
                let state = match &error {
                    IrcError::AuthRejected(_) => ConnectionState::Error,
                    _ => ConnectionState::Disconnected,
                };
                inner.set_state(state);
                *inner.last_error.lock().expect("last error lock") = Some(error.to_string());
                warn!(error = %error, "irc session failed");
            }
        }

        if inner.shutdown.is_cancelled() {
            break;
        }

        inner.reconnects.fetch_add(1, Ordering::SeqCst);
        inner.metrics.observe_irc_reconnect();
        let jitter_cap = (backoff.as_millis() / 2) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
        let delay = backoff + jitter;
        info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");

        tokio::select! {
            _ = sleep(delay) => {}
            _ = inner.shutdown.cancelled() => break,
        }

        backoff = (backoff * 2).min(inner.config.reconnect_cap);
    }

    inner.set_state(ConnectionState::Disconnected);
}

type NetReader = Box<dyn AsyncRead + Send + Unpin>;
type NetWriter = Box<dyn AsyncWrite + Send + Unpin>;

async fn open_stream(config: &IrcConfig) -> Result<(NetReader, NetWriter), IrcError> {
    let tcp = TcpStream::connect((config.server.as_str(), config.port))
        .await
        .map_err(|error| IrcError::Connect(error.to_string()))?;

    if !config.use_tls {
        let (read_half, write_half) = tcp.into_split();
        return Ok((Box::new(read_half), Box::new(write_half)));
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = TlsConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(config.server.clone())
        .map_err(|error| IrcError::Connect(error.to_string()))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|error| IrcError::Connect(error.to_string()))?;
    let (read_half, write_half) = tokio::io::split(stream);
    Ok((Box::new(read_half), Box::new(write_half)))
}

async fn run_session(inner: &Arc<ClientInner>) -> Result<SessionEnd, IrcError> {
    let (reader, writer) = open_stream(&inner.config).await?;
    let mut lines = tokio::io::AsyncBufReadExt::lines(BufReader::new(reader));

    let mut session = Session {
        inner: inner.clone(),
        writer,
        nick: String::new(),
        authenticated: false,
        join_queue: VecDeque::new(),
    };
    session.register().await?;

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    *inner.commands.lock().expect("command channel lock") = Some(command_tx);

    let mut join_timer = tokio::time::interval(inner.config.join_interval);
    join_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Outcome::Disconnect = session.handle_line(&line).await? {
                            return Ok(SessionEnd::Disconnected {
                                authenticated: session.authenticated,
                            });
                        }
                    }
                    Ok(None) => {
                        return Ok(SessionEnd::Disconnected {
                            authenticated: session.authenticated,
                        });
                    }
                    Err(error) => {
                        if session.authenticated {
                            debug!(error = %error, "irc read failed");
                            return Ok(SessionEnd::Disconnected { authenticated: true });
                        }
                        return Err(IrcError::ConnectionLost(error.to_string()));
                    }
                }
            }
            Some(command) = command_rx.recv() => {
                session.handle_command(command).await?;
            }
            _ = join_timer.tick(), if session.has_pending_joins() => {
                session.flush_one_join().await?;
            }
            _ = inner.shutdown.cancelled() => {
                let _ = session.send_line("QUIT").await;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

struct Session {
    inner: Arc<ClientInner>,
    writer: NetWriter,
    nick: String,
    authenticated: bool,
    join_queue: VecDeque<String>,
}

enum Outcome {
    Continue,
    Disconnect,
}

impl Session {
    async fn register(&mut self) -> Result<(), IrcError> {
        self.send_line("CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership")
            .await?;

        match self.inner.config.auth_mode {
            AuthMode::Authenticated => {
                let username = self
                    .inner
                    .config
                    .username
                    .clone()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                let token = self.inner.config.oauth_token.clone().unwrap_or_default();
                let pass = if token.starts_with("oauth:") {
                    token
                } else {
                    format!("oauth:{token}")
                };
                self.send_line(&format!("PASS {pass}")).await?;
                self.nick = username;
            }
            AuthMode::Anonymous => {
                // Read-only login convention: no PASS, throwaway nick.
                self.nick = format!("justinfan{}", rand::thread_rng().gen_range(10_000..100_000));
            }
        }

        let nick = self.nick.clone();
        self.send_line(&format!("NICK {nick}")).await
    }

    fn has_pending_joins(&self) -> bool {
        self.authenticated && !self.join_queue.is_empty()
    }

    async fn handle_line(&mut self, raw: &str) -> Result<Outcome, IrcError> {
        let Some(line) = parse::parse_line(raw) else {
            self.inner.metrics.observe_parse_error();
            debug!(line = raw, "unparseable irc line");
            return Ok(Outcome::Continue);
        };

        match line.command.as_str() {
            "PING" => {
                let payload = line.params.first().cloned().unwrap_or_default();
                self.send_line(&format!("PONG :{payload}")).await?;
            }
            "001" => {
                self.authenticated = true;
                self.inner.connected.store(true, Ordering::SeqCst);
                self.inner.set_state(ConnectionState::Authenticated);
                *self.inner.last_error.lock().expect("last error lock") = None;

                let mut wanted = self
                    .inner
                    .desired
                    .lock()
                    .expect("desired channels lock")
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>();
                wanted.sort();
                info!(nick = %self.nick, channels = wanted.len(), "irc authenticated");
                self.join_queue = wanted.into();
            }
            "PRIVMSG" => match parse::privmsg_to_raw(&line) {
                Some(message) => self.inner.events.on_message(message),
                None => {
                    self.inner.metrics.observe_parse_error();
                    debug!(line = raw, "privmsg with no chat payload");
                }
            },
            "JOIN" => {
                if line.source_nick.as_deref() == Some(self.nick.as_str()) {
                    if let Some(channel) = line.params.first() {
                        let channel = normalize_login(channel);
                        self.inner
                            .joined
                            .lock()
                            .expect("joined channels lock")
                            .insert(channel.clone());
                        self.inner.set_state(ConnectionState::Joined);
                        self.inner.events.on_channel_change(&channel, true);
                    }
                }
            }
            "PART" => {
                if line.source_nick.as_deref() == Some(self.nick.as_str()) {
                    if let Some(channel) = line.params.first() {
                        let channel = normalize_login(channel);
                        self.inner
                            .joined
                            .lock()
                            .expect("joined channels lock")
                            .remove(&channel);
                        self.inner.events.on_channel_change(&channel, false);
                    }
                }
            }
            "NOTICE" => {
                let text = line.params.last().map(String::as_str).unwrap_or_default();
                if text.contains("authentication failed")
                    || text.contains("Improperly formatted auth")
                {
                    return Err(IrcError::AuthRejected(text.to_owned()));
                }
                debug!(notice = text, "irc notice");
            }
            "464" => {
                let text = line.params.last().map(String::as_str).unwrap_or_default();
                return Err(IrcError::AuthRejected(text.to_owned()));
            }
            "RECONNECT" => {
                info!("server requested reconnect");
                return Ok(Outcome::Disconnect);
            }
            _ => {
                trace!(command = %line.command, "ignored irc line");
            }
        }

        Ok(Outcome::Continue)
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), IrcError> {
        match command {
            Command::Join(channel) => {
                if self.authenticated && !self.join_queue.contains(&channel) {
                    self.join_queue.push_back(channel);
                }
            }
            Command::Part(channel) => {
                self.join_queue.retain(|pending| pending != &channel);
                if self.authenticated {
                    self.send_line(&format!("PART #{channel}")).await?;
                }
            }
        }
        Ok(())
    }

    async fn flush_one_join(&mut self) -> Result<(), IrcError> {
        if let Some(channel) = self.join_queue.pop_front() {
            self.send_line(&format!("JOIN #{channel}")).await?;
        }
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<(), IrcError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|error| IrcError::ConnectionLost(error.to_string()))?;
        self.writer
            .write_all(b"\r\n")
            .await
            .map_err(|error| IrcError::ConnectionLost(error.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|error| IrcError::ConnectionLost(error.to_string()))
    }
}
