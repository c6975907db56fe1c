use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chatvault::{
    irc::{AuthMode, ChatEvents, ConnectionState, IrcClient, IrcConfig},
    metrics::AppMetrics,
    models::RawMessage,
};
use tokio::{
    io::{AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    time::{sleep, timeout, Instant},
};

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<RawMessage>>,
    channel_events: Mutex<Vec<(String, bool)>>,
}

impl ChatEvents for Recorder {
    fn on_message(&self, message: RawMessage) {
        self.messages.lock().expect("messages lock").push(message);
    }

    fn on_channel_change(&self, channel: &str, joined: bool) {
        self.channel_events
            .lock()
            .expect("channel events lock")
            .push((channel.to_owned(), joined));
    }
}

impl Recorder {
    fn message_count(&self) -> usize {
        self.messages.lock().expect("messages lock").len()
    }

    fn joins_of(&self, channel: &str) -> usize {
        self.channel_events
            .lock()
            .expect("channel events lock")
            .iter()
            .filter(|(name, joined)| name == channel && *joined)
            .count()
    }
}

fn local_config(port: u16) -> IrcConfig {
    IrcConfig {
        server: "127.0.0.1".to_owned(),
        port,
        use_tls: false,
        auth_mode: AuthMode::Anonymous,
        username: None,
        oauth_token: None,
        channels: vec!["a".to_owned(), "b".to_owned()],
        join_interval: Duration::from_millis(10),
        reconnect_base: Duration::from_millis(50),
        reconnect_cap: Duration::from_millis(400),
    }
}

struct ServerConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ServerConnection {
    fn new(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            lines: tokio::io::AsyncBufReadExt::lines(BufReader::new(read_half)),
            writer,
        }
    }

    async fn read_line(&mut self) -> String {
        timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("client line within deadline")
            .expect("client socket readable")
            .expect("client still connected")
    }

    async fn read_until_prefix(&mut self, prefix: &str) -> String {
        loop {
            let line = self.read_line().await;
            if let Some(rest) = line.strip_prefix(prefix) {
                return rest.to_owned();
            }
        }
    }

    async fn write_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("server write");
        self.writer.flush().await.expect("server flush");
    }
}

/// Accepts one client session: completes registration, confirms the expected
/// JOINs and delivers one PRIVMSG to #a. The caller owns the returned
/// connection; dropping it forces a disconnect.
async fn serve_chat_session(
    listener: &TcpListener,
    expected_joins: usize,
    text: &str,
) -> ServerConnection {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client connects")
        .expect("accept succeeds");
    let mut connection = ServerConnection::new(stream);

    let nick = connection.read_until_prefix("NICK ").await;
    connection
        .write_line(&format!(":tmi.twitch.tv 001 {nick} :Welcome, GLHF!"))
        .await;

    let mut joined = 0;
    while joined < expected_joins {
        let channel = connection.read_until_prefix("JOIN ").await;
        connection
            .write_line(&format!(":{nick}!{nick}@{nick}.tmi.twitch.tv JOIN {channel}"))
            .await;
        joined += 1;
    }

    connection
        .write_line(&format!(
            "@display-name=Wisher :wisher!wisher@wisher.tmi.twitch.tv PRIVMSG #a :{text}"
        ))
        .await;
    connection
}

#[tokio::test]
async fn reconnects_and_rejoins_after_forced_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let recorder = Arc::new(Recorder::default());
    let client = IrcClient::spawn(
        local_config(port),
        recorder.clone(),
        Arc::new(AppMetrics::new()),
    );

    let first_connection = serve_chat_session(&listener, 2, "first session").await;
    // Give the client a beat to drain the socket, then force the disconnect.
    sleep(Duration::from_millis(50)).await;
    drop(first_connection);

    let _second_connection = serve_chat_session(&listener, 2, "second session").await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while recorder.message_count() < 2 {
        assert!(Instant::now() < deadline, "second privmsg never arrived");
        sleep(Duration::from_millis(10)).await;
    }

    let messages = recorder.messages.lock().expect("messages lock").clone();
    assert_eq!(messages[0].text, "first session");
    assert_eq!(messages[1].text, "second session");
    assert_eq!(messages[0].channel_name, "a");
    assert_eq!(messages[0].username, "wisher");
    assert_eq!(messages[0].display_name, "Wisher");

    assert_eq!(recorder.joins_of("a"), 2);
    assert_eq!(recorder.joins_of("b"), 2);
    assert!(client.is_connected());
    assert_eq!(client.channels(), vec!["a".to_owned(), "b".to_owned()]);
    assert!(client.reconnect_attempts() >= 1);

    client.shutdown();
}

#[tokio::test]
async fn answers_server_keepalive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let mut config = local_config(port);
    config.channels = Vec::new();
    let client = IrcClient::spawn(
        config,
        Arc::new(Recorder::default()),
        Arc::new(AppMetrics::new()),
    );

    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client connects")
        .expect("accept succeeds");
    let mut connection = ServerConnection::new(stream);

    let nick = connection.read_until_prefix("NICK ").await;
    connection
        .write_line(&format!(":tmi.twitch.tv 001 {nick} :Welcome, GLHF!"))
        .await;
    connection.write_line("PING :tmi.twitch.tv").await;

    let pong = timeout(Duration::from_secs(5), async {
        loop {
            let line = connection.read_line().await;
            if line.starts_with("PONG") {
                return line;
            }
        }
    })
    .await
    .expect("pong within deadline");
    assert_eq!(pong, "PONG :tmi.twitch.tv");

    client.shutdown();
}

#[tokio::test]
async fn rejected_auth_surfaces_error_and_backs_off() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let mut config = local_config(port);
    config.auth_mode = AuthMode::Authenticated;
    config.username = Some("archivebot".to_owned());
    config.oauth_token = Some("definitely-wrong".to_owned());
    config.channels = Vec::new();
    config.reconnect_base = Duration::from_millis(100);
    config.reconnect_cap = Duration::from_secs(2);

    let client = IrcClient::spawn(
        config,
        Arc::new(Recorder::default()),
        Arc::new(AppMetrics::new()),
    );

    let mut accept_times = Vec::new();
    let mut saw_pass = false;
    for _ in 0..3 {
        let (stream, _) = timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("client connects")
            .expect("accept succeeds");
        accept_times.push(Instant::now());

        let mut connection = ServerConnection::new(stream);
        loop {
            let line = connection.read_line().await;
            if line.starts_with("PASS oauth:") {
                saw_pass = true;
            }
            if line.starts_with("NICK ") {
                break;
            }
        }
        connection
            .write_line(":tmi.twitch.tv NOTICE * :Login authentication failed")
            .await;
        sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_pass, "authenticated mode must send PASS");

    let first_gap = accept_times[1] - accept_times[0];
    let second_gap = accept_times[2] - accept_times[1];
    assert!(
        first_gap >= Duration::from_millis(90),
        "first reconnect too eager: {first_gap:?}"
    );
    assert!(
        second_gap > first_gap,
        "backoff did not grow: {first_gap:?} then {second_gap:?}"
    );
    assert!(
        second_gap >= Duration::from_millis(190),
        "second reconnect too eager: {second_gap:?}"
    );

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let health = client.health();
        if health.state == ConnectionState::Error
            && health.reconnect_attempts >= 3
            && health
                .last_error
                .as_deref()
                .is_some_and(|error| error.contains("authentication"))
        {
            break;
        }
        assert!(Instant::now() < deadline, "auth error never surfaced: {health:?}");
        sleep(Duration::from_millis(10)).await;
    }

    assert!(!client.is_connected());
    client.shutdown();
}
