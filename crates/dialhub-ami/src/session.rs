//! AMI Session
//!
//! One TCP connection to the switch, shared by the whole process. Writes are
//! serialized through the mutexed write half (one message per write); a
//! dedicated reader task accumulates bytes, splits out complete messages and
//! dispatches them either to the response waiter matching their ActionID or
//! to the registered event handlers.

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::errors::{AmiError, Result};
use crate::message::AmiMessage;

/// Synthetic event delivered to subscribers when the session dies
/// underneath them (socket failure, not a deliberate `close`).
pub const EVENT_SESSION_CLOSED: &str = "SessionClosed";

const STATE_CONNECTED: u8 = 0;
const STATE_CLOSED: u8 = 1;
const STATE_LOST: u8 = 2;

type EventHandler = Box<dyn Fn(&AmiMessage) + Send + Sync>;

/// AMI connection parameters
#[derive(Clone)]
pub struct AmiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub connect_timeout: Duration,
    pub action_timeout: Duration,
    /// `None` disables the keepalive ping
    pub keepalive_interval: Option<Duration>,
}

impl AmiConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
            connect_timeout: Duration::from_secs(10),
            action_timeout: Duration::from_secs(15),
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl fmt::Debug for AmiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A logged-in AMI session
pub struct AmiSession {
    writer: Mutex<OwnedWriteHalf>,
    pending: DashMap<String, oneshot::Sender<AmiMessage>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    state: AtomicU8,
    next_action_id: AtomicU64,
    action_prefix: String,
    action_timeout: Duration,
    reader_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl AmiSession {
    /// Open the TCP connection, consume the banner, log in.
    ///
    /// Fails with `ConnectFailed` on socket/timeout problems and with
    /// `AuthFailed` when the switch rejects the credentials.
    pub async fn connect(config: AmiConfig) -> Result<Arc<Self>> {
        let addr = format!("{}:{}", config.host, config.port);
        info!(addr = %addr, username = %config.username, "Connecting to AMI");

        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| AmiError::ConnectFailed(format!("connect timeout to {}", addr)))?
        .map_err(|e| AmiError::ConnectFailed(e.to_string()))?;

        let (mut read_half, write_half) = stream.into_split();

        // The switch greets with a single banner line before any message.
        let mut buf = BytesMut::with_capacity(4096);
        let banner = read_banner(&mut read_half, &mut buf).await?;
        info!(banner = %banner.trim(), "AMI banner received");

        let session = Arc::new(Self {
            writer: Mutex::new(write_half),
            pending: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            state: AtomicU8::new(STATE_CONNECTED),
            next_action_id: AtomicU64::new(1),
            action_prefix: format!("dh-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            action_timeout: config.action_timeout,
            reader_task: SyncMutex::new(None),
        });

        let reader = tokio::spawn(Self::read_loop(session.clone(), read_half, buf));
        *session.reader_task.lock() = Some(reader);

        let response = session
            .send_action(
                "Login",
                &[("Username", &config.username), ("Secret", &config.secret)],
            )
            .await?;
        if !response.is_success() {
            let reason = response
                .get("Message")
                .unwrap_or("login rejected")
                .to_string();
            session.close().await;
            return Err(AmiError::AuthFailed(reason));
        }
        info!("AMI authentication successful");

        if let Some(interval) = config.keepalive_interval {
            tokio::spawn(Self::keepalive_loop(session.clone(), interval));
        }

        Ok(session)
    }

    pub fn connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    /// Send an action and await its correlated response.
    ///
    /// Parameter keys may repeat (`Variable:` does on Originate). The
    /// message is written atomically; the response waiter is registered
    /// before the write so a fast switch cannot win the race.
    pub async fn send_action(&self, name: &str, params: &[(&str, &str)]) -> Result<AmiMessage> {
        if !self.connected() {
            return Err(AmiError::NotConnected);
        }

        let action_id = format!(
            "{}-{}",
            self.action_prefix,
            self.next_action_id.fetch_add(1, Ordering::SeqCst)
        );
        let mut msg = AmiMessage::action(name);
        msg.push("ActionID", action_id.clone());
        for (key, value) in params {
            msg.push(*key, *value);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(action_id.clone(), tx);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(msg.to_wire().as_bytes()).await {
                self.pending.remove(&action_id);
                warn!(action = %name, "AMI write failed: {}", e);
                self.mark_dead(STATE_LOST);
                return Err(AmiError::ConnectionLost);
            }
        }

        match timeout(self.action_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Waiter dropped: the session died or was closed under us.
            Ok(Err(_)) => match self.state.load(Ordering::SeqCst) {
                STATE_CLOSED => Err(AmiError::Cancelled),
                _ => Err(AmiError::ConnectionLost),
            },
            Err(_) => {
                self.pending.remove(&action_id);
                Err(AmiError::ActionTimeout)
            }
        }
    }

    /// Register a handler for an event name.
    ///
    /// Handlers for the same event run in registration order on the reader
    /// task; a panicking handler is caught and logged so it cannot take the
    /// session down.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(&AmiMessage) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Stop the reader, reject outstanding waiters, close the socket.
    pub async fn close(&self) {
        self.mark_dead(STATE_CLOSED);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader_task.lock().take() {
            reader.abort();
        }
        info!("AMI session closed");
    }

    /// Ask the switch to place a call from `channel` to `extension`.
    pub async fn originate(
        &self,
        channel: &str,
        context: &str,
        extension: &str,
        caller_id: Option<&str>,
        variables: &[(&str, &str)],
    ) -> Result<AmiMessage> {
        let var_values: Vec<String> = variables
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mut params: Vec<(&str, &str)> = vec![
            ("Channel", channel),
            ("Context", context),
            ("Exten", extension),
            ("Priority", "1"),
        ];
        if let Some(cid) = caller_id {
            params.push(("CallerID", cid));
        }
        for value in &var_values {
            params.push(("Variable", value));
        }

        self.send_action("Originate", &params).await
    }

    /// Ask the switch to hang up a channel.
    pub async fn hangup(&self, channel: &str) -> Result<AmiMessage> {
        self.send_action("Hangup", &[("Channel", channel)]).await
    }

    /// Query a channel's status.
    pub async fn status(&self, channel: &str) -> Result<AmiMessage> {
        self.send_action("Status", &[("Channel", channel)]).await
    }

    async fn read_loop(session: Arc<Self>, mut read_half: OwnedReadHalf, mut buf: BytesMut) {
        let mut chunk = [0u8; 4096];
        loop {
            // Drain every complete message already buffered.
            while let Some(pos) = find_terminator(&buf) {
                let block = buf.split_to(pos + 4);
                let text = String::from_utf8_lossy(&block[..pos]).into_owned();
                if text.is_empty() {
                    continue;
                }
                session.dispatch(AmiMessage::parse(&text));
            }

            if !session.connected() {
                return;
            }

            match read_half.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!("AMI read failed: {}", e);
                    break;
                }
            }
        }
        debug!("AMI reader stopped");
        session.mark_dead(STATE_LOST);
    }

    fn dispatch(&self, msg: AmiMessage) {
        // A pending waiter always wins, even for event-style responses
        // that carry both an ActionID and an Event key.
        if let Some(action_id) = msg.action_id() {
            if let Some((_, waiter)) = self.pending.remove(action_id) {
                let _ = waiter.send(msg);
                return;
            }
        }
        if let Some(event) = msg.event() {
            self.emit(event, &msg);
            return;
        }
        if let Some(action_id) = msg.action_id() {
            debug!(action_id = %action_id, "Dropping response with no waiter");
            return;
        }
        warn!("Malformed AMI message: {:?}", msg.fields());
    }

    fn emit(&self, event: &str, msg: &AmiMessage) {
        let handlers = self.handlers.read();
        let Some(list) = handlers.get(event) else {
            return;
        };
        for handler in list {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(msg))) {
                error!(event = %event, "AMI event handler panicked: {:?}", panic);
            }
        }
    }

    /// One-shot transition out of `Connected`. Fails all pending waiters;
    /// on an unexpected loss also emits the synthetic `SessionClosed` event
    /// so subscribers (and the owning engine) learn the session is gone.
    fn mark_dead(&self, new_state: u8) {
        if self
            .state
            .compare_exchange(STATE_CONNECTED, new_state, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.pending.clear();
        if new_state == STATE_LOST {
            warn!("AMI session lost");
            let mut synthetic = AmiMessage::new();
            synthetic.push("Event", EVENT_SESSION_CLOSED);
            self.emit(EVENT_SESSION_CLOSED, &synthetic);
        }
    }

    async fn keepalive_loop(session: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if !session.connected() {
                return;
            }
            if let Err(e) = session.send_action("Ping", &[]).await {
                debug!("AMI keepalive failed: {}", e);
                return;
            }
        }
    }
}

async fn read_banner(read_half: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<String> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            return Err(AmiError::ConnectFailed(
                "connection closed before banner".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_detection() {
        assert_eq!(find_terminator(b"Response: Success\r\n\r\n"), Some(17));
        assert_eq!(find_terminator(b"Response: Success\r\n"), None);
        assert_eq!(find_terminator(b""), None);
        // Only the first terminator counts; the rest stays buffered.
        let two = b"A: 1\r\n\r\nB: 2\r\n\r\n";
        assert_eq!(find_terminator(two), Some(4));
    }
}
