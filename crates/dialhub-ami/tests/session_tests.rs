//! AMI session integration tests
//!
//! A scripted mock switch speaks the real wire format over a loopback TCP
//! socket, so these tests exercise framing, login, ActionID correlation,
//! event dispatch and the disconnect paths end to end.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use dialhub_ami::{AmiConfig, AmiError, AmiMessage, AmiSession, EVENT_SESSION_CLOSED};

enum MockCommand {
    Send(String),
    Close,
}

/// One-connection mock switch: greets with a banner, answers the Login
/// action by itself, and forwards every other action to the test.
struct MockSwitch {
    addr: SocketAddr,
    actions: mpsc::UnboundedReceiver<AmiMessage>,
    out: mpsc::UnboundedSender<MockCommand>,
}

impl MockSwitch {
    async fn spawn(accept_login: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (action_tx, actions) = mpsc::unbounded_channel();
        let (out, mut out_rx) = mpsc::unbounded_channel::<MockCommand>();
        let login_out = out.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(b"Asterisk Call Manager/5.0\r\n")
                .await
                .unwrap();

            tokio::spawn(async move {
                while let Some(cmd) = out_rx.recv().await {
                    match cmd {
                        MockCommand::Send(text) => {
                            if write_half.write_all(text.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        MockCommand::Close => {
                            let _ = write_half.shutdown().await;
                            break;
                        }
                    }
                }
            });

            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                while let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let block: Vec<u8> = buf.drain(..pos + 4).collect();
                    let msg = AmiMessage::parse(&String::from_utf8_lossy(&block[..pos]));
                    if msg.get("Action") == Some("Login") {
                        let id = msg.action_id().unwrap_or("").to_string();
                        let reply = if accept_login {
                            format!(
                                "Response: Success\r\nActionID: {}\r\nMessage: Authentication accepted\r\n\r\n",
                                id
                            )
                        } else {
                            format!(
                                "Response: Error\r\nActionID: {}\r\nMessage: Authentication failed\r\n\r\n",
                                id
                            )
                        };
                        let _ = login_out.send(MockCommand::Send(reply));
                    } else {
                        let _ = action_tx.send(msg);
                    }
                }
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
        });

        Self { addr, actions, out }
    }

    fn config(&self) -> AmiConfig {
        let mut config = AmiConfig::new("127.0.0.1", self.addr.port(), "dialer", "secret");
        config.action_timeout = Duration::from_secs(2);
        config.keepalive_interval = None;
        config
    }

    fn send_raw(&self, text: &str) {
        self.out.send(MockCommand::Send(text.to_string())).unwrap();
    }

    fn respond_success(&self, action_id: &str) {
        self.send_raw(&format!(
            "Response: Success\r\nActionID: {}\r\n\r\n",
            action_id
        ));
    }

    fn close_connection(&self) {
        let _ = self.out.send(MockCommand::Close);
    }

    async fn next_action(&mut self) -> AmiMessage {
        timeout(Duration::from_secs(2), self.actions.recv())
            .await
            .expect("timed out waiting for action")
            .expect("mock switch gone")
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn login_handshake_succeeds() {
    let switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();
    assert!(session.connected());
    session.close().await;
    assert!(!session.connected());
}

#[tokio::test]
async fn login_rejected_surfaces_auth_failed() {
    let switch = MockSwitch::spawn(false).await;
    match AmiSession::connect(switch.config()).await {
        Err(AmiError::AuthFailed(reason)) => assert!(reason.contains("Authentication failed")),
        other => panic!("expected AuthFailed, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn responses_correlate_by_action_id_out_of_order() {
    let mut switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.send_action("Status", &[("Channel", "one")]).await })
    };
    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.send_action("Status", &[("Channel", "two")]).await })
    };

    let mut received = vec![switch.next_action().await, switch.next_action().await];
    received.sort_by_key(|m| m.get("Channel").unwrap().to_string());
    let (one, two) = (received.remove(0), received.remove(0));

    // Answer the second action first; correlation must still hold.
    switch.send_raw(&format!(
        "Response: Success\r\nActionID: {}\r\nMarker: two\r\n\r\n",
        two.action_id().unwrap()
    ));
    switch.send_raw(&format!(
        "Response: Success\r\nActionID: {}\r\nMarker: one\r\n\r\n",
        one.action_id().unwrap()
    ));

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.get("Marker"), Some("one"));
    assert_eq!(second.get("Marker"), Some("two"));
}

#[tokio::test]
async fn events_reach_handlers_in_registration_order() {
    let switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();

    let seen: Arc<Mutex<Vec<(u8, String)>>> = Arc::new(Mutex::new(Vec::new()));
    for tag in [1u8, 2u8] {
        let seen = seen.clone();
        session.subscribe("Newchannel", move |msg| {
            seen.lock()
                .unwrap()
                .push((tag, msg.get("Channel").unwrap_or("").to_string()));
        });
    }

    switch.send_raw("Event: Newchannel\r\nChannel: SIP/100/5551234\r\n\r\n");
    wait_until(|| seen.lock().unwrap().len() == 2).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], (1, "SIP/100/5551234".to_string()));
    assert_eq!(seen[1], (2, "SIP/100/5551234".to_string()));
}

#[tokio::test]
async fn event_style_response_goes_to_waiter_only() {
    let mut switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        session.subscribe("OriginateResponse", move |msg| {
            events
                .lock()
                .unwrap()
                .push(msg.get("Reason").unwrap_or("").to_string());
        });
    }

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.send_action("Originate", &[("Channel", "X")]).await })
    };
    let action = switch.next_action().await;

    // Both keys present: the waiter wins, subscribers see nothing.
    switch.send_raw(&format!(
        "Event: OriginateResponse\r\nActionID: {}\r\nResponse: Success\r\nReason: 4\r\n\r\n",
        action.action_id().unwrap()
    ));
    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.event(), Some("OriginateResponse"));
    assert!(events.lock().unwrap().is_empty());

    // Same event without a waiter drops to the subscribers.
    switch.send_raw("Event: OriginateResponse\r\nActionID: stale-99\r\nReason: 5\r\n\r\n");
    wait_until(|| events.lock().unwrap().len() == 1).await;
    assert_eq!(events.lock().unwrap()[0], "5");
}

#[tokio::test]
async fn connection_drop_fails_pending_waiters_and_emits_session_closed() {
    let mut switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();

    let closed = Arc::new(Mutex::new(0u32));
    {
        let closed = closed.clone();
        session.subscribe(EVENT_SESSION_CLOSED, move |_| {
            *closed.lock().unwrap() += 1;
        });
    }

    let mut waiters = Vec::new();
    for i in 0..3 {
        let session = session.clone();
        waiters.push(tokio::spawn(async move {
            let channel = format!("chan-{}", i);
            session
                .send_action("Status", &[("Channel", channel.as_str())])
                .await
        }));
    }
    for _ in 0..3 {
        switch.next_action().await;
    }

    switch.close_connection();

    for waiter in waiters {
        match waiter.await.unwrap() {
            Err(AmiError::ConnectionLost) => {}
            other => panic!("expected ConnectionLost, got {:?}", other.map(|_| ())),
        }
    }
    wait_until(|| *closed.lock().unwrap() == 1).await;
    assert!(!session.connected());
}

#[tokio::test]
async fn handler_panic_does_not_kill_the_session() {
    let switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();

    let seen = Arc::new(Mutex::new(0u32));
    session.subscribe("Hangup", |_| panic!("bad handler"));
    {
        let seen = seen.clone();
        session.subscribe("Hangup", move |_| {
            *seen.lock().unwrap() += 1;
        });
    }

    switch.send_raw("Event: Hangup\r\nChannel: SIP/a\r\n\r\n");
    switch.send_raw("Event: Hangup\r\nChannel: SIP/b\r\n\r\n");
    wait_until(|| *seen.lock().unwrap() == 2).await;
    assert!(session.connected());
}

#[tokio::test]
async fn close_cancels_pending_waiters() {
    let mut switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.send_action("Status", &[("Channel", "X")]).await })
    };
    switch.next_action().await;

    session.close().await;
    match pending.await.unwrap() {
        Err(AmiError::Cancelled) => {}
        other => panic!("expected Cancelled, got {:?}", other.map(|_| ())),
    }

    // Further sends are refused outright.
    match session.send_action("Ping", &[]).await {
        Err(AmiError::NotConnected) => {}
        other => panic!("expected NotConnected, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn fragmented_messages_reassemble() {
    let switch = MockSwitch::spawn(true).await;
    let session = AmiSession::connect(switch.config()).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        session.subscribe("DialEnd", move |msg| {
            seen.lock()
                .unwrap()
                .push(msg.get("DialStatus").unwrap_or("").to_string());
        });
    }

    // Deliver one event split across writes, plus two events in one write.
    switch.send_raw("Event: DialEnd\r\nDialSta");
    switch.send_raw("tus: ANSWER\r\n\r\n");
    switch.send_raw("Event: DialEnd\r\nDialStatus: BUSY\r\n\r\nEvent: DialEnd\r\nDialStatus: CANCEL\r\n\r\n");

    wait_until(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["ANSWER".to_string(), "BUSY".to_string(), "CANCEL".to_string()]
    );
}
