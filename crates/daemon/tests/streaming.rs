//! Streaming tests against a real listener.
//!
//! WebSocket clients use `tokio-tungstenite`; the SSE route is read with
//! `reqwest`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use daemon::api::{ApiKey, AppState};
use daemon::config::{JobConfig, SessionConfig};
use daemon::jobs::JobRunner;
use daemon::lifecycle::{ChildTracker, ControlHandle};
use daemon::session::SessionRegistry;
use daemon::stream::Streamer;
use futures_util::StreamExt;
use protocol::{OutputStream, StreamEvent};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const KEY: &str = "stream-key";
const WAIT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(dir: &Path) -> (SocketAddr, AppState) {
    let tracker = ChildTracker::new();
    let state = AppState {
        sessions: Arc::new(SessionRegistry::new(
            SessionConfig {
                default_shell: "/bin/sh".to_string(),
                ..Default::default()
            },
            tracker.clone(),
        )),
        jobs: Arc::new(JobRunner::new(
            JobConfig {
                stop_grace_ms: 500,
                ..Default::default()
            },
            "/bin/sh".to_string(),
            dir.join("jobs"),
            tracker,
        )),
        streamer: Streamer::new(Duration::from_millis(50)),
        api_key: ApiKey::new(KEY),
        control: ControlHandle::new(),
        started_at: Instant::now(),
        default_session: "default".to_string(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(daemon::api::serve(listener, state.clone()));
    (addr, state)
}

async fn connect(addr: SocketAddr, path: &str) -> Socket {
    let url = format!("ws://{}{}?token={}", addr, path, KEY);
    let (socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
}

/// Reads events until the end event or the socket closes.
async fn read_events(socket: &mut Socket) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(message) = tokio::time::timeout(WAIT, socket.next()).await.unwrap() {
        match message.unwrap() {
            Message::Text(text) => {
                let event = StreamEvent::from_json(&text).unwrap();
                let end = event.is_end();
                events.push(event);
                if end {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    events
}

#[tokio::test]
async fn test_job_websocket_replays_output_and_ends() {
    let dir = TempDir::new().unwrap();
    let (addr, state) = start_server(dir.path()).await;

    let id = state.jobs.start("echo first; sleep 0.3; echo second; exit 2");
    let mut socket = connect(addr, &format!("/job/{}/stream", id)).await;

    let events = read_events(&mut socket).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::output(OutputStream::Combined, "first"),
            StreamEvent::output(OutputStream::Combined, "second"),
            StreamEvent::ended("job completed", Some(2)),
        ]
    );
}

#[tokio::test]
async fn test_two_clients_see_the_same_job_output() {
    let dir = TempDir::new().unwrap();
    let (addr, state) = start_server(dir.path()).await;

    let id = state.jobs.start("sleep 0.2; echo shared");
    let path = format!("/job/{}/stream", id);
    let mut a = connect(addr, &path).await;
    let mut b = connect(addr, &path).await;

    let (events_a, events_b) = tokio::join!(read_events(&mut a), read_events(&mut b));
    assert_eq!(events_a, events_b);
    assert_eq!(
        events_a.first(),
        Some(&StreamEvent::output(OutputStream::Combined, "shared"))
    );
}

#[tokio::test]
async fn test_session_websocket_follows_commands() {
    let dir = TempDir::new().unwrap();
    let (addr, state) = start_server(dir.path()).await;

    let session = state.sessions.create(Some("watched".into()), None).await.unwrap();
    let mut socket = connect(addr, "/session/watched/stream").await;
    // Let the server finish the upgrade and attach.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = session.execute("echo live", None).await.unwrap();
    assert_eq!(response.output, "live");

    let deadline = Instant::now() + WAIT;
    loop {
        let message = tokio::time::timeout(WAIT, socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            let event = StreamEvent::from_json(&text).unwrap();
            assert!(!format!("{:?}", event).contains("__TERMGATE_"));
            if event == StreamEvent::output(OutputStream::Stdout, "live") {
                break;
            }
        }
        assert!(Instant::now() < deadline);
    }

    state.sessions.remove("watched").await.unwrap();
    let events = read_events(&mut socket).await;
    assert!(events.last().is_some_and(StreamEvent::is_end));
}

#[tokio::test]
async fn test_websocket_rejects_missing_token() {
    let dir = TempDir::new().unwrap();
    let (addr, state) = start_server(dir.path()).await;
    let id = state.jobs.start("true");

    let url = format!("ws://{}/job/{}/stream", addr, id);
    match connect_async(url.as_str()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_unknown_job_stream_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (addr, _state) = start_server(dir.path()).await;

    let url = format!("ws://{}/job/missing/stream?token={}", addr, KEY);
    match connect_async(url.as_str()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP 404, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_job_server_sent_events() {
    let dir = TempDir::new().unwrap();
    let (addr, state) = start_server(dir.path()).await;
    let id = state.jobs.start("echo one; echo two");

    let body = reqwest::Client::new()
        .get(format!("http://{}/job/{}/events", addr, id))
        .bearer_auth(KEY)
        .timeout(WAIT)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(body.matches("event: output").count(), 2);
    assert!(body.contains("event: ended"));
    assert!(body.contains("\"line\":\"two\""));
    assert!(body.contains("job completed"));
}
