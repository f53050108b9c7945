use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use parlor_server::auth::{Authenticator, StaticSessionAuthenticator};
use parlor_server::config::Config;
use parlor_server::history::HistoryStore;
use parlor_server::hub::Hub;
use parlor_server::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Origin present in the test config's allow list.
pub const TEST_ORIGIN: &str = "http://localhost:5173";

pub struct TestServer {
    pub addr: SocketAddr,
    pub auth: Arc<StaticSessionAuthenticator>,
}

/// Start an actual TCP server for WebSocket testing. Each call gets its own
/// state and its own history database file.
pub async fn start_server() -> TestServer {
    let db_path = std::env::temp_dir()
        .join(format!("parlor-e2e-{}.db", ulid::Ulid::new()))
        .to_string_lossy()
        .into_owned();

    let config = Arc::new(Config::for_tests(db_path));
    let history = HistoryStore::connect(
        &config.database_path,
        config.history_retention_ttl,
        config.history_per_room_cap,
    )
    .await
    .expect("open history store");

    let hub = Arc::new(Hub::new(config, history));
    let auth = Arc::new(StaticSessionAuthenticator::new());
    let state = AppState {
        hub,
        auth: auth.clone() as Arc<dyn Authenticator>,
    };

    let app = parlor_server::routes::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, auth }
}

/// Attempt a WebSocket upgrade with the given session token and origin.
pub async fn try_connect(
    addr: SocketAddr,
    token: &str,
    origin: &str,
) -> Result<Ws, tungstenite::Error> {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        "Cookie",
        HeaderValue::from_str(&format!("parlor_session={token}")).unwrap(),
    );
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_str(origin).unwrap());

    let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Connect with an allowed origin, panicking on failure.
pub async fn connect(addr: SocketAddr, token: &str) -> Ws {
    try_connect(addr, token, TEST_ORIGIN).await.expect("upgrade")
}

/// Connect and consume the `hello` and initial `history` frames.
pub async fn connect_ready(addr: SocketAddr, token: &str) -> Ws {
    let mut ws = connect(addr, token).await;
    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    let history = recv_json(&mut ws).await;
    assert_eq!(history["type"], "history");
    ws
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// Receive the next text frame as JSON, with a timeout.
pub async fn recv_json(ws: &mut Ws) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("frame is JSON");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Receive frames until one of the given type arrives, discarding others.
pub async fn recv_type(ws: &mut Ws, frame_type: &str) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = recv_json(ws).await;
            if frame["type"] == frame_type {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {frame_type} frame"))
}

/// Drain the stream until a close frame arrives; returns `(code, reason)`.
pub async fn recv_close(ws: &mut Ws) -> (u16, String) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    return (frame.code.into(), frame.reason.to_string());
                }
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}
