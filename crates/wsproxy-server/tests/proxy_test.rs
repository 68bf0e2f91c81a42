//! End-to-end tests: tokio-tungstenite clients talk to an axum backend through
//! a real proxy server bound on loopback.

use axum::{
    body::Body,
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;
use wsproxy_config::{DstConfig, ServerConfig};
use wsproxy_control::{Hub, Session, SessionError, SessionState};
use wsproxy_relay::Handshake;
use wsproxy_server::{ProxyServer, BLANK_PAGE, GET_ONLY, INIT_FAILED, REGISTER_FAILED};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PROXY_PATH: &str = "/ws-proxy";
const WAIT: Duration = Duration::from_secs(5);
const BACKEND_DELAY: Duration = Duration::from_millis(600);

/// Close codes the backend received from the proxy
type CloseEvents = mpsc::UnboundedReceiver<u16>;

async fn echo(mut socket: WebSocket, events: mpsc::UnboundedSender<u16>) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            AxumMessage::Close(frame) => {
                let _ = events.send(frame.map(|f| f.code).unwrap_or(1005));
                break;
            }
            data @ (AxumMessage::Text(_) | AxumMessage::Binary(_)) => {
                if socket.send(data).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
}

async fn echo_handler(
    State(events): State<mpsc::UnboundedSender<u16>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| echo(socket, events))
}

async fn cookies_handler(
    State(events): State<mpsc::UnboundedSender<u16>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string();
    let other = headers.contains_key("x-other");

    ws.on_upgrade(move |mut socket| async move {
        let report = format!("cookie={};x-other={}", cookie, other);
        if socket.send(AxumMessage::Text(report.into())).await.is_ok() {
            echo(socket, events).await;
        }
    })
}

async fn going_away_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(AxumMessage::Close(Some(axum::extract::ws::CloseFrame {
                code: 1001,
                reason: "going away".into(),
            })))
            .await;
        // Wait for the close reply
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

async fn missing_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

/// Same answer, but streamed with chunked transfer encoding
async fn missing_streamed_handler() -> impl IntoResponse {
    let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>("not found")]);
    (StatusCode::NOT_FOUND, Body::from_stream(chunks))
}

async fn slow_missing_handler() -> impl IntoResponse {
    tokio::time::sleep(BACKEND_DELAY).await;
    (StatusCode::NOT_FOUND, "not found")
}

async fn slow_echo_handler(
    State(events): State<mpsc::UnboundedSender<u16>>,
    ws: WebSocketUpgrade,
) -> Response {
    tokio::time::sleep(BACKEND_DELAY).await;
    ws.on_upgrade(move |socket| echo(socket, events))
}

async fn start_backend() -> (SocketAddr, CloseEvents) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let router = Router::new()
        .route("/echo", get(echo_handler))
        .route("/cookies", get(cookies_handler))
        .route("/going-away", get(going_away_handler))
        .route("/missing", get(missing_handler))
        .route("/missing-streamed", get(missing_streamed_handler))
        .route("/slow-missing", get(slow_missing_handler))
        .route("/slow-echo", get(slow_echo_handler))
        .with_state(events_tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, events_rx)
}

fn dst_for(backend: SocketAddr, path: &str) -> DstConfig {
    DstConfig::new(
        ServerConfig::new("127.0.0.1", backend.port().to_string(), path),
        true,
    )
}

async fn start_proxy(dst: DstConfig, hub: Arc<Hub>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = ProxyServer::new(
        ServerConfig::new("127.0.0.1", addr.port().to_string(), PROXY_PATH),
        dst,
        hub,
    );
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    addr
}

async fn connect(proxy: SocketAddr) -> Client {
    let (client, _) = timeout(WAIT, connect_async(format!("ws://{}{}", proxy, PROXY_PATH)))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    client
}

async fn next_message(client: &mut Client) -> Message {
    timeout(WAIT, client.next())
        .await
        .expect("receive timed out")
        .expect("stream ended")
        .expect("receive failed")
}

async fn wait_until_empty(hub: &Hub) {
    for _ in 0..250 {
        if hub.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub still holds {} sessions", hub.len().await);
}

/// A port nothing listens on
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn expect_http_error(result: Result<(Client, impl std::fmt::Debug), WsError>) -> (StatusCode, String) {
    match result {
        Err(WsError::Http(response)) => {
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            (StatusCode::from_u16(response.status().as_u16()).unwrap(), body)
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("handshake unexpectedly succeeded"),
    }
}

#[tokio::test]
async fn test_frames_relayed_both_ways() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/echo"), hub.clone()).await;

    let mut client = connect(proxy).await;
    assert_eq!(hub.len().await, 1);

    client.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::Text("hello".into()));

    client.send(Message::Binary(vec![0, 159, 146, 150])).await.unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Message::Binary(vec![0, 159, 146, 150])
    );
}

#[tokio::test]
async fn test_frame_order_preserved() {
    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/echo"), hub).await;

    let mut client = connect(proxy).await;
    for i in 0..100 {
        client.send(Message::Text(format!("msg-{}", i))).await.unwrap();
    }
    for i in 0..100 {
        assert_eq!(
            next_message(&mut client).await,
            Message::Text(format!("msg-{}", i))
        );
    }
}

#[tokio::test]
async fn test_only_cookies_forwarded() {
    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/cookies"), hub).await;

    let mut request = format!("ws://{}{}", proxy, PROXY_PATH)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("cookie", HeaderValue::from_static("session=abc"));
    request
        .headers_mut()
        .insert("x-other", HeaderValue::from_static("1"));

    let (mut client, _) = timeout(WAIT, connect_async(request))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        next_message(&mut client).await,
        Message::Text("cookie=session=abc;x-other=false".into())
    );
}

#[tokio::test]
async fn test_backend_http_error_relayed() {
    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/missing"), hub.clone()).await;

    let result = timeout(WAIT, connect_async(format!("ws://{}{}", proxy, PROXY_PATH)))
        .await
        .unwrap();
    let (status, body) = expect_http_error(result);

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "not found");
    assert!(hub.is_empty().await);
}

#[tokio::test]
async fn test_chunked_backend_error_relayed() {
    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/missing-streamed"), hub.clone()).await;

    let result = timeout(WAIT, connect_async(format!("ws://{}{}", proxy, PROXY_PATH)))
        .await
        .unwrap();
    let (status, body) = expect_http_error(result);

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "not found");
    assert!(hub.is_empty().await);
}

#[tokio::test]
async fn test_client_gone_mid_dial_releases_session() {
    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/slow-missing"), hub.clone()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        PROXY_PATH, proxy
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    for _ in 0..50 {
        if hub.len().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.len().await, 1, "session registered while dialing");

    // Leave before the backend answers
    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(stream);

    wait_until_empty(&hub).await;
}

#[tokio::test]
async fn test_unreachable_backend_is_503() {
    let backend = SocketAddr::from(([127, 0, 0, 1], dead_port().await));
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/echo"), hub.clone()).await;

    let result = timeout(WAIT, connect_async(format!("ws://{}{}", proxy, PROXY_PATH)))
        .await
        .unwrap();
    let (status, body) = expect_http_error(result);

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Service Unavailable");
    assert!(hub.is_empty().await);
}

#[tokio::test]
async fn test_backend_close_code_forwarded() {
    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/going-away"), hub.clone()).await;

    let mut client = connect(proxy).await;

    match next_message(&mut client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Away);
            assert_eq!(frame.reason, "going away");
        }
        other => panic!("expected close, got {:?}", other),
    }

    // The failed relay closes its session, which leaves the hub
    wait_until_empty(&hub).await;
}

#[tokio::test]
async fn test_client_close_forwarded_and_session_released() {
    let (backend, mut events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/echo"), hub.clone()).await;

    let mut client = connect(proxy).await;
    client.send(Message::Text("ping".into())).await.unwrap();
    next_message(&mut client).await;

    client
        .close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        }))
        .await
        .unwrap();

    let code = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(code, 1001);

    wait_until_empty(&hub).await;
}

#[tokio::test]
async fn test_close_all_interrupts_both_sides() {
    let (backend, mut events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/echo"), hub.clone()).await;

    let mut client = connect(proxy).await;
    client.send(Message::Text("warm-up".into())).await.unwrap();
    next_message(&mut client).await;

    assert!(hub.stop().await);
    assert_eq!(hub.close_all().await, 1);
    assert!(hub.is_empty().await);

    match next_message(&mut client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason, "Interrupted");
        }
        other => panic!("expected close, got {:?}", other),
    }

    let code = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(code, 1000);
}

#[tokio::test]
async fn test_stopped_hub_refuses_sessions() {
    let (backend, _events) = start_backend().await;
    let hub = Arc::new(Hub::new());
    let proxy = start_proxy(dst_for(backend, "/echo"), hub.clone()).await;
    hub.stop().await;

    let result = timeout(WAIT, connect_async(format!("ws://{}{}", proxy, PROXY_PATH)))
        .await
        .unwrap();
    let (status, body) = expect_http_error(result);

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, REGISTER_FAILED);
}

#[tokio::test]
async fn test_plain_http_routes() {
    let backend = SocketAddr::from(([127, 0, 0, 1], 9));
    let server = ProxyServer::new(
        ServerConfig::new("127.0.0.1", "0", "ws-proxy"),
        dst_for(backend, "/echo"),
        Arc::new(Hub::new()),
    );
    let router = server.build_router();

    let response = router
        .clone()
        .oneshot(
            Request::post(PROXY_PATH)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], GET_ONLY.as_bytes());

    let response = router
        .clone()
        .oneshot(Request::get("/anything").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], BLANK_PAGE.as_bytes());

    // GET on the proxy path without upgrade headers is rejected
    let response = router
        .oneshot(Request::get(PROXY_PATH).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
    assert!(server.hub().is_empty().await);
}

#[tokio::test]
async fn test_root_path_proxies_every_path() {
    let backend = SocketAddr::from(([127, 0, 0, 1], 9));
    let server = ProxyServer::new(
        ServerConfig::new("127.0.0.1", "0", ""),
        dst_for(backend, "/echo"),
        Arc::new(Hub::new()),
    );

    let response = server
        .build_router()
        .oneshot(Request::put("/some/other/path").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], GET_ONLY.as_bytes());
}

#[tokio::test]
async fn test_start_requires_port() {
    let server = ProxyServer::new(
        ServerConfig::new("127.0.0.1", "", "/"),
        dst_for(SocketAddr::from(([127, 0, 0, 1], 9)), "/"),
        Arc::new(Hub::new()),
    );

    let err = server.start().await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid configuration: You have to specify port");
}

#[tokio::test]
async fn test_start_reports_bind_failure() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let server = ProxyServer::new(
        ServerConfig::new("127.0.0.1", port.to_string(), "/"),
        dst_for(SocketAddr::from(([127, 0, 0, 1], 9)), "/"),
        Arc::new(Hub::new()),
    );

    match server.start().await {
        Err(wsproxy_server::ServerError::Bind { address, .. }) => {
            assert_eq!(address, format!("127.0.0.1:{}", port));
        }
        other => panic!("expected bind error, got {:?}", other),
    }
}

/// Router that initializes one shared session on every request
fn shared_session_router(session: Arc<Session>, dst: DstConfig) -> Router {
    async fn handler(
        State((session, dst)): State<(Arc<Session>, DstConfig)>,
        headers: HeaderMap,
        ws: WebSocketUpgrade,
    ) -> Response {
        match session.init(Handshake::new(ws, headers), &dst).await {
            Ok(response) => response,
            Err(SessionError::BadState { .. }) => {
                (StatusCode::CONFLICT, INIT_FAILED).into_response()
            }
            Err(SessionError::Proxy { source, .. }) => source.failure_response().into_response(),
        }
    }

    Router::new()
        .route(PROXY_PATH, any(handler))
        .with_state((session, dst))
}

async fn serve_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_second_init_after_success_is_state_error() {
    let (backend, _events) = start_backend().await;
    let session = Arc::new(Session::new(1));
    let addr = serve_router(shared_session_router(session.clone(), dst_for(backend, "/echo"))).await;

    let mut client = connect(addr).await;
    assert_eq!(session.state().await, SessionState::Running);

    let result = timeout(WAIT, connect_async(format!("ws://{}{}", addr, PROXY_PATH)))
        .await
        .unwrap();
    let (status, body) = expect_http_error(result);
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, INIT_FAILED);

    // The first relay is unaffected
    client.send(Message::Text("still here".into())).await.unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Message::Text("still here".into())
    );
}

#[tokio::test]
async fn test_second_init_after_failure_is_state_error() {
    let backend = SocketAddr::from(([127, 0, 0, 1], dead_port().await));
    let session = Arc::new(Session::new(1));
    let addr = serve_router(shared_session_router(session.clone(), dst_for(backend, "/echo"))).await;

    let url = format!("ws://{}{}", addr, PROXY_PATH);

    let (status, _) = expect_http_error(timeout(WAIT, connect_async(url.clone())).await.unwrap());
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(session.state().await, SessionState::Init);

    let (status, _) = expect_http_error(timeout(WAIT, connect_async(url)).await.unwrap());
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(session.state().await, SessionState::Init);
}

#[tokio::test]
async fn test_concurrent_close_on_running_session() {
    let (backend, mut events) = start_backend().await;
    let session = Arc::new(Session::new(1));
    let addr = serve_router(shared_session_router(session.clone(), dst_for(backend, "/echo"))).await;

    let mut client = connect(addr).await;
    client.send(Message::Text("warm-up".into())).await.unwrap();
    next_message(&mut client).await;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        })
        .collect();

    let mut transitions = 0;
    for handle in handles {
        if handle.await.unwrap() {
            transitions += 1;
        }
    }
    assert_eq!(transitions, 1);
    assert_eq!(session.state().await, SessionState::Stopped);

    match next_message(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close, got {:?}", other),
    }
    let code = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(code, 1000);
}

#[tokio::test]
async fn test_close_during_dial_does_not_wait_for_backend() {
    let (backend, _events) = start_backend().await;
    let session = Arc::new(Session::new(1));
    let addr = serve_router(shared_session_router(
        session.clone(),
        dst_for(backend, "/slow-echo"),
    ))
    .await;

    let client = tokio::spawn(connect_async(format!("ws://{}{}", addr, PROXY_PATH)));

    // Let the dial start
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.state().await, SessionState::Init);

    let closed = timeout(Duration::from_millis(200), session.close())
        .await
        .expect("close waited for the backend dial");
    assert!(closed);

    // The dial completes afterwards, but the session stays stopped
    let result = timeout(WAIT, client).await.unwrap().unwrap();
    let (status, body) = expect_http_error(result);
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, INIT_FAILED);
    assert_eq!(session.state().await, SessionState::Stopped);
}
