//! End-to-end relay scenarios over real WebSocket connections

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_core::{Config, JoinOrder};
use relay_server::{RelayServer, ServerHandle};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.server.port = 0;
    config
}

async fn start(config: Config) -> ServerHandle {
    assert_ok!(RelayServer::new(config).start().await)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let url = format!("ws://{}{}", addr, path);
    let (ws, _) = assert_ok!(connect_async(url).await);
    ws
}

/// Next binary frame, skipping control traffic
async fn recv_binary(ws: &mut Client) -> Vec<u8> {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Binary(data) => return data,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected binary frame, got {:?}", other),
        }
    }
}

/// Close code the server sends, skipping any frames still in flight
async fn recv_close(ws: &mut Client) -> Option<u16> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("timed out waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn send(ws: &mut Client, frame: &[u8]) {
    assert_ok!(ws.send(Message::Binary(frame.to_vec())).await);
}

async fn create_session(addr: SocketAddr) -> (Client, String) {
    let mut host = connect(addr, "/create").await;
    let frame = recv_binary(&mut host).await;
    assert_eq!(frame[0], 3, "first frame to the host is CODE");
    let code = String::from_utf8(frame[1..].to_vec()).unwrap();
    (host, code)
}

/// Join and accept a client under `id`; returns the client socket
async fn admit(addr: SocketAddr, host: &mut Client, code: &str, id: i32) -> Client {
    let mut client = connect(addr, &format!("/join/{}", code)).await;
    assert_eq!(recv_binary(host).await, vec![4]);

    let mut send_id = vec![4];
    send_id.extend_from_slice(&id.to_be_bytes());
    send(host, &send_id).await;

    let mut assign = vec![4];
    assign.extend_from_slice(&id.to_be_bytes());
    assert_eq!(recv_binary(&mut client).await, assign);
    assert_eq!(recv_binary(&mut client).await, vec![1, 0, 0, 0, 1]);

    let mut connect_frame = vec![1];
    connect_frame.extend_from_slice(&id.to_be_bytes());
    assert_eq!(recv_binary(host).await, connect_frame);

    client
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    response
}

#[tokio::test]
async fn test_host_receives_four_letter_code() {
    let server = start(test_config()).await;
    let (_host, code) = create_session(server.local_addr()).await;

    assert_eq!(code.len(), 4);
    assert!(code.chars().all(|c| c.is_ascii_uppercase()));

    server.stop().await;
}

#[tokio::test]
async fn test_join_forward_and_kick() {
    let server = start(test_config()).await;
    let addr = server.local_addr();
    let (mut host, code) = create_session(addr).await;

    let mut client = admit(addr, &mut host, &code, 7).await;

    // Host to client: the id is rewritten to the host's
    send(&mut host, &[0, 0, 0, 0, 7, 0xAA, 0xBB]).await;
    assert_eq!(recv_binary(&mut client).await, vec![0, 0, 0, 0, 1, 0xAA, 0xBB]);

    // Client to host: the id is rewritten to the sender's
    send(&mut client, &[0, 0, 0, 0, 1, 0x42]).await;
    assert_eq!(recv_binary(&mut host).await, vec![0, 0, 0, 0, 7, 0x42]);

    send(&mut host, &[2, 0, 0, 0, 7]).await;
    assert_eq!(recv_close(&mut client).await, Some(1001));

    server.stop().await;
}

#[tokio::test]
async fn test_kicked_client_cannot_keep_session_alive() {
    let mut config = test_config();
    config.session.ttl_secs = 1;
    config.session.sweep_interval_secs = 1;
    let server = start(config).await;
    let addr = server.local_addr();
    let (mut host, code) = create_session(addr).await;

    let mut client = admit(addr, &mut host, &code, 7).await;
    send(&mut host, &[2, 0, 0, 0, 7]).await;

    // Never read the close frame; just keep sending.
    let chatter = tokio::spawn(async move {
        for _ in 0..20 {
            let _ = client.send(Message::Binary(vec![0, 0, 0, 0, 1, 9])).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let closed = timeout(Duration::from_secs(4), recv_close(&mut host)).await;
    assert_eq!(closed.expect("session kept alive by kicked client"), Some(3008));
    assert_eq!(server.connection_count(), 0);

    chatter.abort();
    server.stop().await;
}

#[tokio::test]
async fn test_join_is_case_insensitive() {
    let server = start(test_config()).await;
    let addr = server.local_addr();
    let (mut host, code) = create_session(addr).await;

    let _client = admit(addr, &mut host, &code.to_lowercase(), 2).await;

    server.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_notifies_host() {
    let server = start(test_config()).await;
    let addr = server.local_addr();
    let (mut host, code) = create_session(addr).await;

    let mut client = admit(addr, &mut host, &code, 3).await;
    assert_ok!(client.close(None).await);

    assert_eq!(recv_binary(&mut host).await, vec![2, 0, 0, 0, 3]);

    server.stop().await;
}

#[tokio::test]
async fn test_host_disconnect_closes_clients() {
    let server = start(test_config()).await;
    let addr = server.local_addr();
    let (mut host, code) = create_session(addr).await;

    let mut client = admit(addr, &mut host, &code, 5).await;
    assert_ok!(host.close(None).await);

    assert_eq!(recv_close(&mut client).await, Some(1001));

    // The session is gone, so the code no longer admits anyone
    let mut late = connect(addr, &format!("/join/{}", code)).await;
    assert_eq!(recv_close(&mut late).await, Some(1002));

    server.stop().await;
}

#[tokio::test]
async fn test_bad_codes_are_rejected() {
    let server = start(test_config()).await;
    let addr = server.local_addr();

    let mut malformed = connect(addr, "/join/12").await;
    assert_eq!(recv_close(&mut malformed).await, Some(1002));

    let mut unknown = connect(addr, "/join/ZZZZ").await;
    assert_eq!(recv_close(&mut unknown).await, Some(1002));

    server.stop().await;
}

#[tokio::test]
async fn test_fifo_join_order() {
    let mut config = test_config();
    config.session.join_order = JoinOrder::Fifo;
    let server = start(config).await;
    let addr = server.local_addr();
    let (mut host, code) = create_session(addr).await;

    let mut first = connect(addr, &format!("/join/{}", code)).await;
    assert_eq!(recv_binary(&mut host).await, vec![4]);
    let mut second = connect(addr, &format!("/join/{}", code)).await;
    assert_eq!(recv_binary(&mut host).await, vec![4]);

    send(&mut host, &[4, 0, 0, 0, 10]).await;
    assert_eq!(recv_binary(&mut first).await, vec![4, 0, 0, 0, 10]);

    send(&mut host, &[4, 0, 0, 0, 11]).await;
    assert_eq!(recv_binary(&mut second).await, vec![4, 0, 0, 0, 11]);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let server = start(test_config()).await;

    match connect_async(format!("ws://{}/nowhere", server.local_addr())).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        Err(e) => panic!("expected HTTP 404, got {}", e),
        Ok(_) => panic!("upgrade on an unknown route succeeded"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_route_prefix() {
    let mut config = test_config();
    config.server.route_prefix = "/relay".into();
    let server = start(config).await;
    let addr = server.local_addr();

    let mut host = connect(addr, "/relay/create").await;
    assert_eq!(recv_binary(&mut host).await[0], 3);

    assert!(connect_async(format!("ws://{}/create", addr)).await.is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start(test_config()).await;
    let addr = server.local_addr();
    let (_host, _code) = create_session(addr).await;

    let response = http_get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["sessions"], 1);

    server.stop().await;
}

#[tokio::test]
async fn test_health_request_line_split_across_writes() {
    let server = start(test_config()).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(b"GET /hea").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream
        .write_all(b"lth HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("\"healthy\""));

    server.stop().await;
}

#[tokio::test]
async fn test_idle_session_expires() {
    let mut config = test_config();
    config.session.ttl_secs = 1;
    config.session.sweep_interval_secs = 1;
    let server = start(config).await;
    let (mut host, _code) = create_session(server.local_addr()).await;

    let closed = timeout(Duration::from_secs(4), recv_close(&mut host)).await;
    assert_eq!(closed.expect("session never expired"), Some(3008));
    assert_eq!(server.session_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_sessions() {
    let server = start(test_config()).await;
    let (mut host, _code) = create_session(server.local_addr()).await;

    server.stop().await;
    assert_eq!(recv_close(&mut host).await, Some(1001));
}
