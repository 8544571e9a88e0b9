//! Control server for network clients.
//!
//! Clients connect to `ws://<listen>/ws?client=<type>&secret=<secret>` and exchange
//! `[type, payload]` JSON messages. Each connection runs on its own thread, reading
//! with a short timeout and forwarding queued outbound messages in between.
//!
//! `POST /callerid?secret=<secret>` with a Caller-ID JSON body plays the burst on
//! every line without ringing.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use serde::Deserialize;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::{Message, WebSocket};
use crate::callerid::CallerIdPayload;
use crate::clients::{ConnectionId, Inbound, Outbound};
use crate::engine::SharedExchange;
use crate::error::{lock, Error, Result};

const WS_PATH: &str = "/ws";
const CALLER_ID_PATH: &str = "/callerid";
const READ_TIMEOUT: Duration = Duration::from_millis(50);
const ACCEPT_INTERVAL: Duration = Duration::from_millis(100);
/// Time allowed for a peer to send its request head.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_HEAD: usize = 8192;
const MAX_REQUEST_BODY: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Query parameters shared by every endpoint.
#[derive(Deserialize, Default, Debug, PartialEq)]
#[serde(default)]
struct AuthQuery {
    client: String,
    secret: Option<String>,
}

impl AuthQuery {
    fn parse(query: &str) -> Self {
        serde_urlencoded::from_str(query).unwrap_or_default()
    }

    fn from_target(target: &str) -> Self {
        Self::parse(target.split_once('?').map_or("", |(_, query)| query))
    }

    fn is_authorized(&self, secret: &str) -> bool {
        self.secret.as_deref() == Some(secret)
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_owned()));
    *response.status_mut() = status;
    response
}

struct Session {
    client: String,
    connection: ConnectionId,
    outbound: mpsc::Receiver<Outbound>,
}

pub struct ControlServer {
    listener: TcpListener,
    exchange: SharedExchange,
    secret: String,
}

impl ControlServer {
    pub fn bind(addr: &str, exchange: SharedExchange, secret: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|err| Error::Server(format!("{}: {}", addr, err)))?;
        Ok(Self { listener, exchange, secret: secret.into() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|err| Error::Server(err.to_string()))
    }

    /// Accepts connections until `running` is cleared.
    pub fn run(&self, running: &AtomicBool) -> Result<()> {
        self.listener.set_nonblocking(true).map_err(|err| Error::Server(err.to_string()))?;
        info!("Control server listening on ws://{}{}", self.local_addr()?, WS_PATH);

        while running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    let prepared = stream.set_nonblocking(false)
                        .and_then(|_| stream.set_read_timeout(Some(REQUEST_TIMEOUT)));
                    if let Err(err) = prepared {
                        warn!("Dropping connection from {}: {}", peer, err);
                        continue
                    }
                    let exchange = self.exchange.clone();
                    let secret = self.secret.clone();
                    thread::spawn(move || serve_connection(stream, exchange, &secret));
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_INTERVAL),
                Err(err) => warn!("Accept failed: {}", err),
            }
        }
        info!("Control server stopped");
        Ok(())
    }
}

/// Path of the request waiting on `stream`, read without consuming it.
fn peek_path(stream: &TcpStream) -> Option<String> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let deadline = Instant::now() + REQUEST_TIMEOUT;
    loop {
        let n = stream.peek(&mut buf).ok()?;
        if n == 0 {
            return None
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf[..n]) {
            Ok(httparse::Status::Complete(_)) => return request.path.map(|path| path.split('?').next().unwrap_or(path).to_owned()),
            Ok(httparse::Status::Partial) if n < buf.len() && Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            },
            _ => return None,
        }
    }
}

fn serve_connection(stream: TcpStream, exchange: SharedExchange, secret: &str) {
    match peek_path(&stream).as_deref() {
        Some(CALLER_ID_PATH) => serve_caller_id(stream, &exchange, secret),
        _ => serve_websocket(stream, exchange, secret),
    }
}

struct HttpRequest {
    method: String,
    target: String,
    body: Vec<u8>,
}

/// Reads one request with a `Content-Length` body.
fn read_request(stream: &mut TcpStream) -> io::Result<HttpRequest> {
    let invalid = |reason: String| io::Error::new(ErrorKind::InvalidData, reason);
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "request truncated"))
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let head_len = match request.parse(&buf).map_err(|err| invalid(err.to_string()))? {
            httparse::Status::Complete(head_len) => head_len,
            httparse::Status::Partial if buf.len() < MAX_REQUEST_HEAD => continue,
            httparse::Status::Partial => return Err(invalid("request head too large".into())),
        };
        let length = request.headers.iter()
            .find(|header| header.name.eq_ignore_ascii_case("content-length"))
            .and_then(|header| std::str::from_utf8(header.value).ok()?.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if length > MAX_REQUEST_BODY {
            return Err(invalid(format!("body of {} bytes is too large", length)))
        }
        let method = request.method.unwrap_or_default().to_owned();
        let target = request.path.unwrap_or_default().to_owned();

        let mut body = buf.split_off(head_len);
        while body.len() < length {
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "body truncated"))
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(length);
        return Ok(HttpRequest { method, target, body })
    }
}

fn respond(stream: &mut TcpStream, status: StatusCode, body: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        body.len(),
        body
    );
    if let Err(err) = stream.write_all(response.as_bytes()) {
        debug!("Response not delivered: {}", err);
    }
}

fn serve_caller_id(mut stream: TcpStream, exchange: &SharedExchange, secret: &str) {
    match read_request(&mut stream) {
        Ok(request) => {
            let (status, body) = handle_caller_id(&request, exchange, secret);
            respond(&mut stream, status, &body);
        },
        Err(err) => {
            debug!("Unreadable Caller-ID request: {}", err);
            respond(&mut stream, StatusCode::BAD_REQUEST, &err.to_string());
        },
    }
}

fn handle_caller_id(request: &HttpRequest, exchange: &SharedExchange, secret: &str) -> (StatusCode, String) {
    if request.method != "POST" {
        return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".into())
    }
    if !AuthQuery::from_target(&request.target).is_authorized(secret) {
        return (StatusCode::UNAUTHORIZED, "invalid secret".into())
    }
    let payload: CallerIdPayload = match serde_json::from_slice(&request.body) {
        Ok(payload) => payload,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()),
    };
    match lock(exchange).announce_caller_id(&payload) {
        Ok(lines) => {
            info!("Caller-ID {} sent to {} line(s)", payload.number(), lines);
            (StatusCode::NO_CONTENT, String::new())
        },
        Err(Error::Rejected(reason)) => (StatusCode::BAD_REQUEST, reason),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn serve_websocket(stream: TcpStream, exchange: SharedExchange, secret: &str) {
    let mut session = None;
    let callback = |request: &Request, response: Response| {
        if request.uri().path() != WS_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "not found"))
        }
        let query = AuthQuery::parse(request.uri().query().unwrap_or_default());
        if query.client.is_empty() {
            return Err(reject(StatusCode::BAD_REQUEST, "missing client type"))
        }
        if !query.is_authorized(secret) {
            return Err(reject(StatusCode::UNAUTHORIZED, "invalid secret"))
        }

        let (tx, rx) = mpsc::channel();
        match lock(&exchange).register(&query.client, tx) {
            Ok(connection) => {
                session = Some(Session { client: query.client, connection, outbound: rx });
                Ok(response)
            },
            Err(Error::Rejected(reason)) => {
                info!("Refused registration as {}: {}", query.client, reason);
                Err(reject(StatusCode::CONFLICT, &reason))
            },
            Err(err) => Err(reject(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())),
        }
    };

    let result = tungstenite::accept_hdr(stream, callback).map_err(|err| err.to_string());
    match (result, session) {
        (Ok(socket), Some(session)) => run_session(socket, &exchange, session),
        (Err(err), Some(session)) => {
            warn!("Handshake for {} failed: {}", session.client, err);
            lock(&exchange).disconnect(&session.client, session.connection);
        },
        (Err(err), None) => debug!("Handshake rejected: {}", err),
        (Ok(_), None) => {},
    }
}

fn run_session(mut socket: WebSocket<TcpStream>, exchange: &SharedExchange, session: Session) {
    let Session { client, connection, outbound } = session;
    info!("Client {} connected (connection {})", client, connection);
    if let Err(err) = socket.get_ref().set_read_timeout(Some(READ_TIMEOUT)) {
        warn!("Client {}: {}", client, err);
    }

    let mut closing = false;
    'session: loop {
        while !closing {
            let message = match outbound.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => Outbound::Close,
            };
            match message.to_json() {
                Some(json) => {
                    debug!("To {}: {}", client, json);
                    if let Err(err) = socket.send(Message::Text(json)) {
                        warn!("Client {}: send failed: {}", client, err);
                        break 'session
                    }
                },
                None => {
                    debug!("Closing connection {} of {}", connection, client);
                    closing = true;
                    if let Err(err) = socket.close(None) {
                        debug!("Client {}: {}", client, err);
                        break 'session
                    }
                },
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                debug!("From {}: {}", client, text);
                let result = Inbound::parse(&text)
                    .and_then(|message| lock(exchange).handle(&client, connection, message));
                if let Err(err) = result {
                    warn!("Client {}: {}", client, err);
                }
            },
            Ok(_) => {},
            Err(tungstenite::Error::Io(err)) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {},
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(err) => {
                warn!("Client {}: {}", client, err);
                break
            },
        }
    }

    info!("Client {} disconnected (connection {})", client, connection);
    lock(exchange).disconnect(&client, connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::audio::{AudioPipeline, CallerIdAssets, DeviceIds};
    use crate::hid::Protocol;
    use crate::config::{HidphoneConfig, ModemConfig};
    use crate::engine::Exchange;

    fn start() -> (SharedExchange, SocketAddr, Arc<AtomicBool>) {
        let config = HidphoneConfig::parse("secret = \"pa ss\"").unwrap();
        let exchange = Exchange::new(config, CallerIdAssets::load(&ModemConfig::default()).unwrap());
        let server = ControlServer::bind("127.0.0.1:0", exchange.clone(), "pa ss").unwrap();
        let addr = server.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        thread::spawn(move || server.run(&flag));
        (exchange, addr, running)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn status_of(url: String) -> StatusCode {
        match tungstenite::connect(url) {
            Err(tungstenite::Error::Http(response)) => response.status(),
            Err(err) => panic!("unexpected error: {}", err),
            Ok(_) => StatusCode::SWITCHING_PROTOCOLS,
        }
    }

    fn post(addr: SocketAddr, target: &str, body: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            target, body.len(), body
        ).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        let status = response.split(' ').nth(1).unwrap().parse().unwrap();
        let body = response.split_once("\r\n\r\n").unwrap().1.to_owned();
        (status, body)
    }

    #[test]
    fn decodes_auth_query() {
        let query = AuthQuery::parse("client=ws%31&secret=a+b%20c&extra");
        assert_eq!(query.client, "ws1");
        assert!(query.is_authorized("a b c"));
        assert_eq!(AuthQuery::parse(""), AuthQuery::default());
        assert!(!AuthQuery::from_target("/callerid").is_authorized(""));
        assert!(AuthQuery::from_target("/callerid?secret=x").is_authorized("x"));
    }

    #[test]
    fn caller_id_plays_on_every_line() {
        let (exchange, addr, running) = start();
        let audio = Arc::new(AudioPipeline::new());
        let (tx, _rx) = mpsc::channel();
        lock(&exchange).add_line("L1", Protocol::Modern, DeviceIds::default(), Arc::clone(&audio), tx);

        let (status, _) = post(addr, "/callerid?secret=pa+ss", r#"{"number":"2025551234","name":"JOHN SMITH"}"#);
        assert_eq!(status, 204);
        assert!(audio.is_playing());
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn caller_id_requires_secret_and_valid_payload() {
        let (exchange, addr, running) = start();
        let audio = Arc::new(AudioPipeline::new());
        let (tx, _rx) = mpsc::channel();
        lock(&exchange).add_line("L1", Protocol::Modern, DeviceIds::default(), Arc::clone(&audio), tx);

        assert_eq!(post(addr, "/callerid?secret=nope", r#"{"number":"1"}"#), (401, "invalid secret".to_owned()));
        let (status, body) = post(addr, "/callerid?secret=pa+ss", r#"{"number":"1","numberNotPresent":"P"}"#);
        assert_eq!(status, 400);
        assert!(body.contains("numberNotPresent"), "{}", body);
        assert_eq!(post(addr, "/callerid?secret=pa+ss", "not json").0, 400);
        assert!(!audio.is_playing());
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn rejects_bad_handshakes() {
        let (_exchange, addr, running) = start();
        assert_eq!(status_of(format!("ws://{}/ws?secret=pa+ss", addr)), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(format!("ws://{}/ws?client=ws1&secret=nope", addr)), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(format!("ws://{}/ws?client=dialer&secret=pa%20ss", addr)), StatusCode::CONFLICT);
        assert_eq!(status_of(format!("ws://{}/other?client=ws1&secret=pa+ss", addr)), StatusCode::NOT_FOUND);
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn session_registers_and_cleans_up() {
        let (exchange, addr, running) = start();
        let (mut socket, _) = tungstenite::connect(format!("ws://{}/ws?client=ws1&secret=pa+ss", addr)).unwrap();
        assert!(lock(&exchange).is_registered("ws1"));

        socket.send(Message::Text(r#"["ring",{"id":"A"}]"#.into())).unwrap();
        assert!(wait_for(|| lock(&exchange).offers().len() == 1));
        socket.send(Message::Text(r#"["stopRinging","A"]"#.into())).unwrap();
        assert!(wait_for(|| lock(&exchange).offers().is_empty()));

        socket.close(None).unwrap();
        while socket.read().is_ok() {}
        assert!(wait_for(|| !lock(&exchange).is_registered("ws1")));
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn reconnect_closes_previous_session() {
        let (exchange, addr, running) = start();
        let url = format!("ws://{}/ws?client=ws1&secret=pa+ss", addr);
        let (mut first, _) = tungstenite::connect(url.clone()).unwrap();
        let (_second, _) = tungstenite::connect(url).unwrap();

        let closed = loop {
            match first.read() {
                Ok(Message::Close(_)) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(closed);
        assert!(lock(&exchange).is_registered("ws1"));
        running.store(false, Ordering::SeqCst);
    }
}
