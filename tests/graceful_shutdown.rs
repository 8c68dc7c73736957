//! End-to-end shutdown behaviour over real sockets, plain and TLS.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use graceful_web::{
    ConnInfo, ConnState, Lifecycle, Request, Response, Server, ServerError, ShutdownOutcome,
    StatusCode,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

const WAIT: Duration = Duration::from_secs(5);
const NOT_YET: Duration = Duration::from_millis(100);

async fn success(_req: Request) -> Response {
    Response::new(StatusCode::Ok).body("Success")
}

struct ParsedResponse {
    head: String,
    body: String,
}

impl ParsedResponse {
    fn status(&self) -> u16 {
        self.head[9..12].parse().unwrap()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

async fn roundtrip<S>(stream: &mut S, request: &str) -> ParsedResponse
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end - 4].to_vec()).unwrap();
    let mut response = ParsedResponse {
        head,
        body: String::new(),
    };
    let len: usize = response.header("content-length").unwrap().parse().unwrap();
    while buf.len() < head_end + len {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response body");
        buf.extend_from_slice(&chunk[..n]);
    }
    response.body = String::from_utf8(buf[head_end..head_end + len].to_vec()).unwrap();
    response
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n")
}

async fn next_outcome(rx: &mut mpsc::Receiver<ShutdownOutcome>) -> ShutdownOutcome {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no shutdown outcome in time")
        .expect("outcome channel closed")
}

async fn assert_no_outcome_yet(rx: &mut mpsc::Receiver<ShutdownOutcome>) {
    assert!(
        tokio::time::timeout(NOT_YET, rx.recv()).await.is_err(),
        "shutdown completed while work was outstanding"
    );
}

struct TestCert {
    cert_pem: String,
    key_pem: String,
    client: TlsConnector,
}

fn test_cert() -> TestCert {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(generated.cert.der().clone()).unwrap();
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TestCert {
        cert_pem: generated.cert.pem(),
        key_pem: generated.signing_key.serialize_pem(),
        client: TlsConnector::from(Arc::new(config)),
    }
}

async fn tls_connect(connector: &TlsConnector, addr: SocketAddr) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    connector.connect(name, tcp).await.unwrap()
}

async fn start(server: &Server) -> (SocketAddr, mpsc::Receiver<ShutdownOutcome>) {
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let (tx, rx) = mpsc::channel(1);
    server.serve(success, tx).await.unwrap();
    (addr, rx)
}

#[tokio::test]
async fn http_keep_alive_enabled_shuts_down_gracefully() {
    let server = Server::new();
    let (addr, mut rx) = start(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let response = roundtrip(&mut client, &get("/")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.body, "Success");
    assert_eq!(response.header("connection"), Some("keep-alive"));

    // A second request reuses the connection.
    let response = roundtrip(&mut client, &get("/")).await;
    assert_eq!(response.body, "Success");

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
    assert_eq!(server.state(), Lifecycle::Terminated);

    // The idle keep-alive connection is closed by the server.
    let mut rest = Vec::new();
    let read = tokio::time::timeout(WAIT, client.read_to_end(&mut rest)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
}

#[tokio::test]
async fn http_keep_alive_disabled_shuts_down_gracefully() {
    let server = Server::new();
    server.set_keep_alives_enabled(false);
    let (addr, mut rx) = start(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let response = roundtrip(&mut client, &get("/")).await;
    assert_eq!(response.body, "Success");
    assert_eq!(response.header("connection"), Some("close"));
    let mut rest = Vec::new();
    assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn https_keep_alive_enabled_shuts_down_gracefully() {
    let cert = test_cert();
    let server = Server::new();
    server
        .add_tls_certificate(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
        .unwrap();
    let (addr, mut rx) = start(&server).await;

    let mut client = tls_connect(&cert.client, addr).await;
    assert_eq!(client.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));
    let response = roundtrip(&mut client, &get("/")).await;
    assert_eq!(response.body, "Success");
    assert_eq!(response.header("connection"), Some("keep-alive"));

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn https_keep_alive_disabled_shuts_down_gracefully() {
    let cert = test_cert();
    let server = Server::new();
    server.set_keep_alives_enabled(false);
    server
        .add_tls_certificate(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
        .unwrap();
    let (addr, mut rx) = start(&server).await;

    let mut client = tls_connect(&cert.client, addr).await;
    let response = roundtrip(&mut client, &get("/")).await;
    assert_eq!(response.body, "Success");
    assert_eq!(response.header("connection"), Some("close"));

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn in_flight_request_delays_shutdown_and_closes_its_connection() {
    let (started_tx, mut started_rx) = mpsc::channel::<()>(1);
    let release = Arc::new(Notify::new());

    let server = Server::new();
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    let handler_release = Arc::clone(&release);
    server
        .serve(
            move |_req| {
                let started = started_tx.clone();
                let release = Arc::clone(&handler_release);
                async move {
                    let _ = started.send(()).await;
                    release.notified().await;
                    Response::new(StatusCode::Ok).body("slow")
                }
            },
            tx,
        )
        .await
        .unwrap();

    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut stream, &get("/slow")).await
    });

    started_rx.recv().await.unwrap();
    server.shutdown();
    assert_eq!(server.state(), Lifecycle::ShuttingDown);
    assert_no_outcome_yet(&mut rx).await;

    release.notify_one();
    let response = client.await.unwrap();
    assert_eq!(response.body, "slow");
    assert_eq!(response.header("connection"), Some("close"));
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn background_routine_delays_shutdown() {
    let release = Arc::new(Notify::new());

    let server = Server::new();
    let routines = server.routines();
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    let handler_release = Arc::clone(&release);
    server
        .serve(
            move |_req| {
                let guard = routines.guard();
                let release = Arc::clone(&handler_release);
                async move {
                    tokio::spawn(async move {
                        release.notified().await;
                        drop(guard);
                    });
                    Response::new(StatusCode::Accepted)
                }
            },
            tx,
        )
        .await
        .unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(roundtrip(&mut client, &get("/")).await.status(), 202);
    assert!(server.pending_work() >= 1);

    server.shutdown();
    assert_no_outcome_yet(&mut rx).await;

    release.notify_one();
    assert!(next_outcome(&mut rx).await.is_graceful());
    assert_eq!(server.pending_work(), 0);
}

#[tokio::test]
async fn connections_are_refused_after_shutdown() {
    let server = Server::new();
    let (addr, mut rx) = start(&server).await;

    server.shutdown();
    assert!(!server.listening());
    assert!(TcpStream::connect(addr).await.is_err());
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn silent_connection_does_not_block_shutdown() {
    let server = Server::new();
    let (addr, mut rx) = start(&server).await;

    let _silent = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn silent_https_connection_does_not_block_shutdown() {
    let cert = test_cert();
    let server = Server::new();
    server
        .add_tls_certificate(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
        .unwrap();
    let (addr, mut rx) = start(&server).await;

    // Connects but never starts the TLS handshake.
    let _silent = TcpStream::connect(addr).await.unwrap();
    for _ in 0..200 {
        if server.pending_work() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.pending_work(), 1);

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
    assert_eq!(server.pending_work(), 0);
}

#[tokio::test]
async fn panicking_handler_gets_500_and_shutdown_stays_graceful() {
    let server = Server::new();
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    server
        .serve(
            |req: Request| async move {
                if req.path() == "/panic" {
                    panic!("handler bug");
                }
                Response::new(StatusCode::Ok).body("Success")
            },
            tx,
        )
        .await
        .unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let response = roundtrip(&mut client, &get("/panic")).await;
    assert_eq!(response.status(), 500);
    assert_eq!(response.header("connection"), Some("close"));

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(roundtrip(&mut client, &get("/")).await.status(), 200);
    drop(client);

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
    assert_eq!(server.pending_work(), 0);
}

#[tokio::test]
async fn overflowing_content_length_gets_400() {
    let server = Server::new();
    let (addr, mut rx) = start(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let response = roundtrip(
        &mut client,
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 18446744073709551615\r\n\r\n",
    )
    .await;
    assert_eq!(response.status(), 400);
    assert_eq!(response.header("connection"), Some("close"));

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn oversized_request_gets_413() {
    let server = Server::new();
    server.set_max_request_size(64);
    let (addr, mut rx) = start(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: localhost\r\nX-Padding: {}\r\n\r\n",
        "a".repeat(256)
    );
    let response = roundtrip(&mut client, &request).await;
    assert_eq!(response.status(), 413);
    assert_eq!(response.header("connection"), Some("close"));

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let server = Server::new();
    let (addr, mut rx) = start(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let response = roundtrip(&mut client, "\x01 nonsense\r\n\r\n").await;
    assert_eq!(response.status(), 400);

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn observer_sees_every_transition_in_order() {
    let seen: Arc<Mutex<Vec<ConnState>>> = Arc::default();
    let server = Server::new();
    server.set_keep_alives_enabled(false);
    let recorder = Arc::clone(&seen);
    server.set_conn_state_observer(move |_conn: &ConnInfo, state: ConnState| {
        recorder.lock().unwrap().push(state);
    });
    let (addr, mut rx) = start(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    roundtrip(&mut client, &get("/")).await;

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());

    // The user observer is called after accounting, so give it a moment.
    tokio::time::timeout(WAIT, async {
        while seen.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![ConnState::New, ConnState::Active, ConnState::Closed]
    );
}

#[tokio::test]
async fn request_carries_peer_address() {
    let server = Server::new();
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    server
        .serve(
            |req: Request| async move {
                let peer = req.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                Response::new(StatusCode::Ok).body(peer)
            },
            tx,
        )
        .await
        .unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let local = client.local_addr().unwrap();
    let response = roundtrip(&mut client, &get("/")).await;
    assert_eq!(response.body, local.to_string());

    server.shutdown();
    assert!(next_outcome(&mut rx).await.is_graceful());
}

#[tokio::test]
async fn lifecycle_errors_are_reported() {
    let server = Server::new();
    let (tx, _rx) = mpsc::channel(1);
    assert!(matches!(
        server.serve(success, tx).await,
        Err(ServerError::NotListening)
    ));

    server.listen("127.0.0.1:0").await.unwrap();
    assert!(matches!(
        server.listen("127.0.0.1:0").await,
        Err(ServerError::AlreadyListening)
    ));
    server.shutdown();
}
