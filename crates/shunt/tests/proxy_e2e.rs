//! End-to-end tests over loopback sockets: a real upstream thread, the
//! proxy event loop on its own thread, and plain blocking clients.

use std::{
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream},
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use shunt::{Mode, Proxy, ProxyConfig, Stats};

const TIMEOUT: Duration = Duration::from_secs(5);

struct ProxyHarness {
    addr: SocketAddr,
    flag: Arc<AtomicBool>,
    handle: thread::JoinHandle<Stats>,
}

impl ProxyHarness {
    fn start(mode: Mode, backend: SocketAddrV4) -> Self {
        Self::start_with(mode, backend, |cfg| cfg)
    }

    fn start_with(
        mode: Mode,
        backend: SocketAddrV4,
        tweak: impl FnOnce(ProxyConfig) -> ProxyConfig,
    ) -> Self {
        let cfg =
            tweak(ProxyConfig::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), backend, mode));
        let mut proxy = Proxy::new(cfg).unwrap();
        let addr = proxy.local_addr().unwrap();
        let flag = proxy.shutdown_handle();
        let handle = thread::spawn(move || {
            proxy.run().unwrap();
            proxy.stats()
        });
        Self { addr, flag, handle }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    fn stop(self) -> Stats {
        self.flag.store(true, Ordering::Relaxed);
        self.handle.join().unwrap()
    }
}

fn local_v4(listener: &TcpListener) -> SocketAddrV4 {
    match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    }
}

/// Upstream that echoes every byte back on each accepted connection.
fn spawn_echo_upstream() -> SocketAddrV4 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = local_v4(&listener);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Minimal HTTP/1.1 upstream: one request per connection, counts accepts,
/// reports each received body, answers 200 and closes.
fn spawn_http_upstream(hits: Arc<AtomicUsize>, bodies: mpsc::Sender<Vec<u8>>) -> SocketAddrV4 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = local_v4(&listener);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            hits.fetch_add(1, Ordering::SeqCst);
            stream.set_read_timeout(Some(TIMEOUT)).unwrap();
            let (head, mut body) = read_head(&mut stream);
            let want = content_length(&head);
            let mut buf = [0u8; 4096];
            while body.len() < want {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0, "upstream hit eof inside request body");
                body.extend_from_slice(&buf[..n]);
            }
            let _ = bodies.send(body);
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").unwrap();
        }
    });
    addr
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn read_head(stream: &mut TcpStream) -> (Vec<u8>, Vec<u8>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            let body = data.split_off(pos + 4);
            return (data, body);
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before head completed");
        data.extend_from_slice(&buf[..n]);
    }
}

fn content_length(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") { value.trim().parse().ok() } else { None }
        })
        .unwrap_or(0)
}

/// Reads a full response: head through CRLFCRLF plus Content-Length body.
fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            let want = pos + 4 + content_length(&data[..pos]);
            while data.len() < want {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0, "connection closed inside response body");
                data.extend_from_slice(&buf[..n]);
            }
            return data;
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before response head");
        data.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn tcp_echo_through() {
    let upstream = spawn_echo_upstream();
    let proxy = ProxyHarness::start(Mode::Tcp, upstream);

    let mut client = proxy.connect();
    client.write_all(b"hello\n").unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello\n");

    let stats = proxy.stop();
    assert_eq!(stats.total_connections, 2);
    assert!(stats.bytes_forwarded >= 12);
}

#[test]
fn tcp_round_trip_larger_than_buffers() {
    let upstream = spawn_echo_upstream();
    let proxy = ProxyHarness::start(Mode::Tcp, upstream);

    let payload: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
    let mut client = proxy.connect();
    let mut writer = client.try_clone().unwrap();
    let expected = payload.clone();
    let writer_handle = thread::spawn(move || {
        writer.write_all(&payload).unwrap();
    });

    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).unwrap();
    writer_handle.join().unwrap();
    assert_eq!(received, expected);

    proxy.stop();
}

#[test]
fn http_get_keep_alive_two_requests() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, _rx) = mpsc::channel();
    let upstream = spawn_http_upstream(hits.clone(), tx);
    let proxy = ProxyHarness::start(Mode::Http, upstream);

    let mut client = proxy.connect();
    client.write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let first = read_response(&mut client);
    assert!(first.starts_with(b"HTTP/1.1 200"), "got: {}", String::from_utf8_lossy(&first));

    client.write_all(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let second = read_response(&mut client);
    assert!(second.starts_with(b"HTTP/1.1 200"));

    // One upstream dial per request.
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let stats = proxy.stop();
    assert_eq!(stats.requests_handled, 2);
    assert_eq!(stats.keep_alive_reused, 1);
    // One client connection plus two backend connections.
    assert_eq!(stats.total_connections, 3);
}

#[test]
fn http_post_forwards_exact_body() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let upstream = spawn_http_upstream(hits, tx);
    let proxy = ProxyHarness::start(Mode::Http, upstream);

    let mut client = proxy.connect();
    client
        .write_all(b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with(b"HTTP/1.1 200"));

    let body = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(body, b"hello");

    proxy.stop();
}

#[test]
fn malformed_request_gets_400_and_close() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, _rx) = mpsc::channel();
    let upstream = spawn_http_upstream(hits.clone(), tx);
    let proxy = ProxyHarness::start(Mode::Http, upstream);

    let mut client = proxy.connect();
    client.write_all(b"GET\r\n\r\n").unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert!(
        response.starts_with(b"HTTP/1.1 400 Bad Request"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );

    // No backend was ever dialed.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let stats = proxy.stop();
    assert_eq!(stats.requests_error, 1);
}

#[test]
fn upstream_unavailable_gets_502() {
    // Grab a port, then close it again.
    let dead = local_v4(&TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap());
    let proxy = ProxyHarness::start(Mode::Http, dead);

    let mut client = proxy.connect();
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert!(
        response.starts_with(b"HTTP/1.1 502 Bad Gateway"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );

    let stats = proxy.stop();
    assert!(stats.dial_failures >= 1);
}

#[test]
fn tcp_mode_never_parses_http() {
    let upstream = spawn_echo_upstream();
    let proxy = ProxyHarness::start(Mode::Tcp, upstream);

    // In HTTP mode this exact payload draws a 400; in TCP mode it must
    // pass through byte-transparently.
    let mut client = proxy.connect();
    client.write_all(b"GET\r\n\r\n").unwrap();
    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"GET\r\n\r\n");

    proxy.stop();
}

#[test]
fn pool_exhaustion_yields_503() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, _rx) = mpsc::channel();
    let upstream = spawn_http_upstream(hits.clone(), tx);
    // A single slot: the client takes it, the backend dial cannot.
    let proxy = ProxyHarness::start_with(Mode::Http, upstream, |mut cfg| {
        cfg.max_connections = 1;
        cfg
    });

    let mut client = proxy.connect();
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert!(
        response.starts_with(b"HTTP/1.1 503 Service Unavailable"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    proxy.stop();
}

#[test]
fn shutdown_closes_live_connections() {
    let upstream = spawn_echo_upstream();
    let proxy = ProxyHarness::start(Mode::Tcp, upstream);

    let mut client = proxy.connect();
    client.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();

    let stats = proxy.stop();
    assert_eq!(stats.active_connections, 0);

    // The proxy tore the pair down on exit; the client sees EOF.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}
