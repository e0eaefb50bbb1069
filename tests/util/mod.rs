//! Shared helpers for integration tests: a scriptable carbonlink daemon and
//! a tracing capture.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use carbonlink_pool::protocol::{frame, read_frame};
use carbonlink_pool::{CodecKind, Reply, Request};
use tracing_subscriber::fmt::MakeWriter;

/// How the mock daemon answers one request.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Answer {
    Reply(Reply),
    /// A well-framed payload neither codec can parse.
    Garbage,
    /// Close the connection without answering.
    Hangup,
}

type Handler = dyn Fn(&Request) -> Answer + Send + Sync;

/// Loopback daemon speaking the framed protocol in either codec.
pub struct MockDaemon {
    addr: SocketAddr,
    wire: CodecKind,
    handler: Arc<Mutex<Arc<Handler>>>,
    requests: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    peers: Arc<Mutex<Vec<TcpStream>>>,
    stop: Arc<AtomicBool>,
    acceptor: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl MockDaemon {
    /// Daemon that answers every query with `pairs`.
    pub fn with_points(pairs: Vec<(i64, f64)>) -> Self {
        Self::start(move |_| {
            Answer::Reply(Reply {
                datapoints: pairs.clone(),
            })
        })
    }

    /// Pickle-speaking daemon, like carbon-cache.
    pub fn start(handler: impl Fn(&Request) -> Answer + Send + Sync + 'static) -> Self {
        Self::bind("127.0.0.1:0", CodecKind::Pickle, handler)
    }

    pub fn bind(
        addr: &str,
        wire: CodecKind,
        handler: impl Fn(&Request) -> Answer + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind(addr).expect("bind mock daemon");
        let addr = listener.local_addr().expect("local addr");
        let handler: Arc<Mutex<Arc<Handler>>> = Arc::new(Mutex::new(Arc::new(handler)));
        let requests = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let peers = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let handler = Arc::clone(&handler);
            let requests = Arc::clone(&requests);
            let accepted = Arc::clone(&accepted);
            let peers = Arc::clone(&peers);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    if let Ok(clone) = stream.try_clone() {
                        peers.lock().unwrap().push(clone);
                    }
                    let handler = Arc::clone(&handler);
                    let requests = Arc::clone(&requests);
                    thread::spawn(move || serve(stream, wire, handler, requests));
                }
            })
        };

        Self {
            addr,
            wire,
            handler,
            requests,
            accepted,
            peers,
            stop,
            acceptor: Some(acceptor),
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn wire(&self) -> CodecKind {
        self.wire
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Swap how subsequent requests are answered.
    pub fn set_handler(&self, handler: impl Fn(&Request) -> Answer + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    /// Shut down every accepted connection, as if the daemon restarted.
    pub fn disconnect_all(&self) {
        for peer in self.peers.lock().unwrap().drain(..) {
            let _ = peer.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the acceptor so it notices the stop flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        self.disconnect_all();
    }
}

fn decode_request(wire: CodecKind, payload: &[u8]) -> Option<Request> {
    match wire {
        CodecKind::Pickle => serde_pickle::from_slice(payload, serde_pickle::DeOptions::new()).ok(),
        CodecKind::Msgpack => rmp_serde::from_slice(payload).ok(),
    }
}

fn encode_reply(wire: CodecKind, reply: &Reply) -> Vec<u8> {
    match wire {
        CodecKind::Pickle => {
            serde_pickle::to_vec(reply, serde_pickle::SerOptions::new()).expect("pickle reply")
        }
        CodecKind::Msgpack => rmp_serde::to_vec_named(reply).expect("msgpack reply"),
    }
}

fn serve(
    mut stream: TcpStream,
    wire: CodecKind,
    handler: Arc<Mutex<Arc<Handler>>>,
    requests: Arc<AtomicUsize>,
) {
    while let Ok(payload) = read_frame(&mut stream) {
        let Some(request) = decode_request(wire, &payload) else {
            return;
        };
        requests.fetch_add(1, Ordering::SeqCst);

        let handler = Arc::clone(&handler.lock().unwrap());
        let body = match (*handler)(&request) {
            Answer::Reply(reply) => encode_reply(wire, &reply),
            Answer::Garbage => vec![0xC1, 0xC1, 0xC1],
            Answer::Hangup => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        };
        let Ok(framed) = frame(&body) else { return };
        if stream.write_all(&framed).is_err() {
            return;
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Collects formatted log lines from the current thread's subscriber.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

#[allow(dead_code)]
impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(self.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Assert that one captured line contains every needle.
    pub fn assert_line_with(&self, needles: &[&str]) {
        let lines = self.lines();
        assert!(
            lines
                .iter()
                .any(|line| needles.iter().all(|n| line.contains(n))),
            "no log line contains all of {needles:?}:\n{}",
            lines.join("\n")
        );
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
