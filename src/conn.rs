//! A single TCP connection to the cache daemon.

use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::LinkError;
use crate::points::Points;
use crate::protocol::{Codec, Request, read_frame, write_frame};

/// Default per-request read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns one socket to the daemon and speaks the framed protocol over it.
///
/// The socket is `None` whenever the last dial failed or the peer was found
/// closed. Every operation checks for that instead of assuming a live link.
pub struct WireConnection {
    addr: String,
    stream: Option<TcpStream>,
    timeout: Duration,
    connect_timeout: Duration,
    codec: Arc<dyn Codec>,
}

impl std::fmt::Debug for WireConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireConnection")
            .field("addr", &self.addr)
            .field("connected", &self.stream.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WireConnection {
    /// Create a connection without dialing.
    pub fn new(addr: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            codec,
        }
    }

    /// Create a connection and dial it once. A failed dial leaves the
    /// connection absent rather than failing construction.
    pub fn connect(addr: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        let mut conn = Self::new(addr, codec);
        if let Err(e) = conn.refresh() {
            debug!(error = %e, "Initial dial failed");
        }
        conn
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the read/write timeout for subsequent probes. Sockets reject a
    /// zero timeout, so zero is ignored.
    pub fn set_timeout(&mut self, timeout: Duration) {
        if timeout.is_zero() {
            warn!(addr = %self.addr, "Ignoring zero carbonlink timeout");
            return;
        }
        self.timeout = timeout;
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// Drop the current socket (if any) and dial a new one.
    pub fn refresh(&mut self) -> Result<(), LinkError> {
        self.close();

        let stream = self.dial().map_err(|source| LinkError::Dial {
            addr: self.addr.clone(),
            source,
        })?;
        // Requests are tiny; don't let Nagle hold them back.
        stream.set_nodelay(true)?;

        debug!(addr = %self.addr, "Dialed carbonlink");
        self.stream = Some(stream);
        Ok(())
    }

    fn dial(&self) -> std::io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::AddrNotAvailable, "address resolved to nothing")
        }))
    }

    /// Cheap liveness check that never consumes payload bytes.
    ///
    /// Peeks one byte without blocking: end-of-stream or a hard error means
    /// the peer is gone, and the socket is closed. A healthy idle socket
    /// reports `WouldBlock`.
    pub fn is_valid(&mut self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };

        if peer_closed(stream) {
            trace!(addr = %self.addr, "Peer closed connection");
            self.close();
            return false;
        }
        true
    }

    /// One request/reply round trip for `metric`, bucketed by `step`.
    ///
    /// Any error leaves the stream in an unknown position; the caller must
    /// revalidate or refresh before using this connection again.
    pub fn probe(&mut self, metric: &str, step: i64) -> Result<Points, LinkError> {
        let timeout = self.timeout;
        let payload = self.codec.encode(&Request::cache_query(metric))?;

        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        write_frame(stream, &payload).map_err(|e| timed_out(e, timeout))?;
        let reply_bytes = read_frame(stream).map_err(|e| timed_out(e, timeout))?;
        let reply = self.codec.decode(&reply_bytes)?;

        trace!(
            metric = metric,
            samples = reply.datapoints.len(),
            "Carbonlink reply"
        );
        Ok(Points::convert_from(&reply, step))
    }

    /// Shut down and drop the socket. Errors are ignored.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for WireConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn peer_closed(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }

    let mut buf = [0u8; 1];
    let closed = match stream.peek(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
    };

    stream.set_nonblocking(false).is_err() || closed
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
fn timed_out(err: LinkError, timeout: Duration) -> LinkError {
    match err {
        LinkError::Io(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            LinkError::Timeout(timeout)
        }
        other => other,
    }
}
