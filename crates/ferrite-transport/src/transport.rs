use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use ferrite_pdu::{PduError, PduHint, NEGOTIATION_HINT};

use crate::error::{TransportError, TransportResult};
use crate::settings::Settings;
use crate::tcp::{can_recv, TcpEndpoint};
use crate::tls::{TlsEndpoint, TlsIdentity};

/// Initial size of the receive buffers.
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Headroom guaranteed in the receive buffer before each non-blocking read.
const READ_HEADROOM: usize = 32 * 1024;

/// How long a blocking read waits on socket readiness before retrying.
const READINESS_TIMEOUT: Duration = Duration::from_millis(100);

/// Idle back-off used when readiness polling is unavailable, and between
/// zero-byte writes.
pub const IDLE_INTERVAL: Duration = Duration::from_micros(100);

/// Every framing is recognizable from the first four bytes of a PDU.
const PDU_HEADER_PROBE: usize = 4;

/// The active byte-stream endpoint. Exactly one endpoint owns the socket at
/// any time; `Closed` is terminal and entered when a write fails.
enum Layer {
    Tcp(TcpEndpoint),
    Tls(TlsEndpoint),
    Closed,
}

/// Public tag identifying the active layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayerKind {
    Tcp,
    Tls,
    Closed,
}

impl Layer {
    fn kind(&self) -> LayerKind {
        match self {
            Layer::Tcp(_) => LayerKind::Tcp,
            Layer::Tls(_) => LayerKind::Tls,
            Layer::Closed => LayerKind::Closed,
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Layer::Tcp(tcp) => tcp.raw_fd(),
            Layer::Tls(tls) => Some(tls.raw_fd()),
            Layer::Closed => None,
        }
    }

    /// Reads into `dst`, reporting 0 when no data is available right now.
    fn read(&mut self, dst: &mut [u8]) -> TransportResult<usize> {
        let status = match self {
            Layer::Tcp(tcp) => tcp.read(dst),
            Layer::Tls(tls) => tls.read(dst),
            Layer::Closed => return Err(TransportError::NotConnected),
        };

        match status {
            Ok(0) if !dst.is_empty() => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed while reading",
            ))),
            Ok(read) => Ok(read),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Writes from `src`, reporting 0 when the socket cannot take data yet.
    fn write(&mut self, src: &[u8]) -> TransportResult<usize> {
        let status = match self {
            Layer::Tcp(tcp) => tcp.write(src),
            Layer::Tls(tls) => tls.write(src),
            Layer::Closed => return Err(TransportError::PeerClosed),
        };

        match status {
            Ok(written) => Ok(written),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn set_blocking_mode(&mut self, blocking: bool) -> TransportResult<()> {
        match self {
            Layer::Tcp(tcp) => tcp.set_blocking_mode(blocking)?,
            Layer::Tls(tls) => tls.set_blocking_mode(blocking)?,
            Layer::Closed => return Err(TransportError::NotConnected),
        }

        Ok(())
    }
}

/// Upper-layer PDU consumer driven by [`Transport::check_fds`].
pub trait PduHandler: Send {
    /// Receives exactly one complete PDU, positioned at offset 0.
    ///
    /// Returning `false` makes the dispatching `check_fds` call report
    /// failure to its caller. The handler must not re-enter `check_fds` on
    /// the same transport; such a call fails without advancing state.
    fn on_pdu(&mut self, transport: &mut Transport, pdu: &mut BytesMut) -> bool;
}

/// The NLA collaborator. It performs its own TSRequest exchange through the
/// transport's blocking path ([`Transport::recv_pdu_by_hint`] and
/// [`Transport::write`]).
pub trait CredsspAuthenticator {
    fn authenticate(&mut self, transport: &mut Transport) -> TransportResult<()>;
}

/// The transport: one connection, one active endpoint, one PDU at a time.
pub struct Transport {
    layer: Layer,
    settings: Arc<Settings>,
    server_name: Option<String>,
    blocking: bool,
    idle_interval: Duration,
    /// Accumulates partial frames between readiness events.
    recv_buffer: BytesMut,
    /// Scratch buffer for the blocking path.
    recv_stream: BytesMut,
    handler: Option<Box<dyn PduHandler>>,
    /// Dispatch depth; non-zero only while the handler runs.
    level: u32,
}

impl Transport {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            layer: Layer::Tcp(TcpEndpoint::new()),
            settings,
            server_name: None,
            blocking: true,
            idle_interval: IDLE_INTERVAL,
            recv_buffer: BytesMut::with_capacity(BUFFER_SIZE),
            recv_stream: BytesMut::with_capacity(BUFFER_SIZE),
            handler: None,
            level: 0,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn layer_kind(&self) -> LayerKind {
        self.layer.kind()
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Received-but-undispatched byte count.
    pub fn pending_bytes(&self) -> usize {
        self.recv_buffer.len()
    }

    /// Overrides the idle back-off used on fallback wait paths.
    pub fn set_idle_interval(&mut self, interval: Duration) {
        self.idle_interval = interval;
    }

    /// Registers the upper-layer handler invoked by [`Transport::check_fds`].
    pub fn set_pdu_handler(&mut self, handler: Box<dyn PduHandler>) {
        self.handler = Some(handler);
    }

    pub fn connect(&mut self, hostname: &str, port: u16) -> TransportResult<()> {
        match &mut self.layer {
            Layer::Tcp(tcp) => {
                tcp.connect(hostname, port)?;
                self.server_name = Some(hostname.to_owned());

                info!(hostname, port, "connected");

                Ok(())
            }
            _ => Err(TransportError::Config("connect requires the cleartext TCP layer")),
        }
    }

    /// Adopts an already-connected socket without connecting (server-side
    /// use).
    pub fn attach(&mut self, stream: TcpStream) -> TransportResult<()> {
        match &mut self.layer {
            Layer::Tcp(tcp) => {
                tcp.attach(stream);
                Ok(())
            }
            _ => Err(TransportError::Config("attach requires the cleartext TCP layer")),
        }
    }

    pub fn disconnect(&mut self) -> TransportResult<()> {
        match &mut self.layer {
            Layer::Tls(tls) => tls.disconnect()?,
            Layer::Tcp(tcp) => tcp.disconnect()?,
            Layer::Closed => {}
        }

        Ok(())
    }

    /// Standard RDP security: the legacy stream encryption it would set up is
    /// negotiated above the transport, so there is nothing to do here.
    pub fn connect_rdp(&mut self) -> TransportResult<()> {
        Ok(())
    }

    /// See [`Transport::connect_rdp`].
    pub fn accept_rdp(&mut self) -> TransportResult<()> {
        Ok(())
    }

    /// Upgrades the connection to TLS in place, on the same socket.
    ///
    /// On handshake failure the cleartext layer is left as it was.
    pub fn connect_tls(&mut self) -> TransportResult<()> {
        let socket = match &mut self.layer {
            Layer::Tls(_) => return Ok(()),
            Layer::Tcp(tcp) => tcp.take_stream().ok_or(TransportError::NotConnected)?,
            Layer::Closed => return Err(TransportError::NotConnected),
        };

        let server_name = match &self.server_name {
            Some(name) => name.clone(),
            None => match socket.peer_addr() {
                Ok(addr) => addr.ip().to_string(),
                Err(e) => {
                    self.restore_tcp(socket);
                    return Err(e.into());
                }
            },
        };

        debug!(server_name = %server_name, "TLS upgrade");

        match TlsEndpoint::connect(socket, &server_name) {
            Ok(tls) => {
                self.layer = Layer::Tls(tls);
                Ok(())
            }
            Err((socket, e)) => {
                self.restore_tcp(socket);
                Err(e)
            }
        }
    }

    /// Upgrades to TLS, then runs Network Level Authentication when the
    /// settings ask for it. Authentication failure is fatal to the
    /// connection.
    pub fn connect_nla(&mut self, credssp: &mut dyn CredsspAuthenticator) -> TransportResult<()> {
        self.connect_tls()?;

        // Network Level Authentication
        if !self.settings.authentication {
            return Ok(());
        }

        info!("performing network level authentication");

        if let Err(e) = credssp.authenticate(self) {
            error!(
                error = %e,
                "authentication failure, check credentials (if they are valid, the security provider may be at fault)"
            );

            return Err(TransportError::Authentication);
        }

        Ok(())
    }

    /// Server-side mirror of [`Transport::connect_tls`], presenting the
    /// identity named by the settings.
    pub fn accept_tls(&mut self) -> TransportResult<()> {
        if matches!(self.layer, Layer::Tls(_)) {
            return Ok(());
        }

        let (cert_file, key_file) = match (&self.settings.cert_file, &self.settings.privatekey_file) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => return Err(TransportError::Config("accept requires certificate and key paths")),
        };

        let identity = TlsIdentity::from_paths(&cert_file, &key_file)?;

        let socket = match &mut self.layer {
            Layer::Tcp(tcp) => tcp.take_stream().ok_or(TransportError::NotConnected)?,
            _ => return Err(TransportError::NotConnected),
        };

        match TlsEndpoint::accept(socket, identity) {
            Ok(tls) => {
                self.layer = Layer::Tls(tls);
                Ok(())
            }
            Err((socket, e)) => {
                self.restore_tcp(socket);
                Err(e)
            }
        }
    }

    /// Server-side mirror of [`Transport::connect_nla`].
    pub fn accept_nla(&mut self, credssp: &mut dyn CredsspAuthenticator) -> TransportResult<()> {
        self.accept_tls()?;

        if !self.settings.authentication {
            return Ok(());
        }

        info!("awaiting network level authentication");

        if let Err(e) = credssp.authenticate(self) {
            error!(error = %e, "client failed network level authentication");
            return Err(TransportError::Authentication);
        }

        Ok(())
    }

    /// DER SubjectPublicKey of the peer certificate, available after a
    /// client-side TLS upgrade. CredSSP binds its exchange to it.
    pub fn peer_public_key(&self) -> Option<&[u8]> {
        match &self.layer {
            Layer::Tls(tls) => tls.peer_public_key(),
            _ => None,
        }
    }

    /// Updates the transport's mode flag and propagates it to the socket.
    pub fn set_blocking_mode(&mut self, blocking: bool) -> TransportResult<()> {
        self.blocking = blocking;
        self.layer.set_blocking_mode(blocking)
    }

    /// Appends the active descriptor to a caller-provided list for use with a
    /// unified readiness poll.
    pub fn get_read_fds(&self, rfds: &mut Vec<RawFd>) {
        if let Some(fd) = self.layer.raw_fd() {
            rfds.push(fd);
        }
    }

    /// Reads exactly one framed PDU using the blocking path. Used during
    /// connection negotiation.
    pub fn recv_pdu(&mut self) -> TransportResult<BytesMut> {
        self.recv_pdu_by_hint(&NEGOTIATION_HINT)
    }

    /// Reads exactly one PDU matching `hint` using the blocking path.
    pub fn recv_pdu_by_hint(&mut self, hint: &dyn PduHint) -> TransportResult<BytesMut> {
        let mut buf = mem::take(&mut self.recv_stream);
        let result = self.recv_pdu_inner(&mut buf, hint);
        self.recv_stream = buf;

        result
    }

    fn recv_pdu_inner(&mut self, buf: &mut BytesMut, hint: &dyn PduHint) -> TransportResult<BytesMut> {
        loop {
            match hint.find_size(buf)? {
                Some(length) => {
                    while buf.len() < length {
                        let read = self.read_layer_into(buf, length - buf.len())?;

                        if read == 0 {
                            self.wait_for_data()?;
                        }
                    }

                    trace!(length, "PDU received");

                    return Ok(buf.split_to(length));
                }
                None => {
                    let missing = PDU_HEADER_PROBE.saturating_sub(buf.len()).max(1);
                    let read = self.read_layer_into(buf, missing)?;

                    if read == 0 {
                        self.wait_for_data()?;
                    }
                }
            }
        }
    }

    /// The steady-state operation: appends whatever the socket has, and
    /// dispatches at most one complete PDU to the registered handler.
    ///
    /// Returns `Ok(false)` when no complete PDU is buffered yet; additional
    /// bytes beyond one PDU stay buffered for the next call.
    pub fn check_fds(&mut self) -> TransportResult<bool> {
        if self.level != 0 {
            error!("check_fds invoked while a dispatch is in progress");
            return Err(TransportError::Reentrancy);
        }

        let mut buf = mem::take(&mut self.recv_buffer);
        buf.reserve(READ_HEADROOM);
        let status = self.read_pdu_step(&mut buf);
        self.recv_buffer = buf;
        status?;

        if self.recv_buffer.is_empty() {
            return Ok(false);
        }

        let info = match ferrite_pdu::find_size(&self.recv_buffer) {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(false),
            Err(e) => {
                error!(error = %e, "not a recognized TPKT or Fast-Path header");
                debug!("offending bytes\n{}", hexdump(&self.recv_buffer));
                return Err(e.into());
            }
        };

        if info.length == 0 {
            error!("recognized header declares a zero-length PDU");
            debug!("offending bytes\n{}", hexdump(&self.recv_buffer));

            return Err(TransportError::Pdu(PduError::InvalidMessage {
                field: "PDU length",
                reason: "zero-length PDU",
            }));
        }

        if self.recv_buffer.len() < info.length {
            // Packet is not yet completely received.
            return Ok(false);
        }

        let mut frame = self.recv_buffer.split_to(info.length);

        trace!(framing = ?info.framing, length = info.length, "dispatching PDU");

        let Some(mut handler) = self.handler.take() else {
            return Err(TransportError::Config("no PDU handler registered"));
        };

        self.level += 1;
        let accepted = handler.on_pdu(self, &mut frame);
        self.level -= 1;

        if self.handler.is_none() {
            self.handler = Some(handler);
        }

        if accepted {
            Ok(true)
        } else {
            Err(TransportError::Handler)
        }
    }

    /// Delivers the entirety of `data` to the peer.
    ///
    /// A write error is taken as evidence that the peer has dropped the
    /// connection: the layer becomes `Closed` and every further write fails
    /// fast without touching a socket.
    pub fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        if matches!(self.layer, Layer::Closed) {
            return Err(TransportError::PeerClosed);
        }

        if !data.is_empty() {
            trace!(length = data.len(), "sending");
        }

        let mut written = 0;

        while written < data.len() {
            let status = match self.layer.write(&data[written..]) {
                Ok(status) => status,
                Err(e) => {
                    self.layer = Layer::Closed;
                    return Err(e);
                }
            };

            if status == 0 {
                // Blocking while sending.
                thread::sleep(self.idle_interval);
            }

            written += status;
        }

        Ok(written)
    }

    /// Makes one unit of progress towards a complete PDU in `buf`: up to four
    /// header bytes first, then the body once the framing is recognized.
    ///
    /// Returns the number of bytes added during this call. In blocking mode
    /// that is a whole PDU; in non-blocking mode it may be any partial
    /// amount, and the caller retries on the next readiness event.
    fn read_pdu_step(&mut self, buf: &mut BytesMut) -> TransportResult<usize> {
        let mut progress = 0;

        if buf.len() < PDU_HEADER_PROBE {
            progress += self.read_layer_into(buf, PDU_HEADER_PROBE - buf.len())?;

            if buf.len() < PDU_HEADER_PROBE {
                return Ok(progress);
            }
        }

        let total = match ferrite_pdu::negotiation_find_size(buf) {
            Ok(Some(info)) => info.length,
            Ok(None) => return Ok(progress),
            // Leave the offending bytes in place; the dispatch loop surfaces
            // the failure with a dump.
            Err(_) => return Ok(progress),
        };

        if buf.len() < total {
            progress += self.read_layer_into(buf, total - buf.len())?;
        }

        Ok(progress)
    }

    /// Extends `buf` with up to `count` bytes read from the active layer.
    fn read_layer_into(&mut self, buf: &mut BytesMut, count: usize) -> TransportResult<usize> {
        if count == 0 {
            return Ok(0);
        }

        let start = buf.len();
        buf.resize(start + count, 0);

        let result = self.read_layer(&mut buf[start..]);

        let filled = match &result {
            Ok(read) => *read,
            Err(_) => 0,
        };
        buf.truncate(start + filled);

        result
    }

    /// Reads until `dst` is full, or returns early after the first endpoint
    /// status when the transport is non-blocking.
    ///
    /// Blocking here means that the caller cannot continue until the bytes
    /// arrive; it is independent of the socket's own blocking flag. On zero
    /// progress the wait is delegated to a readiness poll on the descriptor,
    /// or to the idle back-off when no descriptor is available.
    fn read_layer(&mut self, dst: &mut [u8]) -> TransportResult<usize> {
        let mut filled = 0;

        while filled < dst.len() {
            let status = self.layer.read(&mut dst[filled..])?;
            filled += status;

            if !self.blocking {
                break;
            }

            if status == 0 {
                self.wait_for_data()?;
            }
        }

        Ok(filled)
    }

    fn wait_for_data(&mut self) -> TransportResult<()> {
        match self.layer.raw_fd() {
            Some(fd) => {
                can_recv(fd, READINESS_TIMEOUT)?;
            }
            None => thread::sleep(self.idle_interval),
        }

        Ok(())
    }

    fn restore_tcp(&mut self, socket: TcpStream) {
        if let Layer::Tcp(tcp) = &mut self.layer {
            tcp.attach(socket);
        }
    }
}

fn hexdump(data: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();

    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04x} ", line * 16);

        for byte in chunk {
            let _ = write!(out, "{byte:02x} ");
        }

        let _ = writeln!(out);
    }

    out
}
