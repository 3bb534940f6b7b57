use std::io::{self, Read as _, Write as _};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd as _, RawFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// Polls a descriptor for readability, waiting up to `timeout`.
///
/// Returns `false` when the timeout elapses without the socket becoming
/// readable.
pub fn can_recv(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);

    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::READABLE)?;

    let result = poll.poll(&mut events, Some(timeout));
    let _ = poll.registry().deregister(&mut SourceFd(&fd));

    match result {
        Ok(()) => Ok(!events.is_empty()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
        Err(e) => Err(e),
    }
}

/// The cleartext endpoint.
///
/// Exists unconnected from construction; [`TcpEndpoint::connect`] or
/// [`TcpEndpoint::attach`] binds it to a live socket. During a TLS upgrade
/// the socket is transferred to the TLS endpoint and this one goes back to
/// the unconnected state.
#[derive(Debug, Default)]
pub struct TcpEndpoint {
    stream: Option<TcpStream>,
}

impl TcpEndpoint {
    pub fn new() -> Self {
        Self { stream: None }
    }

    pub fn connect(&mut self, hostname: &str, port: u16) -> io::Result<()> {
        let stream = TcpStream::connect((hostname, port))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        Ok(())
    }

    /// Adopts an already-connected socket (server-side use).
    pub fn attach(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
    }

    pub(crate) fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|stream| stream.as_raw_fd())
    }

    pub fn set_blocking_mode(&mut self, blocking: bool) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.set_nonblocking(!blocking),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket to configure")),
        }
    }

    pub fn disconnect(&mut self) -> io::Result<()> {
        if let Some(stream) = &self.stream {
            match stream.shutdown(Shutdown::Both) {
                // The peer may have torn the connection down already.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                other => other?,
            }
        }

        Ok(())
    }

    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Some(stream) => stream.read(dst),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket to read from")),
        }
    }

    pub fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match &mut self.stream {
            Some(stream) => stream.write(src),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket to write to")),
        }
    }
}
