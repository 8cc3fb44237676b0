//! Bidirectional byte channels between supervisor and worker.
//!
//! Two variants behind one trait: a loopback TCP socket (cross-platform,
//! the default) and a POSIX named pipe. The supervisor side uses the
//! socket in server mode: bind an ephemeral port, hand the port to the
//! worker on its command line, accept exactly one connection.
//!
//! `close` is idempotent and safe to call while a read or write is in
//! flight; the blocked operation fails with a terminal error.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use outrider_protocol::{framing, ProtocolError};
use tracing::debug;

use crate::error::CommunicationError;

/// Poll interval for the accept loop and non-blocking pipe reads.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A reliable bidirectional byte stream carrying framed messages.
///
/// `send_bytes`/`receive_bytes` move raw bytes; the framed message
/// operations are layered on top of them and shared by all variants.
pub trait ByteChannel: Send + Sync {
    fn send_bytes(&self, data: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes, returning how many were read.
    /// A return of 0 means end-of-stream.
    fn receive_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&self);

    fn is_open(&self) -> bool;

    /// Read exactly `buf.len()` bytes. End-of-stream short of that is an
    /// `UnexpectedEof` error.
    fn receive_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.receive_bytes(&mut buf[filled..])? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "end of stream mid-frame",
                    ))
                }
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Frame a UTF-8 message and send it.
    fn send_message(&self, text: &str) -> Result<(), CommunicationError> {
        if !self.is_open() {
            return Err(CommunicationError::ChannelNotOpen);
        }
        let framed = framing::frame(text.as_bytes())?;
        self.send_bytes(&framed)?;
        Ok(())
    }

    /// Read one framed UTF-8 message: length prefix, then exactly that
    /// many payload bytes. A length above the frame cap is a protocol
    /// violation and the caller must close the channel.
    fn receive_message(&self) -> Result<String, CommunicationError> {
        let mut prefix = [0u8; framing::LENGTH_PREFIX_SIZE];
        self.receive_exact(&mut prefix)?;

        let len = framing::parse_length(&prefix)?;
        if len > framing::MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: framing::MAX_FRAME_LEN,
            }
            .into());
        }

        let mut payload = vec![0u8; len];
        self.receive_exact(&mut payload)?;

        let text = std::str::from_utf8(&payload).map_err(ProtocolError::from)?;
        Ok(text.to_string())
    }
}

// ----------------------------------------------------------------------------
// Loopback TCP
// ----------------------------------------------------------------------------

/// Server side of a loopback channel: bound but not yet connected.
pub struct ChannelListener {
    listener: TcpListener,
    port: u16,
}

impl ChannelListener {
    /// Bind an ephemeral port on 127.0.0.1.
    pub fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        debug!("side-band listener bound to 127.0.0.1:{}", port);
        Ok(Self { listener, port })
    }

    /// Port to hand to the worker on its command line.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept exactly one connection, polling so the wait can be abandoned
    /// via `cancelled` or the timeout.
    pub fn accept(
        &self,
        timeout: Duration,
        cancelled: &AtomicBool,
    ) -> io::Result<LoopbackChannel> {
        self.listener.set_nonblocking(true)?;
        let start = Instant::now();

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "accept abandoned",
                ));
            }
            if start.elapsed() >= timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "worker did not connect to port {} within {:.1}s",
                        self.port,
                        timeout.as_secs_f64()
                    ),
                ));
            }

            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    debug!(
                        "worker connected to port {} after {:.2}s",
                        self.port,
                        start.elapsed().as_secs_f64()
                    );
                    return LoopbackChannel::from_stream(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Loopback TCP channel, either side of the connection.
///
/// Reads and writes go through independently locked clones of the stream
/// so the reader and writer tasks never contend; `close` shuts the
/// underlying socket down, which unblocks both.
#[derive(Debug)]
pub struct LoopbackChannel {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    shutdown_handle: TcpStream,
    open: AtomicBool,
}

impl LoopbackChannel {
    fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            shutdown_handle: stream,
            open: AtomicBool::new(true),
        })
    }

    /// Client mode: connect to a listening peer.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        Self::from_stream(stream)
    }
}

impl ByteChannel for LoopbackChannel {
    fn send_bytes(&self, data: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(data)?;
        writer.flush()
    }

    fn receive_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        self.reader.lock().unwrap().read(buf)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_handle.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// POSIX named pipe
// ----------------------------------------------------------------------------

/// Named pipe channel over a filesystem FIFO (POSIX only).
///
/// The FIFO is created if absent, opened for both read and write so that
/// opening never blocks on a missing peer, and deleted on close. Reads
/// are non-blocking under the hood and polled, so a concurrent `close`
/// terminates an in-flight read within one poll interval.
#[cfg(unix)]
pub struct NamedPipeChannel {
    path: std::path::PathBuf,
    reader: Mutex<std::fs::File>,
    writer: Mutex<std::fs::File>,
    open: AtomicBool,
}

#[cfg(unix)]
impl NamedPipeChannel {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        use nix::sys::stat::Mode;
        use std::os::unix::fs::OpenOptionsExt;

        if !path.exists() {
            nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }

        // O_RDWR on a FIFO never blocks waiting for the peer; the
        // non-blocking read handle keeps close() able to interrupt reads.
        let reader = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(path)?;
        let writer = std::fs::OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(unix)]
impl ByteChannel for NamedPipeChannel {
    fn send_bytes(&self, data: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        }
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(data)?;
        writer.flush()
    }

    fn receive_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.is_open() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
            }
            match self.reader.lock().unwrap().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
impl Drop for NamedPipeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_loopback_message_roundtrip() {
        let listener = ChannelListener::bind().unwrap();
        let port = listener.port();

        let client = std::thread::spawn(move || {
            let channel = LoopbackChannel::connect("127.0.0.1", port).unwrap();
            channel.send_message("from client").unwrap();
            let reply = channel.receive_message().unwrap();
            channel.close();
            reply
        });

        let cancelled = AtomicBool::new(false);
        let server = listener.accept(Duration::from_secs(5), &cancelled).unwrap();
        assert!(server.is_open());

        assert_eq!(server.receive_message().unwrap(), "from client");
        server.send_message("from server").unwrap();

        assert_eq!(client.join().unwrap(), "from server");
        server.close();
        assert!(!server.is_open());
    }

    #[test]
    fn test_accept_timeout() {
        let listener = ChannelListener::bind().unwrap();
        let cancelled = AtomicBool::new(false);
        let err = listener
            .accept(Duration::from_millis(150), &cancelled)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_accept_cancellation() {
        let listener = ChannelListener::bind().unwrap();
        let cancelled = AtomicBool::new(true);
        let err = listener
            .accept(Duration::from_secs(10), &cancelled)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_close_unblocks_pending_read() {
        let listener = ChannelListener::bind().unwrap();
        let port = listener.port();

        let client = std::thread::spawn(move || {
            let channel = LoopbackChannel::connect("127.0.0.1", port).unwrap();
            // Block in a read with no data coming, until closed from
            // another thread.
            let channel = Arc::new(channel);
            let reader = {
                let channel = Arc::clone(&channel);
                std::thread::spawn(move || channel.receive_message())
            };
            std::thread::sleep(Duration::from_millis(100));
            channel.close();
            reader.join().unwrap()
        });

        let cancelled = AtomicBool::new(false);
        let _server = listener.accept(Duration::from_secs(5), &cancelled).unwrap();

        let result = client.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let listener = ChannelListener::bind().unwrap();
        let port = listener.port();
        let client =
            std::thread::spawn(move || LoopbackChannel::connect("127.0.0.1", port).unwrap());
        let cancelled = AtomicBool::new(false);
        let server = listener.accept(Duration::from_secs(5), &cancelled).unwrap();
        client.join().unwrap();

        server.close();
        server.close();
        assert!(!server.is_open());
    }

    #[test]
    fn test_eof_mid_frame_is_an_error() {
        let listener = ChannelListener::bind().unwrap();
        let port = listener.port();

        let client = std::thread::spawn(move || {
            let channel = LoopbackChannel::connect("127.0.0.1", port).unwrap();
            // Declare 100 payload bytes but send only 3, then disconnect.
            channel.send_bytes(&[0, 0, 0, 100, b'a', b'b', b'c']).unwrap();
            channel.close();
        });

        let cancelled = AtomicBool::new(false);
        let server = listener.accept(Duration::from_secs(5), &cancelled).unwrap();
        client.join().unwrap();

        let err = server.receive_message().unwrap_err();
        assert!(matches!(err, CommunicationError::Io(_)));
    }

    #[test]
    fn test_oversize_length_is_a_protocol_error() {
        let listener = ChannelListener::bind().unwrap();
        let port = listener.port();

        let client = std::thread::spawn(move || {
            let channel = LoopbackChannel::connect("127.0.0.1", port).unwrap();
            channel.send_bytes(&[0x7F, 0xFF, 0xFF, 0xFF]).unwrap();
            // Keep the socket open so the server fails on the length, not EOF.
            std::thread::sleep(Duration::from_millis(200));
            channel.close();
        });

        let cancelled = AtomicBool::new(false);
        let server = listener.accept(Duration::from_secs(5), &cancelled).unwrap();

        let err = server.receive_message().unwrap_err();
        assert!(matches!(
            err,
            CommunicationError::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
        client.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_named_pipe_roundtrip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.fifo");

        let channel = NamedPipeChannel::open(&path).unwrap();
        assert!(path.exists());
        assert!(channel.is_open());

        // Opened read+write by the same process: what we send, we can read.
        channel.send_message("through the pipe").unwrap();
        assert_eq!(channel.receive_message().unwrap(), "through the pipe");

        channel.close();
        assert!(!channel.is_open());
        assert!(!path.exists());

        // Idempotent.
        channel.close();
    }

    #[cfg(unix)]
    #[test]
    fn test_named_pipe_close_unblocks_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.fifo");
        let channel = Arc::new(NamedPipeChannel::open(&path).unwrap());

        let reader = {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || channel.receive_message())
        };

        std::thread::sleep(Duration::from_millis(100));
        channel.close();

        assert!(reader.join().unwrap().is_err());
    }
}
