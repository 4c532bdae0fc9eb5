//! Byte-duplex abstraction over the serial device.
//!
//! The scheduler owns exactly one [`Link`] and never blocks on it: reads
//! return `0` bytes when nothing is available rather than blocking, matching
//! spec.md §5's "link reads are non-blocking" requirement.

use std::collections::VecDeque;
use std::io;

/// Outcome of a non-blocking link read, matching Design Note's
/// replacement for sentinel-integer returns: `Pending` (no data yet),
/// `Ok` (bytes read), `Err` (non-recoverable).
#[derive(Debug)]
pub enum LinkStatus<T> {
    Pending,
    Ready(T),
    Err(io::Error),
}

/// A byte-duplex connection to the target, opened and owned exclusively by
/// the scheduler.
pub trait Link: Send {
    /// Reads as many bytes as are immediately available into `buf`,
    /// returning the count. Must not block; returns `Ok(0)` when nothing
    /// is available.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `buf` in full. May perform a blocking flush; this is
    /// acceptable because writes are short (single bytes or short command
    /// frames) and the scheduler has already decided to send.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Attempts to open a link to `device`, matching the `DevUartInit` state's
/// `Link::open` call in spec.md §4.4.
pub trait LinkOpen: Sized {
    fn open(device: &str) -> LinkStatus<Self>;
}

/// In-memory loopback link for tests: bytes written by one side become
/// readable from the other. Grounded on Design Note's "supply a loopback
/// implementation for tests" in place of the source's virtual-UART test
/// hooks.
#[derive(Debug, Default)]
pub struct LoopbackLink {
    /// Bytes queued for the scheduler to read (i.e. simulated target output).
    pub inbound: VecDeque<u8>,
    /// Bytes the scheduler has written (i.e. observed host output).
    pub outbound: Vec<u8>,
    fail_reads: bool,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes as if the target had sent them.
    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    /// Makes the next `read` call return an I/O error, simulating a dead
    /// link.
    pub fn fail_next_read(&mut self) {
        self.fail_reads = true;
    }
}

impl Link for LoopbackLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads {
            self.fail_reads = false;
            return Err(io::Error::new(io::ErrorKind::Other, "loopback link failure"));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.outbound.extend_from_slice(buf);
        Ok(())
    }
}

pub mod tcp {
    //! `TcpStream`-backed [`Link`], for bridging the single-wire protocol
    //! over a network-attached serial adapter rather than a local device
    //! node. Mirrors the teacher's `Network` transport variant.

    use super::{Link, LinkOpen, LinkStatus};
    use std::io::{self, ErrorKind};
    use std::net::TcpStream;
    use std::time::Duration;

    const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(5);

    /// A non-blocking TCP connection carrying the SWT byte stream.
    #[derive(Debug)]
    pub struct TcpLink {
        stream: TcpStream,
    }

    impl TcpLink {
        pub fn connect(addr: &str) -> LinkStatus<Self> {
            let socket_addr = match addr.parse() {
                Ok(a) => a,
                Err(e) => {
                    return LinkStatus::Err(io::Error::new(ErrorKind::InvalidInput, e));
                }
            };
            match TcpStream::connect_timeout(&socket_addr, DEFAULT_CONN_TIMEOUT) {
                Ok(stream) => match stream.set_nonblocking(true) {
                    Ok(()) => LinkStatus::Ready(Self { stream }),
                    Err(e) => LinkStatus::Err(e),
                },
                Err(e) => LinkStatus::Err(e),
            }
        }
    }

    impl LinkOpen for TcpLink {
        fn open(addr: &str) -> LinkStatus<Self> {
            Self::connect(addr)
        }
    }

    impl Link for TcpLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            use std::io::Read;
            match self.stream.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            use std::io::Write;
            self.stream.write_all(buf)
        }
    }
}

#[cfg(feature = "serial")]
pub mod serial {
    //! `serial2`-backed [`Link`] for talking to a real device.

    use super::{Link, LinkOpen, LinkStatus};
    use serial2::SerialPort;
    use std::io::{self, ErrorKind};

    pub(crate) const DEFAULT_BAUD: u32 = 115_200;

    /// A real serial port, opened non-blocking (zero read timeout so
    /// `read` returns promptly with whatever is available).
    #[derive(Debug)]
    pub struct SerialLink {
        port: SerialPort,
    }

    impl SerialLink {
        pub fn open_with_baud(device: &str, baud: u32) -> LinkStatus<Self> {
            match SerialPort::open(device, baud) {
                Ok(port) => {
                    if let Err(e) = port.set_read_timeout(std::time::Duration::from_millis(0)) {
                        return LinkStatus::Err(e);
                    }
                    LinkStatus::Ready(Self { port })
                }
                Err(e) => LinkStatus::Err(e),
            }
        }
    }

    impl LinkOpen for SerialLink {
        fn open(device: &str) -> LinkStatus<Self> {
            Self::open_with_baud(device, DEFAULT_BAUD)
        }
    }

    impl Link for SerialLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    Ok(0)
                }
                Err(e) => Err(e),
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            use std::io::Write;
            self.port.write_all(buf)?;
            self.port.flush()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_round_trips_bytes() {
        let mut link = LoopbackLink::new();
        link.push_inbound(&[1, 2, 3]);

        let mut buf = [0u8; 8];
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        // No more data: returns 0, not an error.
        let n = link.read(&mut buf).unwrap();
        assert_eq!(n, 0);

        link.write_all(&[9, 9]).unwrap();
        assert_eq!(link.outbound, vec![9, 9]);
    }

    #[test]
    fn loopback_can_simulate_failure() {
        let mut link = LoopbackLink::new();
        link.fail_next_read();
        let mut buf = [0u8; 4];
        assert!(link.read(&mut buf).is_err());
        // Only the next call fails.
        assert_eq!(link.read(&mut buf).unwrap(), 0);
    }
}
