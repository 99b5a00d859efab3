//! APRS-IS connection: login, filtered line feed, and frame transmission.
//!
//! The read half runs on its own OS thread ([`FeedReader::consume`]) and pushes
//! frames onto the bridge queue; the write half is the engine's [`FrameSink`].

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::thread;

use aprsbot_core::wire::{is_server_comment, parse_frame};
use aprsbot_core::{Callsign, Frame, FrameSink, QueueProducer, TransportError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Credentials and filter for the APRS-IS login line.
#[derive(Debug, Clone)]
pub struct Login {
    /// Licensed station logging in.
    pub call: Callsign,
    pub passcode: String,
    /// Station whose traffic the server should pass to us.
    pub bot_call: Callsign,
}

impl Login {
    fn line(&self) -> String {
        format!(
            "user {} pass {} vers aprsbot {} filter g/{}",
            self.call, self.passcode, VERSION, self.bot_call
        )
    }
}

/// Write half of an APRS-IS session.
pub struct AprsIs {
    stream: Mutex<TcpStream>,
    dry_run: bool,
}

impl AprsIs {
    /// Connect and log in. Returns the writer and the reader for the worker thread.
    pub fn connect(
        login: &Login,
        host: &str,
        port: u16,
        dry_run: bool,
    ) -> Result<(AprsIs, FeedReader<BufReader<TcpStream>>), TransportError> {
        let stream = TcpStream::connect((host, port))?;
        tracing::info!(host, port, "connected to APRS-IS");
        let mut reader = BufReader::new(stream.try_clone()?);
        let aprs = AprsIs {
            stream: Mutex::new(stream),
            dry_run,
        };
        aprs.send_line(&login.line())?;
        await_logresp(&mut reader)?;
        Ok((aprs, FeedReader::new(reader)))
    }

    /// Replace the server-side filter (`#filter` command).
    pub fn set_filter(&self, pattern: &str) -> Result<(), TransportError> {
        self.send_line(&format!("#filter {pattern}"))?;
        tracing::info!(pattern, "filter set");
        Ok(())
    }

    /// Shut the socket down both ways; the reader thread sees EOF.
    pub fn close(&self) {
        let Ok(stream) = self.stream.lock() else {
            return;
        };
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => tracing::info!("APRS-IS connection closed"),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => tracing::warn!(error = %e, "closing APRS-IS connection"),
        }
    }

    fn send_line(&self, line: &str) -> Result<(), TransportError> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| TransportError::NotConnected)?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        Ok(())
    }
}

impl FrameSink for AprsIs {
    fn send_all(&self, frame: &str) -> Result<(), TransportError> {
        if self.dry_run {
            tracing::info!(frame, "simulated send");
            return Ok(());
        }
        self.send_line(frame)
    }
}

/// Read server lines until the login response. An unverified login can receive
/// but will not be allowed to transmit.
fn await_logresp(reader: &mut impl BufRead) -> Result<(), TransportError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(TransportError::Login(
                "connection closed before login response".into(),
            ));
        }
        let line = line.trim_end();
        if let Some(resp) = line.strip_prefix("# logresp") {
            if resp.contains("unverified") {
                tracing::warn!(response = line, "APRS-IS login unverified; transmissions will be dropped");
            } else {
                tracing::info!(response = line, "APRS-IS login accepted");
            }
            return Ok(());
        }
        tracing::debug!(line, "server banner");
    }
}

/// Read half of an APRS-IS session.
pub struct FeedReader<R> {
    lines: R,
}

impl<R: BufRead> FeedReader<R> {
    pub fn new(lines: R) -> Self {
        Self { lines }
    }

    /// Push every received frame onto the queue until EOF, a read error, or the
    /// queue closes. Blocking; run it on its own thread.
    pub fn consume(mut self, queue: QueueProducer<Frame>) {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.lines.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    tracing::info!("APRS-IS feed ended");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "APRS-IS read failed");
                    return;
                }
            }
            if is_server_comment(&buf) {
                tracing::trace!(line = %String::from_utf8_lossy(&buf).trim_end(), "server comment");
                continue;
            }
            if queue.push(parse_frame(&buf)).is_err() {
                tracing::debug!("bridge queue closed, feed reader exiting");
                return;
            }
        }
    }
}

impl<R: BufRead + Send + 'static> FeedReader<R> {
    /// Run [`FeedReader::consume`] on a named OS thread.
    pub fn spawn(self, queue: QueueProducer<Frame>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("aprs-is-reader".into())
            .spawn(move || self.consume(queue))
    }
}

/// APRS-IS passcode for `call` (SSID ignored).
pub fn passcode(call: &Callsign) -> u16 {
    let mut hash: u16 = 0x73e2;
    for pair in call.base().as_bytes().chunks(2) {
        hash ^= u16::from(pair[0]) << 8;
        if let Some(&low) = pair.get(1) {
            hash ^= u16::from(low);
        }
    }
    hash & 0x7fff
}
