//! Syslog adapter (RFC 3164 framing).
//!
//! Every record becomes one line `<PRI>Mmm dd hh:mm:ss HOSTNAME
//! conntrail[PID]: <json>` rendered by [`Formatter3164`] with facility
//! `user`. OPEN records are logged at severity `info`, CLOSE at `notice`.
//! Over TCP each line is prefixed with its length (octet counting, RFC 6587).

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use conntrail_common::constants::APP_NAME;
use conntrail_common::record::EventRecord;
use conntrail_common::types::Phase;
use nix::errno::Errno;
use syslog::{Facility, Formatter3164, LogFormat, Severity};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, UnixDatagram};

use crate::error::{Result, SinkError};
use crate::sink::{DeliveryOutcome, Sink};

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Severity a record of the given phase is logged at.
pub const fn severity(phase: Phase) -> Severity {
    match phase {
        Phase::Open => Severity::LOG_INFO,
        Phase::Close => Severity::LOG_NOTICE,
    }
}

/// Header settings shared by every line of one sink.
pub fn formatter(hostname: String, pid: u32) -> Formatter3164 {
    Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: Some(hostname),
        process: APP_NAME.into(),
        pid,
    }
}

/// Renders `message` as one RFC 3164 line at the severity of `phase`.
///
/// # Errors
///
/// Returns the formatter's error if the line cannot be written.
pub fn render_line(formatter: &Formatter3164, phase: Phase, message: &str) -> syslog::Result<String> {
    let mut line = Vec::new();
    formatter.format(&mut line, severity(phase), message)?;
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Wraps a line in octet-counting framing.
pub fn octet_frame(line: &str) -> String {
    format!("{} {line}", line.len())
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

enum Transport {
    Local { path: PathBuf, socket: Option<UnixDatagram> },
    Tcp { address: SocketAddr, stream: Option<TcpStream> },
    Udp { socket: UdpSocket },
}

fn connect_local(path: &Path) -> io::Result<UnixDatagram> {
    let socket = UnixDatagram::unbound()?;
    socket.connect(path)?;
    Ok(socket)
}

fn is_oversized(error: &io::Error) -> bool {
    error.raw_os_error() == Some(Errno::EMSGSIZE as i32)
}

fn send_failed(sink: &str, error: &io::Error) -> DeliveryOutcome {
    if is_oversized(error) {
        tracing::debug!(sink, "event larger than the transport allows");
        DeliveryOutcome::DropPermanent
    } else {
        tracing::debug!(sink, error = %error, "syslog send failed");
        DeliveryOutcome::RetryLater
    }
}

/// Delivers records to a syslog daemon.
pub struct SyslogSink {
    name: String,
    formatter: Formatter3164,
    transport: Transport,
}

impl SyslogSink {
    fn with_transport(name: String, transport: Transport) -> Self {
        Self {
            name,
            formatter: formatter(local_hostname(), std::process::id()),
            transport,
        }
    }

    /// Connects to the local syslog socket.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::SyslogSocket`] if the socket is unreachable.
    pub fn local(name: String, path: &Path) -> Result<Self> {
        let socket = connect_local(path).map_err(|source| SinkError::SyslogSocket {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::with_transport(
            name,
            Transport::Local {
                path: path.to_path_buf(),
                socket: Some(socket),
            },
        ))
    }

    /// Prepares a TCP sink. The connection is opened lazily and re-opened
    /// after failures.
    pub fn tcp(name: String, address: SocketAddr) -> Self {
        Self::with_transport(name, Transport::Tcp { address, stream: None })
    }

    /// Prepares a UDP sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Socket`] if no local socket can be bound.
    pub async fn udp(name: String, address: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let prepare = async {
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(address).await?;
            Ok::<_, io::Error>(socket)
        };
        let socket = prepare.await.map_err(|source| SinkError::Socket {
            sink: name.clone(),
            source,
        })?;
        Ok(Self::with_transport(name, Transport::Udp { socket }))
    }

    fn render(&self, record: &EventRecord) -> std::result::Result<String, DeliveryOutcome> {
        let json = record.to_json().map_err(|e| {
            tracing::debug!(sink = %self.name, error = %e, "cannot encode event");
            DeliveryOutcome::DropPermanent
        })?;
        render_line(&self.formatter, record.phase, &json).map_err(|e| {
            tracing::debug!(sink = %self.name, error = %e, "cannot format syslog line");
            DeliveryOutcome::DropPermanent
        })
    }
}

#[async_trait]
impl Sink for SyslogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&mut self, record: &EventRecord) -> DeliveryOutcome {
        let line = match self.render(record) {
            Ok(line) => line,
            Err(outcome) => return outcome,
        };
        let name = self.name.as_str();
        let result = match &mut self.transport {
            Transport::Local { path, socket } => {
                if socket.is_none() {
                    *socket = connect_local(path).ok();
                }
                match socket {
                    Some(connected) => {
                        let sent = connected.send(line.as_bytes()).await.map(|_| ());
                        // The daemon may have restarted; reconnect next time.
                        if sent.as_ref().is_err_and(|e| !is_oversized(e)) {
                            *socket = None;
                        }
                        sent
                    }
                    None => Err(io::Error::from(io::ErrorKind::NotConnected)),
                }
            }
            Transport::Tcp { address, stream } => {
                if stream.is_none() {
                    match TcpStream::connect(*address).await {
                        Ok(connected) => *stream = Some(connected),
                        Err(e) => return send_failed(name, &e),
                    }
                }
                let frame = octet_frame(&line);
                match stream {
                    Some(connected) => {
                        let written = connected.write_all(frame.as_bytes()).await;
                        if written.is_err() {
                            *stream = None;
                        }
                        written
                    }
                    None => Err(io::Error::from(io::ErrorKind::NotConnected)),
                }
            }
            Transport::Udp { socket } => {
                if line.len() > MAX_DATAGRAM {
                    return DeliveryOutcome::DropPermanent;
                }
                socket.send(line.as_bytes()).await.map(|_| ())
            }
        };
        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => send_failed(name, &e),
        }
    }

    async fn close(&mut self) {
        if let Transport::Tcp { stream, .. } = &mut self.transport {
            if let Some(mut connected) = stream.take() {
                let _ = connected.shutdown().await;
            }
        }
    }
}
