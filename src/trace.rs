//! Fans trace bytes received from the target out to every connected client.
//!
//! Each connection carries one sticky error flag.  Once a write to a connection comes up short
//! the connection is rejected on every later write until it is removed.  A broken connection
//! never stops delivery to the others.
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TraceError};

pub const DEFAULT_TRACE_PORT: u16 = 7777;

/// Size of one read from a client.  Client input is discarded.
const INPUT_CHUNK: usize = 256;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Clients served at once.  Further clients are accepted and closed straight away.
pub const MAX_CONNECTIONS: usize = 4;

/// Where the trace server listens: a TCP port, or nowhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortRepr", into = "String")]
pub enum TracePort {
    Disabled,
    Port(u16),
}

impl Default for TracePort {
    fn default() -> Self {
        TracePort::Port(DEFAULT_TRACE_PORT)
    }
}

impl FromStr for TracePort {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "disabled" {
            return Ok(TracePort::Disabled);
        }
        s.parse()
            .map(TracePort::Port)
            .map_err(|_| ConfigError::InvalidTracePort(s.to_string()))
    }
}

impl fmt::Display for TracePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracePort::Disabled => f.write_str("disabled"),
            TracePort::Port(port) => write!(f, "{port}"),
        }
    }
}

impl From<TracePort> for String {
    fn from(port: TracePort) -> Self {
        port.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Number(u16),
    Text(String),
}

impl TryFrom<PortRepr> for TracePort {
    type Error = ConfigError;

    fn try_from(repr: PortRepr) -> Result<Self, Self::Error> {
        match repr {
            PortRepr::Number(port) => Ok(TracePort::Port(port)),
            PortRepr::Text(text) => text.parse(),
        }
    }
}

/// One subscriber of the trace stream.
pub trait TraceConnection {
    /// Write as much of `data` as the connection accepts in one go.
    fn write(&mut self, data: &[u8]) -> Result<usize, TraceError>;
}

impl TraceConnection for TcpStream {
    fn write(&mut self, data: &[u8]) -> Result<usize, TraceError> {
        Ok(Write::write(self, data)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Ok,
    /// A write came up short.  Terminal until the connection is removed.
    Errored,
}

#[derive(Debug)]
struct Entry<C> {
    id: usize,
    conn: C,
    state: ConnectionState,
}

/// The set of trace connections, in the order they were added.
#[derive(Debug)]
pub struct TraceSink<C> {
    entries: Vec<Entry<C>>,
    next_id: usize,
}

impl<C> Default for TraceSink<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<C: TraceConnection> TraceSink<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&mut self, conn: C) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            conn,
            state: ConnectionState::Ok,
        });
        id
    }

    /// Tear a connection down, clearing its error state with it.
    pub fn remove_connection(&mut self, id: usize) -> Result<C, TraceError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(TraceError::NoSuchConnection(id))?;
        Ok(self.entries.remove(pos).conn)
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    pub fn connection(&self, id: usize) -> Option<&C> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.conn)
    }

    pub fn state(&self, id: usize) -> Option<ConnectionState> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.state)
    }

    /// Write `data` to one connection.  All of it has to go out in a single write.
    pub fn output(&mut self, id: usize, data: &[u8]) -> Result<(), TraceError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(TraceError::NoSuchConnection(id))?;
        output_to(entry, data)
    }

    /// Write `data` to every connection, returning how many took all of it.
    pub fn output_all(&mut self, data: &[u8]) -> usize {
        self.entries
            .iter_mut()
            .map(|entry| output_to(entry, data))
            .filter(Result::is_ok)
            .count()
    }

    fn connections_mut(&mut self) -> impl Iterator<Item = (usize, &mut C)> {
        self.entries.iter_mut().map(|e| (e.id, &mut e.conn))
    }
}

fn output_to<C: TraceConnection>(entry: &mut Entry<C>, data: &[u8]) -> Result<(), TraceError> {
    if entry.state == ConnectionState::Errored {
        return Err(TraceError::RemoteClosed);
    }
    match entry.conn.write(data) {
        Ok(written) if written == data.len() => return Ok(()),
        Ok(written) => tracing::error!("error during write: {} != {}", written, data.len()),
        Err(e) => tracing::error!("error during write: {e}"),
    }
    entry.state = ConnectionState::Errored;
    Err(TraceError::RemoteClosed)
}

/// TCP listener feeding a [`TraceSink`].
#[derive(Debug)]
pub struct TraceServer {
    listener: TcpListener,
    sink: TraceSink<TcpStream>,
    read_timeout: Duration,
}

impl TraceServer {
    /// Bind the trace listener, unless the port is disabled.
    pub fn init(port: &TracePort, addr: IpAddr) -> Result<Option<Self>, TraceError> {
        let TracePort::Port(port) = *port else {
            tracing::info!("trace server disabled");
            return Ok(None);
        };
        let listener = TcpListener::bind((addr, port))?;
        listener.set_nonblocking(true)?;
        tracing::info!(
            "Listening on port {} for trace connections",
            listener.local_addr()?.port()
        );
        Ok(Some(Self {
            listener,
            sink: TraceSink::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }))
    }

    /// How long [`service_input`](Self::service_input) waits on each client.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TraceError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn sink(&self) -> &TraceSink<TcpStream> {
        &self.sink
    }

    /// Accept every client waiting on the listener, closing those past [`MAX_CONNECTIONS`].
    /// Returns how many were added to the sink.
    pub fn accept_pending(&mut self) -> Result<usize, TraceError> {
        let mut accepted = 0;
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(client) => client,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            if self.sink.connection_count() >= MAX_CONNECTIONS {
                tracing::warn!(
                    "refusing trace connection from {peer}: {MAX_CONNECTIONS} clients connected"
                );
                continue;
            }
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(Some(self.read_timeout))?;
            stream.set_nodelay(true)?;
            let id = self.sink.add_connection(stream);
            tracing::info!("accepting trace connection #{id} from {peer}");
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Drain whatever clients sent and drop the ones that went away.  Returns how many
    /// connections were removed.
    pub fn service_input(&mut self) -> usize {
        let mut closed = Vec::new();
        let mut buf = [0u8; INPUT_CHUNK];
        for (id, stream) in self.sink.connections_mut() {
            match stream.read(&mut buf) {
                Ok(0) => closed.push(id),
                Ok(_) => tracing::warn!("trace server input not supported"),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    tracing::error!("error during read: {e}");
                    closed.push(id);
                }
            }
        }
        for id in &closed {
            if self.sink.remove_connection(*id).is_ok() {
                tracing::info!("dropped trace connection #{id}");
            }
        }
        closed.len()
    }

    pub fn output_all(&mut self, data: &[u8]) -> usize {
        self.sink.output_all(data)
    }
}
