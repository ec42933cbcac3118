//! Logical endpoints backed by one or more OS sockets.
//!
//! A [`ClientConnection`] keeps a pool of outbound sockets. Callers claim one with
//! [`ClientConnection::lock`], which hands back a [`Checkout`]: the checkout owns the
//! socket until it is unlocked or dropped, so a socket is always either pooled, checked out
//! by exactly one caller, or closed for good.
//!
//! A [`ServerConnection`] holds the sockets accepted from one peer in a slot table.
//! [`ServerConnection::lock`] returns a [`PollGuard`] that scans the slots for readable
//! sockets without blocking and selects them one at a time in round-robin order.
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::fd::{AsFd, AsRawFd},
    sync::{
        Condvar, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use log::{debug, info, trace, warn};
use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::{
        socket::{self, sockopt},
        time::{TimeVal, TimeValLike},
    },
};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use thiserror::Error;

use super::{
    message::Message,
    transport::{ProtocolTransport, RetryPolicy, TransportError},
};

/// Connect attempts made for each new client socket.
pub const MAX_CONNECT_RETRY: u32 = 10;
/// Sockets handed to a single `poll(2)` call.
pub const SOCKET_STEP: usize = 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not connect to {peer} after {attempts} attempts: {source}")]
    Connect {
        peer: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("connection to {0} has no open sockets")]
    Closed(String),
}

/// Opens outbound streams for a [`ClientConnection`].
pub trait Connector: Send + Sync {
    type Stream: Read + Write + Send;

    fn connect(&self) -> io::Result<Self::Stream>;

    /// Called once a stream will not be used again.
    fn disconnect(&self, stream: Self::Stream) {
        drop(stream);
    }

    fn peer(&self) -> String;
}

/// TCP streams with keepalive enabled.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> io::Result<TcpStream> {
        let socket = RawSocket::new(
            Domain::for_address(self.addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_keepalive(true)?;
        socket.connect(&self.addr.into())?;

        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn disconnect(&self, stream: TcpStream) {
        if let Err(e) = stream.shutdown(Shutdown::Read) {
            trace!("shutdown of socket to {} failed: {e}", self.addr);
        }
    }

    fn peer(&self) -> String {
        self.addr.to_string()
    }
}

/// Sizing and retry limits for a client socket pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub sockets: usize,
    pub connect_retries: u32,
    pub transfer: RetryPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            sockets: 1,
            connect_retries: MAX_CONNECT_RETRY,
            transfer: RetryPolicy::default(),
        }
    }
}

pub struct ClientConnection<C: Connector> {
    connector: C,
    options: PoolOptions,
    pool: Mutex<VecDeque<ProtocolTransport<C::Stream>>>,
    available: Condvar,
    live: AtomicUsize,
}

impl<C: Connector> ClientConnection<C> {
    /// Eagerly opens `options.sockets` sockets (at least one). Fails only if none could be
    /// opened.
    pub fn open(connector: C, options: PoolOptions) -> Result<Self, ConnectionError> {
        let connection = Self {
            connector,
            options,
            pool: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            live: AtomicUsize::new(0),
        };

        let mut last_error = None;
        for _ in 0..options.sockets.max(1) {
            match connection.open_socket() {
                Ok(transport) => {
                    connection.pool().push_back(transport);
                    connection.live.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!("{e}");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if connection.live_sockets() == 0 => Err(e),
            _ => {
                info!(
                    "connected to {} with {} sockets",
                    connection.peer(),
                    connection.live_sockets()
                );
                connection.available.notify_all();
                Ok(connection)
            }
        }
    }

    /// Blocks until a socket is free and claims it.
    pub fn lock(&self) -> Result<Checkout<'_, C>, ConnectionError> {
        let mut pool = self.pool();
        loop {
            if let Some(transport) = pool.pop_front() {
                return Ok(Checkout {
                    connection: self,
                    transport: Some(transport),
                });
            }
            if self.live_sockets() == 0 {
                return Err(ConnectionError::Closed(self.peer()));
            }
            pool = self
                .available
                .wait(pool)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn live_sockets(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.live_sockets() > 0
    }

    pub fn peer(&self) -> String {
        self.connector.peer()
    }

    fn open_socket(&self) -> Result<ProtocolTransport<C::Stream>, ConnectionError> {
        let attempts = self.options.connect_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect() {
                Ok(stream) => {
                    debug!("opened socket to {} on attempt {attempt}", self.peer());
                    return Ok(ProtocolTransport::new(stream, self.options.transfer));
                }
                Err(source) if attempt >= attempts => {
                    return Err(ConnectionError::Connect {
                        peer: self.peer(),
                        attempts,
                        source,
                    });
                }
                Err(e) => trace!("connect to {} failed: {e}", self.peer()),
            }
        }
    }

    fn give_back(&self, transport: ProtocolTransport<C::Stream>) {
        self.pool().push_back(transport);
        self.available.notify_one();
    }

    fn retire(&self) {
        let remaining = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("socket to {} closed, {remaining} remain", self.peer());
        // Waiters must see the new count even if nothing returns to the pool.
        let _pool = self.pool();
        self.available.notify_all();
    }

    fn pool(&self) -> MutexGuard<'_, VecDeque<ProtocolTransport<C::Stream>>> {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Connector> Drop for ClientConnection<C> {
    fn drop(&mut self) {
        let pooled: Vec<_> = self.pool().drain(..).collect();
        for mut transport in pooled {
            if let Err(e) = transport.write_message(&Message::CloseConnection) {
                trace!("close message to {} not sent: {e}", self.peer());
            }
            self.connector.disconnect(transport.into_inner());
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Exclusive claim on one pooled socket. Dropping it returns the socket to the pool.
pub struct Checkout<'a, C: Connector> {
    connection: &'a ClientConnection<C>,
    transport: Option<ProtocolTransport<C::Stream>>,
}

impl<C: Connector> Checkout<'_, C> {
    pub fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.transport()?.send(buf)
    }

    pub fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.transport()?.receive(buf)
    }

    pub fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        self.transport()?.write_message(message)
    }

    pub fn receive_message(&mut self) -> Result<Message, TransportError> {
        self.transport()?.read_message()
    }

    /// Force-closes the claimed socket and opens a replacement in its place.
    ///
    /// If no replacement can be opened the claim is left without a socket and the
    /// connection has one live socket fewer.
    pub fn restart(&mut self) -> Result<(), ConnectionError> {
        let had_socket = match self.transport.take() {
            Some(old) => {
                drop(old.into_inner());
                true
            }
            None => false,
        };

        match self.connection.open_socket() {
            Ok(transport) => {
                if !had_socket {
                    self.connection.live.fetch_add(1, Ordering::SeqCst);
                }
                self.transport = Some(transport);
                debug!("restarted socket to {}", self.connection.peer());
                Ok(())
            }
            Err(e) => {
                if had_socket {
                    self.connection.retire();
                }
                Err(e)
            }
        }
    }

    /// Tells the peer this socket is done, then closes it for good.
    pub fn close(mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.write_message(&Message::CloseConnection) {
                trace!("close message not sent: {e}");
            }
            self.connection.connector.disconnect(transport.into_inner());
            self.connection.retire();
        }
    }

    pub fn unlock(self) {}

    pub fn is_bound(&self) -> bool {
        self.transport.is_some()
    }

    fn transport(&mut self) -> Result<&mut ProtocolTransport<C::Stream>, TransportError> {
        self.transport.as_mut().ok_or(TransportError::Closed)
    }

    #[cfg(test)]
    pub(crate) fn stream(&self) -> Option<&C::Stream> {
        self.transport.as_ref().map(ProtocolTransport::get_ref)
    }
}

impl<C: Connector> Drop for Checkout<'_, C> {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.connection.give_back(transport);
        }
    }
}

/// Anything a server connection can poll and read from.
pub trait Socket: Read + Write + AsFd + Send + 'static {}

impl<T: Read + Write + AsFd + Send + 'static> Socket for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Idle,
    Readable,
    Failed,
}

struct SlotTable<S> {
    slots: Vec<Option<ProtocolTransport<S>>>,
    readiness: Vec<Readiness>,
    /// Ready sockets left from the last scan; `None` means scan again.
    pending: Option<usize>,
    next: usize,
}

pub struct ServerConnection<S: Socket> {
    peer: String,
    table: Mutex<SlotTable<S>>,
    live: AtomicUsize,
    socket_step: usize,
    policy: RetryPolicy,
}

impl<S: Socket> ServerConnection<S> {
    pub fn new(peer: impl Into<String>, stream: S, socket_step: usize, policy: RetryPolicy) -> Self {
        let connection = Self {
            peer: peer.into(),
            table: Mutex::new(SlotTable {
                slots: Vec::new(),
                readiness: Vec::new(),
                pending: None,
                next: 0,
            }),
            live: AtomicUsize::new(0),
            socket_step: socket_step.max(1),
            policy,
        };
        connection.add_socket(stream);
        connection
    }

    /// Adds a socket in the first closed slot, or a new one.
    ///
    /// Blocking reads and writes on the socket time out after [`RetryPolicy::io_timeout`],
    /// so a peer that stops mid-frame uses up the stall budget instead of holding a worker.
    pub fn add_socket(&self, stream: S) {
        if let Err(e) = set_io_timeout(&stream, self.policy.io_timeout()) {
            warn!("no i/o timeout on socket from {}: {e}", self.peer);
        }
        let transport = ProtocolTransport::new(stream, self.policy);
        let mut table = self.table();
        match table.slots.iter().position(Option::is_none) {
            Some(index) => {
                table.slots[index] = Some(transport);
                table.readiness[index] = Readiness::Idle;
            }
            None => {
                table.slots.push(Some(transport));
                table.readiness.push(Readiness::Idle);
            }
        }
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    pub fn lock(&self) -> PollGuard<'_, S> {
        PollGuard {
            connection: self,
            table: self.table(),
            selected: None,
            closed: 0,
        }
    }

    pub fn live_sockets(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.live_sockets() > 0
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn slot_count(&self) -> usize {
        self.table().slots.len()
    }

    fn table(&self) -> MutexGuard<'_, SlotTable<S>> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: Socket> Drop for ServerConnection<S> {
    fn drop(&mut self) {
        let table = self
            .table
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for transport in table.slots.iter_mut().filter_map(Option::take) {
            shutdown_write(transport.get_ref());
        }
        debug!("released connection from {}", self.peer);
    }
}

/// Locked view of a [`ServerConnection`] with at most one socket selected.
pub struct PollGuard<'a, S: Socket> {
    connection: &'a ServerConnection<S>,
    table: MutexGuard<'a, SlotTable<S>>,
    selected: Option<usize>,
    closed: usize,
}

impl<S: Socket> PollGuard<'_, S> {
    /// Selects the next readable socket. Returns the number of ready sockets left
    /// including the selected one, or 0 once the current scan is exhausted; the call
    /// after that starts a new scan.
    pub fn poll(&mut self) -> usize {
        self.selected = None;

        let mut pending = match self.table.pending {
            Some(pending) => pending,
            None => self.scan(),
        };

        while pending > 0 {
            match self.next_marked() {
                Some((index, Readiness::Readable)) => {
                    self.selected = Some(index);
                    break;
                }
                Some((index, _)) => {
                    warn!("socket {index} from {} reported an error", self.connection.peer);
                    self.close_slot(index);
                    pending -= 1;
                }
                None => pending = 0,
            }
        }

        self.table.pending = pending.checked_sub(1);
        pending
    }

    /// Advances the round-robin cursor to the next slot marked by the last scan and
    /// clears its mark.
    fn next_marked(&mut self) -> Option<(usize, Readiness)> {
        let table = &mut *self.table;
        let count = table.slots.len();
        for _ in 0..count {
            let index = table.next % count;
            table.next = index + 1;
            let mark = std::mem::replace(&mut table.readiness[index], Readiness::Idle);
            if mark != Readiness::Idle {
                return Some((index, mark));
            }
        }
        None
    }

    /// One non-blocking readiness pass over every live slot, `socket_step` at a time.
    fn scan(&mut self) -> usize {
        let step = self.connection.socket_step;
        let SlotTable {
            slots, readiness, ..
        } = &mut *self.table;

        let live: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i))
            .collect();

        let mut ready = 0;
        let mut broken = Vec::new();
        for batch in live.chunks(step) {
            let mut fds: Vec<PollFd<'_>> = batch
                .iter()
                .filter_map(|&i| slots[i].as_ref())
                .map(|transport| PollFd::new(transport.get_ref().as_fd(), PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(_) => {
                    for (&index, fd) in batch.iter().zip(&fds) {
                        let events = fd.revents().unwrap_or(PollFlags::empty());
                        readiness[index] = if events.is_empty() {
                            Readiness::Idle
                        } else if events == PollFlags::POLLIN {
                            Readiness::Readable
                        } else {
                            Readiness::Failed
                        };
                        if !events.is_empty() {
                            ready += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("poll failed for {}: {e}", self.connection.peer);
                    broken.extend_from_slice(batch);
                }
            }
        }

        for index in broken {
            self.close_slot(index);
        }
        if ready > 0 {
            trace!("{} ready sockets from {}", ready, self.connection.peer);
        }
        ready
    }

    /// Index of the slot selected by the last [`PollGuard::poll`].
    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn receive_message(&mut self) -> Result<Message, TransportError> {
        self.selected_transport()?.read_message()
    }

    /// Replies on the selected socket, closing it if the reply cannot be sent.
    pub fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let result = self.selected_transport()?.write_message(message);
        if result.is_err() {
            self.close_selected();
        }
        result
    }

    pub fn close_selected(&mut self) {
        if let Some(index) = self.selected.take() {
            self.close_slot(index);
        }
    }

    /// Releases the lock and reports how many sockets were closed while it was held.
    pub fn unlock(self) -> usize {
        self.closed
    }

    fn selected_transport(&mut self) -> Result<&mut ProtocolTransport<S>, TransportError> {
        let index = self.selected.ok_or(TransportError::Closed)?;
        self.table.slots[index]
            .as_mut()
            .ok_or(TransportError::Closed)
    }

    fn close_slot(&mut self, index: usize) {
        if let Some(transport) = self.table.slots[index].take() {
            shutdown_write(transport.get_ref());
            self.table.readiness[index] = Readiness::Idle;
            self.closed += 1;
            let remaining = self.connection.live.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!(
                "closed socket {index} from {}, {remaining} remain",
                self.connection.peer
            );
        }
    }
}

fn set_io_timeout<S: AsFd>(stream: &S, timeout: Duration) -> nix::Result<()> {
    let micros = i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX);
    let timeout = TimeVal::microseconds(micros);
    socket::setsockopt(stream, sockopt::ReceiveTimeout, &timeout)?;
    socket::setsockopt(stream, sockopt::SendTimeout, &timeout)
}

fn shutdown_write<S: AsFd>(stream: &S) {
    if let Err(e) = socket::shutdown(stream.as_fd().as_raw_fd(), socket::Shutdown::Write) {
        trace!("shutdown failed: {e}");
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        io::{self, Cursor, ErrorKind, Read, Write},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use super::Connector;

    /// In-memory streams: each reads back a fixed script and records what is written.
    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub script: Vec<u8>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub failing_writes: Arc<AtomicUsize>,
        pub connects: AtomicUsize,
        pub refuse: AtomicBool,
    }

    impl MockConnector {
        pub fn replying(script: Vec<u8>) -> Self {
            Self {
                script,
                ..Default::default()
            }
        }
    }

    pub(crate) struct MockStream {
        pub id: usize,
        input: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        failing_writes: Arc<AtomicUsize>,
    }

    impl Connector for MockConnector {
        type Stream = MockStream;

        fn connect(&self) -> io::Result<MockStream> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ErrorKind::ConnectionRefused.into());
            }
            Ok(MockStream {
                id: self.connects.fetch_add(1, Ordering::SeqCst),
                input: Cursor::new(self.script.clone()),
                written: Arc::clone(&self.written),
                failing_writes: Arc::clone(&self.failing_writes),
            })
        }

        fn peer(&self) -> String {
            "mock".to_string()
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let failed = self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(ErrorKind::ConnectionReset.into());
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
