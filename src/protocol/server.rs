use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::{
    config::ServerConfig,
    runtime::{AcceleratorRuntime, RuntimeFactory},
};

use super::{
    connection::{ServerConnection, Socket},
    message::{Message, MessageKind, Payload},
    thread::{Spawner, WorkPool},
    transport::RetryPolicy,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Server IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Asks a running [`DeviceServer`] to stop accepting and wind down.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the dispatcher does after a message has been handled.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Reply(Message),
    Silent,
    Close,
    Shutdown,
}

/// Server-side state for one connected peer.
pub struct SessionContext {
    factory: Arc<dyn RuntimeFactory>,
    runtime: Option<Box<dyn AcceleratorRuntime>>,
    model_tag: Option<String>,
    input_len: Option<usize>,
}

impl SessionContext {
    pub fn new(factory: Arc<dyn RuntimeFactory>) -> Self {
        Self {
            factory,
            runtime: None,
            model_tag: None,
            input_len: None,
        }
    }

    pub fn model_tag(&self) -> Option<&str> {
        self.model_tag.as_deref()
    }

    fn handle(&mut self, message: Message) -> Action {
        match message {
            Message::Init => self.init(),
            Message::NumDevices(_) => {
                Action::Reply(Message::NumDevices(self.device_count(|rt| rt.num_devices())))
            }
            Message::MaxDevices(_) => {
                Action::Reply(Message::MaxDevices(self.device_count(|rt| rt.max_devices())))
            }
            Message::LoadBinary(payload) => self.load_binary(payload),
            Message::InputData(payload) => self.load_input(payload),
            Message::Infer { output_size } => self.infer(output_size),
            Message::Ping => Action::Reply(Message::Ack(MessageKind::Ping)),
            Message::Ack(MessageKind::OutputData) => Action::Silent,
            Message::Ack(kind) => {
                warn!("ignoring unsolicited ack for {kind:?}");
                Action::Silent
            }
            Message::CloseConnection => Action::Close,
            Message::CloseServer => Action::Shutdown,
            other @ (Message::OutputData(_) | Message::Fail) => {
                warn!("{:?} is not a request", other.kind());
                Action::Close
            }
        }
    }

    fn init(&mut self) -> Action {
        if self.runtime.is_none() {
            match self.factory.create() {
                Ok(runtime) => {
                    info!("created accelerator runtime");
                    self.runtime = Some(runtime);
                }
                Err(e) => {
                    warn!("{e}");
                    return Action::Reply(Message::Fail);
                }
            }
        }
        Action::Reply(Message::Ack(MessageKind::Init))
    }

    fn device_count(&self, count: impl Fn(&dyn AcceleratorRuntime) -> i64) -> i64 {
        match &self.runtime {
            Some(runtime) => count(&**runtime),
            None => {
                warn!("device query before init");
                -1
            }
        }
    }

    fn load_binary(&mut self, payload: Payload) -> Action {
        let Some(runtime) = self.runtime.as_mut() else {
            warn!("binary image sent before init");
            return Action::Reply(Message::Fail);
        };

        if self.model_tag.as_deref() == Some(payload.tag.as_str()) {
            debug!("binary image '{}' already loaded", payload.tag);
            return Action::Reply(Message::Ack(MessageKind::LoadBinary));
        }

        if let Some(previous) = self.model_tag.take() {
            debug!("unloading binary image '{previous}'");
            runtime.unload();
            self.input_len = None;
        }

        match runtime.load(&payload.data) {
            Ok(()) => {
                info!(
                    "loaded binary image '{}' ({} bytes)",
                    payload.tag,
                    payload.data.len()
                );
                self.model_tag = Some(payload.tag);
                Action::Reply(Message::Ack(MessageKind::LoadBinary))
            }
            Err(e) => {
                warn!("{e}");
                Action::Reply(Message::Fail)
            }
        }
    }

    fn load_input(&mut self, payload: Payload) -> Action {
        let runtime = match (self.runtime.as_mut(), &self.model_tag) {
            (Some(runtime), Some(_)) => runtime,
            _ => {
                warn!("input sent before a binary image was loaded");
                return Action::Reply(Message::Fail);
            }
        };

        match runtime.bind_input(&payload.data) {
            Ok(()) => {
                self.input_len = Some(payload.data.len());
                Action::Reply(Message::Ack(MessageKind::InputData))
            }
            Err(e) => {
                warn!("{e}");
                Action::Reply(Message::Fail)
            }
        }
    }

    fn infer(&mut self, output_size: u64) -> Action {
        let runtime = match (self.runtime.as_mut(), &self.model_tag, self.input_len) {
            (Some(runtime), Some(_), Some(_)) => runtime,
            _ => {
                warn!("infer requested without a loaded image and bound input");
                return Action::Reply(Message::Fail);
            }
        };
        // The reply has to fit the u32 size field of an OUTPUT_DATA frame.
        let max_output = u32::MAX as usize - MessageKind::OutputData.fixed_size();
        let output_size = match usize::try_from(output_size) {
            Ok(size) if size <= max_output => size,
            _ => {
                warn!("requested output of {output_size} bytes cannot be framed");
                return Action::Reply(Message::Fail);
            }
        };

        let output = runtime
            .submit()
            .and_then(|()| runtime.read_output(output_size));
        match output {
            Ok(data) => {
                trace!("inference produced {} bytes", data.len());
                Action::Reply(Message::OutputData(Payload::untagged(data)))
            }
            Err(e) => {
                warn!("{e}");
                Action::Reply(Message::Fail)
            }
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Some(mut runtime) = self.runtime.take() {
            if self.model_tag.take().is_some() {
                runtime.unload();
            }
            info!("released accelerator runtime");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Messages were handled; poll again straight away.
    Polling,
    /// Nothing was ready; poll again after yielding.
    Rescheduled,
    /// The peer is gone; nothing more is scheduled for it.
    Closed,
}

/// The poll, decode, handle and reply cycle for one connection.
///
/// A dispatcher runs one cycle per pool task and then resubmits itself, so at most one
/// task per connection is ever queued or running.
///
/// An idle dispatcher hands its worker straight back to the pool while other work is
/// queued. It only sleeps for `idle_backoff` when everything queued is another idle
/// dispatcher, which keeps a pool full of quiet peers from spinning on `poll(2)`.
pub struct Dispatcher<S: Socket> {
    connection: ServerConnection<S>,
    session: SessionContext,
    shutdown: ShutdownHandle,
    idle_backoff: Duration,
    /// Idle dispatchers currently sitting in the pool queue, shared across connections.
    idle_queued: Arc<AtomicUsize>,
    queued_idle: bool,
}

impl<S: Socket> Dispatcher<S> {
    pub fn new(
        connection: ServerConnection<S>,
        session: SessionContext,
        shutdown: ShutdownHandle,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            connection,
            session,
            shutdown,
            idle_backoff,
            idle_queued: Arc::default(),
            queued_idle: false,
        }
    }

    /// Shares the count of queued idle dispatchers with the other connections on a pool.
    pub fn with_idle_count(mut self, idle_queued: Arc<AtomicUsize>) -> Self {
        self.idle_queued = idle_queued;
        self
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn run_cycle(&mut self) -> DispatchState {
        let mut guard = self.connection.lock();
        let mut handled = 0;

        while guard.poll() > 0 {
            let message = match guard.receive_message() {
                Ok(message) => message,
                Err(e) => {
                    warn!("closing socket from {}: {e}", self.connection.peer());
                    guard.close_selected();
                    continue;
                }
            };
            trace!("{} sent {:?}", self.connection.peer(), message.kind());
            handled += 1;

            match self.session.handle(message) {
                Action::Reply(reply) => {
                    if let Err(e) = guard.send_message(&reply) {
                        warn!("reply to {} failed: {e}", self.connection.peer());
                    }
                }
                Action::Silent => {}
                Action::Close => guard.close_selected(),
                Action::Shutdown => {
                    info!("{} asked the server to shut down", self.connection.peer());
                    self.shutdown.shutdown();
                }
            }
        }

        let closed = guard.unlock();
        if closed > 0 || !self.connection.is_open() || self.shutdown.is_shutdown() {
            DispatchState::Closed
        } else if handled > 0 {
            DispatchState::Polling
        } else {
            DispatchState::Rescheduled
        }
    }

    /// Runs one cycle and, unless the connection closed, queues the next one.
    pub fn run(mut self, spawner: Spawner) {
        if std::mem::take(&mut self.queued_idle) {
            self.idle_queued.fetch_sub(1, Ordering::SeqCst);
        }

        match self.run_cycle() {
            DispatchState::Closed => {
                info!("session with {} closed", self.connection.peer());
            }
            DispatchState::Polling => self.resubmit(spawner),
            DispatchState::Rescheduled => {
                if spawner.pending() <= self.idle_queued.load(Ordering::SeqCst) {
                    thread::sleep(self.idle_backoff);
                }
                self.queued_idle = true;
                self.idle_queued.fetch_add(1, Ordering::SeqCst);
                self.resubmit(spawner);
            }
        }
    }

    fn resubmit(self, spawner: Spawner) {
        let next = spawner.clone();
        spawner.spawn(move || self.run(next));
    }
}

/// Accepts clients and serves each on the shared worker pool.
pub struct DeviceServer {
    config: ServerConfig,
    factory: Arc<dyn RuntimeFactory>,
    pool: WorkPool,
    shutdown: ShutdownHandle,
    idle_queued: Arc<AtomicUsize>,
}

impl DeviceServer {
    pub fn new(config: ServerConfig, factory: impl RuntimeFactory + 'static) -> Self {
        let pool = WorkPool::new("dispatch", config.max_threads.max(1))
            .with_drain_interval(config.drain_interval());
        Self {
            config,
            factory: Arc::new(factory),
            pool,
            shutdown: ShutdownHandle::default(),
            idle_queued: Arc::default(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn listen(self) -> Result<(), ServerError> {
        let addr = self.config.listen;
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener)
    }

    /// Accepts until shut down, then closes every session and drains the pool.
    pub fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        info!("listening at {}", listener.local_addr()?);
        listener.set_nonblocking(true)?;

        while !self.shutdown.is_shutdown() {
            match listener.accept() {
                Ok((stream, peer)) => self.accept(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_BACKOFF),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("no longer accepting connections");
        drop(listener);
        self.pool.terminate(true);
        info!("server stopped");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("dropping {peer}: {e}");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("nodelay not set for {peer}: {e}");
        }
        info!("accepted connection from {peer}");

        let policy: RetryPolicy = self.config.transfer.policy();
        let connection =
            ServerConnection::new(peer.to_string(), stream, self.config.socket_step, policy);
        let dispatcher = Dispatcher::new(
            connection,
            SessionContext::new(Arc::clone(&self.factory)),
            self.shutdown.clone(),
            self.config.idle_backoff(),
        )
        .with_idle_count(Arc::clone(&self.idle_queued));

        let spawner = self.pool.spawner();
        if !self
            .pool
            .add_thread_with_task(move || dispatcher.run(spawner))
        {
            debug!(
                "all {} workers busy, {peer} waits for a free one",
                self.pool.max_threads()
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use crate::runtime::{AcceleratorRuntime, RuntimeError, RuntimeFactory};

    /// Counts calls made against runtimes created by [`factory`].
    #[derive(Debug, Default)]
    pub(crate) struct Counters {
        pub created: AtomicUsize,
        pub loads: AtomicUsize,
        pub unloads: AtomicUsize,
        pub released: AtomicUsize,
    }

    impl Counters {
        pub fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    struct StubRuntime {
        counters: Arc<Counters>,
        input: Vec<u8>,
    }

    impl AcceleratorRuntime for StubRuntime {
        fn num_devices(&self) -> i64 {
            1
        }

        fn max_devices(&self) -> i64 {
            4
        }

        fn load(&mut self, image: &[u8]) -> Result<(), RuntimeError> {
            self.counters.loads.fetch_add(1, Ordering::SeqCst);
            if image == b"corrupt" {
                return Err(RuntimeError::Load("corrupt".to_string()));
            }
            Ok(())
        }

        fn unload(&mut self) {
            self.counters.unloads.fetch_add(1, Ordering::SeqCst);
        }

        fn bind_input(&mut self, data: &[u8]) -> Result<(), RuntimeError> {
            self.input = data.to_vec();
            Ok(())
        }

        fn submit(&mut self) -> Result<(), RuntimeError> {
            Ok(())
        }

        fn read_output(&mut self, size: usize) -> Result<Vec<u8>, RuntimeError> {
            Ok(self.input.iter().copied().cycle().take(size).collect())
        }
    }

    impl Drop for StubRuntime {
        fn drop(&mut self) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn factory(counters: Arc<Counters>) -> impl RuntimeFactory {
        move || -> Result<Box<dyn AcceleratorRuntime>, RuntimeError> {
            counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubRuntime {
                counters: Arc::clone(&counters),
                input: Vec::new(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        os::unix::net::UnixStream,
        time::Instant,
    };

    use crate::protocol::transport::ProtocolTransport;

    use super::{
        stub::{Counters, factory},
        *,
    };

    fn quick() -> RetryPolicy {
        RetryPolicy {
            stall_retries: 2,
            stall_backoff: Duration::from_micros(10),
        }
    }

    fn dispatcher(counters: &Arc<Counters>) -> (Dispatcher<UnixStream>, ProtocolTransport<UnixStream>) {
        let (local, remote) = UnixStream::pair().unwrap();
        let connection = ServerConnection::new("test-peer", local, 8, quick());
        let session = SessionContext::new(Arc::new(factory(Arc::clone(counters))));
        let dispatcher = Dispatcher::new(
            connection,
            session,
            ShutdownHandle::default(),
            Duration::from_millis(1),
        );
        (dispatcher, ProtocolTransport::new(remote, quick()))
    }

    fn exchange(
        dispatcher: &mut Dispatcher<UnixStream>,
        peer: &mut ProtocolTransport<UnixStream>,
        request: Message,
    ) -> Message {
        peer.write_message(&request).unwrap();
        assert_eq!(dispatcher.run_cycle(), DispatchState::Polling);
        peer.read_message().unwrap()
    }

    fn load(tag: &str) -> Message {
        Message::LoadBinary(Payload::new(tag, b"image".to_vec()))
    }

    #[test]
    fn init_is_acknowledged() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);

        assert_eq!(
            exchange(&mut dispatcher, &mut peer, Message::Init),
            Message::Ack(MessageKind::Init)
        );
        assert_eq!(
            exchange(&mut dispatcher, &mut peer, Message::Init),
            Message::Ack(MessageKind::Init)
        );
        assert_eq!(Counters::get(&counters.created), 1);
    }

    #[test]
    fn idle_connection_is_rescheduled() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, _peer) = dispatcher(&counters);

        assert_eq!(dispatcher.run_cycle(), DispatchState::Rescheduled);
    }

    #[test]
    fn device_queries_before_init_report_minus_one() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);

        assert_eq!(
            exchange(&mut dispatcher, &mut peer, Message::NumDevices(0)),
            Message::NumDevices(-1)
        );
        exchange(&mut dispatcher, &mut peer, Message::Init);
        assert_eq!(
            exchange(&mut dispatcher, &mut peer, Message::MaxDevices(0)),
            Message::MaxDevices(4)
        );
    }

    #[test]
    fn same_tag_loads_once() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        exchange(&mut dispatcher, &mut peer, Message::Init);

        for tag in ["lenet", "lenet", "resnet", "resnet", "lenet"] {
            assert_eq!(
                exchange(&mut dispatcher, &mut peer, load(tag)),
                Message::Ack(MessageKind::LoadBinary)
            );
        }

        assert_eq!(Counters::get(&counters.loads), 3);
        assert_eq!(Counters::get(&counters.unloads), 2);
        assert_eq!(dispatcher.session().model_tag(), Some("lenet"));
    }

    #[test]
    fn rejected_image_replies_fail_and_is_retried() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        exchange(&mut dispatcher, &mut peer, Message::Init);

        let corrupt = Message::LoadBinary(Payload::new("net", b"corrupt".to_vec()));
        assert_eq!(exchange(&mut dispatcher, &mut peer, corrupt), Message::Fail);
        assert_eq!(dispatcher.session().model_tag(), None);
        assert_eq!(
            exchange(&mut dispatcher, &mut peer, load("net")),
            Message::Ack(MessageKind::LoadBinary)
        );
        assert_eq!(Counters::get(&counters.loads), 2);
    }

    #[test]
    fn out_of_order_requests_fail_without_closing() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);

        assert_eq!(exchange(&mut dispatcher, &mut peer, load("net")), Message::Fail);
        exchange(&mut dispatcher, &mut peer, Message::Init);
        assert_eq!(
            exchange(&mut dispatcher, &mut peer, Message::Infer { output_size: 4 }),
            Message::Fail
        );
        assert_eq!(
            exchange(
                &mut dispatcher,
                &mut peer,
                Message::InputData(Payload::untagged(vec![1]))
            ),
            Message::Fail
        );
        assert_eq!(
            exchange(&mut dispatcher, &mut peer, Message::Ping),
            Message::Ack(MessageKind::Ping)
        );
    }

    #[test]
    fn infer_returns_requested_output() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        exchange(&mut dispatcher, &mut peer, Message::Init);
        exchange(&mut dispatcher, &mut peer, load("net"));
        assert_eq!(
            exchange(
                &mut dispatcher,
                &mut peer,
                Message::InputData(Payload::untagged(vec![1, 2]))
            ),
            Message::Ack(MessageKind::InputData)
        );

        assert_eq!(
            exchange(&mut dispatcher, &mut peer, Message::Infer { output_size: 5 }),
            Message::OutputData(Payload::untagged(vec![1, 2, 1, 2, 1]))
        );

        peer.write_message(&Message::Ack(MessageKind::OutputData)).unwrap();
        assert_eq!(dispatcher.run_cycle(), DispatchState::Polling);
    }

    #[test]
    fn unframeable_output_size_fails() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        exchange(&mut dispatcher, &mut peer, Message::Init);
        exchange(&mut dispatcher, &mut peer, load("net"));
        exchange(
            &mut dispatcher,
            &mut peer,
            Message::InputData(Payload::untagged(vec![1])),
        );

        assert_eq!(
            exchange(
                &mut dispatcher,
                &mut peer,
                Message::Infer {
                    output_size: 1 << 44
                }
            ),
            Message::Fail
        );
        assert_eq!(
            exchange(
                &mut dispatcher,
                &mut peer,
                Message::Infer { output_size: 2 }
            ),
            Message::OutputData(Payload::untagged(vec![1, 1]))
        );
    }

    #[test]
    fn partial_frame_times_out_and_closes() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, peer) = dispatcher(&counters);

        let frame = Message::Ping.to_bytes().unwrap();
        let mut stream = peer.into_inner();
        stream.write_all(&frame[..8]).unwrap();

        assert_eq!(dispatcher.run_cycle(), DispatchState::Closed);
        drop(stream);
    }

    #[test]
    fn idle_dispatcher_yields_to_queued_work() {
        let counters = Arc::new(Counters::default());
        let (local, remote) = UnixStream::pair().unwrap();
        let dispatcher = Dispatcher::new(
            ServerConnection::new("idle-peer", local, 8, quick()),
            SessionContext::new(Arc::new(factory(Arc::clone(&counters)))),
            ShutdownHandle::default(),
            Duration::from_secs(2),
        );

        let pool = WorkPool::new("yield", 1);
        let spawner = pool.spawner();
        pool.add_task(move || dispatcher.run(spawner));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.add_task(move || flag.store(true, Ordering::SeqCst));

        let start = Instant::now();
        pool.add_threads(1);
        while !ran.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        drop(remote);
        pool.terminate(false);
    }

    #[test]
    fn short_declared_size_closes_connection() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        exchange(&mut dispatcher, &mut peer, Message::Init);

        let mut frame = load("net").to_bytes().unwrap();
        let short = frame.len() as u32 - 1;
        frame[12..16].copy_from_slice(&short.to_le_bytes());
        peer.send(&frame).unwrap();

        assert_eq!(dispatcher.run_cycle(), DispatchState::Closed);
        assert_eq!(Counters::get(&counters.loads), 0);
    }

    #[test]
    fn unknown_kind_closes_connection() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, peer) = dispatcher(&counters);

        let mut frame = Message::Ping.to_bytes().unwrap();
        frame[8..12].copy_from_slice(&10u32.to_le_bytes());
        let mut stream = peer.into_inner();
        stream.write_all(&frame).unwrap();

        assert_eq!(dispatcher.run_cycle(), DispatchState::Closed);
    }

    #[test]
    fn close_connection_message_ends_session() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        exchange(&mut dispatcher, &mut peer, Message::Init);

        peer.write_message(&Message::CloseConnection).unwrap();
        assert_eq!(dispatcher.run_cycle(), DispatchState::Closed);

        drop(dispatcher);
        assert_eq!(Counters::get(&counters.released), 1);
    }

    #[test]
    fn disconnect_releases_session_exactly_once() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        exchange(&mut dispatcher, &mut peer, Message::Init);
        exchange(&mut dispatcher, &mut peer, load("net"));

        let pool = WorkPool::new("release", 1);
        pool.add_threads(1);
        drop(peer);
        let spawner = pool.spawner();
        pool.add_task(move || dispatcher.run(spawner));

        let start = Instant::now();
        while Counters::get(&counters.released) == 0 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(2));
        }
        pool.terminate(false);

        assert_eq!(Counters::get(&counters.released), 1);
        assert_eq!(Counters::get(&counters.unloads), 1);
        assert_eq!(pool.pending_tasks(), 0);
    }

    #[test]
    fn close_server_message_sets_shutdown() {
        let counters = Arc::new(Counters::default());
        let (mut dispatcher, mut peer) = dispatcher(&counters);
        let handle = dispatcher.shutdown.clone();

        peer.write_message(&Message::CloseServer).unwrap();
        assert_eq!(dispatcher.run_cycle(), DispatchState::Closed);
        assert!(handle.is_shutdown());
    }

    #[test]
    fn server_stops_when_shutdown_requested() {
        let counters = Arc::new(Counters::default());
        let config = ServerConfig {
            max_threads: 2,
            drain_interval_ms: 5,
            ..Default::default()
        };
        let server = DeviceServer::new(config, factory(Arc::clone(&counters)));
        let handle = server.shutdown_handle();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = thread::spawn(move || server.serve(listener));

        let mut client = ProtocolTransport::new(TcpStream::connect(addr).unwrap(), quick());
        client.write_message(&Message::Init).unwrap();
        let mut reply = None;
        let start = Instant::now();
        while reply.is_none() && start.elapsed() < Duration::from_secs(5) {
            reply = client.read_message().ok();
        }
        assert_eq!(reply, Some(Message::Ack(MessageKind::Init)));

        handle.shutdown();
        serving.join().unwrap().unwrap();
        assert_eq!(Counters::get(&counters.released), 1);
    }
}
