//! Request/acknowledge calls against a device server.
//!
//! The server keeps session state per socket, so a whole
//! INIT → LOAD_BINARY → INPUT_DATA → INFER sequence has to run on one checked-out socket.
//! [`DeviceClient::session`] claims that socket and hands back a [`Session`] that issues
//! the calls. When a call fails on the wire, the session reopens its socket, replays the
//! requests that built up the server-side state, and tries again.
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::config::ClientConfig;

use super::{
    connection::{Checkout, ClientConnection, ConnectionError, Connector, PoolOptions, TcpConnector},
    message::{Message, MessageKind, Payload},
    transport::TransportError,
};

/// Attempts made for each call before it fails.
pub const SOCKET_RETRY: u32 = 10;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server could not satisfy {0:?}")]
    Rejected(MessageKind),

    #[error("expected a reply to {expected:?}, got {got}")]
    Unexpected { expected: MessageKind, got: String },

    #[error("expected {expected} output bytes, received {received}")]
    ShortOutput { expected: usize, received: usize },

    #[error("{kind:?} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        kind: MessageKind,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

pub struct DeviceClient<C: Connector = TcpConnector> {
    connection: ClientConnection<C>,
    retries: u32,
}

impl DeviceClient<TcpConnector> {
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::with_connector(
            TcpConnector::new(config.server),
            config.pool_options(),
            config.call_retries,
        )
    }
}

impl<C: Connector> DeviceClient<C> {
    pub fn with_connector(
        connector: C,
        options: PoolOptions,
        retries: u32,
    ) -> Result<Self, ClientError> {
        let connection = ClientConnection::open(connector, options)?;
        Ok(Self {
            connection,
            retries: retries.max(1),
        })
    }

    /// Claims a socket for a sequence of calls. Blocks while every socket is in use.
    pub fn session(&self) -> Result<Session<'_, C>, ClientError> {
        let checkout = self.connection.lock()?;
        Ok(Session {
            checkout,
            retries: self.retries,
            initialized: false,
            binary: None,
            input: None,
        })
    }

    pub fn connection(&self) -> &ClientConnection<C> {
        &self.connection
    }

    /// Runs the full call sequence on one session and returns the output bytes.
    pub fn run_inference(
        &self,
        tag: &str,
        image: Vec<u8>,
        input: Vec<u8>,
        output_size: usize,
    ) -> Result<Vec<u8>, ClientError> {
        let mut session = self.session()?;
        session.init()?;
        session.load_binary(tag, image)?;
        session.send_input(input)?;
        let output = session.infer(output_size)?;
        session.unlock();
        Ok(output)
    }
}

/// One claimed socket and the server-side state built on it.
pub struct Session<'a, C: Connector> {
    checkout: Checkout<'a, C>,
    retries: u32,
    initialized: bool,
    binary: Option<Message>,
    input: Option<Message>,
}

impl<C: Connector> Session<'_, C> {
    pub fn init(&mut self) -> Result<(), ClientError> {
        let reply = self.exchange(&Message::Init)?;
        expect_ack(MessageKind::Init, reply)?;
        self.initialized = true;
        Ok(())
    }

    pub fn num_devices(&mut self) -> Result<i64, ClientError> {
        match self.exchange(&Message::NumDevices(0))? {
            Message::NumDevices(count) => Ok(count),
            other => Err(reply_error(MessageKind::NumDevices, other)),
        }
    }

    pub fn max_devices(&mut self) -> Result<i64, ClientError> {
        match self.exchange(&Message::MaxDevices(0))? {
            Message::MaxDevices(count) => Ok(count),
            other => Err(reply_error(MessageKind::MaxDevices, other)),
        }
    }

    /// Sends a compiled binary image. The server skips the load when `tag` matches the
    /// image it already holds for this session.
    pub fn load_binary(&mut self, tag: &str, image: Vec<u8>) -> Result<(), ClientError> {
        let request = Message::LoadBinary(Payload::new(tag, image));
        let reply = self.exchange(&request)?;
        expect_ack(MessageKind::LoadBinary, reply)?;
        debug!("binary image '{tag}' accepted");
        self.binary = Some(request);
        self.input = None;
        Ok(())
    }

    pub fn send_input(&mut self, data: Vec<u8>) -> Result<(), ClientError> {
        let request = Message::InputData(Payload::untagged(data));
        let reply = self.exchange(&request)?;
        expect_ack(MessageKind::InputData, reply)?;
        self.input = Some(request);
        Ok(())
    }

    /// Runs the loaded image on the last input and returns exactly `output_size` bytes.
    pub fn infer(&mut self, output_size: usize) -> Result<Vec<u8>, ClientError> {
        let request = Message::Infer {
            output_size: output_size as u64,
        };
        let payload = match self.exchange(&request)? {
            Message::OutputData(payload) => payload,
            other => return Err(reply_error(MessageKind::Infer, other)),
        };
        if payload.data.len() != output_size {
            return Err(ClientError::ShortOutput {
                expected: output_size,
                received: payload.data.len(),
            });
        }

        if let Err(e) = self
            .checkout
            .send_message(&Message::Ack(MessageKind::OutputData))
        {
            warn!("output acknowledgement not sent: {e}");
        }
        Ok(payload.data)
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        let reply = self.exchange(&Message::Ping)?;
        expect_ack(MessageKind::Ping, reply)
    }

    /// Asks the server to shut down, then closes this socket.
    pub fn close_server(mut self) -> Result<(), ClientError> {
        self.checkout.send_message(&Message::CloseServer)?;
        info!("requested server shutdown");
        self.checkout.close();
        Ok(())
    }

    /// Ends the session and closes its socket for good.
    pub fn close(self) {
        self.checkout.close();
    }

    /// Returns the socket to the pool. The server keeps the session state on it.
    pub fn unlock(self) {
        self.checkout.unlock();
    }

    fn exchange(&mut self, request: &Message) -> Result<Message, ClientError> {
        let kind = request.kind();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let resumed = match attempt {
                1 => Ok(()),
                _ => match self.replay() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(refused)) => return Err(refused),
                    Err(e) => Err(e),
                },
            };
            match resumed.and_then(|()| round_trip(&mut self.checkout, request)) {
                Ok(reply) => return Ok(reply),
                Err(source) if attempt >= self.retries => {
                    return Err(ClientError::RetriesExhausted {
                        kind,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!("{kind:?} attempt {attempt} failed: {e}");
                    self.checkout.restart()?;
                }
            }
        }
    }

    /// Rebuilds the server-side session on a fresh socket. The outer error is a wire
    /// failure worth another attempt; the inner one is the server refusing a replayed
    /// request.
    fn replay(&mut self) -> Result<Result<(), ClientError>, TransportError> {
        let init = self.initialized.then_some(Message::Init);
        for request in init.iter().chain(&self.binary).chain(&self.input) {
            let reply = round_trip(&mut self.checkout, request)?;
            if let Err(e) = expect_ack(request.kind(), reply) {
                warn!("server refused replayed {:?}: {e}", request.kind());
                return Ok(Err(e));
            }
            trace!("replayed {:?}", request.kind());
        }
        Ok(Ok(()))
    }
}

fn round_trip<C: Connector>(
    checkout: &mut Checkout<'_, C>,
    request: &Message,
) -> Result<Message, TransportError> {
    checkout.send_message(request)?;
    checkout.receive_message()
}

fn expect_ack(expected: MessageKind, reply: Message) -> Result<(), ClientError> {
    match reply {
        Message::Ack(kind) if kind == expected => Ok(()),
        other => Err(reply_error(expected, other)),
    }
}

fn reply_error(expected: MessageKind, reply: Message) -> ClientError {
    match reply {
        Message::Fail => ClientError::Rejected(expected),
        Message::Ack(kind) => ClientError::Unexpected {
            expected,
            got: format!("Ack({kind:?})"),
        },
        other => ClientError::Unexpected {
            expected,
            got: format!("{:?}", other.kind()),
        },
    }
}
