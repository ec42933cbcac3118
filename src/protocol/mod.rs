//! Client-server offload protocol.
//!
//! This module defines how a client hands a compiled binary image, an input tensor and an
//! execute request to a server that hosts an accelerator, and how the result comes back.
//! Everything runs over plain byte-stream sockets.
//!
//! # Overview
//!
//! The protocol layer is split from the leaves up:
//!
//! - [`message`]: wire framing for a closed set of message kinds. Pure encode/decode logic
//!   with no socket ownership.
//! - [`transport`]: sends and receives whole frames on one stream, treating zero-byte
//!   transfers as stalls with a bounded retry budget.
//! - [`connection`]: one logical remote endpoint. Clients keep a pool of outbound sockets
//!   checked out per call; servers multiplex the sockets accepted from one peer with
//!   readiness polling.
//! - [`thread`]: a bounded worker pool draining a FIFO task queue.
//! - [`server`]: accepts peers and runs one self-resubmitting dispatcher per connection on
//!   the pool.
//! - [`client`]: request/acknowledge calls with reconnect on transient failure.
//!
//! # Binary Format
//!
//! Every frame starts with a 16 byte header:
//!
//! - `magic` (u64): the constant [`MAGIC`], checked before anything else is trusted.
//! - `kind` (u32): a [`MessageKind`] discriminant.
//! - `size` (u32): total frame length including the header.
//!
//! Kind-specific fields follow. LOAD_BINARY, INPUT_DATA and OUTPUT_DATA carry a tag length
//! and a data length (both u64) ahead of the tag and data bytes. All integers are
//! fixed-width little-endian.
//!
//! # Call Sequence
//!
//! 1. INIT → ACK(INIT)
//! 2. NUM_DEVICES / MAX_DEVICES → count (optional)
//! 3. LOAD_BINARY → ACK(LOAD_BINARY) or FAIL
//! 4. INPUT_DATA → ACK(INPUT_DATA)
//! 5. INFER → OUTPUT_DATA, answered with ACK(OUTPUT_DATA)
//! 6. CLOSE_CONNECTION, no reply
pub mod client;
pub mod connection;
pub mod message;
pub mod server;
pub mod thread;
pub mod transport;

pub use client::{ClientError, DeviceClient, SOCKET_RETRY, Session};
pub use connection::{
    Checkout, ClientConnection, ConnectionError, Connector, MAX_CONNECT_RETRY, PollGuard,
    PoolOptions, ServerConnection, Socket, SOCKET_STEP, TcpConnector,
};
pub use message::{FrameBuffer, MAGIC, Message, MessageError, MessageKind, Payload};
pub use server::{DeviceServer, DispatchState, Dispatcher, ServerError, SessionContext, ShutdownHandle};
pub use thread::{Spawner, WorkPool};
pub use transport::{MESSAGE_RETRY, ProtocolTransport, RetryPolicy, TransportError};
