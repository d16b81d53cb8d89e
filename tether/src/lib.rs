//! tether: drive processes, sockets, and a file cache on a remote machine
//! over a single duplex byte pipe.
//!
//! The pipe carries framed logical channels (`mux`), two of which are
//! reserved for a binary command protocol (`protocol`). The issuing side
//! (`client`) sends commands and routes responses to caller handlers by
//! correlation id; the executing side (`executor`) performs the requested
//! OS operations and streams their data back over dynamically allocated
//! channels. `runtime` is the transport-agnostic surface the
//! orchestration layer programs against.

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod mux;
pub mod protocol;
pub mod runtime;

pub use client::{ExecHandler, FilePushHandler, SessionClient, SocketHandler};
pub use config::TransportConfig;
pub use error::{
    ChannelClosed, ProtocolError, RegistryError, RemoteError, TransportError,
};
pub use executor::Executor;
pub use mux::{
    CONTROL_REPLY_ID, CONTROL_REQUEST_ID, ChannelReader, ChannelWriter, Direction, Frame,
    FrameCodec, IdPool, PREAMBLE, Transport, align,
};
pub use protocol::{ControlMessage, EnvEntry, ExitStatus, PushStatus};
pub use runtime::{AcceptedConnection, ProcessHandle, Remote, SocketHandle, TunneledRemote};
