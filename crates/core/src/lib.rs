pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod registry;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::InterleaveConfig;
pub use descriptor::{PassthroughHandler, SocketDescriptor};
pub use endpoint::{
    AuxHandler, Binding, MediaEndpoint, PacketHandler, PayloadProgress, PendingFrame,
    ReceivedPacket, UnbindHandler,
};
pub use error::{InterleaveError, Result};
pub use framing::{CLOSE_SENTINEL, ERROR_SENTINEL, FrameHeader, ParserState, encode_frame};
pub use registry::SocketRegistry;
pub use scheduler::{PollingScheduler, ReadinessScheduler};
pub use transport::{
    AsyncRead, AsyncStreamSocket, AsyncWrite, StreamSocket, StreamTransport, TransportKey,
    UdpFallback,
};
