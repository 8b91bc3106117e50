pub mod bridge;
pub mod channel;
pub mod correlator;
pub mod framing;
pub mod gateway;
pub mod reconnect;
pub mod security;

pub use bridge::{Bridge, BridgeConfig};
pub use channel::{ChannelEvent, SocketChannel};
pub use correlator::RequestCorrelator;
pub use framing::{encode_frame, FrameDecoder};
pub use gateway::{GatewayServer, RelayGateway, DEFAULT_INVOKE_TIMEOUT};
pub use reconnect::{BackoffPolicy, ConnectionState, Connector, ReconnectState, ReconnectSupervisor};
pub use security::SecurityGate;
