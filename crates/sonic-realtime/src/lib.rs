//! Session streaming protocol engine for bidirectional speech-to-speech
//! inference.
//!
//! A [`StreamEngine`] owns many concurrent sessions. Each session turns
//! caller lifecycle calls into an ordered stream of protocol messages for an
//! [`InferenceTransport`], and fans inbound messages out to per-session
//! handlers, closing the loop on tool calls and tracking token usage along
//! the way.

pub mod audio;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod protocol;
pub mod queue;
mod session;
pub mod telemetry;
pub mod tools;
pub mod transport;
pub mod usage;

pub use codec::{AudioInputConfig, AudioOutputConfig, InferenceConfig, OutboundEvent, TextConfig};
pub use config::{ConfigError, EngineConfig};
pub use dispatch::{EventHandler, EventKind, HandlerKey, SessionEvent};
pub use engine::{StreamEngine, StreamEngineBuilder};
pub use error::{DecodeError, StreamError, TransportError};
pub use protocol::ProtocolStage;
pub use session::SessionOptions;
pub use tools::ToolStage;
pub use transport::{InboundStream, InferenceTransport, OutboundStream};
pub use usage::TurnUsage;
