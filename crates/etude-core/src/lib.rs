// src/lib.rs
pub mod accept;
pub mod checksum;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod framing;
pub mod heartbeat;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod packet;
pub mod pool;
pub mod send;
pub mod syscalls;
pub mod threadpool;

// Re-exports for users
pub use checksum::{Checksum, Crc32};
pub use config::{Config, EngineConfig};
pub use conn::ConnHandle;
pub use dispatch::{Dispatcher, MessageHandler, Session};
pub use engine::SocketEngine;
pub use error::{EngineError, EngineResult};
pub use packet::{PKG_HEADER_LEN, PacketHeader};
