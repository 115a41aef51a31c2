// Core modules for the cinderkv key-value store
pub mod error; // ProtocolError, CommandError, WrongType, AofError, DispatchError
pub mod protocol; // RESP Frame codec (wire and on-disk format)
pub mod storage; // Store + Entry/StoredValue with lazy expiry
pub mod aof; // append-only log: replay at startup, append while serving
pub mod dispatch; // Dispatcher: command table, validation, persistence, replies
pub mod config; // Config, FsyncPolicy, env overlay
pub mod net; // bind_reuseport + run_server (mio event loops)

// Re-export all public items from modules for easier access
pub use aof::*;
pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use net::*;
pub use protocol::*;
pub use storage::*;
