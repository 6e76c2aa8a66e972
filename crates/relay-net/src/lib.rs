pub mod config;
pub mod connection;
pub mod error;
pub mod metadata;
pub mod room;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::RelayError;
pub use server::Server;

pub type RelayResult<T> = Result<T, RelayError>;
