pub mod error;
pub mod loader;
pub mod server;

pub use error::ConfigError;
pub use loader::load_servers;
pub use server::ServerSpec;
