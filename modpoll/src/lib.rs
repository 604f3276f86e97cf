pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod modbus;
pub mod mqtt;
pub mod poller;
pub mod publish;
pub mod scheduler;
pub mod shutdown;
pub mod topic;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
