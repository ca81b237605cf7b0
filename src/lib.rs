pub mod addr;
pub mod channel;
pub mod config;
pub mod discovery;
#[cfg(unix)]
pub mod driver;
pub mod error;
mod process;
pub mod sortlist;
pub mod transport;
pub mod wire;

pub use addr::ServerSpec;
pub use channel::{Channel, Interest, QueryCallback, QueryId, QueryOutcome};
pub use config::{ChannelConfig, ChannelOptions};
pub use error::{DnsError, Result};
pub use transport::{SocketHandle, SysTransport, Transport};
pub use wire::{RecordClass, RecordType};
