//! Remote shell execution against fleet hosts.

mod client;
mod result;
mod transport;

pub use client::{ClientOptions, RemoteClient};
pub use result::StageResult;
pub use transport::{CommandOutput, Connection, Connector, Input, RemoteError, SshConnector};
