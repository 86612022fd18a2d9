//! The privilege boundary: envelope codec, transports, the background
//! dispatcher and the foreground proxies that talk to it.

pub mod channel;
pub mod envelope;
pub mod host;
pub mod keystore;
pub mod proxy;
pub mod secrets;
pub mod sso;
pub mod ws;

pub use channel::{BridgeClient, Channel, LocalChannel};
pub use envelope::{Boundary, Envelope, IndexRequest, KeyRequest, PlatformRequest, Reply, WireError};
pub use host::{Host, PlatformInfo};
pub use keystore::{EncryptedKeyStore, KeyStoreClient};
pub use proxy::IndexProxy;
pub use secrets::{MasterKey, SecretError};
pub use sso::{AuthFlow, LoginType, SsoLogin};
pub use ws::{serve, ServerHandle, WsChannel, WsConfig};
