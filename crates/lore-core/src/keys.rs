use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, UserId};

/// Secret protecting serialized end-to-end session state.
/// Redacted in Debug; zeroized on drop.
#[derive(Clone)]
pub struct PickleKey(SecretString);

impl PickleKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PickleKey([REDACTED])")
    }
}

/// Who a pickle key belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyOwner {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl KeyOwner {
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self { user_id, device_id }
    }
}
