//! Pickle key storage on both sides of the boundary.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{info, warn};

use lore_core::errors::BridgeError;
use lore_core::ids::{DeviceId, UserId};
use lore_core::index::KeyStore;
use lore_core::keys::{KeyOwner, PickleKey};
use lore_store::keys::KeyRepo;
use lore_store::Database;

use crate::channel::BridgeClient;
use crate::envelope::KeyRequest;
use crate::secrets::{self, MasterKey, SecretError};

impl From<SecretError> for BridgeError {
    fn from(e: SecretError) -> Self {
        BridgeError::Engine(format!("key store: {e}"))
    }
}

/// Privileged key store: one sealed row per `(user_id, device_id)`.
pub struct EncryptedKeyStore {
    repo: KeyRepo,
    master: MasterKey,
}

impl EncryptedKeyStore {
    pub fn new(db: Database, master: MasterKey) -> Self {
        Self {
            repo: KeyRepo::new(db),
            master,
        }
    }
}

/// Ciphertext is bound to its owner so a row copied to another owner fails
/// to open.
fn context(owner: &KeyOwner) -> String {
    format!("{}|{}", owner.user_id, owner.device_id)
}

#[async_trait]
impl KeyStore for EncryptedKeyStore {
    async fn get_pickle_key(&self, owner: &KeyOwner) -> Result<Option<PickleKey>, BridgeError> {
        let Some(sealed) = self.repo.get(owner)? else {
            return Ok(None);
        };
        let secret = self.master.open(&sealed, &context(owner))?;
        Ok(Some(PickleKey::new(secret.expose_secret())))
    }

    async fn create_pickle_key(&self, owner: &KeyOwner) -> Result<PickleKey, BridgeError> {
        let secret = secrets::random_pickle_key();
        let sealed = self.master.seal(secret.expose_secret(), &context(owner))?;
        self.repo.put(owner, &sealed)?;
        info!(user_id = %owner.user_id, device_id = %owner.device_id, "pickle key created");
        Ok(PickleKey::new(secret.expose_secret()))
    }

    async fn destroy_pickle_key(&self, owner: &KeyOwner) -> Result<(), BridgeError> {
        let removed = self.repo.delete(owner)?;
        info!(user_id = %owner.user_id, device_id = %owner.device_id, removed, "pickle key destroyed");
        Ok(())
    }
}

/// Unprivileged side. Any failure degrades to "no key" so a broken key
/// store never blocks login.
#[derive(Clone)]
pub struct KeyStoreClient {
    client: BridgeClient,
}

impl KeyStoreClient {
    pub fn new(client: BridgeClient) -> Self {
        Self { client }
    }

    pub async fn get_pickle_key(&self, user_id: &UserId, device_id: &DeviceId) -> Option<PickleKey> {
        let owner = KeyOwner::new(user_id.clone(), device_id.clone());
        match self
            .client
            .request::<_, Option<String>>(&KeyRequest::GetPickleKey(owner))
            .await
        {
            Ok(key) => key.map(PickleKey::new),
            Err(e) => {
                warn!(user_id = %user_id, device_id = %device_id, error = %e, "get pickle key failed");
                None
            }
        }
    }

    pub async fn create_pickle_key(&self, user_id: &UserId, device_id: &DeviceId) -> Option<PickleKey> {
        let owner = KeyOwner::new(user_id.clone(), device_id.clone());
        match self
            .client
            .request::<_, String>(&KeyRequest::CreatePickleKey(owner))
            .await
        {
            Ok(key) => Some(PickleKey::new(key)),
            Err(e) => {
                warn!(user_id = %user_id, device_id = %device_id, error = %e, "create pickle key failed");
                None
            }
        }
    }

    pub async fn destroy_pickle_key(&self, user_id: &UserId, device_id: &DeviceId) {
        let owner = KeyOwner::new(user_id.clone(), device_id.clone());
        if let Err(e) = self
            .client
            .request::<_, serde_json::Value>(&KeyRequest::DestroyPickleKey(owner))
            .await
        {
            warn!(user_id = %user_id, device_id = %device_id, error = %e, "destroy pickle key failed");
        }
    }
}
