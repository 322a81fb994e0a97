//! Persistent credential storage for the dashboard backend token.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// Default keyring service name.
pub const DEFAULT_SERVICE: &str = "wachat-sync";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    #[error("credential not found")]
    NotFound,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
}

/// Key/value credential backend addressed by `(service, account)`.
pub trait CredentialStore: Send + Sync {
    fn set_credential(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError>;

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError>;

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError>;
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    fn set_credential(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        (**self).set_credential(service, account, secret)
    }

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        (**self).get_credential(service, account)
    }

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        (**self).delete_credential(service, account)
    }
}

/// Account name under which the bearer token for `api_url` is stored.
///
/// Trailing slashes are ignored so `http://host/` and `http://host` share a
/// token.
pub fn token_account_for(api_url: &str) -> String {
    format!("api-token:{}", api_url.trim().trim_end_matches('/'))
}

/// Process-local store, used in tests and when no OS keyring is built in.
#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn set_credential(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert((service.to_owned(), account.to_owned()), secret.to_owned());
        Ok(())
    }

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(&(service.to_owned(), account.to_owned()))
            .cloned()
            .ok_or(CredentialStoreError::NotFound)
    }

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.remove(&(service.to_owned(), account.to_owned()))
            .map(|_| ())
            .ok_or(CredentialStoreError::NotFound)
    }
}

#[cfg(feature = "os-keyring")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyringCredentialStore;

#[cfg(feature = "os-keyring")]
fn keyring_entry(service: &str, account: &str) -> Result<keyring::Entry, CredentialStoreError> {
    keyring::Entry::new(service, account).map_err(|err| match err {
        keyring::Error::NoStorageAccess(inner) | keyring::Error::PlatformFailure(inner) => {
            CredentialStoreError::Unavailable(inner.to_string())
        }
        other => CredentialStoreError::Backend(other.to_string()),
    })
}

#[cfg(feature = "os-keyring")]
fn map_keyring_error(err: keyring::Error) -> CredentialStoreError {
    match err {
        keyring::Error::NoEntry => CredentialStoreError::NotFound,
        keyring::Error::NoStorageAccess(inner) => CredentialStoreError::Unavailable(inner.to_string()),
        other => CredentialStoreError::Backend(other.to_string()),
    }
}

#[cfg(feature = "os-keyring")]
impl CredentialStore for OsKeyringCredentialStore {
    fn set_credential(&self, service: &str, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        keyring_entry(service, account)?
            .set_password(secret)
            .map_err(map_keyring_error)
    }

    fn get_credential(&self, service: &str, account: &str) -> Result<String, CredentialStoreError> {
        keyring_entry(service, account)?
            .get_password()
            .map_err(map_keyring_error)
    }

    fn delete_credential(&self, service: &str, account: &str) -> Result<(), CredentialStoreError> {
        keyring_entry(service, account)?
            .delete_credential()
            .map_err(map_keyring_error)
    }
}

/// Store bound to one service name.
#[derive(Clone)]
pub struct ScopedCredentialStore<S: CredentialStore> {
    inner: S,
    service: String,
}

impl<S: CredentialStore> ScopedCredentialStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set(&self, account: &str, secret: &str) -> Result<(), CredentialStoreError> {
        self.inner.set_credential(&self.service, account, secret)
    }

    pub fn get(&self, account: &str) -> Result<String, CredentialStoreError> {
        self.inner.get_credential(&self.service, account)
    }

    /// Like [`Self::get`], mapping `NotFound` to `None`.
    pub fn find(&self, account: &str) -> Result<Option<String>, CredentialStoreError> {
        match self.get(account) {
            Ok(secret) => Ok(Some(secret)),
            Err(CredentialStoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, account: &str) -> Result<(), CredentialStoreError> {
        self.inner.delete_credential(&self.service, account)
    }

    /// Bearer token stored for `api_url`, if any.
    pub fn api_token(&self, api_url: &str) -> Result<Option<String>, CredentialStoreError> {
        self.find(&token_account_for(api_url))
    }

    pub fn store_api_token(&self, api_url: &str, token: &str) -> Result<(), CredentialStoreError> {
        self.set(&token_account_for(api_url), token)
    }
}
