//! Backend collaborators for `sync-core`: the dashboard's REST message
//! endpoints and its `/ws` push channel.

use std::{sync::Arc, time::Duration};

use sync_core::{SyncError, SyncErrorCategory};
use sync_platform::{CredentialStore, CredentialStoreError, ScopedCredentialStore};
use url::Url;

mod http;
mod push;

pub use http::HttpMessageApi;
pub use push::WsPushTransport;

/// Credential store shared by the HTTP and WebSocket clients.
pub type SharedCredentials = ScopedCredentialStore<Arc<dyn CredentialStore>>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Resolved backend locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoints {
    pub api_url: Url,
    pub ws_url: Url,
    pub request_timeout: Duration,
}

impl RemoteEndpoints {
    /// Parse `api_url` and derive the push URL unless `ws_url` is given.
    pub fn new(api_url: &str, ws_url: Option<&str>) -> Result<Self, SyncError> {
        let api_url = parse_url("api_url", api_url)?;
        let ws_url = match ws_url {
            Some(ws_url) => parse_url("ws_url", ws_url)?,
            None => derive_ws_url(&api_url)?,
        };
        Ok(Self {
            api_url,
            ws_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, SyncError> {
    Url::parse(raw.trim()).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_url",
            format!("invalid {field} '{raw}': {err}"),
        )
    })
}

/// Push channel URL for an API base URL: same host, `ws`/`wss`, path `/ws`.
pub fn derive_ws_url(api_url: &Url) -> Result<Url, SyncError> {
    let scheme = match api_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "unsupported_scheme",
                format!("cannot derive a push channel URL from scheme '{other}'"),
            ));
        }
    };

    let mut ws_url = api_url.clone();
    ws_url.set_query(None);
    ws_url.set_fragment(None);
    ws_url.set_scheme(scheme).map_err(|()| {
        SyncError::new(
            SyncErrorCategory::Config,
            "unsupported_scheme",
            format!("cannot switch '{api_url}' to {scheme}"),
        )
    })?;
    ws_url
        .path_segments_mut()
        .map_err(|()| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_url",
                format!("'{api_url}' cannot be a base URL"),
            )
        })?
        .pop_if_empty()
        .push("ws");
    Ok(ws_url)
}

/// Bearer token for `api_url`; a missing token means unauthenticated access.
pub(crate) fn load_token(credentials: &SharedCredentials, api_url: &Url) -> Result<Option<String>, SyncError> {
    credentials
        .api_token(api_url.as_str())
        .map_err(|err| map_credential_error("load_token", api_url.as_str(), err))
}

fn map_credential_error(operation: &str, api_url: &str, err: CredentialStoreError) -> SyncError {
    match err {
        CredentialStoreError::NotFound => SyncError::new(
            SyncErrorCategory::Auth,
            "token_not_found",
            format!("no API token stored for '{api_url}' during {operation}"),
        ),
        CredentialStoreError::Unavailable(message) => SyncError::new(
            SyncErrorCategory::Storage,
            "credential_store_unavailable",
            format!("credential store unavailable during {operation}: {message}"),
        ),
        CredentialStoreError::Backend(message) => SyncError::new(
            SyncErrorCategory::Storage,
            "credential_store_error",
            format!("credential store backend error during {operation}: {message}"),
        ),
    }
}
