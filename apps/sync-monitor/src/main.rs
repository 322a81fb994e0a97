//! Headless follower: opens one conversation, keeps it live over the push
//! channel and logs every reconciled change.

mod config;
mod logging;

use std::{collections::HashMap, process::ExitCode, sync::Arc};

use sync_core::{
    ChannelManager, ConversationSnapshot, ConversationSync, DeliveryState, MessageId, SyncError,
};
#[cfg(not(feature = "os-keyring"))]
use sync_platform::InMemoryCredentialStore;
#[cfg(feature = "os-keyring")]
use sync_platform::OsKeyringCredentialStore;
use sync_platform::{CredentialStore, CredentialStoreError, DEFAULT_SERVICE, ScopedCredentialStore};
use sync_remote::{HttpMessageApi, RemoteEndpoints, SharedCredentials, WsPushTransport};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, MonitorConfig};

#[derive(Debug, Error)]
enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("credential store: {0}")]
    Credentials(#[from] CredentialStoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "sync monitor failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), MonitorError> {
    let config = MonitorConfig::from_env()?;
    let credentials = credential_store(&config)?;
    let endpoints = RemoteEndpoints::new(&config.api_url, config.ws_url.as_deref())?;
    info!(api_url = %endpoints.api_url, ws_url = %endpoints.ws_url, "starting sync monitor");

    let api = Arc::new(HttpMessageApi::new(&endpoints, credentials.clone())?);
    let transport = Arc::new(WsPushTransport::new(&endpoints, credentials));
    let channel = ChannelManager::from_config(transport, &config.sync);
    let engine = ConversationSync::new(api, config.sync.clone());
    let _subscription = engine.attach(&channel);
    channel.connect().await;

    if let Some(contact_id) = config.contact_id.as_deref() {
        match engine.open_conversation(contact_id).await {
            Ok(window) => info!(
                contact_id,
                loaded = window.messages.len(),
                has_older = window.has_older,
                "conversation opened"
            ),
            Err(err) => warn!(contact_id, error = %err, "initial load failed"),
        }
    } else {
        info!("WACHAT_CONTACT not set; following the push channel only");
    }

    follow(&engine, &channel).await;
    channel.disconnect().await;
    info!("sync monitor stopped");
    Ok(())
}

fn credential_store(config: &MonitorConfig) -> Result<SharedCredentials, MonitorError> {
    #[cfg(feature = "os-keyring")]
    let store: Arc<dyn CredentialStore> = Arc::new(OsKeyringCredentialStore);
    #[cfg(not(feature = "os-keyring"))]
    let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::default());

    let scoped = ScopedCredentialStore::new(store, DEFAULT_SERVICE);
    if let Some(token) = config.token.as_deref() {
        scoped.store_api_token(&config.api_url, token)?;
        debug!(service = scoped.service(), "seeded API token");
    }
    Ok(scoped)
}

async fn follow(engine: &ConversationSync<HttpMessageApi>, channel: &ChannelManager) {
    let mut updates = engine.updates();
    let mut status = channel.status();
    let mut seen: HashMap<MessageId, DeliveryState> = HashMap::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    log_snapshot(&engine.snapshot(), &mut seen);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                info!(phase = ?current.phase, attempt = current.attempt, retry_in_ms = ?current.retry_in_ms, "push channel status");
                engine.handle_channel_status(&current);
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                updates.borrow_and_update();
                log_snapshot(&engine.snapshot(), &mut seen);
            }
        }
    }
}

fn log_snapshot(snapshot: &ConversationSnapshot, seen: &mut HashMap<MessageId, DeliveryState>) {
    for message in &snapshot.messages {
        match seen.insert(message.id.clone(), message.delivery) {
            None => info!(
                contact_id = %message.contact_id,
                id = %message.id,
                direction = ?message.direction,
                delivery = ?message.delivery,
                body = %message.body,
                "message"
            ),
            Some(previous) if previous != message.delivery => info!(
                id = %message.id,
                from = ?previous,
                to = ?message.delivery,
                "delivery changed"
            ),
            Some(_) => {}
        }
    }
    // Provisional entries disappear once their confirmed copy lands.
    seen.retain(|id, _| snapshot.messages.iter().any(|message| &message.id == id));

    debug!(
        revision = snapshot.revision,
        status = %snapshot.status_text,
        messages = snapshot.messages.len(),
        has_older = snapshot.has_older,
        "view updated"
    );
    if let Some(error_text) = snapshot.error_text.as_deref() {
        warn!(error = error_text, "conversation error");
    }
    if let Some(notice) = snapshot.notice.as_ref() {
        warn!(id = %notice.message_id, code = %notice.code, "{}", notice.text);
    }
}
