//! Attachment storage adapter.
//!
//! Construction validates the options and starts the credential exchange
//! in the background.  Until the exchange finishes the adapter is
//! `Connecting`: operations issued in that window are queued and replayed
//! one at a time, in arrival order, right after the transition.  The
//! transition happens exactly once, to `Connected` or `Failed`, and a
//! failed adapter rejects every queued and later operation with
//! [`AdapterError::Authentication`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::attachment::{object_key_from_url, upload_headers, Attachment};
use crate::client::{open_byte_source, Authenticator, StorageClient};
use crate::config::{AdapterConfig, AdapterOptions};
use crate::errors::{AdapterError, Result};
use crate::gcs::ServiceAccountAuthenticator;
use crate::metrics;

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    /// The credential exchange failed; carries the reason.
    Failed(String),
}

/// An operation deferred until the adapter is connected.
enum Operation {
    Save(Attachment, oneshot::Sender<Result<String>>),
    Remove(String, oneshot::Sender<Result<()>>),
}

enum ConnectionState {
    Connecting { pending: VecDeque<Operation> },
    Connected(Arc<dyn StorageClient>),
    Failed(String),
}

/// Either a client to use now, or a receiver for a queued result.
enum Dispatch<T> {
    Ready(Arc<dyn StorageClient>),
    Queued(oneshot::Receiver<Result<T>>),
}

struct Shared {
    config: AdapterConfig,
    state: Mutex<ConnectionState>,
    status: watch::Sender<Status>,
}

/// Saves and removes attachments in a Cloud Storage bucket.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct StorageAdapter {
    shared: Arc<Shared>,
    status: watch::Receiver<Status>,
}

impl StorageAdapter {
    /// Validate `options` and begin authenticating with `authenticator`.
    ///
    /// Returns as soon as the options are validated; the credential
    /// exchange runs on the current tokio runtime.
    pub fn new<A: Authenticator>(options: AdapterOptions, authenticator: A) -> Result<Self> {
        let config = options.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            AdapterError::Configuration(format!("an async runtime is required: {e}"))
        })?;

        let (status_tx, status_rx) = watch::channel(Status::Connecting);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(ConnectionState::Connecting {
                pending: VecDeque::new(),
            }),
            status: status_tx,
        });

        runtime.spawn(Arc::clone(&shared).establish(authenticator));

        Ok(Self {
            shared,
            status: status_rx,
        })
    }

    /// Like [`StorageAdapter::new`], authenticating against Google with
    /// the configured service-account key.
    pub fn connect(options: AdapterOptions) -> Result<Self> {
        let authenticator = ServiceAccountAuthenticator::new()?;
        Self::new(options, authenticator)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.shared.config
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Number of operations waiting for the connection.
    pub fn pending_operations(&self) -> usize {
        match &*self.shared.lock_state() {
            ConnectionState::Connecting { pending } => pending.len(),
            _ => 0,
        }
    }

    /// Wait until the credential exchange has finished.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| *s != Status::Connecting)
            .await
            .map_err(|_| abandoned())?;
        match &*settled {
            Status::Failed(reason) => Err(AdapterError::Authentication(reason.clone())),
            _ => Ok(()),
        }
    }

    /// Upload `attachment` and return its public URL.
    ///
    /// Exactly one upload request is made per call.
    pub async fn save(&self, attachment: &Attachment) -> Result<String> {
        let dispatch = self
            .shared
            .dispatch(|tx| Operation::Save(attachment.clone(), tx))?;
        match dispatch {
            Dispatch::Ready(client) => self.shared.upload(client.as_ref(), attachment).await,
            Dispatch::Queued(rx) => rx.await.map_err(|_| abandoned())?,
        }
    }

    /// Delete the stored copy of `attachment`.
    ///
    /// Does nothing when the attachment has no URL.
    pub async fn remove(&self, attachment: &Attachment) -> Result<()> {
        let Some(url) = attachment.stored_url() else {
            debug!("remove: attachment has no url, nothing to delete");
            return Ok(());
        };
        let dispatch = self
            .shared
            .dispatch(|tx| Operation::Remove(url.to_string(), tx))?;
        match dispatch {
            Dispatch::Ready(client) => self.shared.delete(client.as_ref(), url).await,
            Dispatch::Queued(rx) => rx.await.map_err(|_| abandoned())?,
        }
    }
}

fn abandoned() -> AdapterError {
    AdapterError::Authentication("credential exchange was abandoned".to_string())
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().expect("adapter state mutex poisoned")
    }

    fn dispatch<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Operation,
    ) -> Result<Dispatch<T>> {
        let mut state = self.lock_state();
        match &mut *state {
            ConnectionState::Connected(client) => Ok(Dispatch::Ready(Arc::clone(client))),
            ConnectionState::Failed(reason) => Err(AdapterError::Authentication(reason.clone())),
            ConnectionState::Connecting { pending } => {
                let (tx, rx) = oneshot::channel();
                pending.push_back(make(tx));
                metrics::pending_queued();
                debug!("Queued operation until connected ({} pending)", pending.len());
                Ok(Dispatch::Queued(rx))
            }
        }
    }

    /// Run the credential exchange and perform the single state transition.
    async fn establish<A: Authenticator>(self: Arc<Self>, authenticator: A) {
        info!(
            "Authenticating {} for bucket {}",
            self.config.issuer(),
            self.config.bucket()
        );

        let result = authenticator
            .authenticate(
                self.config.issuer(),
                self.config.scope(),
                self.config.credential(),
            )
            .await;
        metrics::record_auth(&result);

        let (next, status) = match &result {
            Ok(client) => (ConnectionState::Connected(Arc::clone(client)), Status::Connected),
            Err(e) => {
                let reason = format!("{e:#}");
                (ConnectionState::Failed(reason.clone()), Status::Failed(reason))
            }
        };

        let pending = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, next) {
                ConnectionState::Connecting { pending } => pending,
                _ => VecDeque::new(),
            }
        };
        metrics::pending_drained(pending.len());
        self.status.send_replace(status);

        match result {
            Ok(client) => {
                info!(
                    "Connected to bucket {}; replaying {} queued operation(s)",
                    self.config.bucket(),
                    pending.len()
                );
                for op in pending {
                    self.run(client.as_ref(), op).await;
                }
            }
            Err(e) => {
                warn!(
                    "Credential exchange for {} failed: {:#}; rejecting {} queued operation(s)",
                    self.config.issuer(),
                    e,
                    pending.len()
                );
                let reason = format!("{e:#}");
                for op in pending {
                    let err = AdapterError::Authentication(reason.clone());
                    match op {
                        Operation::Save(_, tx) => {
                            let _ = tx.send(Err(err));
                        }
                        Operation::Remove(_, tx) => {
                            let _ = tx.send(Err(err));
                        }
                    }
                }
            }
        }
    }

    /// Execute a queued operation and hand its result to the waiting caller.
    async fn run(&self, client: &dyn StorageClient, op: Operation) {
        match op {
            Operation::Save(attachment, tx) => {
                let result = self.upload(client, &attachment).await;
                let _ = tx.send(result);
            }
            Operation::Remove(url, tx) => {
                let result = self.delete(client, &url).await;
                let _ = tx.send(result);
            }
        }
    }

    async fn upload(&self, client: &dyn StorageClient, attachment: &Attachment) -> Result<String> {
        let key = self.config.destination_key(attachment);
        let result = self.try_upload(client, attachment, &key).await;
        metrics::record_upload(&result);
        match &result {
            Ok(url) => info!("Stored {} as {}", attachment.path.display(), url),
            Err(e) => warn!("Failed to store {} as {}: {}", attachment.path.display(), key, e),
        }
        result
    }

    async fn try_upload(
        &self,
        client: &dyn StorageClient,
        attachment: &Attachment,
        key: &str,
    ) -> Result<String> {
        let headers = upload_headers(attachment, &self.config)?;
        let body = open_byte_source(&attachment.path).await?;
        let response = client
            .upload_stream(body, self.config.bucket(), key, headers)
            .await?;
        Ok(response.url)
    }

    async fn delete(&self, client: &dyn StorageClient, url: &str) -> Result<()> {
        let key = object_key_from_url(url);
        let result = client
            .delete_object(self.config.bucket(), &key)
            .await
            .map_err(AdapterError::from);
        metrics::record_delete(&result);
        match &result {
            Ok(()) => info!("Removed {} from bucket {}", key, self.config.bucket()),
            Err(e) => warn!("Failed to remove {}: {}", key, e),
        }
        result
    }
}
