use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared::domain::DocumentId;

use crate::remote::RemoteApi;
use crate::store::{Action, SessionStore};
use crate::Notice;

/// Reconciles locally-known pending documents against the remote source of
/// truth. A polling task exists only while at least one document is
/// pending; it self-terminates within one interval of the last pending
/// document settling and is re-armed by the reactor when any document
/// returns to pending.
pub struct StatusReconciler {
    store: Arc<SessionStore>,
    remote: Arc<dyn RemoteApi>,
    notices: broadcast::Sender<Notice>,
    poll_interval: Duration,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusReconciler {
    pub fn new(
        store: Arc<SessionStore>,
        remote: Arc<dyn RemoteApi>,
        notices: broadcast::Sender<Notice>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            remote,
            notices,
            poll_interval,
            poll_task: Mutex::new(None),
        })
    }

    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = reconciler.store.subscribe();
            loop {
                let pending = rx.borrow_and_update().has_pending_processing();
                if pending {
                    reconciler.ensure_polling().await;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
    }

    async fn ensure_polling(self: &Arc<Self>) {
        let mut task = self.poll_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        info!("reconcile: arming status polling");
        let reconciler = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            reconciler.poll_until_settled().await;
        }));
    }

    async fn poll_until_settled(&self) {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let pending: Vec<DocumentId> = self
                .store
                .snapshot()
                .documents
                .iter()
                .filter(|d| d.processing.is_pending())
                .map(|d| d.id)
                .collect();
            if pending.is_empty() {
                break;
            }

            match self.remote.list_documents().await {
                Ok(remote_documents) => {
                    for document_id in pending {
                        let Some(summary) =
                            remote_documents.iter().find(|d| d.id == document_id)
                        else {
                            debug!(
                                document_id = document_id.0,
                                "reconcile: pending document unknown to remote"
                            );
                            continue;
                        };
                        if !summary.processing_status.is_pending() {
                            info!(
                                document_id = document_id.0,
                                status = ?summary.processing_status,
                                "reconcile: processing status settled"
                            );
                            self.store.dispatch(Action::PatchProcessing {
                                document_id,
                                state: summary.processing_status,
                            });
                        }
                    }
                }
                Err(err) if err.is_unauthorized() => {
                    // Credential already cleared by the remote client; stay
                    // passive and keep polling so the session is not
                    // interrupted mid-task.
                    warn!("reconcile: authorization expired during status poll");
                    let _ = self.notices.send(Notice::AuthorizationExpired);
                }
                Err(err) => {
                    warn!("reconcile: status poll failed: {err}");
                }
            }
        }
        info!("reconcile: no pending documents; polling stopped");
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
