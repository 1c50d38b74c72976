use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use shared::domain::{CardId, DocumentId, JOB_DESCRIPTION_CARD};
use shared::protocol::{
    AudioClip, DocumentSummary, GenerateInsightsRequest, HealthResponse, InsightDetail,
    UserProfile,
};
use storage::{ManifestEntry, SessionStorage, StoredIdentity};

pub mod artifacts;
pub mod reconcile;
pub mod remote;
pub mod renderer;
pub mod store;
pub mod viewer;

pub use artifacts::{
    ArtifactEngine, AudioDownload, AudioOutput, AudioOutputEvent, MissingAudioOutput,
    PlaybackCoordinator, PlaybackPhase,
};
pub use reconcile::StatusReconciler;
pub use remote::{DocumentUpload, HttpRemoteApi, MissingRemoteApi, RemoteApi, RemoteError};
pub use renderer::{
    DocumentMetadata, MissingRenderer, RendererConfig, RendererEvent, RendererInstance,
    RendererProvider, SearchHandle, SelectionContent,
};
pub use store::{Action, Artifact, Card, CardSource, Document, Session, SessionStore};
pub use viewer::{ViewerController, ViewerPhase};

const RENDERER_AVAILABILITY_ATTEMPTS: usize = 10;
const RENDERER_AVAILABILITY_DELAY: Duration = Duration::from_millis(250);
const HIGHLIGHT_SETTLE_DELAY: Duration = Duration::from_millis(800);
const HIGHLIGHT_FOLLOWUP_DELAY: Duration = Duration::from_millis(900);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(4);
const NOTICE_CHANNEL_CAPACITY: usize = 1024;

/// Tunable timings for the session reactors. Tests shrink these to keep
/// polling and settle delays fast.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub renderer: RendererConfig,
    pub renderer_attempts: usize,
    pub renderer_retry_delay: Duration,
    pub highlight_settle_delay: Duration,
    pub highlight_followup_delay: Duration,
    pub status_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renderer: RendererConfig::default(),
            renderer_attempts: RENDERER_AVAILABILITY_ATTEMPTS,
            renderer_retry_delay: RENDERER_AVAILABILITY_DELAY,
            highlight_settle_delay: HIGHLIGHT_SETTLE_DELAY,
            highlight_followup_delay: HIGHLIGHT_FOLLOWUP_DELAY,
            status_poll_interval: STATUS_POLL_INTERVAL,
        }
    }
}

/// User-facing notifications emitted by the reactors. Never fatal to the
/// session; the host decides how to present them.
#[derive(Debug, Clone)]
pub enum Notice {
    TransientError { message: String },
    ValidationFailed { message: String },
    AuthorizationExpired,
    ViewerFailed { message: String },
    ContentUnavailable { document_id: DocumentId },
    GenerationFailed { card_id: CardId, message: String },
}

/// In-memory cache of fetched document binaries. Deliberately separate
/// from the session snapshot and never persisted.
#[derive(Default)]
pub struct ContentCache {
    inner: Mutex<HashMap<DocumentId, Arc<Vec<u8>>>>,
}

impl ContentCache {
    pub async fn insert(&self, id: DocumentId, bytes: Vec<u8>) {
        self.inner.lock().await.insert(id, Arc::new(bytes));
    }

    pub async fn get(&self, id: DocumentId) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: DocumentId) {
        self.inner.lock().await.remove(&id);
    }
}

/// Top-level session client: owns the store and wires the viewer
/// controller, artifact engine, playback coordinator and status
/// reconciler around it. All mutable session state flows through the
/// store; this type only orchestrates.
pub struct ReaderClient {
    store: Arc<SessionStore>,
    remote: Arc<dyn RemoteApi>,
    storage: Arc<SessionStorage>,
    content: Arc<ContentCache>,
    viewer: Arc<ViewerController>,
    engine: Arc<ArtifactEngine>,
    playback: Arc<PlaybackCoordinator>,
    reconciler: Arc<StatusReconciler>,
    notices: broadcast::Sender<Notice>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReaderClient {
    pub fn new(storage: Arc<SessionStorage>) -> Arc<Self> {
        Self::new_with_dependencies(
            storage,
            Arc::new(MissingRemoteApi),
            Arc::new(MissingRenderer),
            Arc::new(MissingAudioOutput),
            SessionConfig::default(),
        )
    }

    /// Build a client backed by the HTTP remote service.
    pub fn connect(
        base_url: Url,
        storage: Arc<SessionStorage>,
        provider: Arc<dyn RendererProvider>,
        audio: Arc<dyn AudioOutput>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let remote = Arc::new(HttpRemoteApi::new(base_url, Arc::clone(&storage)));
        Self::new_with_dependencies(storage, remote, provider, audio, config)
    }

    pub fn new_with_dependencies(
        storage: Arc<SessionStorage>,
        remote: Arc<dyn RemoteApi>,
        provider: Arc<dyn RendererProvider>,
        audio: Arc<dyn AudioOutput>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let store = Arc::new(SessionStore::new());
        let content = Arc::new(ContentCache::default());
        let viewer = ViewerController::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            provider,
            Arc::clone(&content),
            config.clone(),
            notices.clone(),
        );
        let engine = ArtifactEngine::new(Arc::clone(&store), Arc::clone(&remote), notices.clone());
        let playback = PlaybackCoordinator::new(audio);
        let reconciler = StatusReconciler::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            notices.clone(),
            config.status_poll_interval,
        );
        Arc::new(Self {
            store,
            remote,
            storage,
            content,
            viewer,
            engine,
            playback,
            reconciler,
            notices,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the reactor tasks. Idempotent only across a shutdown; call
    /// once per client.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.viewer.run());
        tasks.push(self.reconciler.run());
        tasks.push(self.playback.run());
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.viewer.shutdown().await;
        self.reconciler.shutdown().await;
        info!("session client shut down");
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Session {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.store.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn viewer_phase(&self) -> ViewerPhase {
        self.viewer.phase().await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile> {
        let login = self
            .remote
            .login(email, password)
            .await
            .map_err(|err| self.report_remote(err))?;
        self.storage
            .save_identity(&StoredIdentity {
                user_id: login.user.id,
                email: login.user.email.clone(),
                display_name: login.user.display_name.clone(),
            })
            .await
            .context("failed to persist identity")?;
        info!(user_id = login.user.id.0, "signed in");
        Ok(login.user)
    }

    /// Rehydrate the working set from the persisted manifest. Restored
    /// documents carry no binary content; re-selecting one surfaces the
    /// "needs refetch" affordance until `open_document` refetches it.
    pub async fn restore(&self) -> Result<()> {
        let manifest = self.storage.list_manifest().await?;
        for entry in &manifest {
            self.store.dispatch(Action::AddDocument(Document {
                id: entry.document_id,
                display_name: entry.name.clone(),
                uploaded_at: entry.uploaded_at,
                page_count: entry.page_count,
                processing: entry.status,
                has_local_content: false,
            }));
        }
        if let Some(last) = self.storage.last_selected().await? {
            if self.store.snapshot().document(last).is_some() {
                self.store.dispatch(Action::SelectDocument(Some(last)));
            }
        }
        Ok(())
    }

    pub async fn upload_documents(
        &self,
        uploads: Vec<DocumentUpload>,
    ) -> Result<Vec<DocumentSummary>> {
        if uploads.is_empty() {
            return Err(self.validation_failure("select at least one file to upload"));
        }
        let summaries = self
            .remote
            .upload_documents(uploads)
            .await
            .map_err(|err| self.report_remote(err))?;
        for summary in &summaries {
            self.upsert_document(summary, false).await;
        }
        Ok(summaries)
    }

    /// Pull the remote document list and fold it into the working set,
    /// preserving local content flags for unchanged documents.
    pub async fn refresh_documents(&self) -> Result<()> {
        let summaries = self
            .remote
            .list_documents()
            .await
            .map_err(|err| self.report_remote(err))?;
        for summary in &summaries {
            let keep_content = self
                .store
                .snapshot()
                .document(summary.id)
                .is_some_and(|d| d.has_local_content);
            self.upsert_document(summary, keep_content).await;
        }
        Ok(())
    }

    pub async fn remove_document(&self, id: DocumentId) -> Result<()> {
        self.remote
            .delete_document(id)
            .await
            .map_err(|err| self.report_remote(err))?;
        self.store.dispatch(Action::RemoveDocument(id));
        self.content.remove(id).await;
        if let Err(err) = self.storage.remove_manifest_entry(id).await {
            warn!(document_id = id.0, "failed to prune manifest entry: {err}");
        }
        let selected = self.store.snapshot().selected_document_id;
        if let Err(err) = self.storage.set_last_selected(selected).await {
            warn!("failed to persist selection: {err}");
        }
        Ok(())
    }

    pub async fn open_document(&self, id: DocumentId) -> Result<()> {
        self.ensure_local_content(id).await?;
        self.store.dispatch(Action::SelectDocument(Some(id)));
        if let Err(err) = self.storage.set_last_selected(Some(id)).await {
            warn!(document_id = id.0, "failed to persist selection: {err}");
        }
        Ok(())
    }

    pub async fn close_document(&self) {
        self.store.dispatch(Action::SelectDocument(None));
        if let Err(err) = self.storage.set_last_selected(None).await {
            warn!("failed to persist selection: {err}");
        }
    }

    /// The sole "jump to this result" entry point: selection, page and
    /// epoch advance atomically via a single NavigateTo dispatch.
    pub async fn jump_to(&self, document_id: DocumentId, page: u32) -> Result<()> {
        self.ensure_local_content(document_id).await?;
        self.store
            .dispatch(Action::NavigateTo { document_id, page });
        if let Err(err) = self.storage.set_last_selected(Some(document_id)).await {
            warn!(document_id = document_id.0, "failed to persist selection: {err}");
        }
        Ok(())
    }

    pub async fn jump_to_card(&self, card_id: &CardId) -> Result<()> {
        let source = self
            .store
            .snapshot()
            .card(card_id)
            .ok_or_else(|| anyhow!("card {card_id} is no longer part of the current batch"))?
            .source
            .ok_or_else(|| anyhow!("card {card_id} has no source location"))?;
        self.jump_to(source.document_id, source.page).await
    }

    pub async fn generate_insights(&self, job_description: &str) -> Result<()> {
        let job = job_description.trim();
        if job.is_empty() {
            return Err(
                self.validation_failure("enter a job description before generating insights")
            );
        }
        let snapshot = self.store.snapshot();
        if snapshot.documents.is_empty() {
            return Err(
                self.validation_failure("upload at least one document before generating insights")
            );
        }

        let request = GenerateInsightsRequest {
            job_to_be_done: job.to_string(),
            document_ids: snapshot.documents.iter().map(|d| d.id).collect(),
        };
        let payload = self
            .remote
            .generate_insights(request)
            .await
            .map_err(|err| self.report_remote(err))?;

        let mut sections = payload.sections;
        sections.sort_by_key(|s| s.importance_rank);

        let mut cards = Vec::with_capacity(sections.len() + 1);
        if !sections.is_empty() {
            cards.push(Card {
                id: CardId::new(JOB_DESCRIPTION_CARD),
                source: None,
                heading: "Job description".to_string(),
                snippet: job.to_string(),
            });
        }
        for section in sections {
            cards.push(Card {
                id: section.id,
                source: Some(CardSource {
                    document_id: section.document_id,
                    page: section.page.max(1),
                }),
                heading: section.title,
                snippet: section.content,
            });
        }
        info!(cards = cards.len(), "insights generated");
        self.store.dispatch(Action::ReplaceCards(cards));
        Ok(())
    }

    pub async fn ensure_detail(&self, card_id: &CardId) -> Result<InsightDetail> {
        self.engine.ensure_detail(card_id).await
    }

    pub async fn ensure_audio(&self, card_id: &CardId) -> Result<AudioClip> {
        self.engine.ensure_audio(card_id).await
    }

    pub async fn play_audio(&self, card_id: &CardId) -> Result<()> {
        let clip = self.engine.ensure_audio(card_id).await?;
        self.playback.play(card_id, &clip).await
    }

    pub async fn pause_audio(&self, card_id: &CardId) -> Result<()> {
        self.playback.pause(card_id).await
    }

    pub async fn restart_audio(&self, card_id: &CardId) -> Result<()> {
        let clip = self.engine.ensure_audio(card_id).await?;
        self.playback.restart(card_id, &clip).await
    }

    pub async fn download_audio(&self, card_id: &CardId) -> Result<AudioDownload> {
        self.engine.download_audio(card_id)
    }

    pub async fn playback_phase(&self, card_id: &CardId) -> Option<PlaybackPhase> {
        self.playback.phase(card_id).await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        Ok(self.remote.health().await?)
    }

    async fn ensure_local_content(&self, id: DocumentId) -> Result<()> {
        let document = self
            .store
            .snapshot()
            .document(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown document {}", id.0))?;
        if document.has_local_content && self.content.get(id).await.is_some() {
            return Ok(());
        }
        let bytes = self
            .remote
            .fetch_document_content(id)
            .await
            .map_err(|err| self.report_remote(err))?;
        info!(document_id = id.0, bytes = bytes.len(), "fetched document content");
        self.content.insert(id, bytes).await;
        let mut updated = document;
        updated.has_local_content = true;
        self.store.dispatch(Action::UpdateDocument(updated));
        Ok(())
    }

    async fn upsert_document(&self, summary: &DocumentSummary, has_local_content: bool) {
        let document = Document {
            id: summary.id,
            display_name: summary.name.clone(),
            uploaded_at: summary.upload_date,
            page_count: summary.page_count,
            processing: summary.processing_status,
            has_local_content,
        };
        let known = self.store.snapshot().document(summary.id).is_some();
        if known {
            if !has_local_content {
                // Replaced server-side: any cached binary is stale.
                self.content.remove(summary.id).await;
            }
            self.store.dispatch(Action::UpdateDocument(document.clone()));
        } else {
            self.store.dispatch(Action::AddDocument(document.clone()));
        }
        if let Err(err) = self
            .storage
            .upsert_manifest_entry(&ManifestEntry {
                document_id: document.id,
                name: document.display_name.clone(),
                uploaded_at: document.uploaded_at,
                page_count: document.page_count,
                status: document.processing,
            })
            .await
        {
            warn!(document_id = document.id.0, "failed to persist manifest entry: {err}");
        }
    }

    fn validation_failure(&self, message: &str) -> anyhow::Error {
        let _ = self.notices.send(Notice::ValidationFailed {
            message: message.to_string(),
        });
        anyhow!("{message}")
    }

    fn report_remote(&self, err: RemoteError) -> anyhow::Error {
        if err.is_unauthorized() {
            let _ = self.notices.send(Notice::AuthorizationExpired);
        } else {
            let _ = self.notices.send(Notice::TransientError {
                message: err.to_string(),
            });
        }
        err.into()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
