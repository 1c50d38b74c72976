use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shared::domain::DocumentId;
use shared::protocol::SectionContent;

use crate::remote::RemoteApi;
use crate::renderer::{
    DocumentMetadata, RendererEvent, RendererInstance, RendererProvider, SearchHandle,
};
use crate::store::{Action, Document, Session, SessionStore};
use crate::{ContentCache, Notice, SessionConfig};

/// Minimum heading length considered distinctive enough to search for.
const MIN_HEADING_PHRASE_CHARS: usize = 8;
/// Minimum section content length before a content-derived phrase is used.
const MIN_CONTENT_CHARS: usize = 24;
/// Number of leading content words used for a content-derived phrase.
const CONTENT_PHRASE_WORDS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerPhase {
    Uninitialized,
    Initializing,
    Ready,
    Navigating,
    Failed,
    Destroyed,
}

/// Ephemeral ownership record for the one live renderer instance. Never
/// part of session state; invalidated before any new instance is created.
struct ActiveViewer {
    document_id: DocumentId,
    /// Navigation epoch observed when this instance finished initializing.
    /// Page-1 navigation at this epoch is "open document", not a jump.
    opened_epoch: u64,
    instance: Arc<dyn RendererInstance>,
    selection_task: JoinHandle<()>,
    search: Option<Arc<dyn SearchHandle>>,
    highlight_task: Option<JoinHandle<()>>,
}

struct ViewerInner {
    phase: ViewerPhase,
    active: Option<ActiveViewer>,
    handled_epoch: u64,
    /// Document already reported as needing a refetch, so repeated sync
    /// passes do not spam the notice channel.
    refetch_reported: Option<DocumentId>,
}

/// Keeps exactly one live renderer instance bound to the selected document
/// and its displayed page consistent with the store. A pure reactor: it
/// observes snapshots and resynchronizes from the store after every await.
pub struct ViewerController {
    store: Arc<SessionStore>,
    remote: Arc<dyn RemoteApi>,
    provider: Arc<dyn RendererProvider>,
    content: Arc<ContentCache>,
    config: SessionConfig,
    notices: broadcast::Sender<Notice>,
    inner: Mutex<ViewerInner>,
}

impl ViewerController {
    pub fn new(
        store: Arc<SessionStore>,
        remote: Arc<dyn RemoteApi>,
        provider: Arc<dyn RendererProvider>,
        content: Arc<ContentCache>,
        config: SessionConfig,
        notices: broadcast::Sender<Notice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            remote,
            provider,
            content,
            config,
            notices,
            inner: Mutex::new(ViewerInner {
                phase: ViewerPhase::Uninitialized,
                active: None,
                handled_epoch: 0,
                refetch_reported: None,
            }),
        })
    }

    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = controller.store.subscribe();
            loop {
                let snapshot = rx.borrow_and_update().clone();
                controller.sync(&snapshot).await;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub async fn phase(&self) -> ViewerPhase {
        self.inner.lock().await.phase
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown_locked(&mut inner).await;
        inner.phase = ViewerPhase::Destroyed;
    }

    /// Reconcile the live renderer against one session snapshot. Runs on
    /// the single reactor task, so awaits under the inner lock never race
    /// another sync pass; intermediate snapshots coalesced by the watch
    /// channel are exactly the superseded navigation epochs.
    async fn sync(self: &Arc<Self>, snapshot: &Session) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.phase, ViewerPhase::Failed | ViewerPhase::Destroyed) {
            return;
        }

        let bound = inner.active.as_ref().map(|a| a.document_id);
        if snapshot.selected_document_id != bound {
            self.teardown_locked(&mut inner).await;
            let Some(document_id) = snapshot.selected_document_id else {
                inner.phase = ViewerPhase::Uninitialized;
                inner.refetch_reported = None;
                return;
            };
            let Some(document) = snapshot.document(document_id) else {
                inner.phase = ViewerPhase::Uninitialized;
                return;
            };
            if !document.has_local_content {
                self.report_refetch_needed(&mut inner, document_id);
                return;
            }
            let Some(content) = self.content.get(document_id).await else {
                warn!(
                    document_id = document_id.0,
                    "viewer: content flagged local but missing from cache"
                );
                self.report_refetch_needed(&mut inner, document_id);
                return;
            };

            inner.refetch_reported = None;
            inner.phase = ViewerPhase::Initializing;
            match self.initialize(document_id, document, content).await {
                Ok(mut active) => {
                    active.opened_epoch = snapshot.navigation_epoch;
                    inner.active = Some(active);
                    inner.phase = ViewerPhase::Ready;
                    info!(document_id = document_id.0, "viewer: renderer ready");
                }
                Err(err) => {
                    inner.phase = ViewerPhase::Failed;
                    error!(
                        document_id = document_id.0,
                        "viewer: renderer initialization failed: {err:#}"
                    );
                    let _ = self.notices.send(Notice::ViewerFailed {
                        message: err.to_string(),
                    });
                    return;
                }
            }
        }

        self.drive_navigation(&mut inner).await;
    }

    fn report_refetch_needed(&self, inner: &mut ViewerInner, document_id: DocumentId) {
        if inner.refetch_reported != Some(document_id) {
            inner.refetch_reported = Some(document_id);
            let _ = self.notices.send(Notice::ContentUnavailable { document_id });
        }
        inner.phase = ViewerPhase::Uninitialized;
    }

    /// Navigate the live instance to the latest unhandled epoch. An
    /// in-flight goto cannot be cancelled; when it resolves stale, a fresh
    /// call is issued for the latest epoch and the intermediates are
    /// dropped.
    async fn drive_navigation(self: &Arc<Self>, inner: &mut ViewerInner) {
        let Some((document_id, opened_epoch, instance)) = inner
            .active
            .as_ref()
            .map(|a| (a.document_id, a.opened_epoch, Arc::clone(&a.instance)))
        else {
            return;
        };

        loop {
            let current = self.store.snapshot();
            if current.selected_document_id != Some(document_id) {
                return;
            }
            let epoch = current.navigation_epoch;
            if epoch <= inner.handled_epoch {
                return;
            }
            let page = current.current_page;
            inner.handled_epoch = epoch;
            inner.phase = ViewerPhase::Navigating;
            debug!(document_id = document_id.0, page, epoch, "viewer: navigating");

            if let Err(err) = instance.goto_page(page).await {
                warn!(
                    document_id = document_id.0,
                    page, "viewer: goto page failed: {err}"
                );
            }

            let after = self.store.snapshot();
            if after.navigation_epoch != epoch
                || after.selected_document_id != Some(document_id)
            {
                inner.phase = ViewerPhase::Ready;
                continue;
            }

            self.store.dispatch(Action::NavigationSettled { epoch });
            inner.phase = ViewerPhase::Ready;
            if !(page == 1 && epoch == opened_epoch) {
                self.start_highlight(inner, document_id, page, epoch);
            }
            return;
        }
    }

    async fn initialize(
        self: &Arc<Self>,
        document_id: DocumentId,
        document: &Document,
        content: Arc<Vec<u8>>,
    ) -> anyhow::Result<ActiveViewer> {
        let mut available = false;
        for attempt in 0..self.config.renderer_attempts {
            if self.provider.is_available().await {
                available = true;
                break;
            }
            debug!(
                attempt = attempt + 1,
                max_attempts = self.config.renderer_attempts,
                "viewer: rendering component not yet available"
            );
            if attempt + 1 < self.config.renderer_attempts {
                tokio::time::sleep(self.config.renderer_retry_delay).await;
            }
        }
        if !available {
            anyhow::bail!(
                "rendering component did not become available after {} attempts",
                self.config.renderer_attempts
            );
        }

        let metadata = DocumentMetadata {
            document_id,
            file_name: document.display_name.clone(),
        };
        let instance = self
            .provider
            .open(&self.config.renderer, content, metadata)
            .await?;

        if let Some(pages) = document.page_count {
            self.store.dispatch(Action::SetTotalPages(pages));
        }

        let selection_task = self.spawn_selection_task(document_id, &instance);
        Ok(ActiveViewer {
            document_id,
            opened_epoch: 0,
            instance,
            selection_task,
            search: None,
            highlight_task: None,
        })
    }

    /// The renderer offers no listener unregistration, so every late
    /// callback is guarded against the currently-selected document before
    /// anything is dispatched.
    fn spawn_selection_task(
        &self,
        document_id: DocumentId,
        instance: &Arc<dyn RendererInstance>,
    ) -> JoinHandle<()> {
        let mut events = instance.subscribe_events();
        let store = Arc::clone(&self.store);
        let instance = Arc::clone(instance);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    RendererEvent::SelectionEnded {
                        document_id: event_document,
                    } => {
                        if event_document != document_id
                            || store.snapshot().selected_document_id != Some(document_id)
                        {
                            continue;
                        }
                        match instance.selected_content().await {
                            Ok(selection) if !selection.data.is_empty() => {
                                store.dispatch(Action::SetSelectedText(Some(selection.data)));
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(
                                    document_id = document_id.0,
                                    "viewer: failed to read selection: {err}"
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    fn start_highlight(
        self: &Arc<Self>,
        inner: &mut ViewerInner,
        document_id: DocumentId,
        page: u32,
        epoch: u64,
    ) {
        if let Some(active) = inner.active.as_mut() {
            if let Some(previous) = active.highlight_task.take() {
                previous.abort();
            }
            let controller = Arc::clone(self);
            active.highlight_task = Some(tokio::spawn(async move {
                controller.run_highlight(document_id, page, epoch).await;
            }));
        }
    }

    /// One highlight cycle: fetch section content, derive a search phrase,
    /// wait for the page to settle, clear the previous search and issue the
    /// new one (plus an optional more-distinctive followup). Every await is
    /// followed by a staleness check against the live store.
    async fn run_highlight(&self, document_id: DocumentId, page: u32, epoch: u64) {
        let sections = match self.remote.section_content(document_id, page).await {
            Ok(sections) => sections,
            Err(err) => {
                debug!(
                    document_id = document_id.0,
                    page, "viewer: section content unavailable for highlight: {err}"
                );
                return;
            }
        };
        let Some(plan) = derive_highlight_phrases(&sections) else {
            debug!(
                document_id = document_id.0,
                page, "viewer: no distinctive phrase; skipping highlight"
            );
            return;
        };

        tokio::time::sleep(self.config.highlight_settle_delay).await;
        if self.is_stale(document_id, epoch) {
            return;
        }

        let instance = {
            let mut inner = self.inner.lock().await;
            let Some(active) = inner.active.as_mut() else {
                return;
            };
            if active.document_id != document_id {
                return;
            }
            if let Some(previous) = active.search.take() {
                if let Err(err) = previous.clear().await {
                    debug!("viewer: ignoring search clear failure: {err}");
                }
            }
            Arc::clone(&active.instance)
        };

        let handle = match instance.search(&plan.primary).await {
            Ok(handle) => handle,
            Err(err) => {
                debug!(
                    document_id = document_id.0,
                    page, "viewer: highlight search failed: {err}"
                );
                return;
            }
        };
        if self.is_stale(document_id, epoch) {
            return;
        }
        self.store_search_handle(document_id, handle).await;

        let Some(secondary) = plan.secondary else {
            return;
        };
        tokio::time::sleep(self.config.highlight_followup_delay).await;
        if self.is_stale(document_id, epoch) {
            return;
        }
        // Followup search without clearing the first result set.
        match instance.search(&secondary).await {
            Ok(handle) => self.store_search_handle(document_id, handle).await,
            Err(err) => debug!(
                document_id = document_id.0,
                page, "viewer: followup highlight search failed: {err}"
            ),
        }
    }

    async fn store_search_handle(&self, document_id: DocumentId, handle: Arc<dyn SearchHandle>) {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.active.as_mut() {
            if active.document_id == document_id {
                active.search = Some(handle);
            }
        }
    }

    fn is_stale(&self, document_id: DocumentId, epoch: u64) -> bool {
        let snapshot = self.store.snapshot();
        snapshot.selected_document_id != Some(document_id) || snapshot.navigation_epoch != epoch
    }

    async fn teardown_locked(&self, inner: &mut ViewerInner) {
        let Some(mut active) = inner.active.take() else {
            return;
        };
        if let Some(task) = active.highlight_task.take() {
            task.abort();
        }
        active.selection_task.abort();
        if let Some(search) = active.search.take() {
            if let Err(err) = search.clear().await {
                debug!("viewer: ignoring search clear failure during teardown: {err}");
            }
        }
        if let Err(err) = active.instance.destroy().await {
            warn!(
                document_id = active.document_id.0,
                "viewer: renderer destroy failed: {err}"
            );
        }
        info!(
            document_id = active.document_id.0,
            "viewer: renderer instance torn down"
        );
    }
}

pub(crate) struct HighlightPlan {
    pub primary: String,
    pub secondary: Option<String>,
}

/// Derive up to two search phrases from the section content of a page.
/// The heading wins when it is distinctive enough, with a content-derived
/// followup; otherwise the leading content words are used alone; when
/// neither is distinctive, highlighting is abandoned.
pub(crate) fn derive_highlight_phrases(sections: &[SectionContent]) -> Option<HighlightPlan> {
    let section = sections.first()?;
    let heading = section.section_title.trim();
    let content_phrase = if section.content.trim().len() >= MIN_CONTENT_CHARS {
        leading_words(&section.content, CONTENT_PHRASE_WORDS)
    } else {
        None
    };

    if heading.len() >= MIN_HEADING_PHRASE_CHARS {
        let secondary = content_phrase.filter(|phrase| phrase.as_str() != heading);
        return Some(HighlightPlan {
            primary: heading.to_string(),
            secondary,
        });
    }
    content_phrase.map(|primary| HighlightPlan {
        primary,
        secondary: None,
    })
}

fn leading_words(text: &str, count: usize) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().take(count).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

#[cfg(test)]
#[path = "tests/viewer_tests.rs"]
mod tests;
