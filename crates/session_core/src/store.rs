use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use shared::domain::{CardId, DocumentId, ProcessingState};
use shared::protocol::{AudioClip, InsightDetail};

/// One document in the working set. `has_local_content` flips to true once
/// the binary has been fetched into the client-side content cache; the
/// bytes themselves never live in the session snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub display_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub page_count: Option<u32>,
    pub processing: ProcessingState,
    pub has_local_content: bool,
}

/// Where a card's content came from. The job-description pseudo-card has
/// no source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardSource {
    pub document_id: DocumentId,
    pub page: u32,
}

/// One navigable unit of derived content.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub id: CardId,
    pub source: Option<CardSource>,
    pub heading: String,
    pub snippet: String,
}

/// Derived content cached for a card. Either side may be generated
/// independently of the other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifact {
    pub detail: Option<InsightDetail>,
    pub audio: Option<AudioClip>,
}

/// Complete session snapshot. Every dispatch produces a new value; no
/// partial mutation is ever observable.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub documents: Vec<Document>,
    pub selected_document_id: Option<DocumentId>,
    pub current_page: u32,
    pub total_pages: u32,
    pub navigation_epoch: u64,
    pub is_navigating: bool,
    pub cards: Vec<Card>,
    pub artifacts: HashMap<CardId, Artifact>,
    pub processing: HashMap<DocumentId, ProcessingState>,
    pub selected_text: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            selected_document_id: None,
            current_page: 1,
            total_pages: 1,
            navigation_epoch: 0,
            is_navigating: false,
            cards: Vec::new(),
            artifacts: HashMap::new(),
            processing: HashMap::new(),
            selected_text: None,
        }
    }
}

impl Session {
    pub fn document(&self, id: DocumentId) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    pub fn selected_document(&self) -> Option<&Document> {
        self.selected_document_id.and_then(|id| self.document(id))
    }

    pub fn card(&self, id: &CardId) -> Option<&Card> {
        self.cards.iter().find(|c| &c.id == id)
    }

    pub fn has_pending_processing(&self) -> bool {
        self.documents.iter().any(|d| d.processing.is_pending())
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    /// Idempotent on id: adding a document that already exists is a no-op.
    AddDocument(Document),
    /// Replace-by-id: updating an unknown document is a no-op.
    UpdateDocument(Document),
    RemoveDocument(DocumentId),
    SelectDocument(Option<DocumentId>),
    SetCurrentPage(u32),
    SetTotalPages(u32),
    /// The sole entry point for "jump to this result": selection, page and
    /// epoch advance happen in one atomic step. Idempotent when the session
    /// is already at exactly that (document, page).
    NavigateTo { document_id: DocumentId, page: u32 },
    /// Issued by the viewer once a navigation call resolved. Only clears
    /// `is_navigating` when the epoch is still the current one.
    NavigationSettled { epoch: u64 },
    ReplaceCards(Vec<Card>),
    StoreDetail { card_id: CardId, detail: InsightDetail },
    StoreAudio { card_id: CardId, audio: AudioClip },
    PatchProcessing {
        document_id: DocumentId,
        state: ProcessingState,
    },
    SetSelectedText(Option<String>),
}

/// Pure transition function: `(state, action) -> state`. Never suspends,
/// never performs I/O.
pub fn reduce(state: &Session, action: &Action) -> Session {
    let mut next = state.clone();
    match action {
        Action::AddDocument(document) => {
            if next.document(document.id).is_none() {
                next.processing.insert(document.id, document.processing);
                next.documents.push(document.clone());
            }
        }
        Action::UpdateDocument(document) => {
            if let Some(slot) = next.documents.iter_mut().find(|d| d.id == document.id) {
                *slot = document.clone();
                next.processing.insert(document.id, document.processing);
            }
        }
        Action::RemoveDocument(id) => {
            next.documents.retain(|d| d.id != *id);
            next.processing.remove(id);
            if next.selected_document_id == Some(*id) {
                next.selected_document_id = None;
                next.is_navigating = false;
            }
        }
        Action::SelectDocument(None) => {
            next.selected_document_id = None;
            next.current_page = 1;
            next.is_navigating = false;
        }
        Action::SelectDocument(Some(id)) => {
            if let Some(document) = state.document(*id) {
                next.selected_document_id = Some(*id);
                next.current_page = 1;
                if let Some(pages) = document.page_count {
                    next.total_pages = pages.max(1);
                }
                next.navigation_epoch += 1;
                next.is_navigating = true;
            }
        }
        Action::SetCurrentPage(page) => {
            next.current_page = (*page).max(1);
        }
        Action::SetTotalPages(pages) => {
            next.total_pages = (*pages).max(1);
        }
        Action::NavigateTo { document_id, page } => {
            let page = (*page).max(1);
            let already_there =
                state.selected_document_id == Some(*document_id) && state.current_page == page;
            if !already_there {
                if let Some(document) = state.document(*document_id) {
                    next.selected_document_id = Some(*document_id);
                    next.current_page = page;
                    if let Some(pages) = document.page_count {
                        next.total_pages = pages.max(1);
                    }
                    next.navigation_epoch += 1;
                    next.is_navigating = true;
                }
            }
        }
        Action::NavigationSettled { epoch } => {
            if *epoch == state.navigation_epoch {
                next.is_navigating = false;
            }
        }
        Action::ReplaceCards(cards) => {
            // Wholesale replacement; cached artifacts stay untouched so the
            // job-description card keeps its detail/audio across batches.
            next.cards = cards.clone();
        }
        Action::StoreDetail { card_id, detail } => {
            next.artifacts.entry(card_id.clone()).or_default().detail = Some(detail.clone());
        }
        Action::StoreAudio { card_id, audio } => {
            next.artifacts.entry(card_id.clone()).or_default().audio = Some(audio.clone());
        }
        Action::PatchProcessing { document_id, state } => {
            next.processing.insert(*document_id, *state);
            if let Some(slot) = next.documents.iter_mut().find(|d| d.id == *document_id) {
                slot.processing = *state;
            }
        }
        Action::SetSelectedText(text) => {
            next.selected_text = text.clone();
        }
    }
    next
}

/// Single-writer session store. Dispatch is synchronous and total; every
/// consumer observes complete snapshots through a watch channel, so an
/// observer that falls behind sees only the latest state (which is exactly
/// the supersede behavior navigation relies on).
pub struct SessionStore {
    tx: watch::Sender<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Session::default());
        Self { tx }
    }

    pub fn dispatch(&self, action: Action) {
        self.tx.send_modify(|state| *state = reduce(state, &action));
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
