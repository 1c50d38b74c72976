use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::{broadcast, Mutex};

use shared::domain::{CardId, DocumentId, ProcessingState, UserId};
use shared::error::{ApiException, ErrorCode};
use shared::protocol::{
    AudioClip, AudioRequest, AudioResponse, DetailRequest, DocumentSummary,
    GenerateInsightsRequest, HealthResponse, InsightDetail, InsightsPayload, LoginResponse,
    SectionContent, UserProfile,
};

use crate::artifacts::{AudioOutput, AudioOutputEvent};
use crate::remote::{DocumentUpload, RemoteApi, RemoteError};
use crate::renderer::{
    DocumentMetadata, RendererConfig, RendererEvent, RendererInstance, RendererProvider,
    SearchHandle, SelectionContent,
};
use crate::store::{Card, CardSource, Document};

pub async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {description}");
}

pub fn sample_document(id: i64, name: &str) -> Document {
    Document {
        id: DocumentId(id),
        display_name: name.to_string(),
        uploaded_at: Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap(),
        page_count: Some(24),
        processing: ProcessingState::Completed,
        has_local_content: false,
    }
}

pub fn sample_summary(id: i64, name: &str, status: ProcessingState) -> DocumentSummary {
    DocumentSummary {
        id: DocumentId(id),
        name: name.to_string(),
        original_filename: Some(format!("{name}.pdf")),
        page_count: Some(24),
        upload_date: Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap(),
        processing_status: status,
    }
}

pub fn sample_card(id: &str, document_id: i64, page: u32) -> Card {
    Card {
        id: CardId::new(id),
        source: Some(CardSource {
            document_id: DocumentId(document_id),
            page,
        }),
        heading: format!("Section {id}"),
        snippet: "Ranked section content used for artifact generation.".to_string(),
    }
}

pub fn sample_detail() -> InsightDetail {
    InsightDetail {
        key_insights: vec!["key insight".to_string()],
        did_you_know: vec!["did you know".to_string()],
        contradictions: Vec::new(),
        inspirations: vec!["inspiration".to_string()],
    }
}

pub fn sample_clip(card_id: &str) -> AudioClip {
    AudioClip {
        audio_location: format!("/api/insights/podcast-audio/podcast_{card_id}.mp3"),
        duration_secs: 142.0,
    }
}

/// Configurable remote double. Counters record how many network calls each
/// operation performed; `fail_*` knobs make the next N calls fail.
#[derive(Default)]
pub struct StubRemote {
    pub list_calls: AtomicUsize,
    pub list_response: Mutex<Vec<DocumentSummary>>,
    pub fail_list: AtomicUsize,
    pub unauthorized_list: AtomicBool,

    pub upload_calls: AtomicUsize,
    pub assigned_ids: Mutex<HashMap<String, i64>>,
    pub next_id: AtomicI64,

    pub content_calls: AtomicUsize,

    pub section_requests: Mutex<Vec<(DocumentId, u32)>>,
    pub sections: Mutex<Vec<SectionContent>>,

    pub insights_calls: AtomicUsize,
    pub insights_requests: Mutex<Vec<GenerateInsightsRequest>>,
    pub insights_response: Mutex<InsightsPayload>,

    pub detail_calls: AtomicUsize,
    pub detail_requests: Mutex<Vec<DetailRequest>>,
    pub fail_detail: AtomicUsize,
    pub detail_delay_ms: AtomicU64,

    pub job_insights_calls: AtomicUsize,

    pub audio_calls: AtomicUsize,
    pub audio_requests: Mutex<Vec<AudioRequest>>,
    pub fail_audio: AtomicUsize,
    pub audio_delay_ms: AtomicU64,
    pub audio_companion_detail: Mutex<Option<InsightDetail>>,
}

impl StubRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        })
    }

    fn take_failure(counter: &AtomicUsize, operation: &str) -> Result<(), RemoteError> {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::Api(ApiException::new(
                ErrorCode::Internal,
                format!("stubbed {operation} failure"),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for StubRemote {
    async fn login(&self, email: &str, _password: &str) -> Result<LoginResponse, RemoteError> {
        Ok(LoginResponse {
            access_token: "stub-token".to_string(),
            user: UserProfile {
                id: UserId(1),
                email: email.to_string(),
                display_name: None,
            },
        })
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, RemoteError> {
        if self.unauthorized_list.load(Ordering::SeqCst) {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            return Err(RemoteError::Unauthorized {
                message: "session expired".to_string(),
            });
        }
        Self::take_failure(&self.fail_list, "list")?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.list_response.lock().await.clone())
    }

    async fn upload_documents(
        &self,
        uploads: Vec<DocumentUpload>,
    ) -> Result<Vec<DocumentSummary>, RemoteError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let mut assigned = self.assigned_ids.lock().await;
        let mut summaries = Vec::with_capacity(uploads.len());
        for upload in uploads {
            // Same-name uploads reuse the previously assigned id, matching
            // the server's replace-on-same-filename behavior.
            let id = *assigned
                .entry(upload.file_name.clone())
                .or_insert_with(|| self.next_id.fetch_add(1, Ordering::SeqCst));
            summaries.push(DocumentSummary {
                id: DocumentId(id),
                name: upload
                    .file_name
                    .strip_suffix(".pdf")
                    .unwrap_or(&upload.file_name)
                    .to_string(),
                original_filename: Some(upload.file_name),
                page_count: None,
                upload_date: Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap(),
                processing_status: ProcessingState::Pending,
            });
        }
        Ok(summaries)
    }

    async fn delete_document(&self, _id: DocumentId) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn fetch_document_content(&self, id: DocumentId) -> Result<Vec<u8>, RemoteError> {
        self.content_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("%PDF-stub-{}", id.0).into_bytes())
    }

    async fn section_content(
        &self,
        id: DocumentId,
        page: u32,
    ) -> Result<Vec<SectionContent>, RemoteError> {
        self.section_requests.lock().await.push((id, page));
        Ok(self.sections.lock().await.clone())
    }

    async fn generate_insights(
        &self,
        request: GenerateInsightsRequest,
    ) -> Result<InsightsPayload, RemoteError> {
        self.insights_calls.fetch_add(1, Ordering::SeqCst);
        self.insights_requests.lock().await.push(request);
        Ok(self.insights_response.lock().await.clone())
    }

    async fn generate_detail(&self, request: DetailRequest) -> Result<InsightDetail, RemoteError> {
        let delay = self.detail_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Self::take_failure(&self.fail_detail, "detail")?;
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.detail_requests.lock().await.push(request);
        Ok(sample_detail())
    }

    async fn generate_job_insights(
        &self,
        _job_description: &str,
    ) -> Result<InsightDetail, RemoteError> {
        self.job_insights_calls.fetch_add(1, Ordering::SeqCst);
        Ok(sample_detail())
    }

    async fn generate_audio(&self, request: AudioRequest) -> Result<AudioResponse, RemoteError> {
        let delay = self.audio_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Self::take_failure(&self.fail_audio, "audio")?;
        self.audio_calls.fetch_add(1, Ordering::SeqCst);
        let card_id = request.card_id.clone();
        self.audio_requests.lock().await.push(request);
        Ok(AudioResponse {
            clip: sample_clip(&card_id.0),
            detail: self.audio_companion_detail.lock().await.clone(),
        })
    }

    async fn health(&self) -> Result<HealthResponse, RemoteError> {
        Ok(HealthResponse {
            status: "healthy".to_string(),
        })
    }
}

pub struct TestRendererProvider {
    pub available: AtomicBool,
    pub availability_checks: AtomicUsize,
    pub opened: Mutex<Vec<Arc<TestRendererInstance>>>,
}

impl TestRendererProvider {
    pub fn new(available: bool) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(available),
            availability_checks: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub async fn latest_instance(&self) -> Option<Arc<TestRendererInstance>> {
        self.opened.lock().await.last().cloned()
    }

    pub fn open_count(&self) -> usize {
        // cheap probe without await for wait_until closures
        self.opened.try_lock().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RendererProvider for TestRendererProvider {
    async fn is_available(&self) -> bool {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }

    async fn open(
        &self,
        _config: &RendererConfig,
        _content: Arc<Vec<u8>>,
        metadata: DocumentMetadata,
    ) -> Result<Arc<dyn RendererInstance>> {
        let instance = TestRendererInstance::new(metadata.document_id);
        self.opened.lock().await.push(Arc::clone(&instance));
        Ok(instance)
    }
}

pub struct TestRendererInstance {
    pub document_id: DocumentId,
    pub goto_calls: std::sync::Mutex<Vec<u32>>,
    pub goto_delay_ms: AtomicU64,
    pub searches: std::sync::Mutex<Vec<String>>,
    pub search_clears: Arc<AtomicUsize>,
    pub selection: std::sync::Mutex<SelectionContent>,
    pub destroyed: AtomicBool,
    pub events: broadcast::Sender<RendererEvent>,
}

impl TestRendererInstance {
    pub fn new(document_id: DocumentId) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            document_id,
            goto_calls: std::sync::Mutex::new(Vec::new()),
            goto_delay_ms: AtomicU64::new(0),
            searches: std::sync::Mutex::new(Vec::new()),
            search_clears: Arc::new(AtomicUsize::new(0)),
            selection: std::sync::Mutex::new(SelectionContent::default()),
            destroyed: AtomicBool::new(false),
            events,
        })
    }

    pub fn goto_pages(&self) -> Vec<u32> {
        self.goto_calls.lock().expect("goto calls").clone()
    }

    pub fn searched_phrases(&self) -> Vec<String> {
        self.searches.lock().expect("searches").clone()
    }

    pub fn set_selection(&self, data: &str) {
        *self.selection.lock().expect("selection") = SelectionContent {
            kind: "text".to_string(),
            data: data.to_string(),
        };
    }

    pub fn emit_selection_ended(&self) {
        let _ = self.events.send(RendererEvent::SelectionEnded {
            document_id: self.document_id,
        });
    }
}

#[async_trait]
impl RendererInstance for TestRendererInstance {
    async fn goto_page(&self, page: u32) -> Result<()> {
        self.goto_calls.lock().expect("goto calls").push(page);
        let delay = self.goto_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn search(&self, phrase: &str) -> Result<Arc<dyn SearchHandle>> {
        self.searches
            .lock()
            .expect("searches")
            .push(phrase.to_string());
        Ok(Arc::new(TestSearchHandle {
            clears: Arc::clone(&self.search_clears),
        }))
    }

    async fn selected_content(&self) -> Result<SelectionContent> {
        Ok(self.selection.lock().expect("selection").clone())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RendererEvent> {
        self.events.subscribe()
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestSearchHandle {
    clears: Arc<AtomicUsize>,
}

#[async_trait]
impl SearchHandle for TestSearchHandle {
    async fn next(&self) -> Result<()> {
        Ok(())
    }

    async fn previous(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestAudioOutput {
    pub calls: std::sync::Mutex<Vec<(String, CardId)>>,
    pub events: broadcast::Sender<AudioOutputEvent>,
}

impl TestAudioOutput {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            calls: std::sync::Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn operations(&self) -> Vec<(String, CardId)> {
        self.calls.lock().expect("audio calls").clone()
    }

    pub fn emit_finished(&self, card_id: &CardId) {
        let _ = self
            .events
            .send(AudioOutputEvent::Finished(card_id.clone()));
    }

    fn record(&self, op: &str, card_id: &CardId) {
        self.calls
            .lock()
            .expect("audio calls")
            .push((op.to_string(), card_id.clone()));
    }
}

#[async_trait]
impl AudioOutput for TestAudioOutput {
    async fn start(&self, card_id: &CardId, _clip: &AudioClip) -> Result<()> {
        self.record("start", card_id);
        Ok(())
    }

    async fn pause(&self, card_id: &CardId) -> Result<()> {
        self.record("pause", card_id);
        Ok(())
    }

    async fn resume(&self, card_id: &CardId) -> Result<()> {
        self.record("resume", card_id);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AudioOutputEvent> {
        self.events.subscribe()
    }
}
