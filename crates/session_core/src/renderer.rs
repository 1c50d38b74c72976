use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use shared::domain::DocumentId;

/// Configuration handed to the rendering component when an instance is
/// constructed.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub client_id: String,
    pub container_id: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            container_id: "document-viewer".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    pub file_name: String,
}

/// Events emitted by a live renderer instance. The instance is bound to one
/// document, so selection events carry that binding for late-callback
/// guarding.
#[derive(Debug, Clone)]
pub enum RendererEvent {
    SelectionEnded { document_id: DocumentId },
}

#[derive(Debug, Clone, Default)]
pub struct SelectionContent {
    pub kind: String,
    pub data: String,
}

/// Entry point of the opaque third-party rendering component.
/// `is_available` models polling the component's global entry point;
/// `open` models construct + preview + awaiting the readiness promise.
#[async_trait]
pub trait RendererProvider: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn open(
        &self,
        config: &RendererConfig,
        content: Arc<Vec<u8>>,
        metadata: DocumentMetadata,
    ) -> Result<Arc<dyn RendererInstance>>;
}

/// One live renderer instance. Exclusively owned by the viewer controller;
/// no other component may call into it.
#[async_trait]
pub trait RendererInstance: Send + Sync {
    async fn goto_page(&self, page: u32) -> Result<()>;
    async fn search(&self, phrase: &str) -> Result<Arc<dyn SearchHandle>>;
    async fn selected_content(&self) -> Result<SelectionContent>;
    fn subscribe_events(&self) -> broadcast::Receiver<RendererEvent>;
    async fn destroy(&self) -> Result<()>;
}

/// Handle returned by a renderer search call.
#[async_trait]
pub trait SearchHandle: Send + Sync {
    async fn next(&self) -> Result<()>;
    async fn previous(&self) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

pub struct MissingRenderer;

#[async_trait]
impl RendererProvider for MissingRenderer {
    async fn is_available(&self) -> bool {
        false
    }

    async fn open(
        &self,
        _config: &RendererConfig,
        _content: Arc<Vec<u8>>,
        metadata: DocumentMetadata,
    ) -> Result<Arc<dyn RendererInstance>> {
        Err(anyhow!(
            "rendering component unavailable for document {}",
            metadata.document_id.0
        ))
    }
}
