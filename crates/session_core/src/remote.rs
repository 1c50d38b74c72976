use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{multipart, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;
use zeroize::Zeroize;

use shared::domain::DocumentId;
use shared::error::{ApiException, ErrorBody, ErrorCode};
use shared::protocol::{
    AudioRequest, AudioResponse, DetailRequest, DocumentListResponse, DocumentSummary,
    GenerateInsightsRequest, GenerateInsightsResponse, HealthResponse, InsightDetail,
    InsightsPayload, LoginRequest, LoginResponse, SectionContent, SectionContentResponse,
    UploadResponse,
};
use storage::SessionStorage;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not signed in: missing bearer credential")]
    MissingCredential,
    #[error("session expired: {message}")]
    Unauthorized { message: String },
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RemoteError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized { .. })
    }

    fn unavailable(operation: &str) -> Self {
        RemoteError::Api(ApiException::new(
            ErrorCode::Internal,
            format!("remote service unavailable: {operation}"),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// The remote reader service, as consumed by the session core. Every
/// method is request/response; errors carry the backend's human-readable
/// message.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, RemoteError>;
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, RemoteError>;
    async fn upload_documents(
        &self,
        uploads: Vec<DocumentUpload>,
    ) -> Result<Vec<DocumentSummary>, RemoteError>;
    async fn delete_document(&self, id: DocumentId) -> Result<(), RemoteError>;
    async fn fetch_document_content(&self, id: DocumentId) -> Result<Vec<u8>, RemoteError>;
    async fn section_content(
        &self,
        id: DocumentId,
        page: u32,
    ) -> Result<Vec<SectionContent>, RemoteError>;
    async fn generate_insights(
        &self,
        request: GenerateInsightsRequest,
    ) -> Result<InsightsPayload, RemoteError>;
    async fn generate_detail(&self, request: DetailRequest) -> Result<InsightDetail, RemoteError>;
    async fn generate_job_insights(
        &self,
        job_description: &str,
    ) -> Result<InsightDetail, RemoteError>;
    async fn generate_audio(&self, request: AudioRequest) -> Result<AudioResponse, RemoteError>;
    async fn health(&self) -> Result<HealthResponse, RemoteError>;
}

pub struct MissingRemoteApi;

#[async_trait]
impl RemoteApi for MissingRemoteApi {
    async fn login(&self, _email: &str, _password: &str) -> Result<LoginResponse, RemoteError> {
        Err(RemoteError::unavailable("login"))
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, RemoteError> {
        Err(RemoteError::unavailable("list documents"))
    }

    async fn upload_documents(
        &self,
        _uploads: Vec<DocumentUpload>,
    ) -> Result<Vec<DocumentSummary>, RemoteError> {
        Err(RemoteError::unavailable("upload documents"))
    }

    async fn delete_document(&self, id: DocumentId) -> Result<(), RemoteError> {
        Err(RemoteError::unavailable(&format!("delete document {}", id.0)))
    }

    async fn fetch_document_content(&self, id: DocumentId) -> Result<Vec<u8>, RemoteError> {
        Err(RemoteError::unavailable(&format!(
            "fetch content for document {}",
            id.0
        )))
    }

    async fn section_content(
        &self,
        id: DocumentId,
        page: u32,
    ) -> Result<Vec<SectionContent>, RemoteError> {
        Err(RemoteError::unavailable(&format!(
            "section content for document {} page {page}",
            id.0
        )))
    }

    async fn generate_insights(
        &self,
        _request: GenerateInsightsRequest,
    ) -> Result<InsightsPayload, RemoteError> {
        Err(RemoteError::unavailable("generate insights"))
    }

    async fn generate_detail(&self, _request: DetailRequest) -> Result<InsightDetail, RemoteError> {
        Err(RemoteError::unavailable("generate detail"))
    }

    async fn generate_job_insights(
        &self,
        _job_description: &str,
    ) -> Result<InsightDetail, RemoteError> {
        Err(RemoteError::unavailable("generate job insights"))
    }

    async fn generate_audio(&self, _request: AudioRequest) -> Result<AudioResponse, RemoteError> {
        Err(RemoteError::unavailable("generate audio"))
    }

    async fn health(&self) -> Result<HealthResponse, RemoteError> {
        Err(RemoteError::unavailable("health check"))
    }
}

#[derive(Serialize)]
struct JobInsightsRequest<'a> {
    #[serde(rename = "jobDescription")]
    job_description: &'a str,
}

/// HTTP implementation of [`RemoteApi`]. The bearer credential is read
/// from client storage and cached; a 401 on any auth-scoped endpoint
/// clears both so the next interactive action triggers re-authentication.
pub struct HttpRemoteApi {
    http: Client,
    base_url: Url,
    storage: Arc<SessionStorage>,
    token: Mutex<Option<String>>,
}

impl HttpRemoteApi {
    pub fn new(base_url: Url, storage: Arc<SessionStorage>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            storage,
            token: Mutex::new(None),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|err| anyhow::anyhow!("invalid endpoint path '{path}': {err}").into())
    }

    async fn bearer_token(&self) -> Result<String, RemoteError> {
        {
            let guard = self.token.lock().await;
            if let Some(token) = guard.as_ref() {
                return Ok(token.clone());
            }
        }
        let loaded = self
            .storage
            .load_credential()
            .await
            .map_err(RemoteError::Other)?
            .ok_or(RemoteError::MissingCredential)?;
        let mut guard = self.token.lock().await;
        *guard = Some(loaded.clone());
        Ok(loaded)
    }

    async fn remember_token(&self, token: &str) {
        if let Err(err) = self.storage.save_credential(token).await {
            warn!("failed to persist bearer credential: {err}");
        }
        let mut guard = self.token.lock().await;
        if let Some(mut stale) = guard.replace(token.to_string()) {
            stale.zeroize();
        }
    }

    async fn clear_credential(&self) {
        if let Some(mut stale) = self.token.lock().await.take() {
            stale.zeroize();
        }
        if let Err(err) = self.storage.clear_credential().await {
            warn!("failed to clear persisted credential: {err}");
        }
        info!("remote: cleared bearer credential after authorization failure");
    }

    /// Classify a non-success response, surfacing the backend's
    /// human-readable `error` field and clearing the credential on 401.
    async fn classify_failure(&self, response: Response) -> RemoteError {
        let status = response.status();
        let body = response.json::<ErrorBody>().await.ok();
        if status == StatusCode::UNAUTHORIZED {
            self.clear_credential().await;
            return RemoteError::Unauthorized {
                message: body
                    .map(|b| b.error)
                    .unwrap_or_else(|| "session expired".to_string()),
            };
        }
        RemoteError::Api(ApiException::from_response(status.as_u16(), body))
    }

    async fn read_json<T: DeserializeOwned>(&self, response: Response) -> Result<T, RemoteError> {
        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }
        Ok(response.json::<T>().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(self.endpoint(path)?)
            .bearer_auth(token)
            .send()
            .await?;
        self.read_json(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .post(self.endpoint(path)?)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        self.read_json(response).await
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, RemoteError> {
        let response = self
            .http
            .post(self.endpoint("/api/auth/login")?)
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let login: LoginResponse = self.read_json(response).await?;
        self.remember_token(&login.access_token).await;
        Ok(login)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>, RemoteError> {
        let list: DocumentListResponse = self.get_json("/api/pdfs").await?;
        Ok(list.documents)
    }

    async fn upload_documents(
        &self,
        uploads: Vec<DocumentUpload>,
    ) -> Result<Vec<DocumentSummary>, RemoteError> {
        let token = self.bearer_token().await?;
        let mut form = multipart::Form::new();
        for upload in uploads {
            let part = multipart::Part::bytes(upload.bytes)
                .file_name(upload.file_name)
                .mime_str("application/pdf")?;
            form = form.part("pdfs", part);
        }
        let response = self
            .http
            .post(self.endpoint("/api/pdfs/upload")?)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadResponse = self.read_json(response).await?;
        Ok(uploaded.documents)
    }

    async fn delete_document(&self, id: DocumentId) -> Result<(), RemoteError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .delete(self.endpoint(&format!("/api/pdfs/{}", id.0))?)
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }
        Ok(())
    }

    async fn fetch_document_content(&self, id: DocumentId) -> Result<Vec<u8>, RemoteError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(self.endpoint(&format!("/api/pdfs/{}/download", id.0))?)
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn section_content(
        &self,
        id: DocumentId,
        page: u32,
    ) -> Result<Vec<SectionContent>, RemoteError> {
        let response: SectionContentResponse = self
            .get_json(&format!("/api/insights/section-content/{}/{page}", id.0))
            .await?;
        Ok(response.sections)
    }

    async fn generate_insights(
        &self,
        request: GenerateInsightsRequest,
    ) -> Result<InsightsPayload, RemoteError> {
        let response: GenerateInsightsResponse = self
            .post_json("/api/insights/enhanced-generate", &request)
            .await?;
        Ok(response.insights)
    }

    async fn generate_detail(&self, request: DetailRequest) -> Result<InsightDetail, RemoteError> {
        let response: shared::protocol::DetailResponse = self
            .post_json("/api/insights/generate-bulb-insights", &request)
            .await?;
        Ok(response.detail)
    }

    async fn generate_job_insights(
        &self,
        job_description: &str,
    ) -> Result<InsightDetail, RemoteError> {
        let response: shared::protocol::DetailResponse = self
            .post_json(
                "/api/insights/job-insights",
                &JobInsightsRequest { job_description },
            )
            .await?;
        Ok(response.detail)
    }

    async fn generate_audio(&self, request: AudioRequest) -> Result<AudioResponse, RemoteError> {
        self.post_json("/api/insights/generate-podcast", &request)
            .await
    }

    async fn health(&self) -> Result<HealthResponse, RemoteError> {
        let response = self.http.get(self.endpoint("/api/health")?).send().await?;
        self.read_json(response).await
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
