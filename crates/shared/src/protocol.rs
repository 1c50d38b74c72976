use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CardId, DocumentId, ProcessingState, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub user: UserProfile,
}

/// One entry of the remote document list. Field names follow the reader
/// backend's camelCase JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub upload_date: DateTime<Utc>,
    pub processing_status: ProcessingState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentListResponse {
    #[serde(rename = "pdfs")]
    pub documents: Vec<DocumentSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    #[serde(rename = "pdfs")]
    pub documents: Vec<DocumentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInsightsRequest {
    pub job_to_be_done: String,
    #[serde(rename = "pdfIds")]
    pub document_ids: Vec<DocumentId>,
}

/// One ranked section produced by the insight generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionInsight {
    pub id: CardId,
    pub title: String,
    pub content: String,
    pub page: u32,
    #[serde(rename = "pdfId")]
    pub document_id: DocumentId,
    pub importance_rank: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsPayload {
    pub sections: Vec<SectionInsight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cards: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateInsightsResponse {
    pub insights: InsightsPayload,
}

/// Structured insight breakdown attached to a card ("bulb" detail).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightDetail {
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub did_you_know: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
    #[serde(default)]
    pub inspirations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailRequest {
    pub heading: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "pdfName", default)]
    pub document_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailResponse {
    #[serde(rename = "backsideInsights")]
    pub detail: InsightDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioRequest {
    pub heading: String,
    #[serde(default)]
    pub content: String,
    pub card_id: CardId,
    #[serde(
        rename = "backsideInsights",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub detail: Option<InsightDetail>,
    #[serde(rename = "pdfName", default)]
    pub document_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}

/// A playable derived-audio resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioClip {
    pub audio_location: String,
    pub duration_secs: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioResponse {
    #[serde(rename = "podcast")]
    pub clip: AudioClip,
    /// Present when the service had to generate the detail alongside the
    /// audio because the request carried none.
    #[serde(
        rename = "backsideInsights",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub detail: Option<InsightDetail>,
}

/// Full text of one section, used to derive highlight search phrases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionContent {
    pub section_title: String,
    pub content: String,
    pub page_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionContentResponse {
    #[serde(rename = "pdf_id")]
    pub document_id: DocumentId,
    pub page_number: u32,
    pub sections: Vec<SectionContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
