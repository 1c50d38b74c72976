use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(DocumentId);

/// Identifier of one derived-content card. Section cards get batch-scoped
/// ids from the insight generator; the job-description pseudo-card always
/// uses [`JOB_DESCRIPTION_CARD`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(pub String);

impl CardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_job_description(&self) -> bool {
        self.0 == JOB_DESCRIPTION_CARD
    }
}

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reserved id of the singular job-description pseudo-card.
pub const JOB_DESCRIPTION_CARD: &str = "job-description";

/// Remote processing status of an uploaded document. The backend also
/// reports a transient "processing" phase; locally it is indistinguishable
/// from pending, so it deserializes as such.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[serde(alias = "processing")]
    Pending,
    Completed,
    #[serde(alias = "failed")]
    Error,
}

impl ProcessingState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ProcessingState::Pending)
    }
}
