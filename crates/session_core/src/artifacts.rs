use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared::domain::CardId;
use shared::protocol::{AudioClip, AudioRequest, DetailRequest, InsightDetail};

use crate::remote::RemoteApi;
use crate::store::{Action, SessionStore};
use crate::Notice;

const DOWNLOAD_STEM_MAX_CHARS: usize = 48;

enum Flight<T> {
    Leader,
    Follower(broadcast::Receiver<std::result::Result<T, String>>),
}

type FlightMap<T> = Mutex<HashMap<CardId, broadcast::Sender<std::result::Result<T, String>>>>;

/// Lazily generates and caches per-card artifacts with single-flight
/// de-duplication: the first caller for a (card, kind) performs the network
/// call, every concurrent caller observes the same outcome, and nothing is
/// cached on failure so a retry stays possible.
pub struct ArtifactEngine {
    store: Arc<SessionStore>,
    remote: Arc<dyn RemoteApi>,
    notices: broadcast::Sender<Notice>,
    detail_flights: FlightMap<InsightDetail>,
    audio_flights: FlightMap<AudioClip>,
}

impl ArtifactEngine {
    pub fn new(
        store: Arc<SessionStore>,
        remote: Arc<dyn RemoteApi>,
        notices: broadcast::Sender<Notice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            remote,
            notices,
            detail_flights: Mutex::new(HashMap::new()),
            audio_flights: Mutex::new(HashMap::new()),
        })
    }

    fn cached_detail(&self, card_id: &CardId) -> Option<InsightDetail> {
        self.store
            .snapshot()
            .artifacts
            .get(card_id)
            .and_then(|a| a.detail.clone())
    }

    fn cached_audio(&self, card_id: &CardId) -> Option<AudioClip> {
        self.store
            .snapshot()
            .artifacts
            .get(card_id)
            .and_then(|a| a.audio.clone())
    }

    pub async fn ensure_detail(&self, card_id: &CardId) -> Result<InsightDetail> {
        if let Some(detail) = self.cached_detail(card_id) {
            return Ok(detail);
        }

        let flight = {
            let mut flights = self.detail_flights.lock().await;
            if let Some(tx) = flights.get(card_id) {
                Flight::Follower(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                flights.insert(card_id.clone(), tx);
                Flight::Leader
            }
        };

        match flight {
            Flight::Follower(mut rx) => match rx.recv().await {
                Ok(Ok(detail)) => Ok(detail),
                Ok(Err(message)) => Err(anyhow!(message)),
                Err(_) => Err(anyhow!("detail generation for card {card_id} was aborted")),
            },
            Flight::Leader => {
                // The cache may have been written between the first check
                // and claiming the flight.
                let result = match self.cached_detail(card_id) {
                    Some(detail) => Ok(detail),
                    None => self.request_detail(card_id).await,
                };
                if let Ok(detail) = &result {
                    self.store.dispatch(Action::StoreDetail {
                        card_id: card_id.clone(),
                        detail: detail.clone(),
                    });
                }
                let tx = self.detail_flights.lock().await.remove(card_id);
                match result {
                    Ok(detail) => {
                        if let Some(tx) = tx {
                            let _ = tx.send(Ok(detail.clone()));
                        }
                        Ok(detail)
                    }
                    Err(err) => {
                        let message = err.to_string();
                        warn!(card_id = %card_id, "artifacts: detail generation failed: {message}");
                        let _ = self.notices.send(Notice::GenerationFailed {
                            card_id: card_id.clone(),
                            message: message.clone(),
                        });
                        if let Some(tx) = tx {
                            let _ = tx.send(Err(message));
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    pub async fn ensure_audio(&self, card_id: &CardId) -> Result<AudioClip> {
        if let Some(clip) = self.cached_audio(card_id) {
            return Ok(clip);
        }

        let flight = {
            let mut flights = self.audio_flights.lock().await;
            if let Some(tx) = flights.get(card_id) {
                Flight::Follower(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                flights.insert(card_id.clone(), tx);
                Flight::Leader
            }
        };

        match flight {
            Flight::Follower(mut rx) => match rx.recv().await {
                Ok(Ok(clip)) => Ok(clip),
                Ok(Err(message)) => Err(anyhow!(message)),
                Err(_) => Err(anyhow!("audio generation for card {card_id} was aborted")),
            },
            Flight::Leader => {
                let result = match self.cached_audio(card_id) {
                    Some(clip) => Ok(clip),
                    None => self.request_audio(card_id).await,
                };
                if let Ok(clip) = &result {
                    self.store.dispatch(Action::StoreAudio {
                        card_id: card_id.clone(),
                        audio: clip.clone(),
                    });
                }
                let tx = self.audio_flights.lock().await.remove(card_id);
                match result {
                    Ok(clip) => {
                        if let Some(tx) = tx {
                            let _ = tx.send(Ok(clip.clone()));
                        }
                        Ok(clip)
                    }
                    Err(err) => {
                        let message = err.to_string();
                        warn!(card_id = %card_id, "artifacts: audio generation failed: {message}");
                        let _ = self.notices.send(Notice::GenerationFailed {
                            card_id: card_id.clone(),
                            message: message.clone(),
                        });
                        if let Some(tx) = tx {
                            let _ = tx.send(Err(message));
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Expose the generated audio for saving under a filename derived from
    /// the card heading. Playback state is left untouched.
    pub fn download_audio(&self, card_id: &CardId) -> Result<AudioDownload> {
        let snapshot = self.store.snapshot();
        let card = snapshot
            .card(card_id)
            .ok_or_else(|| anyhow!("card {card_id} is no longer part of the current batch"))?;
        let clip = snapshot
            .artifacts
            .get(card_id)
            .and_then(|a| a.audio.clone())
            .ok_or_else(|| anyhow!("no generated audio for card {card_id}"))?;
        Ok(AudioDownload {
            file_name: audio_download_name(&card.heading),
            clip,
        })
    }

    async fn request_detail(&self, card_id: &CardId) -> Result<InsightDetail> {
        let snapshot = self.store.snapshot();
        let card = snapshot
            .card(card_id)
            .ok_or_else(|| anyhow!("card {card_id} is no longer part of the current batch"))?;

        if card.id.is_job_description() {
            debug!("artifacts: generating job-description insights");
            return Ok(self.remote.generate_job_insights(&card.snippet).await?);
        }

        let (document_name, page_number) = card
            .source
            .map(|source| {
                let name = snapshot
                    .document(source.document_id)
                    .map(|d| d.display_name.clone())
                    .unwrap_or_default();
                (name, Some(source.page))
            })
            .unwrap_or_default();

        let request = DetailRequest {
            heading: card.heading.clone(),
            content: card.snippet.clone(),
            document_name,
            page_number,
        };
        Ok(self.remote.generate_detail(request).await?)
    }

    async fn request_audio(&self, card_id: &CardId) -> Result<AudioClip> {
        let snapshot = self.store.snapshot();
        let card = snapshot
            .card(card_id)
            .ok_or_else(|| anyhow!("card {card_id} is no longer part of the current batch"))?;

        let cached_detail = snapshot
            .artifacts
            .get(card_id)
            .and_then(|a| a.detail.clone());
        let (document_name, page_number) = card
            .source
            .map(|source| {
                let name = snapshot
                    .document(source.document_id)
                    .map(|d| d.display_name.clone())
                    .unwrap_or_default();
                (name, Some(source.page))
            })
            .unwrap_or_default();

        let request = AudioRequest {
            heading: card.heading.clone(),
            content: card.snippet.clone(),
            card_id: card_id.clone(),
            detail: cached_detail.clone(),
            document_name,
            page_number,
        };
        let response = self.remote.generate_audio(request).await?;

        // The service generates the detail alongside the audio when the
        // request carried none; cache that too.
        if cached_detail.is_none() {
            if let Some(detail) = response.detail {
                self.store.dispatch(Action::StoreDetail {
                    card_id: card_id.clone(),
                    detail,
                });
            }
        }
        Ok(response.clip)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioDownload {
    pub clip: AudioClip,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub enum AudioOutputEvent {
    Finished(CardId),
}

/// The host-side audio element pool. Ephemeral playback handles live
/// behind this boundary; the coordinator only tracks per-card phases.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Start playing from position zero.
    async fn start(&self, card_id: &CardId, clip: &AudioClip) -> Result<()>;
    async fn pause(&self, card_id: &CardId) -> Result<()>;
    async fn resume(&self, card_id: &CardId) -> Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<AudioOutputEvent>;
}

pub struct MissingAudioOutput;

#[async_trait]
impl AudioOutput for MissingAudioOutput {
    async fn start(&self, card_id: &CardId, _clip: &AudioClip) -> Result<()> {
        Err(anyhow!("audio output unavailable for card {card_id}"))
    }

    async fn pause(&self, card_id: &CardId) -> Result<()> {
        Err(anyhow!("audio output unavailable for card {card_id}"))
    }

    async fn resume(&self, card_id: &CardId) -> Result<()> {
        Err(anyhow!("audio output unavailable for card {card_id}"))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AudioOutputEvent> {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        rx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Paused,
    Playing,
    Ended,
}

/// Enforces the one-card-playing-at-a-time rule across the session.
/// Absent map entry means no audio has been started for that card.
pub struct PlaybackCoordinator {
    output: Arc<dyn AudioOutput>,
    phases: Mutex<HashMap<CardId, PlaybackPhase>>,
}

impl PlaybackCoordinator {
    pub fn new(output: Arc<dyn AudioOutput>) -> Arc<Self> {
        Arc::new(Self {
            output,
            phases: Mutex::new(HashMap::new()),
        })
    }

    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut events = coordinator.output.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    AudioOutputEvent::Finished(card_id) => {
                        let mut phases = coordinator.phases.lock().await;
                        phases.insert(card_id.clone(), PlaybackPhase::Ended);
                        info!(card_id = %card_id, "playback: finished");
                    }
                }
            }
        })
    }

    pub async fn phase(&self, card_id: &CardId) -> Option<PlaybackPhase> {
        self.phases.lock().await.get(card_id).copied()
    }

    pub async fn play(&self, card_id: &CardId, clip: &AudioClip) -> Result<()> {
        let mut phases = self.phases.lock().await;
        self.pause_other_locked(&mut phases, card_id).await;
        match phases.get(card_id) {
            Some(PlaybackPhase::Playing) => {}
            Some(PlaybackPhase::Paused) => {
                self.output.resume(card_id).await?;
                phases.insert(card_id.clone(), PlaybackPhase::Playing);
            }
            Some(PlaybackPhase::Ended) | None => {
                self.output.start(card_id, clip).await?;
                phases.insert(card_id.clone(), PlaybackPhase::Playing);
            }
        }
        Ok(())
    }

    pub async fn pause(&self, card_id: &CardId) -> Result<()> {
        let mut phases = self.phases.lock().await;
        if phases.get(card_id) == Some(&PlaybackPhase::Playing) {
            self.output.pause(card_id).await?;
            phases.insert(card_id.clone(), PlaybackPhase::Paused);
        }
        Ok(())
    }

    /// Reset to position zero and resume playing.
    pub async fn restart(&self, card_id: &CardId, clip: &AudioClip) -> Result<()> {
        let mut phases = self.phases.lock().await;
        self.pause_other_locked(&mut phases, card_id).await;
        self.output.start(card_id, clip).await?;
        phases.insert(card_id.clone(), PlaybackPhase::Playing);
        Ok(())
    }

    async fn pause_other_locked(
        &self,
        phases: &mut HashMap<CardId, PlaybackPhase>,
        card_id: &CardId,
    ) {
        let playing_other = phases
            .iter()
            .find(|(id, phase)| **phase == PlaybackPhase::Playing && *id != card_id)
            .map(|(id, _)| id.clone());
        if let Some(other) = playing_other {
            if let Err(err) = self.output.pause(&other).await {
                warn!(card_id = %other, "playback: failed to pause previous audio: {err}");
            }
            phases.insert(other, PlaybackPhase::Paused);
        }
    }
}

/// Derive a download filename from a card heading, restricted to
/// alphanumerics with underscore separators.
pub fn audio_download_name(heading: &str) -> String {
    let mut stem = String::new();
    let mut pending_separator = false;
    for ch in heading.chars() {
        if stem.len() >= DOWNLOAD_STEM_MAX_CHARS {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !stem.is_empty() {
                stem.push('_');
            }
            pending_separator = false;
            stem.push(ch);
        } else {
            pending_separator = true;
        }
    }
    if stem.is_empty() {
        "podcast.mp3".to_string()
    } else {
        format!("{stem}.mp3")
    }
}

#[cfg(test)]
#[path = "tests/artifacts_tests.rs"]
mod tests;
