//! # Playback Manager
//!
//! Host-facing registry of playback sessions keyed by [`ContextId`].
//!
//! `init_decoder` returns immediately; the media is opened on a
//! `vivista-init` thread while the host polls `get_player_state`
//! (`Uninitialized`, then `Initialized` or `InitFail`). `start` joins that
//! thread if it is still running. Ids are reused: a new context gets the
//! lowest id not currently registered.

use crate::backend::MediaBackend;
use crate::config::PlayerConfig;
use crate::media::{AudioFrame, AudioInfo, VideoFrame, VideoInfo};
use crate::session::{PlaybackSession, PlayerError};
use crate::state::PlayerState;
use crate::sync::MasterClock;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u32);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type InitOutcome = Result<PlaybackSession, String>;

struct Context {
    path: String,
    init: Mutex<Option<JoinHandle<Result<PlaybackSession, PlayerError>>>>,
    outcome: OnceCell<InitOutcome>,
}

impl Context {
    /// The init outcome, joining the init thread when it has finished or
    /// `wait` is set. `None` while still initializing.
    fn resolve(&self, wait: bool) -> Option<&InitOutcome> {
        if let Some(outcome) = self.outcome.get() {
            return Some(outcome);
        }
        let mut init = self.init.lock();
        if let Some(outcome) = self.outcome.get() {
            return Some(outcome);
        }
        if !wait && !init.as_ref().is_some_and(JoinHandle::is_finished) {
            return None;
        }
        let handle = init.take()?;
        let outcome = match handle.join() {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("init thread panicked".to_string()),
        };
        if let Err(reason) = &outcome {
            warn!("failed to open {}: {}", self.path, reason);
        }
        // Only this thread can fill the cell while holding `init`.
        let _ = self.outcome.set(outcome);
        self.outcome.get()
    }
}

pub struct PlaybackManager {
    backend: Arc<dyn MediaBackend>,
    config: PlayerConfig,
    contexts: Mutex<HashMap<ContextId, Arc<Context>>>,
}

impl PlaybackManager {
    pub fn new(backend: Arc<dyn MediaBackend>, config: PlayerConfig) -> Self {
        Self {
            backend,
            config,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Register a context for `path` and start opening it in the
    /// background.
    pub fn init_decoder(&self, path: &str) -> Result<ContextId, PlayerError> {
        let mut contexts = self.contexts.lock();
        let id = (0..)
            .map(ContextId)
            .find(|id| !contexts.contains_key(id))
            .ok_or_else(|| PlayerError::InitFailed("no free context id".into()))?;

        let backend = self.backend.clone();
        let config = self.config.clone();
        let owned_path = path.to_string();
        let handle = std::thread::Builder::new()
            .name("vivista-init".to_string())
            .spawn(move || PlaybackSession::open(backend.as_ref(), &owned_path, config))
            .map_err(|source| PlayerError::Thread {
                name: "vivista-init",
                source,
            })?;

        contexts.insert(
            id,
            Arc::new(Context {
                path: path.to_string(),
                init: Mutex::new(Some(handle)),
                outcome: OnceCell::new(),
            }),
        );
        info!("context {} created for {}", id, path);
        Ok(id)
    }

    fn context(&self, id: ContextId) -> Result<Arc<Context>, PlayerError> {
        self.contexts
            .lock()
            .get(&id)
            .cloned()
            .ok_or(PlayerError::UnknownContext(id))
    }

    fn with_session<R>(
        &self,
        id: ContextId,
        wait: bool,
        f: impl FnOnce(&PlaybackSession) -> Result<R, PlayerError>,
    ) -> Result<R, PlayerError> {
        let context = self.context(id)?;
        match context.resolve(wait) {
            None => Err(PlayerError::Initializing(id)),
            Some(Err(reason)) => Err(PlayerError::InitFailed(reason.clone())),
            Some(Ok(session)) => f(session),
        }
    }

    /// Polling helper: `None` unless the session is open.
    fn query<R>(&self, id: ContextId, f: impl FnOnce(&PlaybackSession) -> R) -> Option<R> {
        self.with_session(id, false, |session| Ok(f(session))).ok()
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn start(&self, id: ContextId) -> Result<(), PlayerError> {
        self.with_session(id, true, PlaybackSession::start)
    }

    pub fn seek(&self, id: ContextId, seconds: f64) -> Result<(), PlayerError> {
        self.with_session(id, true, |session| session.seek(seconds))
    }

    pub fn stop(&self, id: ContextId) -> Result<(), PlayerError> {
        self.with_session(id, true, |session| {
            session.stop();
            Ok(())
        })
    }

    pub fn pause(&self, id: ContextId) -> Result<(), PlayerError> {
        self.with_session(id, true, PlaybackSession::pause)
    }

    pub fn resume(&self, id: ContextId) -> Result<(), PlayerError> {
        self.with_session(id, true, PlaybackSession::resume)
    }

    pub fn enable_video(&self, id: ContextId, enabled: bool) -> Result<(), PlayerError> {
        self.with_session(id, true, |session| {
            session.enable_video(enabled);
            Ok(())
        })
    }

    pub fn enable_audio(&self, id: ContextId, enabled: bool) -> Result<(), PlayerError> {
        self.with_session(id, true, |session| {
            session.enable_audio(enabled);
            Ok(())
        })
    }

    /// Stop the session and forget the context. The id becomes free.
    pub fn destroy(&self, id: ContextId) -> bool {
        let Some(context) = self.contexts.lock().remove(&id) else {
            return false;
        };
        if let Some(Ok(session)) = context.outcome.get() {
            session.stop();
        }
        info!("context {} destroyed", id);
        true
    }

    /// Registered ids, ascending.
    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<_> = self.contexts.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// `None` for an unknown context.
    pub fn get_player_state(&self, id: ContextId) -> Option<PlayerState> {
        let context = self.context(id).ok()?;
        Some(match context.resolve(false) {
            None => PlayerState::Uninitialized,
            Some(Err(_)) => PlayerState::InitFail,
            Some(Ok(session)) => session.state(),
        })
    }

    pub fn get_video_frame(&self, id: ContextId) -> Option<VideoFrame> {
        self.query(id, PlaybackSession::get_video_frame).flatten()
    }

    pub fn free_video_frame(&self, id: ContextId) {
        self.query(id, PlaybackSession::free_video_frame);
    }

    pub fn get_audio_frame(&self, id: ContextId) -> Option<AudioFrame> {
        self.query(id, PlaybackSession::get_audio_frame).flatten()
    }

    pub fn free_audio_frame(&self, id: ContextId) {
        self.query(id, PlaybackSession::free_audio_frame);
    }

    /// True once the read loop hit the end, and for contexts that will never
    /// play (unknown or failed).
    pub fn is_eof(&self, id: ContextId) -> bool {
        let Ok(context) = self.context(id) else {
            return true;
        };
        match context.resolve(false) {
            None => false,
            Some(Err(_)) => true,
            Some(Ok(session)) => session.is_eof(),
        }
    }

    pub fn get_video_info(&self, id: ContextId) -> Option<VideoInfo> {
        self.query(id, PlaybackSession::video_info)
    }

    pub fn get_audio_info(&self, id: ContextId) -> Option<AudioInfo> {
        self.query(id, PlaybackSession::audio_info)
    }

    pub fn is_seek_over(&self, id: ContextId) -> bool {
        self.query(id, PlaybackSession::is_seek_over).unwrap_or(false)
    }

    pub fn is_content_ready(&self, id: ContextId) -> bool {
        self.query(id, PlaybackSession::is_content_ready)
            .unwrap_or(false)
    }

    pub fn is_video_buffer_full(&self, id: ContextId) -> bool {
        self.query(id, PlaybackSession::is_video_buffer_full)
            .unwrap_or(false)
    }

    pub fn is_video_buffer_empty(&self, id: ContextId) -> bool {
        self.query(id, PlaybackSession::is_video_buffer_empty)
            .unwrap_or(true)
    }

    pub fn get_master_clock(&self, id: ContextId) -> Option<MasterClock> {
        self.query(id, PlaybackSession::master_clock)
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        for id in self.contexts() {
            self.destroy(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{FaultPlan, SyntheticBackend, SyntheticMedia};
    use std::time::{Duration, Instant};

    fn manager() -> PlaybackManager {
        let backend = SyntheticBackend::new()
            .with_media("good", SyntheticMedia::new(1.0))
            .with_media(
                "broken",
                SyntheticMedia::new(1.0).with_faults(FaultPlan {
                    fail_stream_info: true,
                    ..FaultPlan::default()
                }),
            );
        let config = PlayerConfig {
            pace_video: false,
            ..PlayerConfig::default()
        };
        PlaybackManager::new(Arc::new(backend), config)
    }

    fn wait_state(manager: &PlaybackManager, id: ContextId) -> PlayerState {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let state = manager.get_player_state(id).unwrap();
            if state != PlayerState::Uninitialized {
                return state;
            }
            assert!(Instant::now() < deadline, "init never finished");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_ids_are_reused_lowest_first() {
        let manager = manager();
        let a = manager.init_decoder("good").unwrap();
        let b = manager.init_decoder("good").unwrap();
        let c = manager.init_decoder("good").unwrap();
        assert_eq!((a, b, c), (ContextId(0), ContextId(1), ContextId(2)));

        assert!(manager.destroy(b));
        assert!(!manager.destroy(b));
        assert_eq!(manager.contexts(), vec![ContextId(0), ContextId(2)]);
        assert_eq!(manager.init_decoder("good").unwrap(), ContextId(1));
    }

    #[test]
    fn test_init_failure_surfaces_as_init_fail() {
        let manager = manager();
        let id = manager.init_decoder("broken").unwrap();
        assert_eq!(wait_state(&manager, id), PlayerState::InitFail);
        assert!(matches!(manager.start(id), Err(PlayerError::InitFailed(_))));
        assert!(manager.is_eof(id));
        assert!(manager.get_video_info(id).is_none());

        let missing = manager.init_decoder("nowhere").unwrap();
        assert!(manager.start(missing).is_err());
        assert_eq!(manager.get_player_state(missing), Some(PlayerState::InitFail));
    }

    #[test]
    fn test_start_joins_init() {
        let manager = manager();
        let id = manager.init_decoder("good").unwrap();
        manager.start(id).unwrap();
        assert!(matches!(
            manager.get_player_state(id),
            Some(PlayerState::Playing | PlayerState::PlayEof)
        ));
        assert!(manager.get_video_info(id).unwrap().is_present);

        manager.stop(id).unwrap();
        assert_eq!(manager.get_player_state(id), Some(PlayerState::Stop));
    }

    #[test]
    fn test_unknown_context() {
        let manager = manager();
        let id = ContextId(7);
        assert_eq!(manager.get_player_state(id), None);
        assert!(manager.is_eof(id));
        assert!(manager.get_video_frame(id).is_none());
        assert!(matches!(
            manager.seek(id, 1.0),
            Err(PlayerError::UnknownContext(ContextId(7)))
        ));
    }
}
