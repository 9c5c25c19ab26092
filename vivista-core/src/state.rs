//! Player state machine.
//!
//! Raw values are part of the host ABI and must not change.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PlayerState {
    InitFail = -1,
    Uninitialized = 0,
    Initialized = 1,
    Playing = 2,
    Seek = 3,
    Buffering = 4,
    PlayEof = 5,
    Stop = 6,
    Pause = 7,
}

impl PlayerState {
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            -1 => Self::InitFail,
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            2 => Self::Playing,
            3 => Self::Seek,
            4 => Self::Buffering,
            5 => Self::PlayEof,
            6 => Self::Stop,
            7 => Self::Pause,
            _ => return None,
        })
    }

    /// Media opened and codecs ready; true for every state after init
    /// except `Stop`.
    pub fn is_initialized(self) -> bool {
        matches!(
            self,
            Self::Initialized
                | Self::Playing
                | Self::Seek
                | Self::Buffering
                | Self::PlayEof
                | Self::Pause
        )
    }

    /// Worker threads are running.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::Playing | Self::Seek | Self::Buffering | Self::PlayEof | Self::Pause
        )
    }

    pub fn accepts_seek(self) -> bool {
        self.is_initialized() && self != Self::Seek
    }

    /// Frames may be handed to the host.
    pub fn is_presenting(self) -> bool {
        matches!(self, Self::Playing | Self::Buffering | Self::PlayEof)
    }
}

/// Atomic cell holding a [`PlayerState`].
#[derive(Debug)]
pub struct StateCell(AtomicI32);

impl StateCell {
    pub fn new(state: PlayerState) -> Self {
        Self(AtomicI32::new(state.as_raw()))
    }

    pub fn get(&self) -> PlayerState {
        PlayerState::from_raw(self.0.load(Ordering::SeqCst)).unwrap_or(PlayerState::InitFail)
    }

    pub fn set(&self, state: PlayerState) {
        let old = self.0.swap(state.as_raw(), Ordering::SeqCst);
        if old != state.as_raw() {
            tracing::debug!(
                "player state {:?} -> {:?}",
                PlayerState::from_raw(old),
                state
            );
        }
    }

    /// Move `from -> to` only if the current state is still `from`.
    pub fn transition(&self, from: PlayerState, to: PlayerState) -> bool {
        let moved = self
            .0
            .compare_exchange(from.as_raw(), to.as_raw(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            tracing::debug!("player state {:?} -> {:?}", from, to);
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values() {
        assert_eq!(PlayerState::InitFail.as_raw(), -1);
        assert_eq!(PlayerState::Pause.as_raw(), 7);
        for raw in -1..=7 {
            assert_eq!(PlayerState::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(PlayerState::from_raw(8), None);
    }

    #[test]
    fn test_predicates() {
        assert!(!PlayerState::Uninitialized.is_initialized());
        assert!(!PlayerState::InitFail.is_initialized());
        assert!(!PlayerState::Stop.is_initialized());
        assert!(PlayerState::Initialized.accepts_seek());
        assert!(PlayerState::PlayEof.accepts_seek());
        assert!(!PlayerState::Seek.accepts_seek());
        assert!(PlayerState::Pause.is_running());
        assert!(!PlayerState::Pause.is_presenting());
    }

    #[test]
    fn test_transition_only_from_expected() {
        let cell = StateCell::new(PlayerState::Playing);
        assert!(!cell.transition(PlayerState::Seek, PlayerState::Playing));
        assert!(cell.transition(PlayerState::Playing, PlayerState::PlayEof));
        assert_eq!(cell.get(), PlayerState::PlayEof);
    }
}
