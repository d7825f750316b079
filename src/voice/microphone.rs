//! Exclusive microphone ownership
//!
//! The hotword detector and the command transcriber both capture audio, but
//! never at the same time. Both go through this token before touching the
//! device, so an ordering bug shows up as `MicrophoneBusy` instead of two
//! engines fighting over one input.

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::VoiceError;

/// Who currently holds the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicOwner {
    Detector,
    Transcriber,
}

impl std::fmt::Display for MicOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MicOwner::Detector => write!(f, "detector"),
            MicOwner::Transcriber => write!(f, "transcriber"),
        }
    }
}

/// Single-owner microphone token
#[derive(Debug, Default)]
pub struct Microphone {
    owner: Mutex<Option<MicOwner>>,
}

impl Microphone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the microphone; re-acquiring by the current owner is allowed
    pub fn acquire(&self, who: MicOwner) -> Result<(), VoiceError> {
        let mut owner = self.owner.lock();
        match *owner {
            Some(current) if current != who => {
                warn!(%current, requested = %who, "microphone already owned");
                Err(VoiceError::MicrophoneBusy(current))
            }
            _ => {
                *owner = Some(who);
                debug!(owner = %who, "microphone acquired");
                Ok(())
            }
        }
    }

    /// Give the microphone back; ignored unless `who` owns it
    pub fn release(&self, who: MicOwner) {
        let mut owner = self.owner.lock();
        if *owner == Some(who) {
            *owner = None;
            debug!(owner = %who, "microphone released");
        }
    }

    #[cfg(test)]
    pub fn owner(&self) -> Option<MicOwner> {
        *self.owner.lock()
    }
}
