//! Presence state machine for kiosk cameras.
//!
//! Kiosks never record. A confirmed presence collects face crops until
//! `max_kiosk_faces` is reached, then hands them to recognition. The presence
//! ends when the subject leaves or `session_timeout` elapses, whichever
//! comes first.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct KioskParams {
    pub min_start_faces: usize,
    pub max_frames_without_faces: usize,
    pub session_timeout: Duration,
    pub max_kiosk_faces: usize,
}

impl Default for KioskParams {
    fn default() -> Self {
        Self {
            min_start_faces: 20,
            max_frames_without_faces: 50,
            session_timeout: Duration::from_secs(30),
            max_kiosk_faces: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEnd {
    Left,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KioskAction {
    None,
    PresenceStart,
    SaveFaces,
    /// Enough crops collected, hand them to recognition
    FacesReady,
    PresenceEnd(PresenceEnd),
}

#[derive(Debug)]
pub struct KioskMachine {
    params: KioskParams,
    confirmed_at: Option<Instant>,
    face_sequence: usize,
    frames_without_faces: usize,
    collected_faces: usize,
    handed_off: bool,
}

impl KioskMachine {
    pub fn new(params: KioskParams) -> Self {
        Self {
            params,
            confirmed_at: None,
            face_sequence: 0,
            frames_without_faces: 0,
            collected_faces: 0,
            handed_off: false,
        }
    }

    pub fn is_present(&self) -> bool {
        self.confirmed_at.is_some()
    }

    fn reset(&mut self) {
        self.confirmed_at = None;
        self.face_sequence = 0;
        self.frames_without_faces = 0;
        self.collected_faces = 0;
        self.handed_off = false;
    }

    pub fn on_frame(&mut self, face_count: usize, now: Instant) -> KioskAction {
        let Some(confirmed_at) = self.confirmed_at else {
            if face_count == 0 {
                self.face_sequence = 0;
                return KioskAction::None;
            }
            self.face_sequence += 1;
            if self.face_sequence >= self.params.min_start_faces {
                self.confirmed_at = Some(now);
                self.frames_without_faces = 0;
                return KioskAction::PresenceStart;
            }
            return KioskAction::None;
        };

        if now.duration_since(confirmed_at) >= self.params.session_timeout {
            self.reset();
            return KioskAction::PresenceEnd(PresenceEnd::Timeout);
        }

        if face_count == 0 {
            self.frames_without_faces += 1;
            if self.frames_without_faces >= self.params.max_frames_without_faces {
                self.reset();
                return KioskAction::PresenceEnd(PresenceEnd::Left);
            }
            return KioskAction::None;
        }

        self.frames_without_faces = 0;
        if self.handed_off {
            return KioskAction::None;
        }
        self.collected_faces += face_count;
        if self.collected_faces >= self.params.max_kiosk_faces {
            self.handed_off = true;
            return KioskAction::FacesReady;
        }
        KioskAction::SaveFaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KioskParams {
        KioskParams {
            min_start_faces: 3,
            max_frames_without_faces: 4,
            session_timeout: Duration::from_secs(10),
            max_kiosk_faces: 2,
        }
    }

    fn confirm(kiosk: &mut KioskMachine, now: Instant) {
        kiosk.on_frame(1, now);
        kiosk.on_frame(1, now);
        assert_eq!(kiosk.on_frame(1, now), KioskAction::PresenceStart);
    }

    #[test]
    fn test_collects_then_hands_off_once() {
        let now = Instant::now();
        let mut kiosk = KioskMachine::new(params());
        confirm(&mut kiosk, now);

        assert_eq!(kiosk.on_frame(1, now), KioskAction::SaveFaces);
        assert_eq!(kiosk.on_frame(1, now), KioskAction::FacesReady);
        assert_eq!(kiosk.on_frame(1, now), KioskAction::None);
        assert!(kiosk.is_present());
    }

    #[test]
    fn test_no_face_counter_ends_presence() {
        let now = Instant::now();
        let mut kiosk = KioskMachine::new(params());
        confirm(&mut kiosk, now);

        for _ in 0..3 {
            assert_eq!(kiosk.on_frame(0, now), KioskAction::None);
        }
        assert_eq!(kiosk.on_frame(0, now), KioskAction::PresenceEnd(PresenceEnd::Left));
        assert!(!kiosk.is_present());
    }

    #[test]
    fn test_session_timeout_allows_new_recognition() {
        let start = Instant::now();
        let mut kiosk = KioskMachine::new(params());
        confirm(&mut kiosk, start);
        kiosk.on_frame(1, start);
        assert_eq!(kiosk.on_frame(1, start), KioskAction::FacesReady);

        let later = start + Duration::from_secs(11);
        assert_eq!(kiosk.on_frame(1, later), KioskAction::PresenceEnd(PresenceEnd::Timeout));

        // same person still standing there starts a fresh session
        confirm(&mut kiosk, later);
        kiosk.on_frame(1, later);
        assert_eq!(kiosk.on_frame(1, later), KioskAction::FacesReady);
    }

    #[test]
    fn test_gap_before_presence_resets_sequence() {
        let now = Instant::now();
        let mut kiosk = KioskMachine::new(params());
        kiosk.on_frame(1, now);
        kiosk.on_frame(1, now);
        kiosk.on_frame(0, now);
        assert_eq!(kiosk.on_frame(1, now), KioskAction::None);
        assert!(!kiosk.is_present());
    }
}
