//! Presence state machine for lane cameras.
//!
//! `watching -> confirming -> recording -> draining`. The machine only counts
//! frames; the worker performs the detection calls and side effects its
//! actions ask for.

#[derive(Debug, Clone)]
pub struct LaneParams {
    pub min_start_faces: usize,
    pub max_frames_without_faces: usize,
    pub min_faces: usize,
    pub faced_frames_reset: usize,
}

impl Default for LaneParams {
    fn default() -> Self {
        Self {
            min_start_faces: 20,
            max_frames_without_faces: 50,
            min_faces: 10,
            faced_frames_reset: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Watching,
    Confirming,
    Recording,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneAction {
    None,
    /// Run the expensive live-model detection on the current frame
    Confirm,
    SessionStart,
    /// Persist the crops of the current frame
    SaveFaces,
    SessionEnd { faces: usize, got_faces: bool },
}

#[derive(Debug)]
pub struct LaneMachine {
    params: LaneParams,
    state: LaneState,
    face_sequence: usize,
    frames_without_faces: usize,
    consecutive_faced: usize,
    collected_faces: usize,
}

impl LaneMachine {
    pub fn new(params: LaneParams) -> Self {
        Self {
            params,
            state: LaneState::Watching,
            face_sequence: 0,
            frames_without_faces: 0,
            consecutive_faced: 0,
            collected_faces: 0,
        }
    }

    pub fn state(&self) -> LaneState {
        self.state
    }

    pub fn face_sequence(&self) -> usize {
        self.face_sequence
    }

    pub fn collected_faces(&self) -> usize {
        self.collected_faces
    }

    pub fn on_frame(&mut self, face_count: usize) -> LaneAction {
        match self.state {
            LaneState::Watching => {
                if face_count == 0 {
                    self.face_sequence = 0;
                    return LaneAction::None;
                }
                self.face_sequence += 1;
                if self.face_sequence >= self.params.min_start_faces {
                    self.state = LaneState::Confirming;
                    return LaneAction::Confirm;
                }
                LaneAction::None
            }
            // frames arriving while a confirmation is pending are ignored
            LaneState::Confirming | LaneState::Draining => LaneAction::None,
            LaneState::Recording => {
                if face_count > 0 {
                    self.collected_faces += face_count;
                    self.consecutive_faced += 1;
                    if self.consecutive_faced >= self.params.faced_frames_reset {
                        self.frames_without_faces = 0;
                    }
                    return LaneAction::SaveFaces;
                }

                self.consecutive_faced = 0;
                self.frames_without_faces += 1;
                if self.frames_without_faces >= self.params.max_frames_without_faces {
                    self.state = LaneState::Draining;
                    return LaneAction::SessionEnd {
                        faces: self.collected_faces,
                        got_faces: self.collected_faces >= self.params.min_faces,
                    };
                }
                LaneAction::None
            }
        }
    }

    pub fn on_confirmation(&mut self, confirmed: bool) -> LaneAction {
        if self.state != LaneState::Confirming {
            return LaneAction::None;
        }
        self.face_sequence = 0;
        if confirmed {
            self.state = LaneState::Recording;
            self.frames_without_faces = 0;
            self.consecutive_faced = 0;
            self.collected_faces = 0;
            LaneAction::SessionStart
        } else {
            self.state = LaneState::Watching;
            LaneAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LaneParams {
        LaneParams {
            min_start_faces: 20,
            max_frames_without_faces: 5,
            min_faces: 3,
            faced_frames_reset: 10,
        }
    }

    #[test]
    fn test_gap_resets_sequence_before_confirmation() {
        let mut lane = LaneMachine::new(params());
        for _ in 0..19 {
            assert_eq!(lane.on_frame(1), LaneAction::None);
        }
        assert_eq!(lane.face_sequence(), 19);

        assert_eq!(lane.on_frame(0), LaneAction::None);
        assert_eq!(lane.face_sequence(), 0);
        assert_eq!(lane.state(), LaneState::Watching);
    }

    #[test]
    fn test_confirmation_failure_returns_to_watching() {
        let mut lane = LaneMachine::new(params());
        for _ in 0..19 {
            lane.on_frame(1);
        }
        assert_eq!(lane.on_frame(2), LaneAction::Confirm);
        assert_eq!(lane.on_frame(1), LaneAction::None);

        assert_eq!(lane.on_confirmation(false), LaneAction::None);
        assert_eq!(lane.state(), LaneState::Watching);
        assert_eq!(lane.face_sequence(), 0);
    }

    #[test]
    fn test_full_session() {
        let mut lane = LaneMachine::new(params());
        for _ in 0..20 {
            lane.on_frame(1);
        }
        assert_eq!(lane.on_confirmation(true), LaneAction::SessionStart);
        assert_eq!(lane.state(), LaneState::Recording);

        assert_eq!(lane.on_frame(1), LaneAction::SaveFaces);
        assert_eq!(lane.on_frame(2), LaneAction::SaveFaces);
        for _ in 0..4 {
            assert_eq!(lane.on_frame(0), LaneAction::None);
        }
        assert_eq!(lane.on_frame(0), LaneAction::SessionEnd { faces: 3, got_faces: true });
        assert_eq!(lane.state(), LaneState::Draining);
        assert_eq!(lane.on_frame(1), LaneAction::None);
    }

    #[test]
    fn test_short_faced_runs_do_not_reset_counter() {
        let mut lane = LaneMachine::new(params());
        for _ in 0..20 {
            lane.on_frame(1);
        }
        lane.on_confirmation(true);

        // 4 empty, 9 faced (below the reset run), then one more empty ends it
        for _ in 0..4 {
            lane.on_frame(0);
        }
        for _ in 0..9 {
            lane.on_frame(1);
        }
        assert_eq!(lane.on_frame(0), LaneAction::SessionEnd { faces: 9, got_faces: true });
    }

    #[test]
    fn test_long_faced_run_resets_counter() {
        let mut lane = LaneMachine::new(params());
        for _ in 0..20 {
            lane.on_frame(1);
        }
        lane.on_confirmation(true);

        for _ in 0..4 {
            lane.on_frame(0);
        }
        for _ in 0..10 {
            lane.on_frame(1);
        }
        assert_eq!(lane.on_frame(0), LaneAction::None);
        assert_eq!(lane.state(), LaneState::Recording);
    }

    #[test]
    fn test_session_without_enough_faces() {
        let mut lane = LaneMachine::new(params());
        for _ in 0..20 {
            lane.on_frame(1);
        }
        lane.on_confirmation(true);
        lane.on_frame(1);
        for _ in 0..4 {
            lane.on_frame(0);
        }
        assert_eq!(lane.on_frame(0), LaneAction::SessionEnd { faces: 1, got_faces: false });
    }
}
