//! Session state machine.
//!
//! Pure functions relating a session's phase timestamps to its status:
//! the explicit transition table, [`next_status`] for instrument completion,
//! [`derive_status`] for timestamp consistency, and the weighted
//! [`completion_percentage`]. Nothing in here touches storage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Weight of the consent milestone in the completion percentage.
pub const CONSENT_WEIGHT: u8 = 25;
/// Weight of the questionnaire (instrument A) milestone.
pub const QUESTIONNAIRE_WEIGHT: u8 = 35;
/// Weight of the interview (instrument B) milestone.
pub const INTERVIEW_WEIGHT: u8 = 40;

/// One of the two assessment instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Instrument A: the fixed-choice categorized questionnaire.
    #[serde(rename = "A")]
    Questionnaire,
    /// Instrument B: the free-form conversational interview.
    #[serde(rename = "B")]
    Interview,
}

impl InstrumentKind {
    /// Both instruments, A first.
    pub const ALL: [InstrumentKind; 2] = [InstrumentKind::Questionnaire, InstrumentKind::Interview];

    /// Short tag used in storage and capture entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Questionnaire => "A",
            InstrumentKind::Interview => "B",
        }
    }

    /// The other instrument.
    pub fn other(&self) -> Self {
        match self {
            InstrumentKind::Questionnaire => InstrumentKind::Interview,
            InstrumentKind::Interview => InstrumentKind::Questionnaire,
        }
    }

    /// In-progress status for this instrument.
    pub fn in_progress(&self) -> SessionStatus {
        match self {
            InstrumentKind::Questionnaire => SessionStatus::QuestionnaireInProgress,
            InstrumentKind::Interview => SessionStatus::InterviewInProgress,
        }
    }
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InstrumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "a" | "questionnaire" => Ok(InstrumentKind::Questionnaire),
            "b" | "interview" => Ok(InstrumentKind::Interview),
            _ => Err(format!("Unknown instrument kind: {}", s)),
        }
    }
}

/// Status of a screening session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, respondent has not started.
    Created,
    /// Consent step is pending.
    Consent,
    /// Consent given, camera check pending.
    CameraCheck,
    /// Questionnaire (A) is the active instrument.
    #[serde(rename = "a_in_progress")]
    QuestionnaireInProgress,
    /// Interview (B) is the active instrument.
    #[serde(rename = "b_in_progress")]
    InterviewInProgress,
    /// Both instruments started, neither finished.
    BothInProgress,
    /// Both instruments done.
    Completed,
    /// Interrupted, recoverable.
    Incomplete,
    /// Left by the respondent, recoverable.
    Abandoned,
    /// Terminal failure, not recoverable.
    Failed,
}

impl SessionStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Consent => "consent",
            SessionStatus::CameraCheck => "camera_check",
            SessionStatus::QuestionnaireInProgress => "a_in_progress",
            SessionStatus::InterviewInProgress => "b_in_progress",
            SessionStatus::BothInProgress => "both_in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Incomplete => "incomplete",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Failed => "failed",
        }
    }

    /// COMPLETED and FAILED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// INCOMPLETE and ABANDONED may be recovered.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SessionStatus::Incomplete | SessionStatus::Abandoned)
    }

    /// One of the instrument phases.
    pub fn is_assessing(&self) -> bool {
        matches!(
            self,
            SessionStatus::QuestionnaireInProgress
                | SessionStatus::InterviewInProgress
                | SessionStatus::BothInProgress
        )
    }

    /// Whether `kind` may receive input while in this status.
    pub fn allows_instrument(&self, kind: InstrumentKind) -> bool {
        *self == SessionStatus::BothInProgress || *self == kind.in_progress()
    }

    /// The explicit transition table.
    ///
    /// `first` is the session's assigned first instrument: CAMERA_CHECK may
    /// only advance to that instrument's in-progress state.
    pub fn can_transition_to(&self, next: SessionStatus, first: InstrumentKind) -> bool {
        use SessionStatus::*;

        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }

        match next {
            Incomplete | Abandoned | Failed => return true,
            // Reset edges. Consent and camera check are the furthest a reset rolls back.
            Consent | CameraCheck if *self != Created => return true,
            _ => {}
        }

        match self {
            Created => next == Consent,
            Consent => next == CameraCheck,
            CameraCheck => next == first.in_progress(),
            QuestionnaireInProgress => {
                matches!(next, InterviewInProgress | BothInProgress | Completed)
            }
            InterviewInProgress => {
                matches!(next, QuestionnaireInProgress | BothInProgress | Completed)
            }
            BothInProgress => matches!(
                next,
                QuestionnaireInProgress | InterviewInProgress | Completed
            ),
            Incomplete | Abandoned => matches!(
                next,
                QuestionnaireInProgress | InterviewInProgress | BothInProgress
            ),
            Completed | Failed => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(SessionStatus::Created),
            "consent" => Ok(SessionStatus::Consent),
            "camera_check" => Ok(SessionStatus::CameraCheck),
            "a_in_progress" => Ok(SessionStatus::QuestionnaireInProgress),
            "b_in_progress" => Ok(SessionStatus::InterviewInProgress),
            "both_in_progress" => Ok(SessionStatus::BothInProgress),
            "completed" => Ok(SessionStatus::Completed),
            "incomplete" => Ok(SessionStatus::Incomplete),
            "abandoned" => Ok(SessionStatus::Abandoned),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Which phase milestones a session has reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Milestones {
    pub consent: bool,
    pub camera_check: bool,
    pub questionnaire_done: bool,
    pub interview_done: bool,
}

impl Milestones {
    /// Whether the given instrument is done.
    pub fn done(&self, kind: InstrumentKind) -> bool {
        match kind {
            InstrumentKind::Questionnaire => self.questionnaire_done,
            InstrumentKind::Interview => self.interview_done,
        }
    }
}

/// Status after an instrument completion.
///
/// Total over every `(a_done, b_done, current)` combination and dependent on
/// nothing else. Terminal statuses never move.
pub fn next_status(a_done: bool, b_done: bool, current: SessionStatus) -> SessionStatus {
    if current.is_terminal() {
        return current;
    }
    match (a_done, b_done) {
        (true, true) => SessionStatus::Completed,
        (true, false) => SessionStatus::InterviewInProgress,
        (false, true) => SessionStatus::QuestionnaireInProgress,
        (false, false) => current,
    }
}

/// The status implied by a session's milestones.
///
/// Side statuses (INCOMPLETE, ABANDONED, FAILED) are overlays and are kept as
/// is. BOTH_IN_PROGRESS is kept while no instrument is done, since it records
/// that the second instrument was started early.
pub fn derive_status(
    milestones: &Milestones,
    first: InstrumentKind,
    current: SessionStatus,
) -> SessionStatus {
    use SessionStatus::*;

    if matches!(current, Incomplete | Abandoned | Failed) {
        return current;
    }
    progress_status(milestones, first, current)
}

/// The progress status implied by milestones, ignoring side statuses.
///
/// Used when an interrupted session is reactivated.
pub fn progress_status(
    milestones: &Milestones,
    first: InstrumentKind,
    current: SessionStatus,
) -> SessionStatus {
    use SessionStatus::*;

    if milestones.questionnaire_done || milestones.interview_done {
        return next_status(
            milestones.questionnaire_done,
            milestones.interview_done,
            InterviewInProgress,
        );
    }
    if milestones.camera_check {
        return if current == BothInProgress {
            BothInProgress
        } else {
            first.in_progress()
        };
    }
    if milestones.consent {
        return CameraCheck;
    }
    if current == Created {
        Created
    } else {
        Consent
    }
}

/// Weighted completion percentage, 0 to 100.
///
/// FAILED and ABANDONED report 0 whatever was reached before.
pub fn completion_percentage(milestones: &Milestones, status: SessionStatus) -> u8 {
    if matches!(status, SessionStatus::Failed | SessionStatus::Abandoned) {
        return 0;
    }

    let mut pct = 0;
    if milestones.consent {
        pct += CONSENT_WEIGHT;
    }
    if milestones.questionnaire_done {
        pct += QUESTIONNAIRE_WEIGHT;
    }
    if milestones.interview_done {
        pct += INTERVIEW_WEIGHT;
    }
    pct
}

/// Deterministic instrument order for a respondent.
///
/// SHA-256 of the owner id; an even final byte puts the questionnaire first.
pub fn assign_first_instrument(owner_id: &str) -> InstrumentKind {
    let digest = Sha256::digest(owner_id.as_bytes());
    if digest[digest.len() - 1] % 2 == 0 {
        InstrumentKind::Questionnaire
    } else {
        InstrumentKind::Interview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    const ALL_STATUSES: [SessionStatus; 10] = [
        Created,
        Consent,
        CameraCheck,
        QuestionnaireInProgress,
        InterviewInProgress,
        BothInProgress,
        Completed,
        Incomplete,
        Abandoned,
        Failed,
    ];

    fn milestones(consent: bool, camera: bool, a: bool, b: bool) -> Milestones {
        Milestones {
            consent,
            camera_check: camera,
            questionnaire_done: a,
            interview_done: b,
        }
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in ALL_STATUSES {
            let parsed: SessionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_as_str() {
        for status in ALL_STATUSES {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_instrument_kind_tags() {
        assert_eq!(InstrumentKind::Questionnaire.as_str(), "A");
        assert_eq!(InstrumentKind::Interview.as_str(), "B");
        assert_eq!("a".parse::<InstrumentKind>().unwrap(), InstrumentKind::Questionnaire);
        assert_eq!(
            "interview".parse::<InstrumentKind>().unwrap(),
            InstrumentKind::Interview
        );
        assert_eq!(InstrumentKind::Questionnaire.other(), InstrumentKind::Interview);
    }

    #[test]
    fn test_next_status_total_and_deterministic() {
        for current in ALL_STATUSES {
            for a in [false, true] {
                for b in [false, true] {
                    let first = next_status(a, b, current);
                    let second = next_status(a, b, current);
                    assert_eq!(first, second);

                    if current.is_terminal() {
                        assert_eq!(first, current);
                        continue;
                    }
                    let expected = match (a, b) {
                        (true, true) => Completed,
                        (true, false) => InterviewInProgress,
                        (false, true) => QuestionnaireInProgress,
                        (false, false) => current,
                    };
                    assert_eq!(first, expected, "a={a} b={b} current={current}");
                }
            }
        }
    }

    #[test]
    fn test_camera_check_only_advances_to_first_instrument() {
        assert!(CameraCheck.can_transition_to(QuestionnaireInProgress, InstrumentKind::Questionnaire));
        assert!(!CameraCheck.can_transition_to(InterviewInProgress, InstrumentKind::Questionnaire));
        assert!(CameraCheck.can_transition_to(InterviewInProgress, InstrumentKind::Interview));
        assert!(!CameraCheck.can_transition_to(BothInProgress, InstrumentKind::Interview));
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        for next in ALL_STATUSES {
            if next != Completed {
                assert!(!Completed.can_transition_to(next, InstrumentKind::Questionnaire));
            }
            if next != Failed {
                assert!(!Failed.can_transition_to(next, InstrumentKind::Questionnaire));
            }
        }
    }

    #[test]
    fn test_side_branches_from_non_terminal() {
        for current in ALL_STATUSES.iter().filter(|s| !s.is_terminal()) {
            for side in [Incomplete, Abandoned, Failed] {
                assert!(current.can_transition_to(side, InstrumentKind::Interview));
            }
        }
    }

    #[test]
    fn test_in_progress_moves() {
        let first = InstrumentKind::Questionnaire;
        assert!(QuestionnaireInProgress.can_transition_to(InterviewInProgress, first));
        assert!(QuestionnaireInProgress.can_transition_to(Completed, first));
        assert!(InterviewInProgress.can_transition_to(QuestionnaireInProgress, first));
        assert!(BothInProgress.can_transition_to(Completed, first));
        assert!(!Created.can_transition_to(QuestionnaireInProgress, first));
        assert!(!Consent.can_transition_to(Completed, first));
    }

    #[test]
    fn test_derive_status_from_milestones() {
        let first = InstrumentKind::Questionnaire;
        assert_eq!(derive_status(&milestones(false, false, false, false), first, Created), Created);
        assert_eq!(derive_status(&milestones(false, false, false, false), first, Consent), Consent);
        assert_eq!(derive_status(&milestones(true, false, false, false), first, Consent), CameraCheck);
        assert_eq!(
            derive_status(&milestones(true, true, false, false), first, CameraCheck),
            QuestionnaireInProgress
        );
        assert_eq!(
            derive_status(&milestones(true, true, false, false), InstrumentKind::Interview, CameraCheck),
            InterviewInProgress
        );
        assert_eq!(
            derive_status(&milestones(true, true, true, false), first, QuestionnaireInProgress),
            InterviewInProgress
        );
        assert_eq!(
            derive_status(&milestones(true, true, true, true), first, InterviewInProgress),
            Completed
        );
        assert_eq!(
            derive_status(&milestones(true, true, false, false), first, BothInProgress),
            BothInProgress
        );
        assert_eq!(
            derive_status(&milestones(true, true, true, false), first, Abandoned),
            Abandoned
        );
    }

    #[test]
    fn test_derive_never_created_with_instrument_done() {
        for current in ALL_STATUSES {
            for first in InstrumentKind::ALL {
                let derived = derive_status(&milestones(true, true, false, true), first, current);
                assert_ne!(derived, Created);
            }
        }
    }

    #[test]
    fn test_completed_requires_both_instruments() {
        for current in ALL_STATUSES.iter().filter(|s| !s.is_terminal()) {
            for (a, b) in [(false, false), (true, false), (false, true)] {
                let derived = derive_status(&milestones(true, true, a, b), InstrumentKind::Questionnaire, *current);
                assert_ne!(derived, Completed);
            }
        }
    }

    #[test]
    fn test_completion_percentage_weights() {
        assert_eq!(CONSENT_WEIGHT + QUESTIONNAIRE_WEIGHT + INTERVIEW_WEIGHT, 100);
        assert_eq!(completion_percentage(&milestones(false, false, false, false), Created), 0);
        assert_eq!(completion_percentage(&milestones(true, false, false, false), CameraCheck), 25);
        assert_eq!(
            completion_percentage(&milestones(true, true, true, false), InterviewInProgress),
            60
        );
        assert_eq!(
            completion_percentage(&milestones(true, true, false, true), QuestionnaireInProgress),
            65
        );
        assert_eq!(completion_percentage(&milestones(true, true, true, true), Completed), 100);
    }

    #[test]
    fn test_completion_percentage_zero_on_failure() {
        let full = milestones(true, true, true, true);
        assert_eq!(completion_percentage(&full, Failed), 0);
        assert_eq!(completion_percentage(&full, Abandoned), 0);
        assert_eq!(completion_percentage(&milestones(true, true, true, false), Incomplete), 60);
    }

    #[test]
    fn test_assign_first_instrument_stable() {
        for owner in ["alice", "bob", "respondent-42", ""] {
            assert_eq!(assign_first_instrument(owner), assign_first_instrument(owner));
        }
    }

    #[test]
    fn test_assign_first_instrument_roughly_balanced() {
        let questionnaire_first = (0..1000)
            .filter(|i| {
                assign_first_instrument(&format!("owner-{i}")) == InstrumentKind::Questionnaire
            })
            .count();
        assert!(
            (400..=600).contains(&questionnaire_first),
            "got {questionnaire_first}"
        );
    }
}
