// dbvault/src/restore/session.rs
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::errors::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreState {
    Init,
    SourceResolved,
    Verified,
    Confirmed,
    SafetyBackedUp,
    ConnectionsDrained,
    TargetReset,
    Restored,
    PostVerified,
    Done,
    Aborted,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreState::Init => "INIT",
            RestoreState::SourceResolved => "SOURCE_RESOLVED",
            RestoreState::Verified => "VERIFIED",
            RestoreState::Confirmed => "CONFIRMED",
            RestoreState::SafetyBackedUp => "SAFETY_BACKED_UP",
            RestoreState::ConnectionsDrained => "CONNECTIONS_DRAINED",
            RestoreState::TargetReset => "TARGET_RESET",
            RestoreState::Restored => "RESTORED",
            RestoreState::PostVerified => "POST_VERIFIED",
            RestoreState::Done => "DONE",
            RestoreState::Aborted => "ABORTED",
        })
    }
}

/// Every forward move a restore may make. `Aborted` is reachable from any
/// non-terminal state and is not listed. `Restored -> Done` is taken when
/// the post-restore check is inconclusive.
const TRANSITIONS: &[(RestoreState, RestoreState)] = &[
    (RestoreState::Init, RestoreState::SourceResolved),
    (RestoreState::SourceResolved, RestoreState::Verified),
    (RestoreState::Verified, RestoreState::Confirmed),
    (RestoreState::Confirmed, RestoreState::SafetyBackedUp),
    (RestoreState::SafetyBackedUp, RestoreState::ConnectionsDrained),
    (RestoreState::ConnectionsDrained, RestoreState::TargetReset),
    (RestoreState::TargetReset, RestoreState::Restored),
    (RestoreState::Restored, RestoreState::PostVerified),
    (RestoreState::Restored, RestoreState::Done),
    (RestoreState::PostVerified, RestoreState::Done),
];

impl RestoreState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RestoreState::Done | RestoreState::Aborted)
    }

    pub fn can_advance_to(self, to: RestoreState) -> bool {
        if to == RestoreState::Aborted {
            return !self.is_terminal();
        }
        TRANSITIONS.contains(&(self, to))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationState {
    Pending,
    /// The operator answered "yes".
    Interactive,
    /// `--force` was given.
    Forced,
    Declined,
}

impl ConfirmationState {
    pub fn is_granted(self) -> bool {
        matches!(self, ConfirmationState::Interactive | ConfirmationState::Forced)
    }
}

/// Position of one restore invocation in the state machine, plus the facts
/// that gate the destructive phase.
#[derive(Debug)]
pub struct RestoreSession {
    state: RestoreState,
    history: Vec<RestoreState>,
    confirmation: ConfirmationState,
    safety_backup: Option<PathBuf>,
    safety_skip_acknowledged: bool,
    destructive_started: bool,
}

impl Default for RestoreSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreSession {
    pub fn new() -> Self {
        RestoreSession {
            state: RestoreState::Init,
            history: vec![RestoreState::Init],
            confirmation: ConfirmationState::Pending,
            safety_backup: None,
            safety_skip_acknowledged: false,
            destructive_started: false,
        }
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    pub fn history(&self) -> &[RestoreState] {
        &self.history
    }

    pub fn safety_backup(&self) -> Option<&Path> {
        self.safety_backup.as_deref()
    }

    pub fn destructive_started(&self) -> bool {
        self.destructive_started
    }

    pub fn set_confirmation(&mut self, confirmation: ConfirmationState) {
        self.confirmation = confirmation;
    }

    pub fn record_safety_backup(&mut self, path: PathBuf) {
        self.safety_backup = Some(path);
    }

    pub fn acknowledge_no_safety_backup(&mut self) {
        self.safety_skip_acknowledged = true;
    }

    /// Consent was given and either a safety backup exists or its absence
    /// was explicitly acknowledged.
    fn may_destroy(&self) -> bool {
        self.confirmation.is_granted() && (self.safety_backup.is_some() || self.safety_skip_acknowledged)
    }

    fn check(&self, to: RestoreState) -> Result<()> {
        let invalid = || PipelineError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        };
        if !self.state.can_advance_to(to) {
            return Err(invalid());
        }
        if to == RestoreState::TargetReset && !self.may_destroy() {
            return Err(invalid());
        }
        Ok(())
    }

    pub fn advance(&mut self, to: RestoreState) -> Result<()> {
        self.check(to)?;
        tracing::debug!("restore state {} -> {}", self.state, to);
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// Checks the gate into `TargetReset` and marks the session as having
    /// started modifying the target. Called right before the reset runs.
    pub fn begin_destructive(&mut self) -> Result<()> {
        self.check(RestoreState::TargetReset)?;
        self.destructive_started = true;
        Ok(())
    }

    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!("restore state {} -> {}", self.state, RestoreState::Aborted);
            self.state = RestoreState::Aborted;
            self.history.push(RestoreState::Aborted);
        }
    }
}

/// Asks the operator for consent before the target is replaced.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, target: &str, source: &Path) -> AnyResult<bool>;
}

pub fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

/// Prompts on stdout and reads one line from stdin. Only a literal `yes`
/// counts; EOF counts as a decline.
#[derive(Debug, Default)]
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, target: &str, source: &Path) -> AnyResult<bool> {
        let prompt = format!(
            "⚠️  This will DROP and recreate '{}' and replace its contents with {}.\nType 'yes' to continue: ",
            target,
            source.display()
        );
        let answer = tokio::task::spawn_blocking(move || -> io::Result<Option<String>> {
            let mut stdout = io::stdout();
            stdout.write_all(prompt.as_bytes())?;
            stdout.flush()?;
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line)? {
                0 => Ok(None),
                _ => Ok(Some(line)),
            }
        })
        .await??;
        Ok(answer.as_deref().is_some_and(is_affirmative))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn walk_to(session: &mut RestoreSession, states: &[RestoreState]) -> Result<()> {
        for s in states {
            session.advance(*s)?;
        }
        Ok(())
    }

    const UP_TO_DRAINED: &[RestoreState] = &[
        RestoreState::SourceResolved,
        RestoreState::Verified,
        RestoreState::Confirmed,
        RestoreState::SafetyBackedUp,
        RestoreState::ConnectionsDrained,
    ];

    #[test]
    fn test_happy_path_is_accepted() -> Result<()> {
        let mut session = RestoreSession::new();
        walk_to(&mut session, &UP_TO_DRAINED[..3])?;
        session.set_confirmation(ConfirmationState::Interactive);
        session.record_safety_backup(PathBuf::from("/b/app-pre-restore_backup_20240101_000000.sql.gz"));
        walk_to(&mut session, &UP_TO_DRAINED[3..])?;
        session.begin_destructive()?;
        walk_to(
            &mut session,
            &[
                RestoreState::TargetReset,
                RestoreState::Restored,
                RestoreState::PostVerified,
                RestoreState::Done,
            ],
        )?;
        assert_eq!(session.history().len(), 10);
        assert!(session.state().is_terminal());
        Ok(())
    }

    #[test]
    fn test_states_cannot_be_skipped_or_revisited() {
        let mut session = RestoreSession::new();
        assert!(session.advance(RestoreState::Verified).is_err());
        session.advance(RestoreState::SourceResolved).unwrap();
        assert!(session.advance(RestoreState::SourceResolved).is_err());
        assert!(session.advance(RestoreState::Init).is_err());
        assert!(session.advance(RestoreState::TargetReset).is_err());
    }

    #[test]
    fn test_target_reset_requires_confirmation() -> Result<()> {
        let mut session = RestoreSession::new();
        walk_to(&mut session, UP_TO_DRAINED)?;
        session.acknowledge_no_safety_backup();
        let err = session.begin_destructive().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert!(!session.destructive_started());
        Ok(())
    }

    #[test]
    fn test_target_reset_requires_safety_net_or_acknowledgement() -> Result<()> {
        let mut session = RestoreSession::new();
        walk_to(&mut session, UP_TO_DRAINED)?;
        session.set_confirmation(ConfirmationState::Forced);
        assert!(session.begin_destructive().is_err());
        session.acknowledge_no_safety_backup();
        session.begin_destructive()?;
        session.advance(RestoreState::TargetReset)?;
        Ok(())
    }

    #[test]
    fn test_declined_confirmation_never_opens_the_gate() -> Result<()> {
        let mut session = RestoreSession::new();
        walk_to(&mut session, UP_TO_DRAINED)?;
        session.set_confirmation(ConfirmationState::Declined);
        session.record_safety_backup(PathBuf::from("/b/x"));
        assert!(session.advance(RestoreState::TargetReset).is_err());
        Ok(())
    }

    #[test]
    fn test_abort_is_terminal() {
        let mut session = RestoreSession::new();
        session.advance(RestoreState::SourceResolved).unwrap();
        session.abort();
        assert_eq!(session.state(), RestoreState::Aborted);
        assert!(session.advance(RestoreState::Verified).is_err());
        session.abort();
        assert_eq!(
            session.history(),
            &[RestoreState::Init, RestoreState::SourceResolved, RestoreState::Aborted]
        );
    }

    #[test]
    fn test_only_literal_yes_is_affirmative() {
        assert!(is_affirmative("yes\n"));
        assert!(is_affirmative("  YES "));
        assert!(!is_affirmative("y"));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("yes please"));
    }
}
