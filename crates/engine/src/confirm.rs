//! Confirmation capability for destructive bulk actions.
//!
//! Every use case that changes the depot or the working copy in bulk asks a
//! [`Confirm`] implementation first. Declining is not an error: the use case
//! stops and returns [`Outcome::Declined`], leaving anything it already did
//! (such as a created changelist) in place. A depot failure after the use
//! case has created a changelist is reported the same way, as
//! [`Outcome::Interrupted`] with what was done so far.

use std::collections::VecDeque;
use std::sync::Mutex;

pub trait Confirm: Send + Sync {
    /// Ask whether to go ahead with the action described by `prompt`.
    fn confirm(&self, prompt: &str) -> bool;
}

/// Confirms everything. For headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;
impl Confirm for AutoConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        tracing::debug!(prompt, "Auto-confirming");
        true
    }
}

/// Declines everything. Useful for dry runs that only need the plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;
impl Confirm for Decline {
    fn confirm(&self, prompt: &str) -> bool {
        tracing::debug!(prompt, "Declining");
        false
    }
}

/// Answers from a fixed script, recording every prompt it was asked.
/// Declines once the script runs out.
#[derive(Debug, Default)]
pub struct Scripted {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
}
impl Scripted {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self { answers: Mutex::new(answers.into_iter().collect()), prompts: Mutex::default() }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
impl Confirm for Scripted {
    fn confirm(&self, prompt: &str) -> bool {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).push(prompt.to_string());
        self.answers.lock().unwrap_or_else(|e| e.into_inner()).pop_front().unwrap_or(false)
    }
}

/// Result of a use case guarded by confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Applied(T),
    /// The user declined. `changelist` is any changelist already created
    /// before the prompt that declined.
    Declined { changelist: Option<u32> },
    /// There was nothing to apply; no confirmation was asked.
    NothingToDo,
    /// A depot call failed after changes were made. `partial` names them,
    /// including any changelist left pending; `reason` is the failure.
    Interrupted { partial: T, reason: String },
}
impl<T> Outcome<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_declined(&self) -> bool {
        matches!(self, Self::Declined { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Applied(value) => Outcome::Applied(f(value)),
            Self::Declined { changelist } => Outcome::Declined { changelist },
            Self::NothingToDo => Outcome::NothingToDo,
            Self::Interrupted { partial, reason } => Outcome::Interrupted { partial: f(partial), reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_answers_then_declines() {
        let confirm = Scripted::new([true, false]);
        assert!(confirm.confirm("first"));
        assert!(!confirm.confirm("second"));
        assert!(!confirm.confirm("third"));
        assert_eq!(confirm.prompts(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(Outcome::Applied(3).applied(), Some(3));
        assert!(Outcome::<()>::Declined { changelist: Some(7) }.is_declined());
        assert_eq!(Outcome::<u32>::NothingToDo.applied(), None);
        let interrupted = Outcome::Interrupted { partial: 2, reason: "gone".to_string() };
        assert_eq!(interrupted.clone().applied(), None);
        assert_eq!(interrupted.map(|n| n * 2), Outcome::Interrupted { partial: 4, reason: "gone".to_string() });
    }
}
