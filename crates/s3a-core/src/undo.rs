//! Undo/redo history over caller-owned state.
//!
//! An [`ActionStack`] never owns the document it edits. Every call takes the
//! state explicitly, and every recorded [`Action`] knows how to apply and
//! revert itself against that state.
//!
//! ```
//! use s3a_core::undo::ActionStack;
//!
//! let mut stack = ActionStack::new();
//! let mut total = 0_i32;
//! let before = stack
//!     .undoable(
//!         &mut total,
//!         "add five",
//!         |t: &mut i32| {
//!             *t += 5;
//!             Ok(*t - 5)
//!         },
//!         |t: &mut i32| {
//!             *t -= 5;
//!             Ok(())
//!         },
//!     )
//!     .unwrap();
//! assert_eq!((before, total), (0, 5));
//! stack.undo(&mut total).unwrap();
//! assert_eq!(total, 0);
//! ```

use std::collections::VecDeque;

/// Error returned by an action body.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the undo stack.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// There is no action to undo.
    #[error("nothing to undo")]
    NothingToUndo,

    /// There is no action to redo.
    #[error("nothing to redo")]
    NothingToRedo,

    /// An action failed to apply or revert.
    #[error("action `{description}` failed: {source}")]
    Action {
        /// Description of the failed action.
        description: String,
        /// What the action reported.
        #[source]
        source: ActionError,
    },
}

/// A reversible edit of `S`.
pub trait Action<S> {
    /// Perform the edit (again).
    ///
    /// # Errors
    ///
    /// Whatever the edit reports; the stack leaves its history unchanged.
    fn apply(&mut self, state: &mut S) -> Result<(), ActionError>;

    /// Take the edit back.
    ///
    /// # Errors
    ///
    /// Whatever the edit reports; the stack leaves its history unchanged.
    fn revert(&mut self, state: &mut S) -> Result<(), ActionError>;
}

/// An [`Action`] made of a forward and a backward closure.
pub struct FnAction<F, B> {
    forward: F,
    backward: B,
}

impl<F, B> FnAction<F, B> {
    /// Pair `forward` with the `backward` that undoes it.
    pub const fn new(forward: F, backward: B) -> Self {
        Self { forward, backward }
    }
}

impl<S, F, B> Action<S> for FnAction<F, B>
where
    F: FnMut(&mut S) -> Result<(), ActionError>,
    B: FnMut(&mut S) -> Result<(), ActionError>,
{
    fn apply(&mut self, state: &mut S) -> Result<(), ActionError> {
        (self.forward)(state)
    }

    fn revert(&mut self, state: &mut S) -> Result<(), ActionError> {
        (self.backward)(state)
    }
}

/// Notification sent to the change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent<'a> {
    /// A new action (or group) was recorded.
    Performed(&'a str),
    /// An action was undone.
    Undone(&'a str),
    /// An action was redone.
    Redone(&'a str),
    /// The history was cleared.
    Cleared,
}

type Listener = Box<dyn FnMut(StackEvent<'_>)>;

/// One history entry: a single action or a flattened group.
struct Entry<S> {
    id: u64,
    description: String,
    actions: Vec<Box<dyn Action<S>>>,
}

impl<S> Entry<S> {
    /// Revert actions last to first. On failure the already reverted ones
    /// are applied again.
    fn revert(&mut self, state: &mut S) -> Result<(), ActionError> {
        for i in (0..self.actions.len()).rev() {
            if let Err(err) = self.actions[i].revert(state) {
                for action in &mut self.actions[i + 1..] {
                    if let Err(reapply) = action.apply(state) {
                        tracing::warn!(error = %reapply, "could not restore partially undone group");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Apply actions first to last. On failure the already applied ones are
    /// reverted again.
    fn apply(&mut self, state: &mut S) -> Result<(), ActionError> {
        for i in 0..self.actions.len() {
            if let Err(err) = self.actions[i].apply(state) {
                for action in self.actions[..i].iter_mut().rev() {
                    if let Err(revert) = action.revert(state) {
                        tracing::warn!(error = %revert, "could not restore partially redone group");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Linear undo/redo history.
pub struct ActionStack<S> {
    done: VecDeque<Entry<S>>,
    undone: Vec<Entry<S>>,
    /// Actions recorded inside the outermost open group.
    group: Option<Vec<Box<dyn Action<S>>>>,
    next_id: u64,
    savepoint: Option<u64>,
    limit: Option<usize>,
    listener: Option<Listener>,
}

impl<S> std::fmt::Debug for ActionStack<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionStack")
            .field("undo", &self.done.iter().map(|e| &e.description).collect::<Vec<_>>())
            .field("redo", &self.undone.iter().map(|e| &e.description).collect::<Vec<_>>())
            .field("grouping", &self.group.is_some())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl<S> Default for ActionStack<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ActionStack<S> {
    /// An empty, unbounded history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            done: VecDeque::new(),
            undone: Vec::new(),
            group: None,
            next_id: 1,
            savepoint: None,
            limit: None,
            listener: None,
        }
    }

    /// Keep at most `limit` undoable entries; the oldest are forgotten.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self.enforce_limit();
        self
    }

    /// Call `listener` whenever the history changes.
    pub fn set_listener(&mut self, listener: impl FnMut(StackEvent<'_>) + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Run `forward` and record it together with `backward`.
    ///
    /// Returns what `forward` returned. Pending redos are discarded. Inside
    /// [`group`](Self::group) the action joins the group instead of becoming
    /// an entry of its own.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Action`] if `forward` fails; nothing is
    /// recorded in that case.
    pub fn undoable<R, F, B>(
        &mut self,
        state: &mut S,
        description: &str,
        mut forward: F,
        backward: B,
    ) -> Result<R, StackError>
    where
        F: FnMut(&mut S) -> Result<R, ActionError> + 'static,
        B: FnMut(&mut S) -> Result<(), ActionError> + 'static,
        S: 'static,
    {
        let value = forward(state).map_err(|source| StackError::Action {
            description: description.to_owned(),
            source,
        })?;
        let action = FnAction::new(move |s: &mut S| forward(s).map(drop), backward);
        self.record(description, Box::new(action));
        Ok(value)
    }

    /// Record an already performed `action`.
    pub fn push(&mut self, description: &str, action: impl Action<S> + 'static) {
        self.record(description, Box::new(action));
    }

    fn record(&mut self, description: &str, action: Box<dyn Action<S>>) {
        if let Some(group) = &mut self.group {
            group.push(action);
            return;
        }
        self.push_entry(description, vec![action]);
    }

    fn push_entry(&mut self, description: &str, actions: Vec<Box<dyn Action<S>>>) {
        let id = self.next_id;
        self.next_id += 1;
        self.done.push_back(Entry {
            id,
            description: description.to_owned(),
            actions,
        });
        self.undone.clear();
        self.enforce_limit();
        self.notify(StackEvent::Performed(description));
    }

    /// Run `body` so that everything it records becomes one entry.
    ///
    /// Nested groups join the outermost one. Undoing the entry reverts its
    /// actions last to first; redoing applies them first to last. If `body`
    /// fails, whatever it already did is reverted and nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns the error from `body`.
    pub fn group<R>(
        &mut self,
        state: &mut S,
        description: &str,
        body: impl FnOnce(&mut Self, &mut S) -> Result<R, StackError>,
    ) -> Result<R, StackError> {
        if self.group.is_some() {
            return body(self, state);
        }
        self.group = Some(Vec::new());
        let result = body(self, state);
        let actions = self.group.take().unwrap_or_default();
        match result {
            Ok(value) => {
                if !actions.is_empty() {
                    self.push_entry(description, actions);
                }
                Ok(value)
            }
            Err(err) => {
                let mut partial = Entry {
                    id: 0,
                    description: description.to_owned(),
                    actions,
                };
                if let Err(revert) = partial.revert(state) {
                    tracing::warn!(group = description, error = %revert, "could not roll back failed group");
                }
                Err(err)
            }
        }
    }

    /// Revert the latest entry.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NothingToUndo`] on an empty history and
    /// [`StackError::Action`] if reverting fails; the history is unchanged
    /// then.
    pub fn undo(&mut self, state: &mut S) -> Result<(), StackError> {
        let mut entry = self.done.pop_back().ok_or(StackError::NothingToUndo)?;
        if let Err(source) = entry.revert(state) {
            let description = entry.description.clone();
            self.done.push_back(entry);
            return Err(StackError::Action { description, source });
        }
        tracing::debug!(action = %entry.description, "undo");
        self.notify(StackEvent::Undone(&entry.description));
        self.undone.push(entry);
        Ok(())
    }

    /// Re-apply the most recently undone entry.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NothingToRedo`] when nothing was undone and
    /// [`StackError::Action`] if applying fails; the history is unchanged
    /// then.
    pub fn redo(&mut self, state: &mut S) -> Result<(), StackError> {
        let mut entry = self.undone.pop().ok_or(StackError::NothingToRedo)?;
        if let Err(source) = entry.apply(state) {
            let description = entry.description.clone();
            self.undone.push(entry);
            return Err(StackError::Action { description, source });
        }
        tracing::debug!(action = %entry.description, "redo");
        self.notify(StackEvent::Redone(&entry.description));
        self.done.push_back(entry);
        self.enforce_limit();
        Ok(())
    }

    /// Whether [`undo`](Self::undo) has something to revert.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.done.is_empty()
    }

    /// Whether [`redo`](Self::redo) has something to re-apply.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    /// Description of the entry [`undo`](Self::undo) would revert.
    #[must_use]
    pub fn undo_description(&self) -> Option<&str> {
        self.done.back().map(|e| e.description.as_str())
    }

    /// Description of the entry [`redo`](Self::redo) would re-apply.
    #[must_use]
    pub fn redo_description(&self) -> Option<&str> {
        self.undone.last().map(|e| e.description.as_str())
    }

    /// Number of undoable entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.done.len()
    }

    /// Whether there is nothing to undo.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    /// Mark the current position, e.g. when the document is saved.
    pub fn set_savepoint(&mut self) {
        self.savepoint = self.latest_id();
    }

    /// Whether undo or redo moved away from the savepoint.
    ///
    /// Without an explicit savepoint the empty history counts as saved.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.savepoint != self.latest_id()
    }

    fn latest_id(&self) -> Option<u64> {
        self.done.back().map(|e| e.id)
    }

    /// Forget all history and the savepoint.
    pub fn clear(&mut self) {
        self.done.clear();
        self.undone.clear();
        self.savepoint = None;
        self.notify(StackEvent::Cleared);
    }

    fn enforce_limit(&mut self) {
        if let Some(limit) = self.limit {
            while self.done.len() > limit {
                self.done.pop_front();
            }
        }
    }

    fn notify(&mut self, event: StackEvent<'_>) {
        if let Some(listener) = &mut self.listener {
            listener(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn push_value(stack: &mut ActionStack<Vec<i32>>, state: &mut Vec<i32>, value: i32) {
        stack
            .undoable(
                state,
                &format!("push {value}"),
                move |s: &mut Vec<i32>| {
                    s.push(value);
                    Ok(())
                },
                |s: &mut Vec<i32>| {
                    s.pop();
                    Ok(())
                },
            )
            .unwrap();
    }

    #[test]
    fn undo_and_redo_restore_state() {
        let mut stack = ActionStack::new();
        let mut state = Vec::new();
        push_value(&mut stack, &mut state, 1);
        push_value(&mut stack, &mut state, 2);
        stack.undo(&mut state).unwrap();
        assert_eq!(state, [1]);
        assert_eq!(stack.redo_description(), Some("push 2"));
        stack.redo(&mut state).unwrap();
        assert_eq!(state, [1, 2]);
        stack.undo(&mut state).unwrap();
        stack.undo(&mut state).unwrap();
        assert!(state.is_empty());
        assert!(matches!(stack.undo(&mut state), Err(StackError::NothingToUndo)));
    }

    #[test]
    fn new_action_flushes_redos() {
        let mut stack = ActionStack::new();
        let mut state = Vec::new();
        push_value(&mut stack, &mut state, 1);
        stack.undo(&mut state).unwrap();
        assert!(stack.can_redo());
        push_value(&mut stack, &mut state, 7);
        assert!(!stack.can_redo());
        assert!(matches!(stack.redo(&mut state), Err(StackError::NothingToRedo)));
        assert_eq!(state, [7]);
    }

    #[test]
    fn failed_forward_records_nothing() {
        let mut stack: ActionStack<Vec<i32>> = ActionStack::new();
        let mut state = Vec::new();
        let err = stack
            .undoable(
                &mut state,
                "broken",
                |_: &mut Vec<i32>| Err::<(), _>("nope".into()),
                |_: &mut Vec<i32>| Ok(()),
            )
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(!stack.can_undo());
    }

    #[test]
    fn group_is_one_entry_reverted_in_reverse() {
        let mut stack = ActionStack::new();
        let mut state = vec![0];
        stack
            .group(&mut state, "batch", |stack, state| {
                push_value(stack, state, 1);
                stack.group(state, "inner", |stack, state| {
                    push_value(stack, state, 2);
                    Ok(())
                })?;
                push_value(stack, state, 3);
                Ok(())
            })
            .unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.undo_description(), Some("batch"));
        stack.undo(&mut state).unwrap();
        assert_eq!(state, [0]);
        stack.redo(&mut state).unwrap();
        assert_eq!(state, [0, 1, 2, 3]);
    }

    #[test]
    fn group_reverts_last_action_first() {
        fn set_last(stack: &mut ActionStack<Vec<i32>>, state: &mut Vec<i32>, value: i32) {
            stack
                .undoable(
                    state,
                    "set last",
                    move |s: &mut Vec<i32>| {
                        let old = s.pop().unwrap_or_default();
                        s.push(value);
                        Ok(old)
                    },
                    move |s: &mut Vec<i32>| {
                        if s.last() != Some(&value) {
                            return Err(format!("expected {value} on top, got {s:?}").into());
                        }
                        s.pop();
                        s.push(value - 1);
                        Ok(())
                    },
                )
                .unwrap();
        }
        let mut stack = ActionStack::new();
        let mut state = vec![0];
        stack
            .group(&mut state, "steps", |stack, state| {
                for value in 1..=3 {
                    set_last(stack, state, value);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(state, [3]);
        stack.undo(&mut state).unwrap();
        assert_eq!(state, [0]);
    }

    #[test]
    fn failed_group_rolls_back() {
        let mut stack = ActionStack::new();
        let mut state = Vec::new();
        let result: Result<(), _> = stack.group(&mut state, "batch", |stack, state| {
            push_value(stack, state, 1);
            push_value(stack, state, 2);
            Err(StackError::NothingToRedo)
        });
        assert!(result.is_err());
        assert!(state.is_empty());
        assert!(!stack.can_undo());
    }

    #[test]
    fn failing_undo_keeps_history() {
        let mut stack: ActionStack<i32> = ActionStack::new();
        let mut state = 0;
        stack
            .undoable(
                &mut state,
                "stuck",
                |s: &mut i32| {
                    *s = 1;
                    Ok(())
                },
                |_: &mut i32| Err("cannot revert".into()),
            )
            .unwrap();
        assert!(matches!(stack.undo(&mut state), Err(StackError::Action { .. })));
        assert!(stack.can_undo());
        assert!(!stack.can_redo());
        assert_eq!(state, 1);
    }

    #[test]
    fn savepoint_tracks_position() {
        let mut stack = ActionStack::new();
        let mut state = Vec::new();
        assert!(!stack.has_changed());
        push_value(&mut stack, &mut state, 1);
        assert!(stack.has_changed());
        stack.set_savepoint();
        assert!(!stack.has_changed());
        stack.undo(&mut state).unwrap();
        assert!(stack.has_changed());
        stack.redo(&mut state).unwrap();
        assert!(!stack.has_changed());
    }

    #[test]
    fn limit_drops_oldest() {
        let mut stack = ActionStack::new().with_limit(2);
        let mut state = Vec::new();
        for v in 0..4 {
            push_value(&mut stack, &mut state, v);
        }
        assert_eq!(stack.len(), 2);
        stack.undo(&mut state).unwrap();
        stack.undo(&mut state).unwrap();
        assert_eq!(state, [0, 1]);
        assert!(!stack.can_undo());
    }

    #[test]
    fn listener_sees_every_change() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let mut stack = ActionStack::new();
        stack.set_listener(move |event| log.borrow_mut().push(format!("{event:?}")));
        let mut state = Vec::new();
        push_value(&mut stack, &mut state, 1);
        stack.undo(&mut state).unwrap();
        stack.clear();
        assert_eq!(
            *seen.borrow(),
            [r#"Performed("push 1")"#, r#"Undone("push 1")"#, "Cleared"]
        );
    }

    #[test]
    fn explicit_actions_can_be_pushed() {
        struct Toggle;
        impl Action<bool> for Toggle {
            fn apply(&mut self, state: &mut bool) -> Result<(), ActionError> {
                *state = !*state;
                Ok(())
            }
            fn revert(&mut self, state: &mut bool) -> Result<(), ActionError> {
                self.apply(state)
            }
        }
        let mut stack = ActionStack::new();
        let mut flag = true;
        Toggle.apply(&mut flag).unwrap();
        stack.push("toggle", Toggle);
        stack.undo(&mut flag).unwrap();
        assert!(flag);
    }
}
