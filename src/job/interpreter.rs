//! Forward-only cursor over a broker script.
//!
//! `next_action` advances exactly once per dispatched action;
//! `current_action` re-reads the last dispatched action without advancing,
//! which is what retry paths use. `restart` rewinds to the first action for
//! the one page-invalid restart a run is allowed.

use crate::broker::Action;

#[derive(Debug, Clone)]
pub struct ActionInterpreter {
    actions: Vec<Action>,
    cursor: usize,
}

impl ActionInterpreter {
    pub fn for_actions(actions: &[Action]) -> Self {
        Self {
            actions: actions.to_vec(),
            cursor: 0,
        }
    }

    /// The next action to dispatch. Advances the cursor.
    pub fn next_action(&mut self) -> Option<Action> {
        let action = self.actions.get(self.cursor).cloned();
        if action.is_some() {
            self.cursor += 1;
        }
        action
    }

    /// The last dispatched action, for retries. Does not advance.
    pub fn current_action(&self) -> Option<Action> {
        if self.cursor == 0 {
            return None;
        }
        self.actions.get(self.cursor - 1).cloned()
    }

    /// Rewind to the first action.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// 1-based position of the last dispatched action.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
