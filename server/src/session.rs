use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use llm_core::prompt::Turn;
use llm_core::CancelToken;
use tracing::debug;

/// Conversation state for one session id. Sessions are shared across
/// connections: reconnecting with the same id resumes the same history.
pub struct Session {
    pub id: String,
    history: Mutex<VecDeque<Turn>>,
    pub cancel: CancelToken,
    busy: AtomicBool,
}

impl Session {
    fn new(id: String) -> Self {
        Session {
            id,
            history: Mutex::new(VecDeque::new()),
            cancel: CancelToken::new(),
            busy: AtomicBool::new(false),
        }
    }

    /// Claim the single active turn slot. Returns false while another
    /// turn is still running for this session.
    pub fn try_claim_turn(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_turn(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Last `pairs` user/assistant exchanges, oldest first.
    pub fn history_window(&self, pairs: usize) -> Vec<Turn> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let keep = pairs * 2;
        let skip = history.len().saturating_sub(keep);
        history.iter().skip(skip).cloned().collect()
    }

    /// Record a finished exchange. An empty assistant reply records only
    /// the user turn so the next prompt still sees what was asked.
    pub fn commit_turn(&self, user_text: &str, assistant_text: &str, max_pairs: usize) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(Turn::user(user_text));
        if !assistant_text.is_empty() {
            history.push_back(Turn::assistant(assistant_text));
        }
        let bound = max_pairs * 2;
        while history.len() > bound {
            history.pop_front();
        }
    }

    #[cfg(test)]
    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// All live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: DashMap::new(),
        }
    }

    /// Fetch or create the session for `id`. Attaching clears any stale
    /// cancellation left over from a previous connection.
    pub fn attach(&self, id: &str) -> Arc<Session> {
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %id, "creating session");
                Arc::new(Session::new(id.to_string()))
            })
            .clone();
        session.cancel.clear();
        session
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_window_keeps_last_pairs() {
        let session = Session::new("s".into());
        for i in 0..5 {
            session.commit_turn(&format!("q{i}"), &format!("a{i}"), 2);
        }

        assert_eq!(session.history_len(), 4);
        let window = session.history_window(2);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].content, "q3");
        assert_eq!(window[3].content, "a4");
    }

    #[test]
    fn smaller_window_than_stored_history() {
        let session = Session::new("s".into());
        session.commit_turn("q0", "a0", 4);
        session.commit_turn("q1", "a1", 4);

        let window = session.history_window(1);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "q1");
    }

    #[test]
    fn empty_assistant_reply_records_user_only() {
        let session = Session::new("s".into());
        session.commit_turn("hello", "", 2);
        assert_eq!(session.history_len(), 1);
    }

    #[test]
    fn turn_slot_is_exclusive_until_released() {
        let session = Session::new("s".into());
        assert!(session.try_claim_turn());
        assert!(!session.try_claim_turn());
        session.release_turn();
        assert!(session.try_claim_turn());
    }

    #[test]
    fn attach_reuses_sessions_and_clears_cancel() {
        let registry = SessionRegistry::new();
        let first = registry.attach("abc");
        first.cancel.cancel();

        let second = registry.attach("abc");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.cancel.is_cancelled());
        assert_eq!(registry.len(), 1);
    }
}
