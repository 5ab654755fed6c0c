use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::collaborators::SessionStore;
use crate::errors::StoreError;
use crate::messages::Message;
use crate::session::SessionContext;

/// Process-local [`SessionStore`]. Contents are lost on restart.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionContext>>,
    history_limit: usize,
}

impl InMemorySessionStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, subject_id: &str) -> Result<SessionContext, StoreError> {
        let mut sessions = self.sessions.lock();
        let ctx = sessions
            .entry(subject_id.to_string())
            .or_insert_with(|| SessionContext::new(subject_id, self.history_limit));
        Ok(ctx.clone())
    }

    async fn append(&self, subject_id: &str, message: Message) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .entry(subject_id.to_string())
            .or_insert_with(|| SessionContext::new(subject_id, self.history_limit))
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_creates_empty_context() {
        let store = InMemorySessionStore::new(5);
        let ctx = store.load("kid-1").await.unwrap();
        assert_eq!(ctx.subject_id, "kid-1");
        assert_eq!(ctx.history_len(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn append_is_visible_on_next_load() {
        let store = InMemorySessionStore::new(5);
        store.append("kid-1", Message::user("hello")).await.unwrap();
        let ctx = store.load("kid-1").await.unwrap();
        assert_eq!(ctx.history_len(), 1);
        assert_eq!(ctx.last_message().unwrap().text, "hello");
    }

    #[tokio::test]
    async fn append_respects_history_limit() {
        let store = InMemorySessionStore::new(2);
        for i in 0..4 {
            store.append("kid-1", Message::user(format!("m{i}"))).await.unwrap();
        }
        assert_eq!(store.load("kid-1").await.unwrap().history_len(), 2);
    }
}
