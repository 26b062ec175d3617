use std::{collections::HashMap, sync::Arc};

use shared::domain::{ConversationId, UserId};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    error::SyncError,
    registry::SyncRegistry,
    session::{ConversationSession, SessionSettings},
    transport::Transports,
};

/// Entry point for one signed-in user: hands out one session per
/// conversation and tears them all down on logout.
pub struct SyncClient {
    user_id: UserId,
    transports: Transports,
    registry: SyncRegistry,
    settings: SessionSettings,
    sessions: Mutex<HashMap<ConversationId, Arc<ConversationSession>>>,
}

impl SyncClient {
    pub fn new(
        user_id: UserId,
        transports: Transports,
        registry: SyncRegistry,
        settings: SessionSettings,
    ) -> Self {
        Self {
            user_id,
            transports,
            registry,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    /// Returns the live session for `conversation_id`, creating it if needed.
    pub async fn session(&self, conversation_id: &ConversationId) -> Arc<ConversationSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions
            .get(conversation_id)
            .filter(|session| !session.is_closed())
        {
            return Arc::clone(session);
        }
        let session = ConversationSession::new(
            conversation_id.clone(),
            self.user_id.clone(),
            self.transports.clone(),
            self.registry.clone(),
            self.settings.clone(),
        );
        sessions.insert(conversation_id.clone(), Arc::clone(&session));
        session
    }

    pub async fn existing(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<Arc<ConversationSession>> {
        self.sessions.lock().await.get(conversation_id).cloned()
    }

    pub async fn join(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Arc<ConversationSession>, SyncError> {
        let session = self.session(conversation_id).await;
        session.join().await?;
        Ok(session)
    }

    pub async fn leave(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        match self.existing(conversation_id).await {
            Some(session) => session.leave().await,
            None => Ok(()),
        }
    }

    /// Tears one conversation down and forgets its session.
    pub async fn close(&self, conversation_id: &ConversationId) {
        let session = self.sessions.lock().await.remove(conversation_id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn conversations(&self) -> Vec<ConversationId> {
        let mut ids = self
            .sessions
            .lock()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Closes every session and clears the shared retry and cache state.
    pub async fn logout(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().await);
        let count = sessions.len();
        for session in sessions.into_values() {
            session.close().await;
        }
        self.registry.clear();
        info!(user_id = %self.user_id, sessions = count, "sync: logged out");
    }
}
