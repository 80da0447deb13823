use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::chat::{ ChatSession, MessageRow, UserProfile };
use super::{ NewAccount, PersistenceAdapter };

struct StoredAccount {
    profile: UserProfile,
    password: String,
}

#[derive(Default)]
struct MemoryState {
    accounts: Vec<StoredAccount>,
    current: Option<UserProfile>,
    sessions: HashMap<String, Vec<ChatSession>>,
    messages: HashMap<String, Vec<MessageRow>>,
}

/// In-process adapter backing guest mode and tests. Same contract as the
/// REST adapter, strict about accounts: no auto-registration on sign-in.
#[derive(Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn get_current_user(
        &self
    ) -> Result<Option<UserProfile>, Box<dyn Error + Send + Sync>> {
        Ok(self.state.lock().await.current.clone())
    }

    async fn sign_in(
        &self,
        email: &str,
        password: &str
    ) -> Result<UserProfile, Box<dyn Error + Send + Sync>> {
        let mut state = self.state.lock().await;
        let account = state.accounts
            .iter()
            .find(|a| a.profile.email == email)
            .ok_or("Account not found. Please Sign Up.")?;
        if account.password != password {
            return Err("Incorrect password.".into());
        }
        let profile = account.profile.clone();
        state.current = Some(profile.clone());
        Ok(profile)
    }

    async fn sign_up(
        &self,
        account: NewAccount
    ) -> Result<UserProfile, Box<dyn Error + Send + Sync>> {
        let mut state = self.state.lock().await;
        if state.accounts.iter().any(|a| a.profile.email == account.email) {
            return Err("An account with this email already exists.".into());
        }
        let profile = UserProfile {
            id: Uuid::new_v4().to_string(),
            first_name: account.first_name,
            last_name: account.last_name,
            email: account.email,
        };
        state.accounts.push(StoredAccount {
            profile: profile.clone(),
            password: account.password,
        });
        state.current = Some(profile.clone());
        Ok(profile)
    }

    async fn sign_in_as_guest(&self) -> Result<UserProfile, Box<dyn Error + Send + Sync>> {
        let profile = UserProfile {
            id: format!("guest_{}", Uuid::new_v4()),
            first_name: "Guest".to_string(),
            last_name: "Traveler".to_string(),
            email: "guest@travel.ai".to_string(),
        };
        self.state.lock().await.current = Some(profile.clone());
        Ok(profile)
    }

    async fn sign_out(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.state.lock().await.current = None;
        Ok(())
    }

    async fn get_sessions(
        &self,
        user_id: &str
    ) -> Result<Vec<ChatSession>, Box<dyn Error + Send + Sync>> {
        let state = self.state.lock().await;
        let mut sessions = state.sessions.get(user_id).cloned().unwrap_or_default();
        sessions.reverse();
        Ok(sessions)
    }

    async fn create_session(
        &self,
        user_id: &str,
        title: &str
    ) -> Result<ChatSession, Box<dyn Error + Send + Sync>> {
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.state
            .lock().await
            .sessions.entry(user_id.to_string())
            .or_default()
            .push(session.clone());
        Ok(session)
    }

    async fn get_messages(
        &self,
        session_id: &str
    ) -> Result<Vec<MessageRow>, Box<dyn Error + Send + Sync>> {
        let state = self.state.lock().await;
        Ok(state.messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn save_message(
        &self,
        session_id: &str,
        content: &str,
        role: &str
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            role: role.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.state
            .lock().await
            .messages.entry(session_id.to_string())
            .or_default()
            .push(row);
        Ok(())
    }

    async fn get_all_users(&self) -> Result<Vec<UserProfile>, Box<dyn Error + Send + Sync>> {
        let state = self.state.lock().await;
        Ok(state.accounts.iter().map(|a| a.profile.clone()).collect())
    }

    async fn get_all_chats_count(&self) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let state = self.state.lock().await;
        Ok(state.sessions.values().map(|s| s.len() as u64).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str) -> NewAccount {
        NewAccount {
            first_name: "Test".into(),
            last_name: "Traveler".into(),
            email: email.into(),
            password: "secret".into(),
        }
    }

    #[tokio::test]
    async fn sign_in_is_strict_about_accounts() {
        let adapter = MemoryAdapter::new();
        assert!(adapter.sign_in("nobody@example.com", "pw").await.is_err());

        adapter.sign_up(account("amy@example.com")).await.unwrap();
        assert!(adapter.sign_in("amy@example.com", "wrong").await.is_err());
        let profile = adapter.sign_in("amy@example.com", "secret").await.unwrap();
        assert_eq!(profile.email, "amy@example.com");
    }

    #[tokio::test]
    async fn sessions_list_most_recent_first() {
        let adapter = MemoryAdapter::new();
        let user = adapter.sign_in_as_guest().await.unwrap();

        adapter.create_session(&user.id, "First trip").await.unwrap();
        adapter.create_session(&user.id, "Second trip").await.unwrap();

        let sessions = adapter.get_sessions(&user.id).await.unwrap();
        assert_eq!(sessions[0].title, "Second trip");
        assert_eq!(sessions[1].title, "First trip");
    }

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let adapter = MemoryAdapter::new();
        let user = adapter.sign_in_as_guest().await.unwrap();
        let session = adapter.create_session(&user.id, "Lisbon").await.unwrap();

        adapter.save_message(&session.id, "Plan a trip", "user").await.unwrap();
        adapter.save_message(&session.id, "Sure!", "ai").await.unwrap();

        let rows = adapter.get_messages(&session.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, "user");
        assert_eq!(rows[1].role, "ai");
    }

    #[tokio::test]
    async fn chats_count_spans_users() {
        let adapter = MemoryAdapter::new();
        let a = adapter.sign_in_as_guest().await.unwrap();
        let b = adapter.sign_in_as_guest().await.unwrap();
        adapter.create_session(&a.id, "One").await.unwrap();
        adapter.create_session(&b.id, "Two").await.unwrap();

        assert_eq!(adapter.get_all_chats_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sign_out_clears_current_user() {
        let adapter = MemoryAdapter::new();
        adapter.sign_in_as_guest().await.unwrap();
        assert!(adapter.get_current_user().await.unwrap().is_some());

        adapter.sign_out().await.unwrap();
        assert!(adapter.get_current_user().await.unwrap().is_none());
    }
}
