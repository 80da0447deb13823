mod memory;
mod rest;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;

use crate::cli::Args;
use crate::models::chat::{ ChatSession, MessageRow, UserProfile };

pub use self::memory::MemoryAdapter;
pub use self::rest::RestAdapter;

/// Registration details collected by the sign-up form.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

/// Thin data-access boundary to the external backend-as-a-service
/// collaborator: account auth, chat sessions, message rows and the admin
/// counters. Every call is opaque and may fail; callers decide whether a
/// failure degrades (list fetches) or surfaces (auth).
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn get_current_user(
        &self
    ) -> Result<Option<UserProfile>, Box<dyn Error + Send + Sync>>;

    async fn sign_in(
        &self,
        email: &str,
        password: &str
    ) -> Result<UserProfile, Box<dyn Error + Send + Sync>>;

    async fn sign_up(
        &self,
        account: NewAccount
    ) -> Result<UserProfile, Box<dyn Error + Send + Sync>>;

    async fn sign_in_as_guest(&self) -> Result<UserProfile, Box<dyn Error + Send + Sync>>;

    async fn sign_out(&self) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Sessions owned by a user, most recent first.
    async fn get_sessions(
        &self,
        user_id: &str
    ) -> Result<Vec<ChatSession>, Box<dyn Error + Send + Sync>>;

    async fn create_session(
        &self,
        user_id: &str,
        title: &str
    ) -> Result<ChatSession, Box<dyn Error + Send + Sync>>;

    /// Message rows for a session, oldest first.
    async fn get_messages(
        &self,
        session_id: &str
    ) -> Result<Vec<MessageRow>, Box<dyn Error + Send + Sync>>;

    async fn save_message(
        &self,
        session_id: &str,
        content: &str,
        role: &str
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn get_all_users(&self) -> Result<Vec<UserProfile>, Box<dyn Error + Send + Sync>>;

    async fn get_all_chats_count(&self) -> Result<u64, Box<dyn Error + Send + Sync>>;
}

pub fn create_adapter(
    args: &Args
) -> Result<Arc<dyn PersistenceAdapter>, Box<dyn Error + Send + Sync>> {
    match args.persistence_type.to_lowercase().as_str() {
        "rest" => {
            let adapter = rest::RestAdapter::new(args)?;
            Ok(Arc::new(adapter))
        }
        "memory" => Ok(Arc::new(memory::MemoryAdapter::new())),
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported persistence type: {}", args.persistence_type)
                    )
                )
            ),
    }
}

pub fn initialize_adapter(
    args: &Args
) -> Result<Arc<dyn PersistenceAdapter>, Box<dyn Error + Send + Sync>> {
    info!(
        "Conversations will be persisted via: {} at {}",
        args.persistence_type,
        args.persistence_url
    );
    create_adapter(args)
}
