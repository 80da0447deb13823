use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use serde_json::json;
use std::error::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cli::Args;
use crate::models::chat::{ ChatSession, MessageRow, UserProfile };
use super::{ NewAccount, PersistenceAdapter };

#[derive(Deserialize)]
struct AuthSession {
    access_token: String,
    user: AuthUser,
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: serde_json::Value,
}

/// Backend-as-a-service adapter speaking the hosted service's REST
/// surface: token auth under /auth/v1, table rows under /rest/v1. The
/// bearer token of the signed-in account is held for row access.
pub struct RestAdapter {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    token: Mutex<Option<String>>,
}

impl RestAdapter {
    pub fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        if args.persistence_url.is_empty() {
            return Err("Persistence base URL is required for the rest adapter".into());
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: args.persistence_url.trim_end_matches('/').to_string(),
            anon_key: args.persistence_anon_key.clone(),
            token: Mutex::new(None),
        })
    }

    async fn bearer(&self) -> String {
        // Row access falls back to the anon key when nobody is signed in.
        self.token.lock().await.clone().unwrap_or_else(|| self.anon_key.clone())
    }

    fn auth_url(&self, route: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, route)
    }

    fn rest_url(&self, table: &str, query: &str) -> String {
        format!("{}/rest/v1/{}?{}", self.base_url, table, query)
    }

    async fn profile_for(&self, user: &AuthUser) -> UserProfile {
        // Profile table first; user metadata captured at sign-up as the
        // fallback, then the bare email handle.
        let url = self.rest_url("profiles", &format!("id=eq.{}&select=*", user.id));
        let profiles: Vec<UserProfile> = match self.get_rows(&url).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Profile lookup failed: {}", e);
                Vec::new()
            }
        };
        if let Some(profile) = profiles.into_iter().next() {
            return profile;
        }

        let meta = &user.user_metadata;
        let email = user.email.clone().unwrap_or_default();
        UserProfile {
            id: user.id.clone(),
            first_name: meta["first_name"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| email.split('@').next().unwrap_or("Traveler").to_string()),
            last_name: meta["last_name"].as_str().unwrap_or("").to_string(),
            email,
        }
    }

    async fn get_rows<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str
    ) -> Result<Vec<T>, Box<dyn Error + Send + Sync>> {
        let rows = self.client
            .get(url)
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer().await)
            .send().await?
            .error_for_status()?
            .json::<Vec<T>>().await?;
        Ok(rows)
    }

    async fn insert_row(
        &self,
        table: &str,
        body: serde_json::Value,
        want_row: bool
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let prefer = if want_row { "return=representation" } else { "return=minimal" };
        let resp = self.client
            .post(format!("{}/rest/v1/{}", self.base_url, table))
            .header("apikey", &self.anon_key)
            .header("Prefer", prefer)
            .bearer_auth(self.bearer().await)
            .json(&json!([body]))
            .send().await?
            .error_for_status()?;

        if want_row {
            let mut rows: Vec<serde_json::Value> = resp.json().await?;
            if rows.is_empty() {
                return Err(format!("Insert into '{}' returned no row", table).into());
            }
            Ok(rows.remove(0))
        } else {
            Ok(serde_json::Value::Null)
        }
    }

    async fn authenticate(
        &self,
        route: &str,
        body: serde_json::Value
    ) -> Result<AuthSession, Box<dyn Error + Send + Sync>> {
        let session = self.client
            .post(self.auth_url(route))
            .header("apikey", &self.anon_key)
            .json(&body)
            .send().await?
            .error_for_status()?
            .json::<AuthSession>().await?;
        *self.token.lock().await = Some(session.access_token.clone());
        Ok(session)
    }
}

#[async_trait]
impl PersistenceAdapter for RestAdapter {
    async fn get_current_user(
        &self
    ) -> Result<Option<UserProfile>, Box<dyn Error + Send + Sync>> {
        // Clone the token out so the lock is not held across the calls
        // below (profile_for re-locks it for row access).
        let token = self.token.lock().await.clone();
        let token = match token {
            Some(token) => token,
            None => {
                return Ok(None);
            }
        };

        let user = self.client
            .get(self.auth_url("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send().await?
            .error_for_status()?
            .json::<AuthUser>().await?;

        Ok(Some(self.profile_for(&user).await))
    }

    async fn sign_in(
        &self,
        email: &str,
        password: &str
    ) -> Result<UserProfile, Box<dyn Error + Send + Sync>> {
        let session = self.authenticate(
            "token?grant_type=password",
            json!({ "email": email, "password": password })
        ).await?;
        Ok(self.profile_for(&session.user).await)
    }

    async fn sign_up(
        &self,
        account: NewAccount
    ) -> Result<UserProfile, Box<dyn Error + Send + Sync>> {
        let session = self.authenticate(
            "signup",
            json!({
                "email": account.email,
                "password": account.password,
                "data": {
                    "first_name": account.first_name,
                    "last_name": account.last_name,
                }
            })
        ).await?;

        // Mirror the metadata into the profiles table; auth already holds
        // it, so a failure here is not fatal.
        let insert = self.insert_row(
            "profiles",
            json!({
                "id": session.user.id,
                "first_name": account.first_name,
                "last_name": account.last_name,
                "email": account.email,
            }),
            false
        ).await;
        if let Err(e) = insert {
            warn!("Profile row creation failed: {}", e);
        }

        Ok(UserProfile {
            id: session.user.id,
            first_name: account.first_name,
            last_name: account.last_name,
            email: account.email,
        })
    }

    async fn sign_in_as_guest(&self) -> Result<UserProfile, Box<dyn Error + Send + Sync>> {
        // Anonymous sign-in when the service supports it; otherwise a
        // local guest identity so the conversation still works.
        match self.authenticate("signup", json!({})).await {
            Ok(session) => Ok(UserProfile {
                id: session.user.id,
                first_name: "Guest".to_string(),
                last_name: "User".to_string(),
                email: "guest@anonymous".to_string(),
            }),
            Err(e) => {
                warn!("Anonymous sign-in failed, using local guest: {}", e);
                Ok(UserProfile {
                    id: format!("guest_{}", Uuid::new_v4()),
                    first_name: "Guest".to_string(),
                    last_name: "Traveler".to_string(),
                    email: "guest@travel.ai".to_string(),
                })
            }
        }
    }

    async fn sign_out(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let token = self.token.lock().await.take();
        if let Some(token) = token {
            let result = self.client
                .post(self.auth_url("logout"))
                .header("apikey", &self.anon_key)
                .bearer_auth(token)
                .send().await;
            if let Err(e) = result {
                warn!("Logout call failed: {}", e);
            }
        }
        Ok(())
    }

    async fn get_sessions(
        &self,
        user_id: &str
    ) -> Result<Vec<ChatSession>, Box<dyn Error + Send + Sync>> {
        let url = self.rest_url(
            "chats",
            &format!("user_id=eq.{}&select=*&order=created_at.desc", user_id)
        );
        self.get_rows(&url).await
    }

    async fn create_session(
        &self,
        user_id: &str,
        title: &str
    ) -> Result<ChatSession, Box<dyn Error + Send + Sync>> {
        let row = self.insert_row(
            "chats",
            json!({ "user_id": user_id, "title": title }),
            true
        ).await?;
        Ok(serde_json::from_value(row)?)
    }

    async fn get_messages(
        &self,
        session_id: &str
    ) -> Result<Vec<MessageRow>, Box<dyn Error + Send + Sync>> {
        let url = self.rest_url(
            "messages",
            &format!("chat_id=eq.{}&select=*&order=created_at.asc", session_id)
        );
        self.get_rows(&url).await
    }

    async fn save_message(
        &self,
        session_id: &str,
        content: &str,
        role: &str
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.insert_row(
            "messages",
            json!({ "chat_id": session_id, "content": content, "role": role }),
            false
        ).await?;
        Ok(())
    }

    async fn get_all_users(&self) -> Result<Vec<UserProfile>, Box<dyn Error + Send + Sync>> {
        self.get_rows(&self.rest_url("profiles", "select=*")).await
    }

    async fn get_all_chats_count(&self) -> Result<u64, Box<dyn Error + Send + Sync>> {
        // PostgREST reports the exact count in the Content-Range trailer
        // of a HEAD request: `0-24/3197`.
        let resp = self.client
            .head(self.rest_url("chats", "select=id"))
            .header("apikey", &self.anon_key)
            .header("Prefer", "count=exact")
            .bearer_auth(self.bearer().await)
            .send().await?
            .error_for_status()?;

        let count = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|range| range.rsplit('/').next())
            .and_then(|total| total.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(count)
    }
}
