use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;

use chrono::Utc;
use log::{ info, warn };
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::conversation::accumulator::StreamAccumulator;
use crate::conversation::store::ConversationStore;
use crate::history::{ NewAccount, PersistenceAdapter };
use crate::llm::ModelSession;
use crate::models::chat::{ ChatSession, Message, MessageContent, Sender, UserProfile };
use crate::models::websocket::ServerMessage;

/// Fixed apology appended when an open stream fails mid-way.
pub const STREAM_FAILURE_NOTICE: &str =
    "I'm sorry, I encountered an issue while connecting to the travel network. Please try again.";

const SESSION_TITLE_LIMIT: usize = 30;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("a send or regenerate is already in flight")]
    Busy,
    #[error("no signed-in user")]
    NotSignedIn,
    #[error("model backend call failed: {0}")]
    Backend(String),
    #[error("model stream failed: {0}")]
    Stream(String),
    #[error("persistence call failed: {0}")]
    Persistence(String),
}

#[derive(Serialize, Debug)]
pub struct AdminReport {
    pub users: Vec<UserProfile>,
    pub total_chats: u64,
}

/// Clears the in-flight flag on every exit path, including early returns
/// and panics inside a flow.
struct FlightToken {
    flag: Arc<AtomicBool>,
}

impl Drop for FlightToken {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Per-connection orchestrator for one travel-planning conversation: owns
/// the model session, the live transcript, the persistence adapter handle
/// and the in-flight gate that keeps the transcript single-writer.
pub struct TravelAgent {
    adapter: Arc<dyn PersistenceAdapter>,
    model: Box<dyn ModelSession>,
    store: ConversationStore,
    events: UnboundedSender<ServerMessage>,
    user: Option<UserProfile>,
    sessions: Vec<ChatSession>,
    active_session: Option<String>,
    in_flight: Arc<AtomicBool>,
}

/// First line of the prompt becomes the session title, truncated the way
/// the sidebar expects it.
fn session_title(text: &str) -> String {
    let title: String = text.chars().take(SESSION_TITLE_LIMIT).collect();
    if text.chars().count() > SESSION_TITLE_LIMIT {
        format!("{}...", title)
    } else {
        title
    }
}

impl TravelAgent {
    pub fn new(
        adapter: Arc<dyn PersistenceAdapter>,
        model: Box<dyn ModelSession>,
        events: UnboundedSender<ServerMessage>
    ) -> Self {
        Self {
            adapter,
            model,
            store: ConversationStore::new(),
            events,
            user: None,
            sessions: Vec::new(),
            active_session: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn current_user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    fn emit(&self, message: ServerMessage) {
        let _ = self.events.send(message);
    }

    fn try_begin_flight(&self) -> Result<FlightToken, ChatError> {
        if
            self.in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(ChatError::Busy);
        }
        Ok(FlightToken { flag: Arc::clone(&self.in_flight) })
    }

    // --- Auth lifecycle ---

    pub async fn sign_in(
        &mut self,
        email: &str,
        password: &str
    ) -> Result<UserProfile, ChatError> {
        let profile = self.adapter
            .sign_in(email, password).await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        self.enter_account(profile.clone()).await;
        Ok(profile)
    }

    pub async fn sign_up(&mut self, account: NewAccount) -> Result<UserProfile, ChatError> {
        let profile = self.adapter
            .sign_up(account).await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        self.enter_account(profile.clone()).await;
        Ok(profile)
    }

    pub async fn sign_in_as_guest(&mut self) -> Result<UserProfile, ChatError> {
        let profile = self.adapter
            .sign_in_as_guest().await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        self.enter_account(profile.clone()).await;
        Ok(profile)
    }

    async fn enter_account(&mut self, profile: UserProfile) {
        info!("Signed in as {} ({})", profile.display_name(), profile.id);
        self.user = Some(profile.clone());
        self.store.clear();
        self.active_session = None;
        self.model.reset();

        // A failed session-list fetch degrades to an empty sidebar.
        self.sessions = match self.adapter.get_sessions(&profile.id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Session list fetch failed: {}", e);
                Vec::new()
            }
        };
        self.emit(ServerMessage::Sessions { sessions: self.sessions.clone() });
    }

    pub async fn sign_out(&mut self) {
        if let Err(e) = self.adapter.sign_out().await {
            warn!("Sign-out call failed: {}", e);
        }
        self.user = None;
        self.sessions.clear();
        self.active_session = None;
        self.store.clear();
        self.model.reset();
    }

    // --- Conversation lifecycle ---

    pub async fn select_session(&mut self, session_id: &str) -> Result<(), ChatError> {
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(ChatError::Busy);
        }

        let rows = match self.adapter.get_messages(session_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Message list fetch failed for {}: {}", session_id, e);
                Vec::new()
            }
        };
        self.store.load_rows(rows);
        self.active_session = Some(session_id.to_string());
        self.model.reset();

        self.emit(ServerMessage::History {
            session_id: Some(session_id.to_string()),
            messages: self.store.messages().to_vec(),
        });
        Ok(())
    }

    pub fn new_chat(&mut self) -> Result<(), ChatError> {
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(ChatError::Busy);
        }
        self.store.clear();
        self.active_session = None;
        self.model.reset();
        self.emit(ServerMessage::History { session_id: None, messages: Vec::new() });
        Ok(())
    }

    // --- Send flow ---

    pub async fn send_message(
        &mut self,
        text: &str,
        image: Option<String>
    ) -> Result<(), ChatError> {
        let user = self.user.clone().ok_or(ChatError::NotSignedIn)?;
        let _flight = self.try_begin_flight()?;
        self.emit(ServerMessage::Processing);

        if self.active_session.is_none() {
            // The conversation continues without durable storage when
            // session creation fails, exactly like a guest with no backend.
            match self.adapter.create_session(&user.id, &session_title(text)).await {
                Ok(session) => {
                    self.active_session = Some(session.id.clone());
                    self.sessions.insert(0, session);
                    self.emit(ServerMessage::Sessions { sessions: self.sessions.clone() });
                }
                Err(e) => warn!("Session creation failed: {}", e),
            }
        }

        let user_message = Message::user(text.to_string(), image.clone());
        self.store.push(user_message.clone());
        self.emit(ServerMessage::Message { message: user_message });
        if let Some(session_id) = self.active_session.clone() {
            if let Err(e) = self.adapter.save_message(&session_id, text, "user").await {
                warn!("History write (user) failed: {}", e);
            }
        }

        let pending = Message::pending_ai();
        let reply_id = pending.id.clone();
        self.store.push(pending.clone());
        self.emit(ServerMessage::Message { message: pending });

        let stream = match self.model.send(text, image.as_deref()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon_reply(&reply_id);
                return Err(ChatError::Backend(e.to_string()));
            }
        };

        let events = self.events.clone();
        let result = StreamAccumulator::new(&mut self.store, &reply_id).run(
            stream,
            move |message_id, text| {
                let _ = events.send(ServerMessage::Partial {
                    message_id: message_id.to_string(),
                    text: text.to_string(),
                });
            }
        ).await;

        match result {
            Ok(content) => {
                self.model.record_reply(&content);
                if let Some(message) = self.store.get(&reply_id) {
                    self.emit(ServerMessage::Resolved { message: message.clone() });
                }

                if let Some(session_id) = self.active_session.clone() {
                    let stored = match &content {
                        MessageContent::Plan { itinerary, .. } =>
                            serde_json::to_string(itinerary).unwrap_or_default(),
                        MessageContent::Text { text } => text.clone(),
                        MessageContent::Pending { text } => text.clone(),
                    };
                    if let Err(e) = self.adapter.save_message(&session_id, &stored, "ai").await {
                        warn!("History write (ai) failed: {}", e);
                    }
                }

                self.emit(ServerMessage::Done { timestamp: Utc::now().timestamp() });
                Ok(())
            }
            Err(e) => {
                self.abandon_reply(&reply_id);
                Err(ChatError::Stream(e.to_string()))
            }
        }
    }

    /// Stream-failure disposition for a fresh send: the partial message is
    /// dropped and a fixed apology is appended in its place.
    fn abandon_reply(&mut self, reply_id: &str) {
        self.store.remove(reply_id);
        self.emit(ServerMessage::Removed { message_id: reply_id.to_string() });

        let apology = Message::settled_ai(STREAM_FAILURE_NOTICE.to_string());
        self.store.push(apology.clone());
        self.emit(ServerMessage::Message { message: apology });
    }

    // --- Regenerate flow ---

    /// Re-runs the prior user prompt against the existing AI message id.
    /// Requires a preceding user-authored sibling; anything else is a
    /// logged no-op. The regenerated result is intentionally not persisted
    /// — only the original send path writes durable rows.
    pub async fn regenerate(&mut self, message_id: &str) -> Result<(), ChatError> {
        if self.user.is_none() {
            return Err(ChatError::NotSignedIn);
        }
        let _flight = self.try_begin_flight()?;

        let (prompt, image) = match self.store.predecessor(message_id) {
            Some(prev) if prev.sender == Sender::User => {
                (prev.text().to_string(), prev.image.clone())
            }
            _ => {
                info!("Regenerate skipped for {}: no preceding user message", message_id);
                return Ok(());
            }
        };

        let reset = self.store.update(message_id, |message| {
            message.content = MessageContent::Pending { text: String::new() };
        });
        if !reset {
            return Ok(());
        }
        if let Some(message) = self.store.get(message_id) {
            self.emit(ServerMessage::Message { message: message.clone() });
        }
        self.emit(ServerMessage::Processing);

        let stream = match self.model.send(&prompt, image.as_deref()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.settle_regenerate_failure(message_id);
                return Err(ChatError::Backend(e.to_string()));
            }
        };

        let events = self.events.clone();
        let result = StreamAccumulator::new(&mut self.store, message_id).run(
            stream,
            move |message_id, text| {
                let _ = events.send(ServerMessage::Partial {
                    message_id: message_id.to_string(),
                    text: text.to_string(),
                });
            }
        ).await;

        match result {
            Ok(content) => {
                self.model.record_reply(&content);
                if let Some(message) = self.store.get(message_id) {
                    self.emit(ServerMessage::Resolved { message: message.clone() });
                }
                self.emit(ServerMessage::Done { timestamp: Utc::now().timestamp() });
                Ok(())
            }
            Err(e) => {
                self.settle_regenerate_failure(message_id);
                Err(ChatError::Stream(e.to_string()))
            }
        }
    }

    /// Stream-failure disposition for a regeneration: the message already
    /// existed before this attempt, so it settles as the empty-text
    /// fallback instead of being dropped.
    fn settle_regenerate_failure(&mut self, message_id: &str) {
        self.store.update(message_id, |message| {
            message.content = MessageContent::Text { text: String::new() };
        });
        if let Some(message) = self.store.get(message_id) {
            self.emit(ServerMessage::Resolved { message: message.clone() });
        }
        self.emit(ServerMessage::Error {
            message: STREAM_FAILURE_NOTICE.to_string(),
        });
    }

    // --- Admin reporting ---

    pub async fn admin_report(&self) -> AdminReport {
        gather_admin_report(self.adapter.as_ref()).await
    }
}

/// Usage numbers for the administrative reporting view. Either fetch
/// failing degrades to an empty slice of the report rather than an error.
pub async fn gather_admin_report(adapter: &dyn PersistenceAdapter) -> AdminReport {
    let users = match adapter.get_all_users().await {
        Ok(users) => users,
        Err(e) => {
            warn!("User list fetch failed: {}", e);
            Vec::new()
        }
    };
    let total_chats = match adapter.get_all_chats_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!("Chat count fetch failed: {}", e);
            0
        }
    };
    AdminReport { users, total_chats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::error::Error as StdError;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::history::MemoryAdapter;
    use crate::llm::chunk::{ decode, ChunkEvent, RawChunk };
    use crate::llm::ChunkStream;

    type ScriptedTurn = Result<Vec<Result<ChunkEvent, String>>, String>;

    /// Model session that replays scripted turns. Recorded replies and
    /// resets are captured for assertions.
    struct ScriptedSession {
        turns: Mutex<VecDeque<ScriptedTurn>>,
        replies: Arc<Mutex<Vec<MessageContent>>>,
        resets: Arc<Mutex<usize>>,
    }

    impl ScriptedSession {
        fn new(turns: Vec<ScriptedTurn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                replies: Arc::new(Mutex::new(Vec::new())),
                resets: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl ModelSession for ScriptedSession {
        async fn send(
            &mut self,
            _text: &str,
            _image: Option<&str>
        ) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>> {
            let turn = self.turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            match turn {
                Ok(items) => {
                    let items: Vec<Result<ChunkEvent, Box<dyn StdError + Send + Sync>>> = items
                        .into_iter()
                        .map(|item| item.map_err(|e| e.into()))
                        .collect();
                    let stream: ChunkStream = Box::pin(stream::iter(items));
                    Ok(stream)
                }
                Err(e) => Err(e.into()),
            }
        }

        fn record_reply(&mut self, reply: &MessageContent) {
            self.replies.lock().unwrap().push(reply.clone());
        }

        fn reset(&mut self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    fn text_event(text: &str) -> Result<ChunkEvent, String> {
        Ok(decode(serde_json::from_value::<RawChunk>(json!({ "text": text })).unwrap()))
    }

    fn itinerary_event(title: &str) -> Result<ChunkEvent, String> {
        let raw = json!({
            "candidates": [{ "content": { "parts": [{
                "functionCall": {
                    "name": "propose_itinerary",
                    "args": {
                        "trip_title": title,
                        "destination": "Lisbon",
                        "days": [{"day_number": 1, "theme": "Arrival", "activities": []}],
                        "summary": "A short trip.",
                        "vibe": "Relaxed"
                    }
                }
            }] } }]
        });
        Ok(decode(serde_json::from_value::<RawChunk>(raw).unwrap()))
    }

    async fn guest_agent(
        turns: Vec<ScriptedTurn>
    ) -> (TravelAgent, Arc<MemoryAdapter>, mpsc::UnboundedReceiver<ServerMessage>) {
        let adapter = Arc::new(MemoryAdapter::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut agent = TravelAgent::new(
            adapter.clone(),
            Box::new(ScriptedSession::new(turns)),
            tx
        );
        agent.sign_in_as_guest().await.unwrap();
        (agent, adapter, rx)
    }

    #[tokio::test]
    async fn send_resolves_plain_text_and_persists_both_rows() {
        let (mut agent, adapter, _rx) = guest_agent(
            vec![Ok(vec![text_event("Sure, "), text_event("let's plan!")])]
        ).await;

        agent.send_message("Hello", None).await.unwrap();

        let messages = agent.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[1].text(), "Sure, let's plan!");
        assert!(!messages[1].is_streaming());

        let session_id = agent.sessions()[0].id.clone();
        let rows = adapter.get_messages(&session_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, "user");
        assert_eq!(rows[1].content, "Sure, let's plan!");
    }

    #[tokio::test]
    async fn send_resolves_itinerary_and_persists_serialized_plan() {
        let (mut agent, adapter, _rx) = guest_agent(
            vec![Ok(vec![text_event("Sure! "), itinerary_event("Lisbon Getaway")])]
        ).await;

        agent.send_message("Plan a 3-day trip to Lisbon", None).await.unwrap();

        let reply = &agent.messages()[1];
        assert_eq!(reply.text(), "Sure! ");
        assert_eq!(reply.itinerary().unwrap().trip_title, "Lisbon Getaway");

        let session_id = agent.sessions()[0].id.clone();
        let rows = adapter.get_messages(&session_id).await.unwrap();
        let stored: crate::models::itinerary::Itinerary = serde_json
            ::from_str(&rows[1].content)
            .unwrap();
        assert_eq!(stored.trip_title, "Lisbon Getaway");
    }

    #[tokio::test]
    async fn stream_failure_replaces_partial_with_apology() {
        let (mut agent, _adapter, _rx) = guest_agent(
            vec![
                Ok(vec![text_event("Planning your"), Err("connection reset".into())]),
                Ok(vec![text_event("second try")])
            ]
        ).await;

        let result = agent.send_message("Plan a trip", None).await;
        assert!(matches!(result, Err(ChatError::Stream(_))));

        let messages = agent.messages();
        assert!(messages.iter().all(|m| !m.text().contains("Planning your")));
        let apology = messages.last().unwrap();
        assert_eq!(apology.sender, Sender::Ai);
        assert_eq!(apology.text(), STREAM_FAILURE_NOTICE);
        assert!(!apology.is_streaming());

        // The gate must have cleared so a retry goes through.
        agent.send_message("Try again", None).await.unwrap();
        assert_eq!(agent.messages().last().unwrap().text(), "second try");
    }

    #[tokio::test]
    async fn busy_gate_rejects_overlapping_sends() {
        let (mut agent, _adapter, _rx) = guest_agent(vec![Ok(vec![])]).await;

        let _held = agent.try_begin_flight().unwrap();
        let result = agent.send_message("while busy", None).await;
        assert!(matches!(result, Err(ChatError::Busy)));
    }

    #[tokio::test]
    async fn regenerate_replaces_reply_without_persisting() {
        let (mut agent, adapter, _rx) = guest_agent(
            vec![
                Ok(vec![itinerary_event("First Draft")]),
                Ok(vec![itinerary_event("Second Draft")])
            ]
        ).await;

        agent.send_message("Plan Lisbon", None).await.unwrap();
        let reply_id = agent.messages()[1].id.clone();
        let session_id = agent.sessions()[0].id.clone();

        agent.regenerate(&reply_id).await.unwrap();

        let reply = agent.messages().iter().find(|m| m.id == reply_id).unwrap();
        assert_eq!(reply.itinerary().unwrap().trip_title, "Second Draft");

        // Only the original send wrote durable rows.
        let rows = adapter.get_messages(&session_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let stored: crate::models::itinerary::Itinerary = serde_json
            ::from_str(&rows[1].content)
            .unwrap();
        assert_eq!(stored.trip_title, "First Draft");
    }

    #[tokio::test]
    async fn regenerate_without_user_predecessor_is_a_no_op() {
        let (mut agent, _adapter, _rx) = guest_agent(vec![]).await;

        // A lone AI notice has no preceding user message.
        let notice = Message::settled_ai("welcome".to_string());
        let notice_id = notice.id.clone();
        agent.store.push(notice);

        agent.regenerate(&notice_id).await.unwrap();
        assert_eq!(agent.messages().len(), 1);
        assert_eq!(agent.messages()[0].text(), "welcome");
    }

    #[tokio::test]
    async fn regenerate_failure_settles_empty_instead_of_sticking() {
        let (mut agent, _adapter, _rx) = guest_agent(
            vec![
                Ok(vec![text_event("original reply")]),
                Ok(vec![Err("dropped".into())])
            ]
        ).await;

        agent.send_message("Plan Lisbon", None).await.unwrap();
        let reply_id = agent.messages()[1].id.clone();

        let result = agent.regenerate(&reply_id).await;
        assert!(matches!(result, Err(ChatError::Stream(_))));

        let reply = agent.messages().iter().find(|m| m.id == reply_id).unwrap();
        assert!(!reply.is_streaming());
        assert_eq!(reply.text(), "");
    }

    #[tokio::test]
    async fn session_switch_reconstructs_itinerary_round_trip() {
        let (mut agent, _adapter, _rx) = guest_agent(
            vec![Ok(vec![itinerary_event("Lisbon Getaway")])]
        ).await;

        agent.send_message("Plan Lisbon", None).await.unwrap();
        let session_id = agent.sessions()[0].id.clone();
        let original = agent.messages()[1].itinerary().unwrap().clone();

        agent.new_chat().unwrap();
        assert!(agent.messages().is_empty());

        agent.select_session(&session_id).await.unwrap();
        let reloaded = agent.messages()[1].itinerary().unwrap();
        assert_eq!(*reloaded, original);
        assert_eq!(agent.messages()[1].text(), "");
    }

    #[tokio::test]
    async fn resolved_replies_feed_the_session_history() {
        let session = ScriptedSession::new(
            vec![Ok(vec![text_event("Hi!")]), Ok(vec![itinerary_event("Lisbon Getaway")])]
        );
        let replies = Arc::clone(&session.replies);
        let resets = Arc::clone(&session.resets);

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut agent = TravelAgent::new(Arc::new(MemoryAdapter::new()), Box::new(session), tx);
        agent.sign_in_as_guest().await.unwrap();

        agent.send_message("Hello", None).await.unwrap();
        agent.send_message("Plan Lisbon", None).await.unwrap();

        let recorded = replies.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(matches!(&recorded[0], MessageContent::Text { text } if text == "Hi!"));
        assert!(matches!(&recorded[1], MessageContent::Plan { .. }));

        // Guest sign-in reset the session before any turns ran.
        assert_eq!(*resets.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn send_without_sign_in_is_rejected() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut agent = TravelAgent::new(adapter, Box::new(ScriptedSession::new(vec![])), tx);

        let result = agent.send_message("hello", None).await;
        assert!(matches!(result, Err(ChatError::NotSignedIn)));
    }

    #[tokio::test]
    async fn admin_report_aggregates_users_and_chats() {
        let (mut agent, adapter, _rx) = guest_agent(vec![Ok(vec![text_event("hi")])]).await;
        agent.send_message("hello", None).await.unwrap();

        adapter
            .sign_up(NewAccount {
                first_name: "Ada".into(),
                last_name: "Wong".into(),
                email: "ada@example.com".into(),
                password: "pw".into(),
            }).await
            .unwrap();

        let report = agent.admin_report().await;
        assert_eq!(report.users.len(), 1);
        assert_eq!(report.total_chats, 1);
    }

    #[test]
    fn session_titles_truncate_long_prompts() {
        assert_eq!(session_title("short"), "short");
        let long = "Plan a relaxing weekend trip to Kyoto with tea ceremonies";
        let title = session_title(long);
        assert_eq!(title.chars().count(), SESSION_TITLE_LIMIT + 3);
        assert!(title.ends_with("..."));
    }
}
