//! Stream relay: forwards one upstream generation to one push channel.
//!
//! The relay owns its [`StreamSession`] for the whole run. Fragments are
//! forwarded in upstream order as `content` events and accumulated; the run
//! ends with exactly one of
//!
//! - `done`, after persisting the accumulated reply (null id when nothing was
//!   generated or the reply could not be saved),
//! - `error`, when the upstream failed, with nothing persisted,
//! - no terminal event at all, when the client went away or the session was
//!   cancelled. Nothing is persisted in that case either.
//!
//! The upstream stream is dropped before the relay returns, which closes the
//! connection to the inference server on every exit path.

use crate::core::inference::{CompletionRequest, InferenceError};
use crate::core::session::StreamSession;
use crate::core::traits::{ConversationService, InferenceClient};
use crate::event::RelayEvent;
use di::Ref;
use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a relay run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Completed {
        message_id: Option<i64>,
        fragments: usize,
    },
    Failed(String),
    Cancelled {
        fragments: usize,
    },
}

enum Step {
    Exhausted,
    Failed(InferenceError),
    Cancelled,
}

pub struct StreamRelay {
    store: Ref<dyn ConversationService>,
    inference: Ref<dyn InferenceClient>,
}

impl StreamRelay {
    pub fn new(store: Ref<dyn ConversationService>, inference: Ref<dyn InferenceClient>) -> Self {
        Self { store, inference }
    }

    pub async fn run(
        &self,
        mut session: StreamSession,
        request: CompletionRequest,
        events: mpsc::Sender<RelayEvent>,
    ) -> RelayOutcome {
        let conversation_id = session.conversation_id();
        let cancel = session.cancellation();
        info!("relaying generation for conversation {conversation_id}");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = events.closed() => None,
            opened = self.inference.stream_completion(&request) => Some(opened),
        };

        let mut fragments = match opened {
            None => return cancelled(&session),
            Some(Err(e)) => return fail(&session, &events, e).await,
            Some(Ok(fragments)) => fragments,
        };

        let step = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Step::Cancelled,
                _ = events.closed() => break Step::Cancelled,
                next = fragments.next() => match next {
                    None => break Step::Exhausted,
                    Some(Err(e)) => break Step::Failed(e),
                    Some(Ok(fragment)) => {
                        session.push(&fragment);
                        if !emit(&events, &cancel, RelayEvent::content(fragment)).await {
                            break Step::Cancelled;
                        }
                    }
                },
            }
        };

        drop(fragments);

        match step {
            Step::Cancelled => cancelled(&session),
            Step::Failed(e) => fail(&session, &events, e).await,
            Step::Exhausted => self.complete(session, &events).await,
        }
    }

    async fn complete(&self, session: StreamSession, events: &mpsc::Sender<RelayEvent>) -> RelayOutcome {
        let conversation_id = session.conversation_id();
        let fragments = session.fragments;

        let message_id = if session.buffer.is_empty() {
            None
        } else {
            self.persist(&session).await
        };

        info!(
            "generation for conversation {conversation_id} completed: {fragments} fragments, {} bytes",
            session.buffer.len()
        );

        // the reply is complete either way; a vanished client is not an error here
        let _ = events.send(RelayEvent::Done { message_id }).await;

        RelayOutcome::Completed {
            message_id,
            fragments,
        }
    }

    async fn persist(&self, session: &StreamSession) -> Option<i64> {
        let conversation_id = session.conversation_id();

        let message = match self
            .store
            .create_assistant_message(conversation_id, session.buffer.clone())
            .await
        {
            Ok(message) => message,
            Err(e) => {
                error!("failed to save assistant message for conversation {conversation_id}: {e}");
                return None;
            }
        };

        if let Err(e) = self
            .store
            .auto_title(session.user_id, conversation_id, &session.prompt)
            .await
        {
            warn!("failed to title conversation {conversation_id}: {e}");
        }

        Some(message.id)
    }
}

/// Sends one event unless the session is cancelled first. Returns `false`
/// when the event could not be delivered.
async fn emit(events: &mpsc::Sender<RelayEvent>, cancel: &CancellationToken, event: RelayEvent) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn fail(session: &StreamSession, events: &mpsc::Sender<RelayEvent>, e: InferenceError) -> RelayOutcome {
    let message = e.to_string();
    warn!(
        "generation for conversation {} failed after {} fragments: {message}",
        session.conversation_id(),
        session.fragments
    );

    let _ = events.send(RelayEvent::error(message.clone())).await;
    RelayOutcome::Failed(message)
}

fn cancelled(session: &StreamSession) -> RelayOutcome {
    info!(
        "generation for conversation {} cancelled after {} fragments",
        session.conversation_id(),
        session.fragments
    );
    RelayOutcome::Cancelled {
        fragments: session.fragments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inference::{ChatMessage, FragmentStream, GenerationParams, ModelInfo};
    use crate::core::session::SessionRegistry;
    use crate::infrastructure::entities::{Conversation, Message, Role};
    use crate::infrastructure::traits::StoreError;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    const CONVERSATION: i64 = 1;

    #[derive(Default)]
    struct MemoryStore {
        messages: Mutex<Vec<Message>>,
        titles: Mutex<Vec<String>>,
        fail_writes: AtomicBool,
    }

    impl MemoryStore {
        fn assistant_messages(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ConversationService for MemoryStore {
        async fn list_conversations(&self, _user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
            Ok(Vec::new())
        }

        async fn create_conversation(&self, _user_id: Uuid, _title: Option<String>) -> Result<Conversation, StoreError> {
            unimplemented!()
        }

        async fn get_conversation(&self, _user_id: Uuid, _conversation_id: i64) -> Result<Option<Conversation>, StoreError> {
            Ok(None)
        }

        async fn rename_conversation(
            &self,
            _user_id: Uuid,
            _conversation_id: i64,
            _title: String,
        ) -> Result<Option<Conversation>, StoreError> {
            Ok(None)
        }

        async fn delete_conversation(&self, _user_id: Uuid, _conversation_id: i64) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn list_messages(&self, _user_id: Uuid, _conversation_id: i64) -> Result<Vec<Message>, StoreError> {
            Ok(self.messages.lock().unwrap().clone())
        }

        async fn append_message(
            &self,
            conversation_id: i64,
            role: Role,
            content: String,
            image: Option<String>,
        ) -> Result<Message, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }
            let mut messages = self.messages.lock().unwrap();
            let message = Message {
                id: messages.len() as i64 + 1,
                conversation_id,
                role,
                content,
                image,
                created_at: Utc::now(),
            };
            messages.push(message.clone());
            Ok(message)
        }

        async fn auto_title(&self, _user_id: Uuid, _conversation_id: i64, first_message: &str) -> Result<(), StoreError> {
            self.titles.lock().unwrap().push(first_message.to_owned());
            Ok(())
        }
    }

    /// Sets a flag when the stream it travels with is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    enum Script {
        Fragments(Vec<Result<String, InferenceError>>),
        /// Yields the fragments, then never ends.
        Stall(Vec<String>),
        Refuse,
    }

    struct FakeInference {
        script: Mutex<Option<Script>>,
        closed: Arc<AtomicBool>,
    }

    impl FakeInference {
        fn new(script: Script) -> Self {
            Self {
                script: Mutex::new(Some(script)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn yielding(fragments: &[&str]) -> Self {
            Self::new(Script::Fragments(
                fragments.iter().map(|f| Ok(f.to_string())).collect(),
            ))
        }
    }

    #[async_trait]
    impl InferenceClient for FakeInference {
        async fn stream_completion(&self, _request: &CompletionRequest) -> Result<FragmentStream, InferenceError> {
            let flag = DropFlag(Arc::clone(&self.closed));
            let script = self.script.lock().unwrap().take().expect("one stream per fake");

            let items: FragmentStream = match script {
                Script::Refuse => {
                    return Err(InferenceError::Unreachable {
                        url: "http://127.0.0.1:9".into(),
                    });
                }
                Script::Fragments(items) => Box::pin(stream::iter(items)),
                Script::Stall(items) => Box::pin(
                    stream::iter(items.into_iter().map(Ok)).chain(stream::pending()),
                ),
            };

            Ok(Box::pin(items.map(move |item| {
                let _keep = &flag;
                item
            })))
        }

        async fn list_models(&self, _target_server: &str) -> Result<Vec<ModelInfo>, InferenceError> {
            Ok(Vec::new())
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            history: vec![ChatMessage {
                role: Role::User,
                content: "Hello".into(),
            }],
            params: GenerationParams {
                temperature: 0.7,
                top_k: 40,
                top_p: 0.9,
                repeat_penalty: 1.1,
                max_tokens: 64,
                system_prompt: String::new(),
                model: String::new(),
                target_server: "http://127.0.0.1:9".into(),
            },
            image: None,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        inference: Arc<FakeInference>,
        registry: SessionRegistry,
    }

    impl Harness {
        fn new(inference: FakeInference) -> Self {
            Self {
                store: Arc::new(MemoryStore::default()),
                inference: Arc::new(inference),
                registry: SessionRegistry::new(Duration::from_millis(50)),
            }
        }

        fn relay(&self) -> StreamRelay {
            StreamRelay::new(self.store.clone(), self.inference.clone())
        }

        async fn session(&self) -> StreamSession {
            let lease = self.registry.begin(CONVERSATION).await.unwrap();
            StreamSession::new(Uuid::new_v4(), "Hello".into(), lease)
        }

        async fn run_to_end(&self) -> (RelayOutcome, Vec<RelayEvent>) {
            let (sender, mut receiver) = mpsc::channel(64);
            let outcome = self.relay().run(self.session().await, request(), sender).await;

            let mut events = Vec::new();
            while let Some(event) = receiver.recv().await {
                events.push(event);
            }
            (outcome, events)
        }
    }

    #[tokio::test]
    async fn test_fragments_are_forwarded_in_order_and_persisted() {
        let harness = Harness::new(FakeInference::yielding(&["Hi", " there", "!"]));

        let (outcome, events) = harness.run_to_end().await;

        assert_eq!(
            events,
            vec![
                RelayEvent::content("Hi"),
                RelayEvent::content(" there"),
                RelayEvent::content("!"),
                RelayEvent::Done { message_id: Some(1) },
            ]
        );
        assert_eq!(
            outcome,
            RelayOutcome::Completed {
                message_id: Some(1),
                fragments: 3
            }
        );
        assert_eq!(harness.store.assistant_messages(), vec!["Hi there!"]);
        assert_eq!(*harness.store.titles.lock().unwrap(), vec!["Hello"]);
        assert!(harness.inference.closed.load(Ordering::SeqCst));
        assert!(!harness.registry.is_active(CONVERSATION));
    }

    #[tokio::test]
    async fn test_concatenation_matches_upstream_exactly() {
        let fragments = ["", "a", " ", "ü", "\n\n", "data: {}", "end"];
        let harness = Harness::new(FakeInference::yielding(&fragments));

        let (_, events) = harness.run_to_end().await;

        let relayed: String = events
            .iter()
            .filter_map(|event| match event {
                RelayEvent::Content { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(relayed, fragments.concat());
        assert_eq!(events.len(), fragments.len() + 1);
    }

    #[tokio::test]
    async fn test_empty_generation_reports_null_id_and_persists_nothing() {
        let harness = Harness::new(FakeInference::yielding(&[]));

        let (outcome, events) = harness.run_to_end().await;

        assert_eq!(events, vec![RelayEvent::Done { message_id: None }]);
        assert_eq!(
            outcome,
            RelayOutcome::Completed {
                message_id: None,
                fragments: 0
            }
        );
        assert!(harness.store.assistant_messages().is_empty());
        assert!(harness.store.titles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_emits_error_without_persisting() {
        let harness = Harness::new(FakeInference::new(Script::Fragments(vec![
            Ok("partial".into()),
            Err(InferenceError::Timeout(Duration::from_secs(5))),
            Ok("never".into()),
        ])));

        let (outcome, events) = harness.run_to_end().await;

        assert_eq!(
            events,
            vec![
                RelayEvent::content("partial"),
                RelayEvent::error("LLM server sent nothing for 5 seconds"),
            ]
        );
        assert!(matches!(outcome, RelayOutcome::Failed(_)));
        assert!(harness.store.assistant_messages().is_empty());
        assert!(harness.inference.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_reported() {
        let harness = Harness::new(FakeInference::new(Script::Refuse));

        let (outcome, events) = harness.run_to_end().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RelayEvent::Error { content } if content.contains("Cannot connect")));
        assert!(matches!(outcome, RelayOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_client_abort_closes_upstream_without_terminal_event() {
        let harness = Harness::new(FakeInference::new(Script::Stall(vec![
            "Hi".into(),
            " there".into(),
        ])));
        let (sender, mut receiver) = mpsc::channel(64);
        let relay = harness.relay();
        let session = harness.session().await;

        let run = tokio::spawn(async move { relay.run(session, request(), sender).await });

        assert_eq!(receiver.recv().await, Some(RelayEvent::content("Hi")));
        drop(receiver);

        let outcome = run.await.unwrap();
        assert!(matches!(outcome, RelayOutcome::Cancelled { .. }));
        assert!(harness.store.assistant_messages().is_empty());
        assert!(harness.inference.closed.load(Ordering::SeqCst));
        assert!(!harness.registry.is_active(CONVERSATION));
    }

    #[tokio::test]
    async fn test_registry_cancel_stops_relay_silently() {
        let harness = Harness::new(FakeInference::new(Script::Stall(vec!["Hi".into()])));
        let (sender, mut receiver) = mpsc::channel(64);
        let relay = harness.relay();
        let session = harness.session().await;

        let run = tokio::spawn(async move { relay.run(session, request(), sender).await });
        assert_eq!(receiver.recv().await, Some(RelayEvent::content("Hi")));

        assert!(harness.registry.cancel(CONVERSATION));

        assert_eq!(run.await.unwrap(), RelayOutcome::Cancelled { fragments: 1 });
        assert_eq!(receiver.recv().await, None);
        assert!(harness.store.assistant_messages().is_empty());
        assert!(harness.inference.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_persistence_failure_still_reports_done() {
        let harness = Harness::new(FakeInference::yielding(&["ok"]));
        harness.store.fail_writes.store(true, Ordering::SeqCst);

        let (outcome, events) = harness.run_to_end().await;

        assert_eq!(
            events,
            vec![RelayEvent::content("ok"), RelayEvent::Done { message_id: None }]
        );
        assert_eq!(
            outcome,
            RelayOutcome::Completed {
                message_id: None,
                fragments: 1
            }
        );
    }
}
