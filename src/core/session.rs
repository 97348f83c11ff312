//! Tracks in-flight generations: at most one per conversation.

use crate::config::AppConfig;
use di::{Ref, inject, injectable};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a reply is already being generated for conversation {0}")]
    Busy(i64),
}

#[derive(Default)]
struct Slots {
    locks: HashMap<i64, Arc<AsyncMutex<()>>>,
    active: HashMap<i64, (u64, CancellationToken)>,
}

struct RegistryInner {
    slots: Mutex<Slots>,
    shutdown: CancellationToken,
    next_lease: AtomicU64,
    grace: Duration,
}

impl RegistryInner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[injectable]
impl SessionRegistry {
    #[inject]
    pub fn create(config: Ref<AppConfig>) -> SessionRegistry {
        SessionRegistry::new(config.session_grace)
    }
}

impl SessionRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(Slots::default()),
                shutdown: CancellationToken::new(),
                next_lease: AtomicU64::new(1),
                grace,
            }),
        }
    }

    /// Claims the conversation for a new generation. Waits up to the grace
    /// period for a previous session to release it.
    pub async fn begin(&self, conversation_id: i64) -> Result<SessionLease, SessionError> {
        let lock = Arc::clone(
            self.inner
                .slots()
                .locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );

        let guard = tokio::time::timeout(self.inner.grace, lock.lock_owned())
            .await
            .map_err(|_| {
                warn!("rejecting concurrent generation for conversation {conversation_id}");
                SessionError::Busy(conversation_id)
            })?;

        let id = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        self.inner
            .slots()
            .active
            .insert(conversation_id, (id, token.clone()));

        debug!("session {id} started for conversation {conversation_id}");

        Ok(SessionLease {
            conversation_id,
            id,
            token,
            guard: Some(guard),
            registry: Arc::clone(&self.inner),
        })
    }

    /// Cancels the active session of a conversation. Returns whether one was running.
    pub fn cancel(&self, conversation_id: i64) -> bool {
        match self.inner.slots().active.get(&conversation_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every running session. Sessions begun afterwards start cancelled.
    pub fn cancel_all(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_active(&self, conversation_id: i64) -> bool {
        self.inner.slots().active.contains_key(&conversation_id)
    }
}

/// Exclusive claim on one conversation, released on drop.
pub struct SessionLease {
    conversation_id: i64,
    id: u64,
    token: CancellationToken,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Arc<RegistryInner>,
}

impl SessionLease {
    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut slots = self.registry.slots();

        if matches!(slots.active.get(&self.conversation_id), Some((id, _)) if *id == self.id) {
            slots.active.remove(&self.conversation_id);
        }

        if let Some(guard) = self.guard.take() {
            let lock = Arc::clone(OwnedMutexGuard::mutex(&guard));
            drop(guard);
            // the map and the clone above are the only owners when nobody waits
            let idle = slots
                .locks
                .get(&self.conversation_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2);
            if idle {
                slots.locks.remove(&self.conversation_id);
            }
        }

        debug!("session {} ended for conversation {}", self.id, self.conversation_id);
    }
}

/// Transient state of one generation: lives as long as its relay invocation.
pub struct StreamSession {
    pub user_id: Uuid,
    /// The user message that started the generation.
    pub prompt: String,
    pub buffer: String,
    pub fragments: usize,
    lease: SessionLease,
}

impl StreamSession {
    pub fn new(user_id: Uuid, prompt: String, lease: SessionLease) -> Self {
        Self {
            user_id,
            prompt,
            buffer: String::new(),
            fragments: 0,
            lease,
        }
    }

    pub fn conversation_id(&self) -> i64 {
        self.lease.conversation_id()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.lease.token().clone()
    }

    pub fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
        self.fragments += 1;
    }
}
