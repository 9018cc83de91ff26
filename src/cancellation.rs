//! Cancellation Coordinator.
//!
//! Token-based, hierarchically propagated cancellation. Cancellation is
//! cooperative in-process: workers poll [`Token::is_requested`] at natural
//! checkpoints. Crossing a boundary to a detached host worker goes through
//! an external hook registered once per token.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type ExternalHook = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

struct TokenInner {
    requested: AtomicBool,
    reason: RwLock<Option<String>>,
    children: RwLock<Vec<Token>>,
    hook: RwLock<Option<ExternalHook>>,
    hook_fired: AtomicBool,
}

/// A cheap, cloneable handle workers use to observe cancellation. Owned by
/// the [`CancellationCoordinator`]; workers only ever hold a weak observe
/// capability via clones of this handle.
#[derive(Clone)]
pub struct Token {
    pub id: String,
    inner: Arc<TokenInner>,
}

impl Token {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Arc::new(TokenInner {
                requested: AtomicBool::new(false),
                reason: RwLock::new(None),
                children: RwLock::new(Vec::new()),
                hook: RwLock::new(None),
                hook_fired: AtomicBool::new(false),
            }),
        }
    }

    /// Cheap; workers poll this between cooperative checkpoints.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Idempotent. Propagates to all linked children and fires the external
    /// hook exactly once.
    pub fn request(&self, reason: impl Into<String>) {
        let reason = reason.into();
        *self.inner.reason.write() = Some(reason.clone());
        let was_requested = self.inner.requested.swap(true, Ordering::SeqCst);

        if !was_requested && !self.inner.hook_fired.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.inner.hook.read().as_ref() {
                if let Err(e) = hook(&reason) {
                    tracing::warn!(token = %self.id, error = %e, "external cancellation hook failed");
                }
            }
        }

        for child in self.inner.children.read().iter() {
            child.request(reason.clone());
        }
    }

    fn link_child(&self, child: Token) {
        let already_requested = self.is_requested();
        if already_requested {
            child.request(self.reason().unwrap_or_default());
        }
        self.inner.children.write().push(child);
    }

    fn set_hook(&self, hook: ExternalHook) {
        *self.inner.hook.write() = Some(hook);
    }
}

/// Issues, links, and observes cancellation tokens across boundaries.
#[derive(Clone)]
pub struct CancellationCoordinator {
    tokens: Arc<RwLock<HashMap<String, Token>>>,
    pub unreachable_timeout: Duration,
}

impl Default for CancellationCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl CancellationCoordinator {
    pub fn new(unreachable_timeout: Duration) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
            unreachable_timeout,
        }
    }

    pub fn create_token(&self, operation_id: impl Into<String>) -> Token {
        let token = Token::new(operation_id);
        self.tokens.write().insert(token.id.clone(), token.clone());
        token
    }

    pub fn get(&self, operation_id: &str) -> Option<Token> {
        self.tokens.read().get(operation_id).cloned()
    }

    /// Child becomes requested whenever parent is.
    pub fn link(&self, parent: &Token, child: Token) {
        parent.link_child(child);
    }

    /// Request cancellation with a reason. Idempotent; a second request
    /// still refreshes the reason string.
    pub fn request(&self, operation_id: &str, reason: impl Into<String>) {
        if let Some(token) = self.get(operation_id) {
            token.request(reason);
        }
    }

    pub fn is_requested(&self, operation_id: &str) -> bool {
        self.get(operation_id).map_or(false, |t| t.is_requested())
    }

    /// Registers a callback invoked once, on first `request`, to push
    /// cancellation across a process boundary.
    pub fn register_external_hook<F>(&self, operation_id: &str, hook: F)
    where
        F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    {
        if let Some(token) = self.get(operation_id) {
            token.set_hook(Box::new(hook));
        }
    }

    pub fn remove(&self, operation_id: &str) {
        self.tokens.write().remove(operation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_idempotent() {
        let coord = CancellationCoordinator::default();
        let token = coord.create_token("op-1");
        token.request("first");
        token.request("second");
        assert!(token.is_requested());
        assert_eq!(token.reason().unwrap(), "second");
    }

    #[test]
    fn cancelling_parent_propagates_to_linked_children() {
        let coord = CancellationCoordinator::default();
        let parent = coord.create_token("parent");
        let child = coord.create_token("child");
        coord.link(&parent, child.clone());

        assert!(!child.is_requested());
        parent.request("user stop");
        assert!(child.is_requested());
        assert_eq!(child.reason().unwrap(), "user stop");
    }

    #[test]
    fn linking_an_already_requested_parent_immediately_requests_child() {
        let coord = CancellationCoordinator::default();
        let parent = coord.create_token("parent");
        parent.request("pre-existing");
        let child = coord.create_token("child");
        coord.link(&parent, child.clone());
        assert!(child.is_requested());
    }

    #[test]
    fn external_hook_fires_exactly_once() {
        let coord = CancellationCoordinator::default();
        let token = coord.create_token("op-1");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        coord.register_external_hook("op-1", move |_reason| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        token.request("first");
        token.request("second");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
