//! Tracks the cancellation token for each chat's active stream, so
//! `POST /api/stream/chat/{chatId}/cancel` can reach a running pipeline
//! (§4.6 step 7, §5's per-stream cancellation tokens).

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct StreamRegistry {
    tokens: DashMap<u64, CancellationToken>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh token for `chat_id`, replacing (and canceling) any
    /// stale one left behind by a stream that didn't clean up after itself.
    pub fn register(&self, chat_id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some((_, stale)) = self.tokens.remove(&chat_id) {
            stale.cancel();
        }
        self.tokens.insert(chat_id, token.clone());
        token
    }

    pub fn unregister(&self, chat_id: u64) {
        self.tokens.remove(&chat_id);
    }

    /// Cancels the active stream for `chat_id`, if any. Returns whether one
    /// was found.
    pub fn cancel(&self, chat_id: u64) -> bool {
        if let Some(token) = self.tokens.get(&chat_id) {
            token.cancel();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_signals_the_registered_token() {
        let registry = StreamRegistry::new();
        let token = registry.register(1);
        assert!(!token.is_cancelled());
        assert!(registry.cancel(1));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_on_unknown_chat_returns_false() {
        let registry = StreamRegistry::new();
        assert!(!registry.cancel(42));
    }

    #[test]
    fn registering_twice_cancels_the_stale_token() {
        let registry = StreamRegistry::new();
        let first = registry.register(1);
        let second = registry.register(1);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }
}
