use std::collections::VecDeque;
use std::fmt;

/// Client id / secret pair for one provider account.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyPair {
    pub client_id: String,
    pub client_secret: String,
}

impl ApiKeyPair {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Last four characters of the client id, safe for logs.
    pub fn masked_id(&self) -> String {
        let len = self.client_id.chars().count();
        let tail: String = self.client_id.chars().skip(len.saturating_sub(4)).collect();
        format!("...{tail}")
    }
}

impl fmt::Debug for ApiKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyPair")
            .field("client_id", &self.masked_id())
            .finish_non_exhaustive()
    }
}

/// Ordered credential queue owned by a single client.
///
/// The head is the key in use. Discarding it moves on to the next one; once
/// every key has been discarded the pool is exhausted for good.
#[derive(Debug, Clone, Default)]
pub struct KeyPool {
    keys: VecDeque<ApiKeyPair>,
    discarded: usize,
}

impl KeyPool {
    /// Keys in configuration order.
    pub fn shared(keys: &[ApiKeyPair]) -> Self {
        Self {
            keys: keys.iter().cloned().collect(),
            discarded: 0,
        }
    }

    /// Keys rotated so `worker` starts at `worker % len` and then cycles
    /// through every remaining key in order.
    pub fn for_worker(keys: &[ApiKeyPair], worker: usize) -> Self {
        if keys.is_empty() {
            return Self::default();
        }
        let start = worker % keys.len();
        Self {
            keys: keys[start..].iter().chain(&keys[..start]).cloned().collect(),
            discarded: 0,
        }
    }

    pub fn head(&self) -> Option<&ApiKeyPair> {
        self.keys.front()
    }

    pub fn discard_head(&mut self) -> Option<ApiKeyPair> {
        let key = self.keys.pop_front()?;
        self.discarded += 1;
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// True once keys were configured and all of them have been discarded.
    pub fn is_exhausted(&self) -> bool {
        self.keys.is_empty() && self.discarded > 0
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.client_id.as_str())
    }
}
