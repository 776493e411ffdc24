//! In-memory article fetcher

use async_trait::async_trait;
use nzb_stream::{ArticleConnection, ArticleFetcher, FetchError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves encoded articles from memory, optionally holding some back
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    articles: Arc<HashMap<String, Vec<u8>>>,
    slow: Arc<HashMap<String, Duration>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MemoryFetcher {
    pub fn new(articles: HashMap<String, Vec<u8>>) -> Self {
        Self {
            articles: Arc::new(articles),
            ..Default::default()
        }
    }

    /// Delay every article whose id starts with `prefix`
    pub fn slow_down(mut self, prefix: &str, delay: Duration) -> Self {
        let mut slow = (*self.slow).clone();
        for id in self.articles.keys().filter(|id| id.starts_with(prefix)) {
            slow.insert(id.clone(), delay);
        }
        self.slow = Arc::new(slow);
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

struct MemoryConnection {
    fetcher: MemoryFetcher,
}

#[async_trait]
impl ArticleFetcher for MemoryFetcher {
    async fn connect(&self) -> Result<Box<dyn ArticleConnection>, FetchError> {
        Ok(Box::new(MemoryConnection {
            fetcher: self.clone(),
        }))
    }
}

#[async_trait]
impl ArticleConnection for MemoryConnection {
    async fn fetch(&self, message_id: &str) -> Result<Vec<u8>, FetchError> {
        self.fetcher
            .requests
            .lock()
            .unwrap()
            .push(message_id.to_string());
        if let Some(delay) = self.fetcher.slow.get(message_id) {
            tokio::time::sleep(*delay).await;
        }
        self.fetcher
            .articles
            .get(message_id)
            .cloned()
            .ok_or_else(|| FetchError::ArticleNotFound {
                message_id: message_id.to_string(),
            })
    }
}
