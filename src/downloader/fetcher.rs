//! Article fetching over NNTP.
//!
//! [`ArticleFetcher`] opens connections; each fetch worker owns exactly one
//! [`ArticleConnection`] for its whole lifetime.

use crate::config::ServerConfig;
use crate::error::FetchError;

/// Opens article connections, enabling testability of the scheduler
#[async_trait::async_trait]
pub trait ArticleFetcher: Send + Sync {
    /// Open and authenticate one connection
    async fn connect(&self) -> Result<Box<dyn ArticleConnection>, FetchError>;
}

/// One open connection able to fetch article bodies by message ID
#[async_trait::async_trait]
pub trait ArticleConnection: Send + Sync {
    /// Fetch the body of one article (message ID without angle brackets)
    async fn fetch(&self, message_id: &str) -> Result<Vec<u8>, FetchError>;

    /// Close the connection. Called once when the owning worker exits.
    async fn close(&mut self) {}
}

/// Check whether an NNTP error indicates a missing/expired article (vs connection/protocol failure).
pub(crate) fn is_missing_article_error(err: &nntp_rs::NntpError) -> bool {
    match err {
        nntp_rs::NntpError::NoSuchArticle(_) => true,
        nntp_rs::NntpError::Protocol { code, .. } if *code == 430 => true,
        other => {
            let msg = other.to_string();
            msg.contains("No such article") || msg.contains("no such article")
        }
    }
}

fn classify(err: nntp_rs::NntpError, message_id: &str) -> FetchError {
    if is_missing_article_error(&err) {
        return FetchError::ArticleNotFound {
            message_id: message_id.to_string(),
        };
    }
    match err {
        nntp_rs::NntpError::Protocol { .. } => FetchError::Protocol(err.to_string()),
        other => FetchError::Connection(other.to_string()),
    }
}

/// Production [`ArticleFetcher`] backed by `nntp-rs`
#[derive(Clone, Debug)]
pub struct NntpArticleFetcher {
    server: ServerConfig,
}

impl NntpArticleFetcher {
    /// Create a fetcher for one server
    pub fn new(server: ServerConfig) -> Self {
        Self { server }
    }
}

#[async_trait::async_trait]
impl ArticleFetcher for NntpArticleFetcher {
    async fn connect(&self) -> Result<Box<dyn ArticleConnection>, FetchError> {
        // A single-slot pool keeps reconnect and auth handling inside nntp-rs
        let pool = nntp_rs::NntpPool::new(self.server.clone().into(), 1)
            .await
            .map_err(|e| FetchError::Connection(format!("Failed to create NNTP pool: {}", e)))?;

        // Establish the connection now so bad credentials fail the worker up front
        pool.get()
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        tracing::debug!(host = %self.server.host, port = self.server.port, "NNTP connection established");

        Ok(Box::new(NntpConnection { pool }))
    }
}

struct NntpConnection {
    pool: nntp_rs::NntpPool,
}

#[async_trait::async_trait]
impl ArticleConnection for NntpConnection {
    async fn fetch(&self, message_id: &str) -> Result<Vec<u8>, FetchError> {
        let wire_id = if message_id.starts_with('<') {
            message_id.to_string()
        } else {
            format!("<{}>", message_id)
        };

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        let mut responses = conn
            .fetch_articles_pipelined(&[wire_id.as_str()], 1)
            .await
            .map_err(|e| classify(e, message_id))?;

        if responses.is_empty() {
            return Err(FetchError::ArticleNotFound {
                message_id: message_id.to_string(),
            });
        }
        let response = responses.swap_remove(0);

        if response.code == 430 {
            return Err(FetchError::ArticleNotFound {
                message_id: message_id.to_string(),
            });
        }
        if response.code >= 400 {
            return Err(FetchError::Protocol(format!(
                "{} {}",
                response.code, response.message
            )));
        }

        Ok(response.data)
    }
}
