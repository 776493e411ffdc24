//! Scheduler tests driven by an in-memory article fetcher.

use super::*;
use crate::error::FetchError;
use crate::manifest::Part;
use crate::yenc;
use std::time::Duration;


/// Serves pre-encoded articles from memory and logs every request
#[derive(Clone, Default)]
pub(super) struct MockFetcher {
    articles: Arc<HashMap<String, Vec<u8>>>,
    requests: Arc<std::sync::Mutex<Vec<String>>>,
    delay: Option<Duration>,
    refuse_connections: bool,
}

struct MockConnection {
    fetcher: MockFetcher,
}

impl MockFetcher {
    pub(super) fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub(super) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(super) fn refusing(mut self) -> Self {
        self.refuse_connections = true;
        self
    }

    pub(super) fn without(mut self, message_id: &str) -> Self {
        let mut articles = (*self.articles).clone();
        articles.remove(message_id);
        self.articles = Arc::new(articles);
        self
    }
}

#[async_trait::async_trait]
impl ArticleFetcher for MockFetcher {
    async fn connect(&self) -> std::result::Result<Box<dyn ArticleConnection>, FetchError> {
        if self.refuse_connections {
            return Err(FetchError::Connection("connection refused".into()));
        }
        Ok(Box::new(MockConnection {
            fetcher: self.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl ArticleConnection for MockConnection {
    async fn fetch(&self, message_id: &str) -> std::result::Result<Vec<u8>, FetchError> {
        self.fetcher
            .requests
            .lock()
            .unwrap()
            .push(message_id.to_string());
        if let Some(delay) = self.fetcher.delay {
            tokio::time::sleep(delay).await;
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

/// File contents used by the fixtures; distinct per name
pub(super) fn contents(name: &str, len: usize) -> Vec<u8> {
    let seed = name.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..len).map(|i| seed.wrapping_add((i * 13) as u8)).collect()
}

/// Build a manifest whose files are split into `part_size` byte articles,
/// and a fetcher that serves them
pub(super) fn fixture(
    root: &Path,
    files: &[(&str, Vec<u8>)],
    part_size: usize,
) -> (Manifest, MockFetcher) {
    let job_dir = root.join("job");
    let mut articles = HashMap::new();
    let mut remote_files = Vec::new();

    for (name, data) in files {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(part_size).collect()
        };
        let total = chunks.len() as u32;
        let mut parts = Vec::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let index = i as u32 + 1;
            let message_id = format!("{name}.{index}@test");
            articles.insert(
                message_id.clone(),
                yenc::encode_part(
                    name,
                    chunk,
                    (i * part_size) as u64,
                    data.len() as u64,
                    index,
                    total,
                )
                .unwrap(),
            );
            parts.push(Part {
                index,
                message_id,
                bytes: chunk.len() as u64,
            });
        }
        remote_files.push(RemoteFile {
            name: name.to_string(),
            subject: format!("\"{name}\" yEnc (1/{total})"),
            parts,
            path: job_dir.join(name),
            checksum: None,
        });
    }

    let manifest = Manifest {
        name: "job".to_string(),
        title: None,
        job_dir,
        files: remote_files,
    };
    let fetcher = MockFetcher {
        articles: Arc::new(articles),
        ..Default::default()
    };
    (manifest, fetcher)
}

pub(super) fn test_config(connections: usize) -> Config {
    let mut config = Config::default();
    config.server.connections = connections;
    config.download.retry.max_attempts = 0;
    config.download.retry.initial_delay = Duration::from_millis(1);
    config.download.retry.jitter = false;
    config
}

pub(super) fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
