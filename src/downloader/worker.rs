//! Fetch workers -- one connection each, pulling part jobs from a shared queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::fetcher::{ArticleConnection, ArticleFetcher};
use crate::config::RetryConfig;
use crate::error::{DecodeError, FetchError};
use crate::manifest::Part;
use crate::retry::fetch_with_retry;
use crate::yenc;

/// Shared job queue; workers take turns receiving from it
pub(crate) type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<PartJob>>>;

/// One part to fetch
#[derive(Clone, Debug)]
pub(crate) struct PartJob {
    /// Index of the owning file in the manifest
    pub(crate) file_index: usize,
    pub(crate) file_name: String,
    pub(crate) part: Part,
    pub(crate) part_count: u32,
}

/// A fetched and decoded part
#[derive(Debug)]
pub(crate) struct FetchResult {
    pub(crate) file_index: usize,
    pub(crate) part_index: u32,
    pub(crate) part_count: u32,
    /// Target file name as declared by the article
    pub(crate) file_name: String,
    /// 0-based offset of `data` in the target file
    pub(crate) offset: u64,
    pub(crate) data: Vec<u8>,
    /// Total size declared by the article header
    pub(crate) file_size: Option<u64>,
}

/// What a worker reports for every job it takes
#[derive(Debug)]
pub(crate) struct PartOutcome {
    pub(crate) file_index: usize,
    pub(crate) part_index: u32,
    pub(crate) result: Result<FetchResult, FetchError>,
}

/// Everything a fetch worker needs
pub(crate) struct WorkerContext {
    pub(crate) id: usize,
    pub(crate) fetcher: Arc<dyn ArticleFetcher>,
    pub(crate) jobs: JobQueue,
    pub(crate) results: mpsc::Sender<PartOutcome>,
    pub(crate) retry: RetryConfig,
    pub(crate) cancel: CancellationToken,
}

/// Run one fetch worker until the job queue closes, cancellation fires, or its
/// connection fails.
pub(crate) async fn run_worker(ctx: WorkerContext) {
    let WorkerContext {
        id,
        fetcher,
        jobs,
        results,
        retry,
        cancel,
    } = ctx;

    let mut conn = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        connected = fetcher.connect() => match connected {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(worker = id, error = %e, "Fetch worker could not connect");
                return;
            }
        },
    };
    tracing::debug!(worker = id, "Fetch worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = async { jobs.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = fetch_part(conn.as_ref(), &job, &retry) => outcome,
        };

        let fatal = matches!(&outcome.result, Err(e) if e.is_fatal_to_connection());
        if let Err(e) = &outcome.result {
            tracing::debug!(
                worker = id,
                file = %job.file_name,
                part = job.part.index,
                error = %e,
                "Part fetch failed"
            );
        }

        if results.send(outcome).await.is_err() {
            // Scheduler is gone
            break;
        }
        if fatal {
            tracing::warn!(worker = id, "Fetch worker lost its connection, exiting");
            break;
        }
    }

    conn.close().await;
    tracing::debug!(worker = id, "Fetch worker exited");
}

/// Fetch (with retry) and decode one part
async fn fetch_part(
    conn: &dyn ArticleConnection,
    job: &PartJob,
    retry: &RetryConfig,
) -> PartOutcome {
    let message_id = job.part.message_id.as_str();
    let fetched = fetch_with_retry(retry, move || conn.fetch(message_id)).await;

    let result = match fetched {
        Ok(body) => decode(body).await.map(|article| FetchResult {
            file_index: job.file_index,
            part_index: job.part.index,
            part_count: job.part_count,
            file_name: article.file_name,
            offset: article.offset,
            data: article.data,
            file_size: article.file_size,
        }),
        Err(e) => Err(e),
    };

    PartOutcome {
        file_index: job.file_index,
        part_index: job.part.index,
        result,
    }
}

/// Decode off the async workers so other connections keep streaming
async fn decode(body: Vec<u8>) -> Result<yenc::DecodedArticle, FetchError> {
    tokio::task::spawn_blocking(move || yenc::decode_article(&body))
        .await
        .unwrap_or_else(|e| {
            Err(DecodeError::InvalidHeader(format!(
                "Decode task panicked: {}",
                e
            )))
        })
        .map_err(FetchError::from)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MapFetcher {
        articles: HashMap<String, Vec<u8>>,
        connects: AtomicUsize,
        fail_connect: bool,
    }

    struct MapConnection {
        articles: HashMap<String, Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl ArticleFetcher for MapFetcher {
        async fn connect(&self) -> Result<Box<dyn ArticleConnection>, FetchError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(FetchError::Connection("refused".into()));
            }
            Ok(Box::new(MapConnection {
                articles: self.articles.clone(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl ArticleConnection for MapConnection {
        async fn fetch(&self, message_id: &str) -> Result<Vec<u8>, FetchError> {
            match self.articles.get(message_id) {
                Some(body) if body.is_empty() => Err(FetchError::Connection("eof".into())),
                Some(body) => Ok(body.clone()),
                None => Err(FetchError::ArticleNotFound {
                    message_id: message_id.to_string(),
                }),
            }
        }
    }

    fn no_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    fn job(index: u32, message_id: &str) -> PartJob {
        PartJob {
            file_index: 0,
            file_name: "a.bin".to_string(),
            part: Part {
                index,
                message_id: message_id.to_string(),
                bytes: 100,
            },
            part_count: 2,
        }
    }

    fn spawn(
        fetcher: MapFetcher,
        jobs: Vec<PartJob>,
    ) -> (mpsc::Receiver<PartOutcome>, tokio::task::JoinHandle<()>) {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        for j in jobs {
            job_tx.send(j).unwrap();
        }
        drop(job_tx);
        let (results_tx, results_rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_worker(WorkerContext {
            id: 0,
            fetcher: Arc::new(fetcher),
            jobs: Arc::new(Mutex::new(job_rx)),
            results: results_tx,
            retry: no_retry(),
            cancel: CancellationToken::new(),
        }));
        (results_rx, handle)
    }

    #[tokio::test]
    async fn fetches_and_decodes_every_job_then_exits() {
        let mut articles = HashMap::new();
        articles.insert("p1@x".to_string(), yenc::encode_part("a.bin", b"hello ", 0, 11, 1, 2).unwrap());
        articles.insert("p2@x".to_string(), yenc::encode_part("a.bin", b"world", 6, 11, 2, 2).unwrap());
        let fetcher = MapFetcher {
            articles,
            connects: AtomicUsize::new(0),
            fail_connect: false,
        };

        let (mut rx, handle) = spawn(fetcher, vec![job(1, "p1@x"), job(2, "p2@x")]);

        let first = rx.recv().await.unwrap().result.unwrap();
        let second = rx.recv().await.unwrap().result.unwrap();
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();

        assert_eq!(first.part_index, 1);
        assert_eq!(first.data, b"hello ");
        assert_eq!(second.offset, 6);
        assert_eq!(second.file_size, Some(11));
    }

    #[tokio::test]
    async fn missing_article_and_bad_payload_are_part_failures() {
        let mut articles = HashMap::new();
        articles.insert("junk@x".to_string(), b"no yenc here".to_vec());
        let fetcher = MapFetcher {
            articles,
            connects: AtomicUsize::new(0),
            fail_connect: false,
        };

        let (mut rx, _handle) = spawn(fetcher, vec![job(1, "gone@x"), job(2, "junk@x")]);

        let missing = rx.recv().await.unwrap();
        assert_eq!(missing.part_index, 1);
        assert!(matches!(
            missing.result,
            Err(FetchError::ArticleNotFound { .. })
        ));

        let junk = rx.recv().await.unwrap();
        assert!(matches!(
            junk.result,
            Err(FetchError::Decode(DecodeError::NoPayload))
        ));
    }

    #[tokio::test]
    async fn connection_error_stops_the_worker_after_reporting() {
        let mut articles = HashMap::new();
        articles.insert("dead@x".to_string(), Vec::new());
        articles.insert("p2@x".to_string(), yenc::encode_part("a.bin", b"x", 0, 1, 1, 1).unwrap());
        let fetcher = MapFetcher {
            articles,
            connects: AtomicUsize::new(0),
            fail_connect: false,
        };

        let (mut rx, handle) = spawn(fetcher, vec![job(1, "dead@x"), job(2, "p2@x")]);

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(FetchError::Connection(_))));
        assert!(rx.recv().await.is_none(), "worker exits without taking more jobs");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_connect_exits_without_results() {
        let fetcher = MapFetcher {
            articles: HashMap::new(),
            connects: AtomicUsize::new(0),
            fail_connect: true,
        };

        let (mut rx, handle) = spawn(fetcher, vec![job(1, "p1@x")]);

        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }
}
