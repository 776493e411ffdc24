//! Release fixtures: stored RAR volumes and yEnc-encoded manifests

use super::MemoryFetcher;
use nzb_stream::yenc;
use nzb_stream::{Config, Manifest, Part, RemoteFile};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Deterministic content
pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

fn block(kind: u8, flags: u16, body: &[u8]) -> Vec<u8> {
    let mut header = vec![kind];
    header.extend_from_slice(&flags.to_le_bytes());
    header.extend_from_slice(&((7 + body.len()) as u16).to_le_bytes());
    header.extend_from_slice(body);
    let crc = (crc32fast::hash(&header) & 0xffff) as u16;
    let mut out = crc.to_le_bytes().to_vec();
    out.extend(header);
    out
}

/// Split `content` into stored RAR4 volumes of one entry called `entry`
pub fn rar_volumes(entry: &str, content: &[u8], volumes: usize) -> Vec<Vec<u8>> {
    let chunk = content.len().div_ceil(volumes);
    let slices: Vec<&[u8]> = content.chunks(chunk).collect();
    let last = slices.len() - 1;

    slices
        .iter()
        .enumerate()
        .map(|(i, data)| {
            let mut out = b"Rar!\x1a\x07\x00".to_vec();
            out.extend(block(0x73, 0x0011, &[0u8; 6]));

            let mut flags = 0x8000u16;
            if i > 0 {
                flags |= 0x01;
            }
            if i < last {
                flags |= 0x02;
            }
            let mut body = Vec::new();
            body.extend_from_slice(&(data.len() as u32).to_le_bytes());
            body.extend_from_slice(&(content.len() as u32).to_le_bytes());
            body.push(2);
            body.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
            body.extend_from_slice(&0u32.to_le_bytes());
            body.push(29);
            body.push(0x30);
            body.extend_from_slice(&(entry.len() as u16).to_le_bytes());
            body.extend_from_slice(&0x20u32.to_le_bytes());
            body.extend_from_slice(entry.as_bytes());
            out.extend(block(0x74, flags, &body));
            out.extend_from_slice(data);
            out.extend(block(0x7b, 0x4000 | u16::from(i < last), &[]));
            out
        })
        .collect()
}

/// Manifest for `files` under `root/<job>/`, split into `part_size` byte articles,
/// and a fetcher serving them
pub fn job(
    root: &Path,
    job: &str,
    files: &[(String, Vec<u8>)],
    part_size: usize,
) -> (Manifest, MemoryFetcher) {
    let job_dir = root.join(job);
    let mut articles = HashMap::new();
    let mut remote_files = Vec::new();

    for (name, data) in files {
        let chunks: Vec<&[u8]> = data.chunks(part_size).collect();
        let total = chunks.len() as u32;
        let parts = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let index = i as u32 + 1;
                let message_id = format!("{name}.{index}@example");
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
                Part {
                    index,
                    message_id,
                    bytes: chunk.len() as u64,
                }
            })
            .collect();
        remote_files.push(RemoteFile {
            name: name.clone(),
            subject: format!("{job} - \"{name}\" yEnc (1/{total})"),
            parts,
            path: job_dir.join(name),
            checksum: None,
        });
    }

    let manifest = Manifest {
        name: job.to_string(),
        title: None,
        job_dir,
        files: remote_files,
    };
    (manifest, MemoryFetcher::new(articles))
}

/// Config with short poll intervals and no retries
pub fn fast_config(root: &Path, connections: usize) -> Config {
    let mut config = Config::default();
    config.server.connections = connections;
    config.download.download_dir = root.to_path_buf();
    config.download.retry.max_attempts = 0;
    config.stream.chunk_size = 4 * 1024;
    config.stream.queue_depth = 4;
    config.stream.volume_poll_interval = Duration::from_millis(10);
    config.stream.file_poll_interval = Duration::from_millis(10);
    config
}
