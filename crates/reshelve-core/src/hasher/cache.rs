use super::{digest, ContentHash};
use crate::storage::models::CachedHash;
use crate::storage::Database;
use rayon::prelude::*;
use std::io;
use std::path::PathBuf;
use tracing::{trace, warn};

/// A file waiting for its content hash.
#[derive(Debug, Clone)]
pub struct HashRequest {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_nanos: i64,
}

#[derive(Debug, Clone)]
pub struct Hashed {
    pub hash: ContentHash,
    pub signature: u64,
}

/// Resolve content hashes for a batch, in request order.
///
/// Cache lookups and write-back happen on the calling thread (the SQLite
/// handle is single-writer); only cache misses are hashed on `pool`. A cached
/// entry is trusted when size, mtime (nanosecond precision) and the metadata
/// signature all still match.
pub fn resolve_batch(
    db: Option<&Database>,
    pool: &rayon::ThreadPool,
    requests: &[HashRequest],
    streaming_threshold: u64,
) -> Vec<io::Result<Hashed>> {
    let mut results: Vec<Option<io::Result<Hashed>>> = Vec::with_capacity(requests.len());
    let mut misses: Vec<usize> = Vec::new();

    for (idx, request) in requests.iter().enumerate() {
        let signature = match digest::signature(&request.path, request.size, request.mtime_nanos) {
            Ok(sig) => sig,
            Err(e) => {
                results.push(Some(Err(e)));
                continue;
            }
        };
        match db.map(|db| lookup(db, request, signature)) {
            Some(Some(hash)) => {
                trace!("Found hash for {} in cache", request.path.display());
                results.push(Some(Ok(Hashed { hash, signature })));
            }
            _ => {
                results.push(None);
                misses.push(idx);
            }
        }
    }

    let computed: Vec<(usize, io::Result<ContentHash>)> = pool.install(|| {
        misses
            .par_iter()
            .map(|&idx| {
                let request = &requests[idx];
                (idx, digest::hash_file(&request.path, streaming_threshold))
            })
            .collect()
    });

    let mut fresh: Vec<CachedHash> = Vec::new();
    for (idx, outcome) in computed {
        let request = &requests[idx];
        let outcome = outcome.and_then(|hash| {
            // Recompute the signature so a file rewritten mid-hash is not cached
            let signature = digest::signature(&request.path, request.size, request.mtime_nanos)?;
            fresh.push(CachedHash {
                path: request.path.to_string_lossy().into_owned(),
                file_size: request.size as i64,
                mtime_nanos: request.mtime_nanos,
                signature: signature as i64,
                content_hash: hash.as_str().to_string(),
            });
            Ok(Hashed { hash, signature })
        });
        results[idx] = Some(outcome);
    }

    if let Some(db) = db {
        if !fresh.is_empty() {
            if let Err(e) = db.upsert_cached_hashes(&fresh) {
                warn!("Failed to write {} hash cache entries: {}", fresh.len(), e);
            }
        }
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::Other, "hash not resolved"))))
        .collect()
}

fn lookup(db: &Database, request: &HashRequest, signature: u64) -> Option<ContentHash> {
    let key = request.path.to_string_lossy();
    match db.get_cached_hash(&key) {
        Ok(Some(cached))
            if cached.file_size == request.size as i64
                && cached.mtime_nanos == request.mtime_nanos
                && cached.signature == signature as i64 =>
        {
            Some(ContentHash::from_hex(cached.content_hash))
        }
        Ok(_) => None,
        Err(e) => {
            warn!("Hash cache lookup failed for {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn request(path: PathBuf) -> HashRequest {
        let meta = fs::metadata(&path).unwrap();
        let mtime = chrono::DateTime::<chrono::Utc>::from(meta.modified().unwrap());
        HashRequest {
            path,
            size: meta.len(),
            mtime_nanos: mtime.timestamp_nanos_opt().unwrap_or_default(),
        }
    }

    #[test]
    fn test_resolve_batch_populates_cache_and_keeps_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "alpha").unwrap();
        fs::write(&b, "beta").unwrap();
        let db = Database::open_in_memory().unwrap();

        let requests = vec![request(a.clone()), request(b.clone())];
        let first = resolve_batch(Some(&db), &pool(), &requests, 1024);
        assert_eq!(db.count_cached_hashes().unwrap(), 2);

        let second = resolve_batch(Some(&db), &pool(), &requests, 1024);
        let first_a = first[0].as_ref().unwrap();
        let second_a = second[0].as_ref().unwrap();
        assert_eq!(first_a.hash, second_a.hash);
        assert_eq!(first_a.hash, ContentHash::from(blake3::hash(b"alpha")));
        assert_eq!(
            second[1].as_ref().unwrap().hash,
            ContentHash::from(blake3::hash(b"beta"))
        );
    }

    #[test]
    fn test_vanished_file_reports_error_without_failing_batch() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, "alpha").unwrap();
        let requests = vec![
            HashRequest {
                path: dir.path().join("gone.txt"),
                size: 3,
                mtime_nanos: 0,
            },
            request(a),
        ];
        let results = resolve_batch(None, &pool(), &requests, 1024);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }
}
