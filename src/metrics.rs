//! Download and cache metrics
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! embedding application installs a recorder.

/// Record bytes written into the blob store
pub fn record_bytes_downloaded(repo_id: &str, bytes: u64) {
    metrics::counter!("hub_cache_bytes_downloaded_total",
        "repo" => repo_id.to_string()
    )
    .increment(bytes);
}

/// Record a file whose blob was transferred and linked
pub fn record_file_downloaded(repo_id: &str) {
    metrics::counter!("hub_cache_files_downloaded_total",
        "repo" => repo_id.to_string()
    )
    .increment(1);
}

/// Record a download satisfied without transferring content
///
/// `kind` is `pointer` when the snapshot entry already existed and `blob`
/// when only the link had to be recreated.
pub fn record_dedup_hit(kind: &'static str) {
    metrics::counter!("hub_cache_dedup_hits_total", "kind" => kind).increment(1);
}

/// Record a transient failure that triggered a retry
pub fn record_transfer_retry(repo_id: &str) {
    metrics::counter!("hub_cache_transfer_retries_total",
        "repo" => repo_id.to_string()
    )
    .increment(1);
}

/// Record space reclaimed by cache cleanup
pub fn record_bytes_freed(bytes: u64) {
    metrics::counter!("hub_cache_bytes_freed_total").increment(bytes);
}
