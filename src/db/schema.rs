/// Tables for the response cache, the mutation queue and the key-value slots.
pub const SCHEMA: &str = r#"
-- Named, versioned response caches (shell-v1, assets-v1, api-runtime, ...)
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    strategy TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (cache_name, url)
);

-- Deferred writes, replayed in id order
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    session_id TEXT,
    enqueued_at INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    retention_deadline INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mutations_deadline ON mutations(retention_deadline);

-- Small persistent slots (flag snapshot, active version)
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
