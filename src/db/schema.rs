/// Schema for the entry store, the version log and the sync queue.
pub const SCHEMA: &str = r#"
-- Cache generations and their lifecycle state
CREATE TABLE IF NOT EXISTS cache_versions (
    version TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Stored responses, scoped by cache version
CREATE TABLE IF NOT EXISTS entries (
    version TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    vary TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (version, cache_key)
);

-- Durable log of operations waiting to reach the remote.
-- AUTOINCREMENT keeps ids monotonic and never reused.
CREATE TABLE IF NOT EXISTS pending_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_channel
    ON pending_operations(channel, id);
"#;
