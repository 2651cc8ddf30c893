/// Schema for the local store. All timestamps are epoch milliseconds.
pub const SCHEMA: &str = r#"
-- Cached entity records, one row per (collection, key)
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    scope TEXT,
    data BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (collection, record_key)
);

CREATE INDEX IF NOT EXISTS idx_records_scope
    ON records(collection, scope);

CREATE INDEX IF NOT EXISTS idx_records_cached_at
    ON records(collection, cached_at);

-- Durable write queue, FIFO by order_number
CREATE TABLE IF NOT EXISTS write_queue (
    order_number INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    correlation TEXT,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

-- Single-row high-water mark so order numbers are never reused
CREATE TABLE IF NOT EXISTS write_queue_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    high_water INTEGER NOT NULL
);

-- Report generation jobs keyed by parameter identity
CREATE TABLE IF NOT EXISTS report_jobs (
    parameter_key TEXT PRIMARY KEY,
    parameters BLOB NOT NULL,
    status TEXT NOT NULL,
    result_locator TEXT,
    result_payload BLOB,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
