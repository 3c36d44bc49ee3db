//! SQL schema for the clinic SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS records (
    row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    form          TEXT NOT NULL,
    discriminator TEXT,
    status        TEXT NOT NULL DEFAULT 'active',  -- 'active' | 'completed' | 'cancelled'
    fields_json   TEXT NOT NULL DEFAULT '{}',      -- JSON object of field values
    created_at    TEXT NOT NULL,                   -- ISO 8601 UTC
    updated_at    TEXT NOT NULL
);

-- One row per named key sequence; last_value is the last number issued.
CREATE TABLE IF NOT EXISTS sequences (
    name       TEXT PRIMARY KEY,
    last_value INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS records_form_idx ON records(form);

PRAGMA user_version = 1;
";
