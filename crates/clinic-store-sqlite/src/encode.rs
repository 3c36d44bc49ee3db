//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, field maps are compact JSON objects, and
//! record ids are the decimal `row_id`.

use chrono::{DateTime, Utc};
use clinic_core::record::{Discriminator, FieldMap, PersistedRecord, RecordId, RecordStatus};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── RecordId ────────────────────────────────────────────────────────────────

pub fn encode_record_id(row_id: i64) -> RecordId { RecordId::new(row_id.to_string()) }

pub fn decode_record_id(id: &RecordId) -> Result<i64> {
  id.as_str()
    .trim()
    .parse()
    .map_err(|_| Error::InvalidRecordId(id.to_string()))
}

// ─── Fields ──────────────────────────────────────────────────────────────────

pub fn encode_fields(fields: &FieldMap) -> Result<String> {
  Ok(serde_json::to_string(fields)?)
}

pub fn decode_fields(s: &str) -> Result<FieldMap> { Ok(serde_json::from_str(s)?) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Columns selected for every record read, in [`RawRecord`] order.
pub const RECORD_COLUMNS: &str =
  "row_id, form, discriminator, status, fields_json, created_at, updated_at";

/// Raw values read directly from a `records` row.
pub struct RawRecord {
  pub row_id:        i64,
  pub form:          String,
  pub discriminator: Option<String>,
  pub status:        String,
  pub fields_json:   String,
  pub created_at:    String,
  pub updated_at:    String,
}

impl RawRecord {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      row_id:        row.get(0)?,
      form:          row.get(1)?,
      discriminator: row.get(2)?,
      status:        row.get(3)?,
      fields_json:   row.get(4)?,
      created_at:    row.get(5)?,
      updated_at:    row.get(6)?,
    })
  }

  pub fn into_record(self) -> Result<PersistedRecord> {
    Ok(PersistedRecord {
      id:            encode_record_id(self.row_id),
      form:          self.form,
      discriminator: self.discriminator.map(Discriminator::new),
      status:        RecordStatus::parse(&self.status)?,
      fields:        decode_fields(&self.fields_json)?,
      created_at:    decode_dt(&self.created_at)?,
      updated_at:    decode_dt(&self.updated_at)?,
    })
  }
}
