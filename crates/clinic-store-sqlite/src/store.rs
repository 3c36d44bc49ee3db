//! [`SqliteStore`], the SQLite implementation of [`RecordStore`] and
//! [`SequenceGenerator`].

use std::path::Path;

use chrono::Utc;
use rusqlite::{OptionalExtension as _, TransactionBehavior};

use clinic_core::{
  record::{NewRecord, PersistedRecord, RecordId, RecordUpdate, merge_fields},
  store::{RecordStore, SequenceGenerator},
  uniqueness::{ExternalRecordSnapshot, KeyDomain, KeyEntry},
};

use crate::{
  Error, Result,
  encode::{
    RECORD_COLUMNS, RawRecord, decode_fields, decode_record_id, encode_dt, encode_fields,
    encode_record_id,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A clinic record store backed by a single SQLite file.
///
/// Cloning is cheap: the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn fetch_raw(&self, row_id: i64) -> Result<Option<RawRecord>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {RECORD_COLUMNS} FROM records WHERE row_id = ?1"),
              rusqlite::params![row_id],
              RawRecord::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    Ok(raw)
  }
}

fn other(e: Error) -> tokio_rusqlite::Error { tokio_rusqlite::Error::Other(Box::new(e)) }

/// Merge `update` into the stored row.
fn apply_update(raw: RawRecord, update: RecordUpdate) -> Result<PersistedRecord> {
  let mut record = raw.into_record()?;
  merge_fields(&mut record.fields, update.fields);
  if let Some(d) = update.discriminator {
    record.discriminator = Some(d);
  }
  if let Some(status) = update.status {
    record.status = status;
  }
  record.updated_at = Utc::now();
  Ok(record)
}

// ─── RecordStore impl ────────────────────────────────────────────────────────

impl RecordStore for SqliteStore {
  type Error = Error;

  async fn fetch_keys(&self, domain: &KeyDomain) -> Result<ExternalRecordSnapshot> {
    let form = domain.form.clone();

    let rows: Vec<(i64, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare("SELECT row_id, fields_json FROM records WHERE form = ?1")?;
        let rows = stmt
          .query_map(rusqlite::params![form], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for (row_id, fields_json) in rows {
      let fields = decode_fields(&fields_json)?;
      if let Some(key) = fields.get(&domain.key_field).filter(|v| !v.is_blank()) {
        entries.push(KeyEntry { id: encode_record_id(row_id), key: key.to_string() });
      }
    }
    Ok(ExternalRecordSnapshot::new(domain.clone(), entries))
  }

  async fn create(&self, record: NewRecord) -> Result<PersistedRecord> {
    let now = Utc::now();
    let form = record.form.clone();
    let discriminator = record.discriminator.as_ref().map(|d| d.as_str().to_owned());
    let status = record.status.to_string();
    let fields_json = encode_fields(&record.fields)?;
    let at_str = encode_dt(now);

    let row_id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO records (
             form, discriminator, status, fields_json, created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
          rusqlite::params![form, discriminator, status, fields_json, at_str],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(PersistedRecord {
      id:            encode_record_id(row_id),
      form:          record.form,
      discriminator: record.discriminator,
      status:        record.status,
      fields:        record.fields,
      created_at:    now,
      updated_at:    now,
    })
  }

  async fn update(&self, id: &RecordId, update: RecordUpdate) -> Result<PersistedRecord> {
    let row_id = decode_record_id(id)?;

    // Read, merge and write in one transaction.
    let updated = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = tx
          .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE row_id = ?1"),
            rusqlite::params![row_id],
            RawRecord::from_row,
          )
          .optional()?;
        let Some(raw) = raw else { return Ok(None) };

        let record = apply_update(raw, update).map_err(other)?;
        let fields_json = encode_fields(&record.fields).map_err(other)?;
        tx.execute(
          "UPDATE records
             SET discriminator = ?1, status = ?2, fields_json = ?3, updated_at = ?4
           WHERE row_id = ?5",
          rusqlite::params![
            record.discriminator.as_ref().map(|d| d.as_str()),
            record.status.to_string(),
            fields_json,
            encode_dt(record.updated_at),
            row_id,
          ],
        )?;
        tx.commit()?;
        Ok(Some(record))
      })
      .await?;

    updated.ok_or_else(|| Error::RecordNotFound(id.clone()))
  }

  async fn get(&self, id: &RecordId) -> Result<Option<PersistedRecord>> {
    // Ids this store never issued simply do not exist.
    let Ok(row_id) = decode_record_id(id) else { return Ok(None) };
    self.fetch_raw(row_id).await?.map(RawRecord::into_record).transpose()
  }

  async fn list(&self, form: &str) -> Result<Vec<PersistedRecord>> {
    let form = form.to_owned();

    let raws: Vec<RawRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RECORD_COLUMNS} FROM records WHERE form = ?1 ORDER BY row_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![form], RawRecord::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRecord::into_record).collect()
  }
}

// ─── SequenceGenerator impl ──────────────────────────────────────────────────

impl SequenceGenerator for SqliteStore {
  type Error = Error;

  /// Keys look like `PT-000042`: the sequence name and a zero-padded counter.
  async fn next(&self, sequence: &str) -> Result<String> {
    let name = sequence.to_owned();

    let value: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "INSERT INTO sequences (name, last_value) VALUES (?1, 1)
           ON CONFLICT (name) DO UPDATE SET last_value = last_value + 1
           RETURNING last_value",
          rusqlite::params![name],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(format!("{sequence}-{value:06}"))
  }
}
