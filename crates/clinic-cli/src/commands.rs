//! Subcommands of the `clinic` binary.

use anyhow::{Context as _, bail};
use chrono::{Local, NaiveDate, Weekday};
use clap::Subcommand;
use clinic_core::{
  dates,
  forms::{Form, KeyPolicy},
  record::{FieldMap, PersistedRecord, RecordDraft, RecordId, RecordStatus},
  rules::Predicate,
  uniqueness::{KeyDomain, Verdict},
};
use clinic_engine::{RecordLifecycleManager, SectionKey};
use clinic_store_sqlite::SqliteStore;

type Manager = RecordLifecycleManager<SqliteStore, SqliteStore>;

#[derive(Subcommand)]
pub enum Command {
  /// Show the built-in forms and their fields.
  Forms,

  /// Create a record.
  Register {
    #[arg(long)]
    form:          String,
    /// Discriminator value, e.g. `new` or `therapeutic`.
    #[arg(long = "type")]
    discriminator: String,
    /// Field assignment, `field=value`. Repeatable.
    #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    set:           Vec<(String, String)>,
  },

  /// Edit an existing record in place.
  Update {
    id:  String,
    #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    set: Vec<(String, String)>,
  },

  /// Create a new record from a dated one with a new start and duration.
  Renew {
    id:       String,
    #[arg(long)]
    start:    String,
    #[arg(long)]
    duration: i64,
    #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    set:      Vec<(String, String)>,
  },

  /// Mark an active record completed or cancelled.
  Status { id: String, status: RecordStatus },

  /// Check whether a business key is still free.
  CheckKey {
    #[arg(long)]
    form: String,
    key:  String,
  },

  /// Print the first date on or after `--from` falling on an allowed weekday.
  NextSlot {
    #[arg(long, value_delimiter = ',', required = true)]
    weekdays: Vec<Weekday>,
    #[arg(long)]
    from:     Option<NaiveDate>,
  },

  /// List the records of a form.
  List { form: String },
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
  let (field, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected FIELD=VALUE, got {s:?}"))?;
  let field = field.trim();
  if field.is_empty() {
    return Err(format!("missing field name in {s:?}"));
  }
  Ok((field.to_owned(), value.to_owned()))
}

pub async fn run(command: Command, manager: &Manager) -> anyhow::Result<()> {
  match command {
    Command::Forms => {
      for form in manager.forms().iter() {
        print_form(form);
      }
    }

    Command::Register { form, discriminator, set } => {
      let mut draft = manager.create_draft(&form, Some(&discriminator)).await?;
      apply(manager, &mut draft, &set)?;
      let record = manager.submit(&mut draft).await?;
      print_record(&record)?;
    }

    Command::Update { id, set } => {
      let section = SectionKey::new(format!("cli:update:{id}"));
      let mut draft = manager.open_for_edit(&RecordId::new(id), section).await?.draft;
      apply(manager, &mut draft, &set)?;
      let record = manager.submit(&mut draft).await?;
      print_record(&record)?;
    }

    Command::Renew { id, start, duration, set } => {
      let overrides: FieldMap =
        set.into_iter().map(|(field, value)| (field, value.into())).collect();
      let section = SectionKey::new(format!("cli:renew:{id}"));
      let restored = manager
        .renew_record(&RecordId::new(id), section, &start, duration, &overrides)
        .await?;
      let mut draft = restored.draft;
      let record = manager.submit(&mut draft).await?;
      print_record(&record)?;
    }

    Command::Status { id, status } => {
      let record = manager.set_status(&RecordId::new(id), status).await?;
      print_record(&record)?;
    }

    Command::CheckKey { form, key } => {
      let form = manager.form(&form)?;
      let Some(key_field) = &form.business_key else {
        bail!("form {} has no business key", form.name);
      };
      let domain = KeyDomain::new(&form.name, key_field);
      let check = manager.validator().check_now(&domain, &key, None).await;
      match check.verdict {
        Verdict::Unique => println!("{key}: available"),
        Verdict::Conflict { existing } => println!("{key}: taken by record {existing}"),
        Verdict::Unknown { reason } => bail!("could not check {key}: {reason}"),
      }
    }

    Command::NextSlot { weekdays, from } => {
      let from = from.unwrap_or_else(|| Local::now().date_naive());
      let date = dates::next_allowed_date(from, &weekdays)
        .context("no allowed weekday within a week")?;
      println!("{}", dates::format_date(date));
    }

    Command::List { form } => {
      for record in manager.list(&form).await? {
        let discriminator = record
          .discriminator
          .as_ref()
          .map_or("-", |d| d.as_str());
        println!(
          "{:>6}  {:<10} {:<12} {}",
          record.id.as_str(),
          record.status.to_string(),
          discriminator,
          serde_json::to_string(&record.fields)?
        );
      }
    }
  }
  Ok(())
}

/// Apply `field=value` assignments through the engine so derived fields and
/// discriminator defaults follow.
fn apply(
  manager: &Manager,
  draft: &mut RecordDraft,
  assignments: &[(String, String)],
) -> anyhow::Result<()> {
  for (field, value) in assignments {
    manager
      .edit(draft, field, value.as_str())
      .with_context(|| format!("cannot set {field}"))?;
  }
  Ok(())
}

fn print_record(record: &PersistedRecord) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(record)?);
  Ok(())
}

fn print_form(form: &Form) {
  println!("{}", form.name);
  let options: Vec<String> = form
    .discriminators
    .iter()
    .map(|d| match &d.key_policy {
      KeyPolicy::Manual => d.value.clone(),
      KeyPolicy::Generated { sequence } => format!("{} (key from {sequence})", d.value),
    })
    .collect();
  println!("  {} = {}", form.discriminator_field, options.join(" | "));
  for rule in &form.rules {
    let when = match &rule.required_when {
      Predicate::Always => "required".to_owned(),
      Predicate::Not { predicate } if matches!(**predicate, Predicate::Always) => {
        "optional".to_owned()
      }
      other => format!("required when {}", serde_json::to_string(other).unwrap_or_default()),
    };
    println!("  {:<20} {:<8} {when}", rule.field, format!("{:?}", rule.kind).to_lowercase());
  }
  if let Some(key) = &form.business_key {
    println!("  unique key: {key}");
  }
}
