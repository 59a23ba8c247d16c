use anyhow::Result;
use db::{Db, ErrorRow};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Point-in-time summary of the file log: how many paths sit in each
/// status, plus every path carrying upload errors.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub counts: BTreeMap<String, i64>,
    pub errors: Vec<ErrorRow>,
    pub timestamp: i64,
}

pub fn collect(db: &Db) -> Result<StatusSnapshot> {
    let counts = db.status_counts()?.into_iter().collect();
    let errors = db.list_errors()?;
    Ok(StatusSnapshot {
        counts,
        errors,
        timestamp: OffsetDateTime::now_utc().unix_timestamp(),
    })
}

pub fn print(snapshot: &StatusSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    if snapshot.counts.is_empty() {
        println!("File log is empty.");
        return Ok(());
    }

    println!("{:<12} COUNT", "STATUS");
    for (status, count) in &snapshot.counts {
        let label = if status.is_empty() { "(none)" } else { status };
        println!("{label:<12} {count}");
    }

    if !snapshot.errors.is_empty() {
        println!();
        println!("{:<6} {:<10} PATH", "ERRORS", "STATUS");
        for row in &snapshot.errors {
            let status = row.status.map(|s| s.as_str()).unwrap_or("(none)");
            println!("{:<6} {:<10} {}", row.error_count, status, row.path);
        }
    }
    Ok(())
}
