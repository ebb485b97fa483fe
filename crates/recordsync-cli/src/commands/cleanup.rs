use chrono::Duration;
use recordsync_core::sync::{retention_cutoff, Ledger, PendingQueue};
use recordsync_core::{Config, MetadataStore};
use tracing::info;

use super::CommandResult;

pub fn run(retention_days: Option<u32>) -> CommandResult {
    let retention = match retention_days {
        Some(days) => Duration::days(i64::from(days)),
        None => Config::load()?.retention(),
    };
    let before = retention_cutoff(retention);

    let store = MetadataStore::open_default()?;
    let (tombstones, relationships) = store.write(|conn| {
        Ok((
            Ledger::new(conn).reap(before)?,
            PendingQueue::new(conn).reap_applied(before)?,
        ))
    })?;
    info!(tombstones, relationships, "cleanup complete");
    println!("removed {tombstones} tombstones and {relationships} applied relationships");
    Ok(())
}
