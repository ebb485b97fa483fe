use recordsync_core::MetadataStore;
use serde::Serialize;

use super::CommandResult;

#[derive(Serialize)]
struct Status {
    new: u64,
    changed: u64,
    deleted: u64,
    synced: u64,
    tombstones: u64,
    pending_push: u64,
    unresolved_relationships: usize,
}

pub fn run(json: bool) -> CommandResult {
    let store = MetadataStore::open_default()?;
    let counts = store.ledger().counts()?;
    let status = Status {
        new: counts.new,
        changed: counts.changed,
        deleted: counts.deleted,
        synced: counts.synced,
        tombstones: counts.tombstones,
        pending_push: counts.pending(),
        unresolved_relationships: store.pending().len()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("new:        {}", status.new);
    println!("changed:    {}", status.changed);
    println!("deleted:    {}", status.deleted);
    println!("synced:     {}", status.synced);
    println!("tombstones: {}", status.tombstones);
    println!("pending push: {}", status.pending_push);
    println!("unresolved relationships: {}", status.unresolved_relationships);
    Ok(())
}
