use recordsync_core::{ChangeState, MetadataStore};

use super::CommandResult;

pub fn run(state: Option<ChangeState>, json: bool) -> CommandResult {
    let store = MetadataStore::open_default()?;
    let ledger = store.ledger();
    let entities = match state {
        Some(state) => ledger.entities_in(&[state])?,
        None => ledger.all()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entities)?);
        return Ok(());
    }
    if entities.is_empty() {
        println!("no entities");
        return Ok(());
    }
    for entity in entities {
        let tombstone = if entity.is_deleted { "  (tombstone)" } else { "" };
        println!(
            "{}  {:<8} {}{}",
            entity.key(),
            entity.change_state.as_str(),
            entity.modified_at.format("%Y-%m-%d %H:%M:%S"),
            tombstone
        );
    }
    Ok(())
}
