use recordsync_core::MetadataStore;

use super::CommandResult;

pub fn run(json: bool) -> CommandResult {
    let store = MetadataStore::open_default()?;
    let unresolved = store.pending().unresolved()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&unresolved)?);
        return Ok(());
    }
    if unresolved.is_empty() {
        println!("no pending relationships");
        return Ok(());
    }
    for relationship in unresolved {
        println!(
            "{}/{}.{} -> {}[{}]",
            relationship.from_type,
            relationship.from_identifier,
            relationship.property,
            relationship.to_type,
            relationship.targets.join(", ")
        );
    }
    Ok(())
}
