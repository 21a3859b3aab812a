use std::io::Write;

use anyhow::Result;

use crate::state::StateStore;

/// Print every persisted workflow with a one-line summary.
pub fn list(out: &mut impl Write) -> Result<()> {
    let store = StateStore::open(StateStore::default_dir())?;
    for id in store.list()? {
        match store.load(&id) {
            Ok(workflow) => {
                writeln!(
                    out,
                    "{id}  {} agent(s)  ${:.4}",
                    workflow.agents.len(),
                    workflow.total_cost
                )?;
            }
            Err(e) => {
                writeln!(out, "{id}  (unreadable: {e})")?;
            }
        }
    }
    Ok(())
}
