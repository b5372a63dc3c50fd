use anyhow::Result;
use vergen_gix::{BuildBuilder, Emitter, GixBuilder};

// Feeds the version banner of `labgpud --version`.
fn main() -> Result<()> {
    let build = BuildBuilder::default().build_timestamp(true).build()?;
    let git = GixBuilder::default().sha(true).branch(true).build()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&git)?
        .emit()?;
    Ok(())
}
