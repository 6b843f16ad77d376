//! Full snapshots of feed and mirror data.
//!
//! ```text
//!   <dir>/
//!     primary/          store export (arangodump output or JSON collections)
//!     mirror.sqlite3    SQLite online backup of the mirror
//! ```

use std::path::{Path, PathBuf};
use stixgraph_store::arango::find_tool;

use crate::context::EngineContext;
use crate::error::{Error, Result};

pub const PRIMARY_DIR: &str = "primary";
pub const MIRROR_FILE: &str = "mirror.sqlite3";

fn primary_dir(dir: &Path) -> PathBuf {
    dir.join(PRIMARY_DIR)
}

/// External tools the configured store needs must be installed.
fn require_tool(ctx: &EngineContext, tool: &str) -> Result<()> {
    if ctx.config.arango().is_none() {
        return Ok(());
    }
    match find_tool(tool) {
        Some(_) => Ok(()),
        None => Err(Error::ToolingMissing(tool.to_string())),
    }
}

/// Writes every collection and the mirror database to `dir`.
///
/// Fails with [`Error::ToolingMissing`] before anything is written when the
/// store's dump tool is not installed.
pub fn snapshot(ctx: &EngineContext, dir: &Path) -> Result<()> {
    require_tool(ctx, &ctx.config.snapshot.dump_tool)?;
    let collections = ctx.store.collections()?;
    let primary = primary_dir(dir);
    std::fs::create_dir_all(&primary).map_err(|e| Error::Store(e.into()))?;
    ctx.store
        .export(&primary, &collections)
        .map_err(Error::from_store)?;

    if let Some(mirror) = &ctx.mirror {
        mirror.backup_to(&dir.join(MIRROR_FILE))?;
    }
    tracing::info!(
        dir = %dir.display(),
        collections = collections.len(),
        mirror = ctx.mirror.is_some(),
        "snapshot written"
    );
    Ok(())
}

/// Loads a snapshot written by [`snapshot`].
pub fn snapshot_restore(ctx: &EngineContext, dir: &Path) -> Result<()> {
    require_tool(ctx, &ctx.config.snapshot.restore_tool)?;
    ctx.store
        .import(&primary_dir(dir))
        .map_err(Error::from_store)?;

    let mirror_file = dir.join(MIRROR_FILE);
    match (&ctx.mirror, mirror_file.is_file()) {
        (Some(mirror), true) => mirror.restore_from(&mirror_file)?,
        (None, true) => tracing::warn!(
            file = %mirror_file.display(),
            "snapshot has mirror data but no mirror is configured"
        ),
        (_, false) => {}
    }
    tracing::info!(dir = %dir.display(), "snapshot restored");
    Ok(())
}
