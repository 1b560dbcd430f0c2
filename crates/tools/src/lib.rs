//! Shared helpers for the POFF command line tools.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod dump;

/// Open and map a file read-only.
pub fn map_file(path: &Path) -> Result<memmap2::Mmap> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open file '{}'", path.display()))?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .with_context(|| format!("failed to map file '{}'", path.display()))?;
    Ok(mmap)
}
