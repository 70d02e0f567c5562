//! Stage hand-off files, so each stage can also run on its own.

use crate::errors::{DataHubError, Result};
use crate::models::price::{DownloadJob, Symbol};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Serialize, Deserialize)]
struct SymbolRow {
    symbol: Symbol,
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn require_file(path: &Path, produced_by: &str) -> Result<()> {
    if !path.exists() {
        return Err(DataHubError::DataError(format!(
            "{} not found. Run '{}' first.", path.display(), produced_by
        )));
    }
    Ok(())
}

pub fn write_symbols(path: &Path, symbols: &[Symbol]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for symbol in symbols {
        writer.serialize(SymbolRow { symbol: symbol.clone() })?;
    }
    writer.flush()?;
    info!("Saved {} symbols to {}", symbols.len(), path.display());
    Ok(())
}

pub fn read_symbols(path: &Path) -> Result<Vec<Symbol>> {
    require_file(path, "discover")?;
    let mut reader = csv::Reader::from_path(path)?;
    let symbols = reader
        .deserialize::<SymbolRow>()
        .map(|row| row.map(|r| r.symbol))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(symbols)
}

pub fn write_plan(path: &Path, jobs: &[DownloadJob]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for job in jobs {
        writer.serialize(job)?;
    }
    writer.flush()?;
    info!("Saved download plan ({} jobs) to {}", jobs.len(), path.display());
    Ok(())
}

pub fn read_plan(path: &Path) -> Result<Vec<DownloadJob>> {
    require_file(path, "plan")?;
    let mut reader = csv::Reader::from_path(path)?;
    let jobs = reader
        .deserialize::<DownloadJob>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(jobs)
}
