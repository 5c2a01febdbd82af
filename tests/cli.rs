// Drive the built binary through a pty
mod common;

use anyhow::Result;
use rexpect::spawn;
use std::fs;
use std::path::{Path, PathBuf};

use common::*;

const BIN: &str = env!("CARGO_BIN_EXE_rifugio-monitor");

fn write_fixtures(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let pdf = dir.join("calendar.pdf");
    fs::write(&pdf, pdf_with(september_table(&[(12, "green"), (21, "red")]), vec![]))?;
    let config = dir.join("monitor.toml");
    fs::write(&config, "[extraction.ocr]\nenabled = false\n")?;
    Ok((pdf, config))
}

#[test]
fn test_hash_prints_sha256() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (pdf, config) = write_fixtures(dir.path())?;
    let expected = rifugio_monitor::content_hash(&fs::read(&pdf)?);

    let mut session = spawn(
        &format!("{} --config {} hash {}", BIN, config.display(), pdf.display()),
        Some(10_000),
    )?;
    session.exp_string(&expected)?;
    session.exp_eof()?;
    Ok(())
}

#[test]
fn test_extract_prints_table() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (pdf, config) = write_fixtures(dir.path())?;

    let mut session = spawn(
        &format!("{} --config {} extract {} --range 11-13", BIN, config.display(), pdf.display()),
        Some(10_000),
    )?;
    session.exp_string("September 11-13")?;
    session.exp_string("Unknown")?;
    session.exp_string("Available")?;
    session.exp_string("text")?;
    session.exp_string("confidence: High")?;
    session.exp_eof()?;
    Ok(())
}

#[test]
fn test_extract_json() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (pdf, config) = write_fixtures(dir.path())?;

    let mut session = spawn(
        &format!("{} --config {} extract {} --json", BIN, config.display(), pdf.display()),
        Some(10_000),
    )?;
    session.exp_string("\"status\": \"fully_booked\"")?;
    session.exp_string("\"method\": \"text\"")?;
    session.exp_eof()?;
    Ok(())
}

#[test]
fn test_extract_rejects_corrupt_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_, config) = write_fixtures(dir.path())?;
    let broken = dir.path().join("broken.pdf");
    fs::write(&broken, "<html>Service unavailable</html>")?;

    let mut session = spawn(
        &format!("{} --config {} extract {}", BIN, config.display(), broken.display()),
        Some(10_000),
    )?;
    session.exp_string("corrupt input")?;
    session.exp_eof()?;
    Ok(())
}
