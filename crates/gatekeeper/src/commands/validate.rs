use anyhow::{bail, Result};
use std::path::Path;

use crate::config::{parse_file, validate};

/// Print whether the config is valid; fails with the error count otherwise
pub fn execute(path: &Path) -> Result<()> {
    let errors = match parse_file(path) {
        Ok(config) => validate(&config),
        Err(e) => vec![format!("{:#}", e)],
    };

    if errors.is_empty() {
        println!("✅ Config is valid: {}", path.display());
        return Ok(());
    }

    eprintln!("❌ Config is invalid: {}", path.display());
    for error in &errors {
        eprintln!("  - {}", error);
    }
    bail!("{} problem(s) found", errors.len())
}
