//! Asm command - assemble text to a `.qbc` file

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn run(input: &Path, output: &Path) -> Result<()> {
    let source = fs::read_to_string(input)
        .with_context(|| format!("Failed to read source file: {}", input.display()))?;
    let code = quicken_runtime::assemble(&source)
        .with_context(|| format!("Failed to assemble {}", input.display()))?;
    if let Err(errors) = quicken_runtime::validate(&code) {
        for error in &errors {
            eprintln!("{}: {}", input.display(), error);
        }
        anyhow::bail!("{} failed validation", code.name);
    }
    quicken_runtime::save(&code, output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!(input = %input.display(), output = %output.display(), "assembled");
    Ok(())
}
