pub mod asm;
pub mod dis;
pub mod opcodes;
pub mod run;

use anyhow::{Context, Result};
use quicken_runtime::CodeObject;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Extension of binary bytecode files.
pub const BYTECODE_EXTENSION: &str = "qbc";

/// Load a `.qbc` file, or assemble anything else as text.
pub fn load_program(path: &Path) -> Result<Arc<CodeObject>> {
    if path.extension().and_then(|ext| ext.to_str()) == Some(BYTECODE_EXTENSION) {
        return quicken_runtime::load(path)
            .with_context(|| format!("Failed to load bytecode file: {}", path.display()));
    }
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read source file: {}", path.display()))?;
    quicken_runtime::assemble(&source)
        .with_context(|| format!("Failed to assemble {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_text_program() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, ".code main\n.const 1\n RETURN_CONST 0\n.end").unwrap();
        let code = load_program(file.path()).unwrap();
        assert_eq!(&*code.name, "main");
    }

    #[test]
    fn test_assembler_error_mentions_line() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, ".code main\n BOGUS\n.end").unwrap();
        let err = load_program(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_missing_file() {
        assert!(load_program(Path::new("does-not-exist.qasm")).is_err());
    }
}
