//! Dis command - print a disassembly

use super::load_program;
use anyhow::Result;
use quicken_config::QuickenConfig;
use quicken_runtime::{disassemble, DisasmOptions, View, Vm, VmConfig};
use std::path::PathBuf;
use std::sync::Arc;

pub struct DisArgs {
    pub file: PathBuf,
    pub after_run: bool,
    pub deopt: bool,
    pub nested: bool,
}

pub fn run(args: &DisArgs, config: &QuickenConfig) -> Result<()> {
    let code = load_program(&args.file)?;

    if args.after_run {
        let mut vm = Vm::with_config(VmConfig::from_config(config));
        // A failing program still leaves its specialized sites behind.
        if let Err(err) = vm.run(Arc::clone(&code)) {
            eprintln!("warning: program failed: {}", err);
        }
    }

    let options = DisasmOptions {
        view: if args.deopt {
            View::Deoptimized
        } else {
            View::Live
        },
        nested: args.nested,
    };
    print!("{}", disassemble(&code, options));
    Ok(())
}
