use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueHint};
use comet2_emulator::assemble;
use tracing::info;

#[derive(Parser, Debug)]
pub struct DumpOpt {
    /// CASL II source file
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
}

impl DumpOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        info!(path = ?self.input, "Reading program");
        let source = std::fs::read_to_string(&self.input)
            .with_context(|| format!("could not read {}", self.input.display()))?;
        let assembly = assemble(&source)?;

        for (address, word) in assembly.image.iter().enumerate() {
            let address = address as u16;
            let line = assembly
                .debug_info
                .line_for_address(address)
                .unwrap_or(0);
            println!("{line:4} {address:04x} {word:04x}");
        }

        println!();
        println!("DEFINED SYMBOLS");
        for (label, address) in &assembly.debug_info.labels {
            // A section's own label prints bare; others carry their scope
            let display = match label.split_once(':') {
                Some((scope, name)) if scope == name => name.to_string(),
                Some((scope, name)) => format!("{name} ({scope})"),
                None => label.clone(),
            };
            println!("{address:04x}\t{display}");
        }

        Ok(())
    }
}
