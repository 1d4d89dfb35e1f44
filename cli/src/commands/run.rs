use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueHint};
use comet2_emulator::assemble;
use comet2_emulator::runtime::Machine;
use tracing::{debug, info};

use crate::interactive::run_interactive;

#[derive(Parser, Debug)]
pub struct RunOpt {
    /// CASL II source file
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Lines queued for SVC IN before reading from the terminal
    inputs: Vec<String>,

    /// Start running immediately instead of waiting at the prompt
    #[arg(short, long)]
    run: bool,
}

impl RunOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        info!(path = ?self.input, "Reading program");
        let source = std::fs::read_to_string(&self.input)
            .with_context(|| format!("could not read {}", self.input.display()))?;

        debug!("Assembling program");
        let assembly = assemble(&source)?;
        info!(start = assembly.start, words = assembly.image.len(), "Successfully assembled");

        let mut machine = Machine::new(&assembly);
        run_interactive(&mut machine, self.inputs, self.run)
    }
}
