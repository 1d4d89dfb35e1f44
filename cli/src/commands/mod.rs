mod dap;
mod dump;
mod run;

#[derive(clap::Subcommand, Debug)]
pub enum Subcommand {
    /// Assemble a CASL II program and run it interactively
    Run(run::RunOpt),

    /// Serve the Debug Adapter Protocol over TCP
    Dap(dap::DapOpt),

    /// Print the assembly listing and the symbol table
    Dump(dump::DumpOpt),
}

impl Subcommand {
    pub fn exec(self) -> anyhow::Result<()> {
        match self {
            Subcommand::Run(opt) => opt.exec(),
            Subcommand::Dap(opt) => opt.exec(),
            Subcommand::Dump(opt) => opt.exec(),
        }
    }
}
