use std::net::TcpListener;

use clap::Parser;

#[derive(Parser, Debug)]
pub struct DapOpt {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = 4711)]
    port: u16,
}

impl DapOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))?;
        comet2_emulator::dap::serve(listener)?;
        Ok(())
    }
}
