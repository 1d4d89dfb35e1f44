//! Debug Adapter Protocol server
//!
//! Line-oriented JSON over TCP: `Content-Length`-prefixed frames carrying
//! the standard DAP envelope. [`serve`] accepts connections and runs one
//! [`session`] per client.

use std::net::TcpListener;

use tracing::{info, warn};

pub mod codec;
pub mod protocol;
mod session;

pub use self::codec::CodecError;

/// Accept DAP clients forever
pub fn serve(listener: TcpListener) -> std::io::Result<()> {
    let address = listener.local_addr()?;
    info!(%address, "DAP server listening");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "client connected");
                std::thread::spawn(move || session::run_session(stream));
            }
            Err(error) => warn!(%error, "accept failed"),
        }
    }
}
