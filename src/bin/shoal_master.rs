use std::{error::Error, net::SocketAddr, process};

use clap::Parser;
use log::info;
use shoal::MasterServer;

#[derive(Debug, Parser)]
struct Cli {
    /// Listen for worker connections at address
    address: SocketAddr,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = MasterServer::bind(cli.address)?;

    ctrlc::set_handler(|| {
        info!("shutting down");
        process::exit(0);
    })?;

    server.serve()?;
    Ok(())
}
