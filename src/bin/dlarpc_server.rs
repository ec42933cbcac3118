use std::error::Error;

use clap::Parser;
use dlarpc::{DeviceServer, HostRuntime, ServerConfig};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "Serve inference requests on the host runtime")]
struct Cli {
    #[command(flatten)]
    config: ServerConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = DeviceServer::new(cli.config, HostRuntime::factory());

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        handle.shutdown();
    })?;

    server.listen()?;
    Ok(())
}
