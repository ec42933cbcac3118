use std::{error::Error, fs, path::PathBuf};

use clap::Parser;
use dlarpc::{ClientConfig, DeviceClient};

#[derive(Debug, Parser)]
#[command(version, about = "Run one inference on a remote accelerator")]
struct Cli {
    /// Compiled binary image to load
    model: PathBuf,

    /// Raw input tensor bytes
    input: PathBuf,

    /// Output bytes to read back
    output_size: usize,

    /// Tag identifying the image; defaults to the model file name
    #[arg(long)]
    tag: Option<String>,

    /// Print the output as little-endian f32 values instead of hex
    #[arg(long)]
    float: bool,

    /// Ask the server to shut down afterwards
    #[arg(long)]
    shutdown_server: bool,

    #[command(flatten)]
    config: ClientConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let image = fs::read(&cli.model)?;
    let input = fs::read(&cli.input)?;
    let tag = cli.tag.clone().unwrap_or_else(|| {
        cli.model
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let client = DeviceClient::connect(&cli.config)?;
    let mut session = client.session()?;
    session.init()?;
    println!(
        "devices: {} of {}",
        session.num_devices()?,
        session.max_devices()?
    );
    session.load_binary(&tag, image)?;
    session.send_input(input)?;
    let output = session.infer(cli.output_size)?;

    if cli.float {
        for value in output.chunks_exact(4) {
            println!("{}", f32::from_le_bytes([value[0], value[1], value[2], value[3]]));
        }
    } else {
        for line in output.chunks(16) {
            let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
            println!("{}", hex.join(" "));
        }
    }

    if cli.shutdown_server {
        session.close_server()?;
    } else {
        session.close();
    }
    Ok(())
}
