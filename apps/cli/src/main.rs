use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use openrtk_core::payload::FirmwareImage;
use openrtk_core::protocol::Framer;
use openrtk_core::provider::{
    CommandResponse, DeviceProfile, DeviceProperties, EthernetProfile, Provider, ProviderConfig, UartProfile,
};
use openrtk_core::transport::{DEFAULT_BAUD_RATE, SerialCommunicator, list_ports};
use openrtk_core::upgrade::Pipeline;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "OpenRTK / INS401 device tool", long_about = None)]
struct Args {
    /// Provider settings (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device configuration (JSON parameter table)
    #[arg(long, global = true)]
    properties: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct PortArgs {
    /// Serial port the device is attached to
    #[arg(short, long)]
    port: String,

    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,
    /// Show the segments of a combined image and the resulting upgrade steps
    Plan {
        firmware: PathBuf,

        /// Plan for the Ethernet (INS401) profile instead of serial
        #[arg(long)]
        ethernet: bool,
    },
    /// Upgrade the device from a combined image
    Upgrade {
        #[command(flatten)]
        port: PortArgs,

        firmware: PathBuf,
    },
    /// Read the whole parameter table
    GetParams {
        #[command(flatten)]
        port: PortArgs,
    },
    /// Read one parameter
    GetParam {
        #[command(flatten)]
        port: PortArgs,

        param_id: u32,
    },
    /// Write one parameter (value as JSON, e.g. 1.5 or "abc")
    SetParam {
        #[command(flatten)]
        port: PortArgs,

        param_id: u32,

        value: String,
    },
    /// Persist the current parameters on the device
    SaveConfig {
        #[command(flatten)]
        port: PortArgs,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => ProviderConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProviderConfig::default(),
    };
    let properties = match &args.properties {
        Some(path) => DeviceProperties::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeviceProperties::default(),
    };

    match args.command {
        Commands::Ports => {
            for port in list_ports() {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}  {:04x}:{:04x}  {}",
                        port.name,
                        vid,
                        pid,
                        port.product.unwrap_or_default()
                    ),
                    _ => println!("{}", port.name),
                }
            }
        }
        Commands::Plan { firmware, ethernet } => plan(&firmware, ethernet, config)?,
        Commands::Upgrade { port, firmware } => {
            let provider = connect(&port, config, properties)?;
            let data = std::fs::read(&firmware).with_context(|| format!("reading {}", firmware.display()))?;
            provider.start_upgrade(data)?;
            if let Some(result) = provider.wait_upgrade() {
                result?;
            }
            info!("Upgrade finished");
            provider.close();
        }
        Commands::GetParams { port } => {
            let provider = connect(&port, config, properties)?;
            print_response(&provider.get_params())?;
            provider.close();
        }
        Commands::GetParam { port, param_id } => {
            let provider = connect(&port, config, properties)?;
            print_response(&provider.get_param(param_id))?;
            provider.close();
        }
        Commands::SetParam {
            port,
            param_id,
            value,
        } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            let provider = connect(&port, config, properties)?;
            print_response(&provider.set_param(param_id, &value))?;
            provider.close();
        }
        Commands::SaveConfig { port } => {
            let provider = connect(&port, config, properties)?;
            print_response(&provider.save_config())?;
            provider.close();
        }
    }

    Ok(())
}

fn connect(
    port: &PortArgs,
    config: ProviderConfig,
    properties: DeviceProperties,
) -> Result<Provider<SerialCommunicator>> {
    let comm = Arc::new(SerialCommunicator::open(&port.port, port.baud)?);
    let provider = Provider::new(comm, config, properties);
    provider.start()?;
    info!(port = %port.port, baud = port.baud, "Connected");
    Ok(provider)
}

fn plan(firmware: &Path, ethernet: bool, config: ProviderConfig) -> Result<()> {
    let data = std::fs::read(firmware).with_context(|| format!("reading {}", firmware.display()))?;
    let image = FirmwareImage::parse(data, &config.split_rules);

    for segment in image.segments() {
        if segment.is_empty() {
            println!("{:<6} absent", segment.name);
        } else {
            println!(
                "{:<6} {:>8} bytes at {:#x}",
                segment.name,
                segment.size(),
                segment.range.start
            );
        }
    }

    // Link addresses only matter on the wire.
    let profile: Box<dyn DeviceProfile> = if ethernet {
        Box::new(EthernetProfile::new(Framer::ethernet(Default::default(), Default::default()), config))
    } else {
        Box::new(UartProfile::new(Framer::uart(), config))
    };
    let pipeline = Pipeline::assemble(&image, profile.as_ref());
    println!();
    println!("{} steps ({}):", pipeline.len(), profile.name());
    for (i, name) in pipeline.names().iter().enumerate() {
        println!("  {:>2}. {}", i + 1, name);
    }
    Ok(())
}

fn print_response(response: &CommandResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if !response.is_success() {
        anyhow::bail!("device command failed");
    }
    Ok(())
}
