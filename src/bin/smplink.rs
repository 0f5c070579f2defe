//! smplink - SMP device management from the command line.
//!
//! Talks to an SMP (mcumgr) server over a serial console or UDP and
//! exposes the common management operations: echo, image management,
//! firmware upload and reset.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use smplink::groups::img::{ActivateOutcome, ImgGroup, UploadProgress, UploadRequest};
use smplink::groups::os::OsGroup;
use smplink::transport::serial::{available_ports, SerialConfig, SerialTransport};
use smplink::transport::udp::{UdpConfig, UdpTransport};
use smplink::transport::SmpTransport;
use smplink::{Error, Result, SmpProcessor};

#[derive(Parser)]
#[command(name = "smplink", version, about = "SMP (mcumgr) device management client")]
struct Cli {
    /// Serial port to use, e.g. /dev/ttyACM0.
    #[arg(long, global = true, conflicts_with = "udp")]
    serial: Option<String>,

    /// Baud rate for the serial port.
    #[arg(long, global = true, default_value_t = 115_200)]
    baud: u32,

    /// UDP target as host:port.
    #[arg(long, global = true)]
    udp: Option<String>,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports present on this system.
    Ports,
    /// Round-trip a string through the device.
    Echo { text: String },
    /// Reboot the device.
    Reset {
        /// Reset even if the device would rather not.
        #[arg(long)]
        force: bool,
    },
    /// Image management.
    #[command(subcommand)]
    Image(ImageCommand),
}

#[derive(Subcommand)]
enum ImageCommand {
    /// Show the device image state.
    List,
    /// Upload a firmware file.
    Upload {
        file: PathBuf,
        /// Destination image number.
        #[arg(long, default_value_t = 0)]
        image: u32,
        /// Ask the device to reject downgrades.
        #[arg(long)]
        upgrade: bool,
        /// Mark the uploaded image for test on the next boot.
        #[arg(long, conflicts_with = "confirm")]
        test: bool,
        /// Confirm the uploaded image permanently.
        #[arg(long)]
        confirm: bool,
        /// Reboot the device once the upload completes.
        #[arg(long)]
        reset: bool,
    },
    /// Mark an image for test on the next boot by hash.
    Test { hash: String },
    /// Confirm an image permanently, the running one when no hash given.
    Confirm { hash: Option<String> },
    /// Erase an image slot.
    Erase {
        #[arg(long, default_value_t = 1)]
        slot: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    if let Command::Ports = cli.command {
        for port in available_ports()? {
            println!("{port}");
        }
        return Ok(());
    }

    let transport = connect(&cli).await?;
    let mut processor = SmpProcessor::new(transport);

    let result = run(&cli.command, &mut processor).await;
    processor.disconnect().await?;
    result
}

async fn connect(cli: &Cli) -> Result<Box<dyn SmpTransport>> {
    if let Some(port) = &cli.serial {
        let transport = SerialTransport::connect(SerialConfig::new(port, cli.baud)).await?;
        Ok(Box::new(transport))
    } else if let Some(address) = &cli.udp {
        let transport = UdpTransport::connect(UdpConfig::new(address)).await?;
        Ok(Box::new(transport))
    } else {
        Err(Error::InvalidConfiguration(
            "select a transport with --serial or --udp".into(),
        ))
    }
}

async fn run(command: &Command, processor: &mut SmpProcessor<Box<dyn SmpTransport>>) -> Result<()> {
    match command {
        Command::Ports => Ok(()),
        Command::Echo { text } => {
            let mut os = OsGroup::new();
            println!("{}", os.echo(processor, text).await?);
            Ok(())
        }
        Command::Reset { force } => {
            let mut os = OsGroup::new();
            os.reset(processor, *force).await?;
            println!("device reset");
            Ok(())
        }
        Command::Image(image) => run_image(image, processor).await,
    }
}

async fn run_image(
    command: &ImageCommand,
    processor: &mut SmpProcessor<Box<dyn SmpTransport>>,
) -> Result<()> {
    let mut img = ImgGroup::new();
    match command {
        ImageCommand::List => {
            let state = img.list_images(processor).await?;
            for slot in &state.images {
                println!(
                    "image {} slot {}: version {} hash {}{}{}{}{}",
                    slot.image,
                    slot.slot,
                    slot.version,
                    hex::encode(&slot.hash),
                    flag(slot.active, " active"),
                    flag(slot.confirmed, " confirmed"),
                    flag(slot.pending, " pending"),
                    flag(slot.permanent, " permanent"),
                );
            }
            Ok(())
        }
        ImageCommand::Upload {
            file,
            image,
            upgrade,
            test,
            confirm,
            reset,
        } => {
            let data = std::fs::read(file)?;
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<UploadProgress>();
            let reporter = tokio::spawn(async move {
                let mut last = 0;
                while let Some(progress) = progress_rx.recv().await {
                    if progress.percent != last {
                        last = progress.percent;
                        println!("{:3}% ({}/{} bytes)", progress.percent, progress.offset, progress.total);
                    }
                }
            });

            let request = UploadRequest {
                data: &data,
                image: *image,
                upgrade: *upgrade,
                progress: Some(progress_tx),
            };
            if *test || *confirm {
                match img.upload_and_activate(processor, request, *confirm).await? {
                    ActivateOutcome::Activated => println!("upload complete, image marked"),
                    ActivateOutcome::StateUnsupported => {
                        println!("upload complete, device does not support image state")
                    }
                }
            } else {
                let stats = img.upload(processor, request).await?;
                println!(
                    "upload complete: {} bytes in {:.1}s ({:.0} B/s)",
                    stats.bytes,
                    stats.elapsed.as_secs_f64(),
                    stats.bytes_per_second(),
                );
            }
            let _ = reporter.await;

            if *reset {
                let mut os = OsGroup::new();
                os.reset(processor, false).await?;
                println!("device reset");
            }
            Ok(())
        }
        ImageCommand::Test { hash } => {
            let hash = parse_hash(hash)?;
            img.set_state(processor, Some(&hash), false).await?;
            println!("image marked for test");
            Ok(())
        }
        ImageCommand::Confirm { hash } => {
            let hash = hash.as_deref().map(parse_hash).transpose()?;
            img.set_state(processor, hash.as_deref(), true).await?;
            println!("image confirmed");
            Ok(())
        }
        ImageCommand::Erase { slot } => {
            img.erase(processor, *slot).await?;
            println!("slot {slot} erased");
            Ok(())
        }
    }
}

fn parse_hash(hash: &str) -> Result<Vec<u8>> {
    hex::decode(hash).map_err(|e| Error::InvalidConfiguration(format!("bad hash: {e}")))
}

fn flag(set: bool, label: &str) -> &str {
    if set {
        label
    } else {
        ""
    }
}
