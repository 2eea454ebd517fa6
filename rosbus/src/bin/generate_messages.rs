//! `generate-messages [package]` - run the message generator over one named
//! package, or over every package found on the search path.

use anyhow::anyhow;
use clap::Parser;
use tracing::{error, info, Level};

use rosbus::msggen;

#[derive(Parser)]
#[command(name = "generate-messages")]
struct Args {
    /// package to generate for; all discovered packages when omitted
    package: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut packages = msggen::discover_packages()?;
    if let Some(name) = &args.package {
        packages.retain(|p| p.file_name().map(|f| f.to_string_lossy() == *name).unwrap_or(false));
        if packages.is_empty() {
            return Err(anyhow!("no package named {:?} on the search path", name));
        }
    }
    if packages.is_empty() {
        info!("no message packages found");
        return Ok(());
    }

    let mut failed = false;
    for package in &packages {
        if let Err(e) = msggen::generate_package(package).await {
            error!("{}", e);
            failed = true;
        }
    }

    if failed {
        // the per-package errors are already logged
        std::process::exit(1);
    }
    info!("generated messages for {} package(s)", packages.len());
    Ok(())
}
