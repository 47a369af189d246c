//! `nativeapi`: serves the demo device over the native API.

use clap::Parser;
use nativeapi_config::CliArgs;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = nativeapi_app::run(args).await {
        eprintln!("nativeapi: {e}");
        std::process::exit(1);
    }
}
