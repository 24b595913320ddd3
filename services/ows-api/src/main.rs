//! OGC WMS/WCS/WPS frontend server.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ows_api::state::{spawn_config_watcher, AppState};
use ows_common::config::{dump_config_map, load_config_map};

#[derive(Parser, Debug)]
#[command(name = "ows-api")]
#[command(about = "OGC WMS/WCS/WPS frontend server")]
struct Args {
    /// Server listening port
    #[arg(short = 'p', long = "port", default_value_t = 8080)]
    port: u16,

    /// Server data directory (static assets, placeholder images)
    #[arg(long = "data_dir", default_value = "/usr/share/ows")]
    data_dir: PathBuf,

    /// Server config directory
    #[arg(long = "conf_dir", default_value = "/etc/ows")]
    conf_dir: PathBuf,

    /// Validate server config files and exit
    #[arg(long = "check_conf", default_value_t = false)]
    check_conf: bool,

    /// Dump canonicalized server config and exit
    #[arg(long = "dump_conf", default_value_t = false)]
    dump_conf: bool,

    /// Verbose mode for more server output
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Terminal config modes: neither starts the server.
    if args.check_conf || args.dump_conf {
        let map = match load_config_map(&args.conf_dir) {
            Ok(map) => map,
            Err(e) => {
                eprintln!("Error in loading config files: {}", e);
                exit(1);
            }
        };
        if args.dump_conf {
            match dump_config_map(&map) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error in dumping configs: {}", e);
                    exit(1);
                }
            }
        }
        exit(0);
    }

    let state = Arc::new(AppState::new(
        args.data_dir.clone(),
        args.conf_dir.clone(),
        args.verbose,
    )?);
    spawn_config_watcher(state.clone(), Duration::from_secs(10));

    let app = ows_api::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "OWS server is ready");
    axum::serve(listener, app).await?;

    Ok(())
}
