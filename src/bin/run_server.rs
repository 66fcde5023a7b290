use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

use snapkv::config::Config;
use snapkv::{server, Error, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "snapkv-server")]
#[command(about = "In-memory key/value server with RDB-compatible snapshots")]
#[command(version)]
struct Args {
    /// TCP listen port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding the snapshot file
    #[arg(long, default_value = "databases")]
    dir: String,

    /// Snapshot file name
    #[arg(long, default_value = "save.rdb")]
    dbfilename: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = Config {
        port: args.port,
        dir: args.dir,
        dbfilename: args.dbfilename,
    };

    // a bind failure is fatal and exits nonzero
    let listener = TcpListener::bind(&format!("127.0.0.1:{}", config.port)).await?;
    tracing::info!(port = config.port, "listening");

    server::run(listener, config, signal::ctrl_c()).await;

    Ok(())
}
