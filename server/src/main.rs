use clap::Parser;
use duel_server::liveness::spawn_liveness_monitor;
use duel_server::network::RelayServer;
use log::{error, info};

/// Main-method of the relay.
/// Parses command-line arguments, binds the listener, then runs the accept
/// loop next to the liveness monitor until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, env = "DUEL_PORT", default_value = "4000")]
        port: u16,
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    let server = RelayServer::bind(&address).await?;
    let monitor = spawn_liveness_monitor(server.registry());

    info!("Duel relay running on {}", address);

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    monitor.abort();
    Ok(())
}
