use clap::Parser;
use tracing::error;

use minnow::config::Config;
use minnow::logging::init_logging;
use minnow::server::Server;

/// Event-driven HTTP/1.1 static file server.
#[derive(Parser)]
#[command(name = "minnow", version)]
struct Cli {
    /// Address to bind, e.g. 0.0.0.0
    ip: String,

    /// TCP port to listen on
    port: u16,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    init_logging();

    let mut config = Config::from_env();
    config.host = cli.ip;
    config.port = cli.port;

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}
