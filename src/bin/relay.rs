//! Relay binary: listens on `PORT` (default 3001) and fans out operations
//! between participants until SIGINT/SIGTERM.

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use cowrite::RelayServer;
use cowrite::config::relay_port;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = relay_port();
    let server = match RelayServer::bind(&format!("0.0.0.0:{port}")) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_flag();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown);

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("relay failed: {err}");
            ExitCode::FAILURE
        }
    }
}
