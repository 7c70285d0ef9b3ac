//! Host binary entry point.
//!
//! Runs the listener with the built-in scripted engine; real engines link
//! the library and call [`mlx_host::serve`] with their own [`Engine`]
//! implementation from their own binary.
//!
//! Exit codes: 0 clean shutdown, 1 bind/listen failure, 2 argument error.

use std::sync::Arc;

use mlx_host::config::HostConfig;
use mlx_host::engine::MockEngine;
use mlx_host::log_error;

fn usage() {
    eprintln!("Usage: mlx-host [--socket <path>]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  SOCKET_PATH  endpoint path, used when --socket is absent");
    eprintln!("  AUTH_TOKEN   shared secret required from clients");
    eprintln!("  DEVICE       engine device preference (cpu | gpu)");
}

#[tokio::main]
async fn main() {
    let config = match HostConfig::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mlx-host: {e}");
            usage();
            std::process::exit(2);
        }
    };

    let engine = Arc::new(MockEngine::new());
    if let Err(e) = mlx_host::serve(config, engine).await {
        log_error!("HOST", "{e:#}");
        std::process::exit(1);
    }
}
