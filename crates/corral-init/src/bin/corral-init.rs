//! Init supervisor binary, copied into every container as `/.corral/init`.

use std::process::ExitCode;

use corral_common::constants::INIT_SOCKET_ENV;
use corral_init::server::{Server, ServerOptions, install_panic_hook};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_target(false)
        .init();
    install_panic_hook();

    let Some(socket) = std::env::var_os(INIT_SOCKET_ENV) else {
        tracing::error!(variable = INIT_SOCKET_ENV, "socket path not set");
        return ExitCode::FAILURE;
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let server = Server::bind(socket, ServerOptions::default())?;
        server.run().await
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "init supervisor failed");
            ExitCode::FAILURE
        }
    }
}
