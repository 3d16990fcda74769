//! Relay binary entrypoint: parse CLI args, load configuration, install
//! the tracing subscriber, and hand off to [`nostr_relay_core::server`].
use clap::Parser;
use nostr_relay_core::config::{Args, Settings};
use nostr_relay_core::server;
use tracing_subscriber::EnvFilter;

#[cfg(all(not(target_env = "msvc"), not(target_os = "openbsd")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match Settings::load(&args.config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to load configuration from {}: {e}", args.config);
            std::process::exit(1);
        }
    };

    if let Err(e) = server::start_server(settings) {
        tracing::error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
