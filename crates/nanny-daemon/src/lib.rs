//! Nanny daemon: command line, configuration, metrics endpoint and the
//! wiring of one nanny against its upstreams.

pub mod app;
pub mod cli;
pub mod config;
pub mod server;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` wins over the default `info` directive.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(layer).with(filter).init();
}
