use std::sync::Arc;

use anyhow::Context;
use clap::{App, Arg};
use slog::Drain;

use piece_socks::{AllowAll, Config, DirectConnector, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = App::new("piece-socks")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SOCKS5 relay built from composable pieces")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("CONFIG")
                .help("Specify the config file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDR")
                .help("Address to listen on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-level")
                .short("v")
                .long("log-level")
                .value_name("LEVEL")
                .help("One of critical, error, warn, info, debug, trace")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(addr) = matches.value_of("listen") {
        config.listen_addr = addr.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.listen_port = port
            .parse()
            .with_context(|| format!("invalid port: {}", port))?;
    }
    if let Some(level) = matches.value_of("log-level") {
        config.log_level = level.to_string();
    }
    config.validate()?;

    let logger = setup_logger(config.log_level()?);
    let server = Server::bind(
        config,
        Arc::new(AllowAll),
        Arc::new(DirectConnector),
        logger.clone(),
    )
    .await?;
    server.serve().await
}

fn setup_logger(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(level)
        .fuse();
    slog::Logger::root(drain, slog::o!())
}
