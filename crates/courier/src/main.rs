//! Courier command line
//!
//! Sends commands through a configured transport, serves an echo handler,
//! and generates signing keys.

mod echo;

use courier_command::Commands;
use courier_config::RuntimeConfig;
use courier_crypto::CryptoRegistry;
use courier_error::CourierError;
use courier_transport::{Command, CommandOptions, create_transport, serve};
use courier_types::settings::TransportKind;
use echo::EchoHandler;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = courier_command::parse();

    if let Err(e) = handle_commands(args.command) {
        error!("Application error: {}", e);
        eprintln!("{e}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins over the configured level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &str) -> Result<RuntimeConfig, CourierError> {
    let config = RuntimeConfig::from_file(path)?;
    init_logging(&config.log_level);
    config.validate()?;
    info!("Loaded configuration from: {}", path);
    Ok(config)
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CourierError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CourierError::RuntimeError(format!("Failed to create Tokio runtime: {}", e)))
}

fn handle_commands(args: Commands) -> Result<(), CourierError> {
    let request = args
        .request()
        .map_err(|e| CourierError::ConfigError(e.to_string()))?;
    let timeout = args.timeout();

    match args {
        Commands::Send {
            config,
            name,
            no_reply,
            sign,
            ..
        } => {
            let config = load_config(&config)?;
            let options = CommandOptions {
                timeout,
                is_need_signature: sign,
                ..CommandOptions::default()
            };
            build_runtime()?.block_on(handle_send(config, name, request, options, no_reply))
        }
        Commands::Listen { config, name } => {
            let config = load_config(&config)?;
            build_runtime()?.block_on(handle_listen(config, name))
        }
        Commands::Keygen { algorithm } => {
            init_logging("warn");
            handle_keygen(&algorithm)
        }
    }
}

async fn handle_send(
    config: RuntimeConfig,
    name: String,
    request: serde_json::Value,
    options: CommandOptions,
    no_reply: bool,
) -> Result<(), CourierError> {
    let transport = create_transport(&config.transport).await?;

    // nothing else can answer on an in-process transport
    if config.transport.kind == TransportKind::Local {
        serve(transport.clone(), Arc::new(EchoHandler::new(name.clone()))).await?;
    }

    let command = Command::new(name, request)?;
    let result = if no_reply {
        transport.send(command, Some(options)).await.map(|_| None)
    } else {
        transport.send_listen(command, Some(options)).await.map(Some)
    };
    transport.close().await;

    if let Some(response) = result? {
        let output = serde_json::to_string_pretty(&response)
            .map_err(|e| CourierError::RuntimeError(e.to_string()))?;
        println!("{output}");
    }
    Ok(())
}

async fn handle_listen(config: RuntimeConfig, name: String) -> Result<(), CourierError> {
    let transport = create_transport(&config.transport).await?;
    let worker = serve(transport.clone(), Arc::new(EchoHandler::new(name.clone()))).await?;
    info!(command = %name, "echo handler ready, press ctrl-c to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        _ = worker => info!("Command stream closed"),
    }
    transport.close().await;
    Ok(())
}

fn handle_keygen(algorithm: &str) -> Result<(), CourierError> {
    let manager = CryptoRegistry::with_defaults()
        .manager(algorithm)
        .map_err(|e| CourierError::ConfigError(e.to_string()))?;
    let keys = manager
        .generate_key_pair()
        .map_err(|e| CourierError::RuntimeError(e.to_string()))?;

    println!("algorithm: {}", manager.algorithm());
    println!("public_key: |\n{}", indent(&keys.public_key));
    println!("private_key: |\n{}", indent(&keys.private_key));
    Ok(())
}

fn indent(value: &str) -> String {
    value
        .trim_end()
        .lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
