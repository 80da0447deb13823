pub mod agent;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;

use cli::Args;
use history::initialize_adapter;
use log::info;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Model: {}", args.gemini_model.as_deref().unwrap_or("adapter default"));
    info!("Persistence Type: {}", args.persistence_type);
    info!("Persistence URL: {}", if args.persistence_url.is_empty() {
        "(none)"
    } else {
        args.persistence_url.as_str()
    });
    info!("HTTP API Port: {:?}", args.http_port);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let adapter = initialize_adapter(&args)?;
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, adapter, args.server_api_key.clone(), args.clone());
    server.run().await?;

    Ok(())
}
