use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Model Backend Args ---
    /// API key for the generative language backend.
    #[arg(long, env = "GEMINI_API_KEY", default_value = "")]
    pub gemini_api_key: String,

    /// Model name for travel-planning chat completion.
    #[arg(long, env = "GEMINI_MODEL")] // No default, adapter picks its own
    pub gemini_model: Option<String>,

    /// Base URL for the generative language API.
    #[arg(long, env = "GEMINI_BASE_URL")]
    pub gemini_base_url: Option<String>,

    // --- Persistence Args ---
    /// Persistence adapter type (rest, memory)
    #[arg(long, env = "PERSISTENCE_TYPE", default_value = "memory")]
    pub persistence_type: String,

    /// Base URL of the backend-as-a-service project (required for rest).
    #[arg(long, env = "PERSISTENCE_URL", default_value = "")]
    pub persistence_url: String,

    /// Anonymous/publishable API key for the persistence service.
    #[arg(long, env = "PERSISTENCE_ANON_KEY", default_value = "")]
    pub persistence_anon_key: String,

    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional API Key required for clients to connect to the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Optional port for the HTTP API (health + admin reporting). Disabled when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}
