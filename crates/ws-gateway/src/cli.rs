use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ws-gateway", version, about = "WebSocket-to-TCP gateway for peer nodes")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Tor SOCKS5 proxy host (overrides config file setting)
    #[arg(long, env = "TOR_PROXY_HOST")]
    pub tor_proxy_host: Option<String>,

    /// Tor SOCKS5 proxy port (overrides config file setting)
    #[arg(long, env = "TOR_PROXY_PORT")]
    pub tor_proxy_port: Option<u16>,

    /// Comma-separated origins allowed to connect (overrides config file setting)
    #[arg(long, env = "RESTRICT_ORIGINS", value_delimiter = ',')]
    pub restrict_origins: Option<Vec<String>>,
}
