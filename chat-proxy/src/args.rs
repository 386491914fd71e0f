use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments for the chat-proxy binary.
#[derive(Debug, Parser)]
#[command(name = "chat-proxy", version, about = "Dialect-normalizing proxy in front of a chat-completion gateway")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CHAT_PROXY_CONFIG", default_value = "chat-proxy.toml")]
    pub config: PathBuf,

    /// Log filter, e.g. "info" or "llm=debug,server=info".
    #[arg(long, env = "LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}
