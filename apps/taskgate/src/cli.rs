use std::path::PathBuf;

use clap::Parser;

pub const MEMORY_DSN: &str = "memory";

#[derive(Debug, Clone, Parser)]
#[command(name = "taskgate", version, about = "Async video task relay with quota accounting")]
pub struct Cli {
    #[arg(long, env = "TASKGATE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "TASKGATE_PORT", default_value_t = 8787)]
    pub port: u16,

    /// Database url. Empty means `taskgate.db` next to the executable, `memory` keeps
    /// everything in process.
    #[arg(long, env = "TASKGATE_DSN", default_value = "")]
    pub dsn: String,

    /// TOML file with `[quota]` and `[[channels]]`.
    #[arg(long, env = "TASKGATE_CONFIG", default_value = "taskgate.toml")]
    pub config: PathBuf,

    #[arg(long, env = "TASKGATE_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.dsn.trim().eq_ignore_ascii_case(MEMORY_DSN)
    }
}
