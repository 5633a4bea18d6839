use clap::Parser;

use crate::shell::{config, server};

#[derive(Debug, Parser)]
#[command(name = "llmshell", version, about = "single-session process supervisor over local HTTP")]
pub struct Args {
    /// Host to bind (overrides LLM_SHELL_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind (overrides LLM_SHELL_PORT)
    #[arg(long)]
    pub port: Option<u16>,
}

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = config::Settings::from_env()?;
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    server::run(settings).await
}
