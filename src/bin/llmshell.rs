#[tokio::main]
async fn main() -> anyhow::Result<()> {
    llmshell::shell::cli::run().await
}
