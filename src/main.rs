use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    furrow_cli::run().await
}
