mod app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::runtime::run().await
}
