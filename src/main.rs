#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aiavatar_lib::run().await
}
