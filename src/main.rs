#[tokio::main]
async fn main() -> anyhow::Result<()> {
    health_gateway_lib::run().await
}
