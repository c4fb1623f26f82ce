use anyhow::Result;

use blobd::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("blobd")?;
    blobd::server::run().await
}
