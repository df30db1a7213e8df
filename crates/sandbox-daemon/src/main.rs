use anyhow::Result;

use sandbox_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("sandbox-daemon")?;
    sandbox_daemon::server::run().await
}
