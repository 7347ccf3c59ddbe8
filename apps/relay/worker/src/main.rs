//! Relay Worker Service - Entry Point
//!
//! Consumes configured queues and retries failed events through delay queues.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relay_worker::run().await
}
