// Binary entry point for xcbridge
// This is a thin wrapper that delegates to the library implementation

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    xcbridge::shell::run().await
}
