use anyhow::Result;

/// The daemon runs every poller, tick and write on one thread, mirroring an event loop.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
