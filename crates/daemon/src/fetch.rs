//! Source download into job scratch space.

use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Error type for source fetches
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request failed, timed out, or returned an error status
    #[error("Failed to fetch source: {0}")]
    Http(#[from] reqwest::Error),

    /// Writing the downloaded bytes failed
    #[error("Failed to store source: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the HTTP client used for source fetches.
///
/// `timeout` bounds connecting and each read; a stalled transfer fails
/// instead of hanging the job.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()?;
    Ok(client)
}

/// Stream `url` into `dest`, returning the number of bytes written.
pub async fn download_source(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<u64, FetchError> {
    let response = client.get(url).send().await?.error_for_status()?;

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}
