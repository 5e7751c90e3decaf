use std::path::Path;
use std::time::Duration;

use segdl_core::{
    format_duration, format_size, format_speed, DmResult, DownloadConfig, DownloadEvent,
    DownloadRequest, DownloadStatus, Downloader,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> DmResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Segdl Core - Segmented File Downloader Example");

    // A test download file
    let url = "http://localhost:8080/1.mp4";
    let destination = Path::new("../downloads/1.mp4");

    let config = DownloadConfig::new()
        .with_threads(8)
        .with_max_cache_size(1024 * 1024); // 1MB cache per segment

    let downloader = Downloader::new(DownloadRequest::new(url, destination), config)?;
    let mut events = downloader.subscribe();

    let info = downloader.check().await?;
    println!(
        "Start downloading: {} ({}, suggested name {:?})",
        url,
        format_size(info.total_size),
        info.filename
    );
    println!("Save to: {}", destination.display());

    downloader.download().await?;
    println!("Segments: {}", downloader.segment_count());

    // Show off pause and resume once the transfer is underway
    let handle = downloader.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        if handle.pause().is_ok() {
            println!("Paused");
            tokio::time::sleep(Duration::from_secs(2)).await;
            while handle.status() == DownloadStatus::Pausing {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if handle.resume().is_ok() {
                println!("Resumed");
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            DownloadEvent::Progress(progress) => println!(
                "Downloaded: {:.2}% ({}/{}), Speed: {}, Time remaining: {}",
                progress.percentage(),
                format_size(progress.received()),
                format_size(progress.total()),
                format_speed(progress.speed()),
                format_duration(Duration::from_secs(progress.eta().unwrap_or(0)))
            ),
            DownloadEvent::StatusChanged(status) => println!("Status: {}", status),
            DownloadEvent::Completed(completion) => {
                match completion.error {
                    Some(error) => println!("Failed: {}", error),
                    None => println!(
                        "Completed! {} in {}",
                        format_size(completion.downloaded),
                        format_duration(completion.elapsed)
                    ),
                }
                break;
            }
        }
    }

    Ok(())
}
