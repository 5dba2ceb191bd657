// A small command-line runner for the `cbir` library. Point it at a
// directory of corpus images (or precomputed feature tables) and a query
// identifier, and it prints the ranked corpus.

use anyhow::{Context, bail};
use cbir::{FeatureStore, Method, RetrievalService};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(image_dir), Some(query_id)) = (args.next(), args.next()) else {
        bail!("usage: cbir <image-dir> <query-id> [intensity|color-code|combined]");
    };
    let method = match args.next().as_deref() {
        None | Some("combined") => Method::Combined,
        Some("intensity") => Method::Intensity,
        Some("color-code") => Method::ColorCode,
        Some(other) => bail!("unknown method {other:?}"),
    };

    let mut store = FeatureStore::with_fallback(PathBuf::from(&image_dir));
    let registered = store
        .scan_fallback()
        .with_context(|| format!("scanning corpus directory {image_dir}"))?;
    if registered == 0 {
        bail!("no corpus images found in {image_dir}");
    }
    println!("corpus: {registered} images, method: {method}");

    let service = RetrievalService::new(store);
    let handle = service.submit_query(query_id, method, None);

    while handle.state() == cbir::SessionState::Scoring {
        let (fraction, status) = service.get_progress(&handle);
        println!("[{:>5.1}%] {status}", fraction * 100.0);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let results = service.wait_for_result(&handle).await?;
    for (rank, result) in results.iter().enumerate().take(20) {
        println!("{:>3}. image {} (distance {:.6})", rank + 1, result.id, result.distance);
    }
    Ok(())
}
