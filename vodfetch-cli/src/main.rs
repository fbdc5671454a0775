mod error;
mod headers;
mod output;
mod playlist;
mod progress;

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use indicatif::HumanBytes;
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;
use vodfetch_engine::{DownloaderConfig, EngineConfig, VodDownloader};

use crate::error::{AppError, Result};
use crate::headers::parse_headers;
use crate::output::output_targets;
use crate::playlist::PlaylistResolver;
use crate::progress::DownloadProgress;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download HLS/VOD streams into a single file", long_about = None)]
struct Args {
    /// M3U8 playlist URL or local file path
    #[arg(short, long)]
    url: String,

    /// Base URL for resolving relative URIs in a local playlist
    #[arg(long)]
    base_url: Option<String>,

    /// Output file; `.ts` (or `.mp4` for fragmented streams) is appended when missing
    #[arg(short, long, default_value = "video.ts")]
    output: PathBuf,

    /// Maximum concurrent segment downloads
    #[arg(short, long, default_value_t = 10)]
    concurrent: usize,

    /// Maximum retries per segment
    #[arg(short, long, default_value_t = 3)]
    retries: u32,

    /// Timeout in seconds for each HTTP request
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// Custom 16-byte key file, overriding the playlist's key URI
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Extra HTTP header in `Key: Value` form (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Directory for temporary segment files
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Print the download summary as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Keep stderr to errors in JSON mode unless debug output was asked for.
    init_logging(args.verbose, args.quiet || (args.json && !args.verbose));
    let json = args.json;

    if let Err(e) = run(args).await {
        if json {
            let error_json = serde_json::json!({
                "status": "error",
                "message": e.to_string(),
            });
            println!("{error_json}");
        } else {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let headers = parse_headers(&args.headers)?;
    if !headers.is_empty() {
        info!("Custom headers set: {} header(s)", headers.len());
    }

    let downloader_config = DownloaderConfig::default()
        .with_headers(headers)
        .with_timeout(Duration::from_secs(args.timeout));

    let base_url = args.base_url.as_deref().map(Url::parse).transpose()?;
    let mut resolver = PlaylistResolver::new(&downloader_config, base_url)?;
    if let Some(path) = &args.key {
        resolver = resolver.with_custom_key(load_key_file(path).await?);
        info!("Custom encryption key loaded from {}", path.display());
    }

    info!("Parsing playlist {}", args.url);
    let request = resolver.resolve(&args.url).await?;
    let targets = output_targets(
        &args.output,
        request.format.fragmented,
        request.audio.is_some(),
    );

    let total = request.video.len() + request.audio.as_ref().map_or(0, Vec::len);
    info!(
        output = %targets.video.display(),
        concurrent = args.concurrent,
        retries = args.retries,
        timeout = args.timeout,
        "Found {total} segments to download"
    );
    if request.crypto.enabled {
        info!("Encrypted stream detected, segments will be decrypted");
    }

    let mut config = EngineConfig::default()
        .with_concurrency(args.concurrent)
        .with_max_retries(args.retries);
    if let Some(dir) = &args.temp_dir {
        config = config.with_temp_root(dir);
    }

    let progress = DownloadProgress::new(total, args.quiet || args.json);
    let downloader =
        VodDownloader::new(config, &downloader_config)?.with_progress(progress.callback());
    let result = downloader.download(&request, &targets).await;
    progress.finish(result.is_ok());
    let summary = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let path = std::fs::canonicalize(&summary.video.destination)
            .unwrap_or_else(|_| summary.video.destination.clone());
        info!(
            "Download complete ({}), file saved to {}",
            HumanBytes(summary.video.bytes_written),
            path.display()
        );
        if let Some(audio) = &summary.audio {
            info!("Audio track saved to {}", audio.destination.display());
        }
    }

    Ok(())
}

async fn load_key_file(path: &Path) -> Result<Bytes> {
    let key = tokio::fs::read(path)
        .await
        .map_err(|source| AppError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    if key.len() != 16 {
        return Err(AppError::InvalidKey(key.len()));
    }
    Ok(Bytes::from(key))
}

fn log_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    }
}

/// Logs go to stderr so stdout only ever carries the download summary.
fn init_logging(verbose: bool, quiet: bool) {
    tracing_subscriber::registry()
        .with(log_filter(verbose, quiet))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(verbose),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::try_parse_from(["vodfetch", "--url", "https://example.com/a.m3u8"]).unwrap();
        assert_eq!(args.output, PathBuf::from("video.ts"));
        assert_eq!(args.concurrent, 10);
        assert_eq!(args.retries, 3);
        assert_eq!(args.timeout, 30);
        assert!(args.headers.is_empty());
    }

    #[test]
    fn headers_are_repeatable() {
        let args = Args::try_parse_from([
            "vodfetch",
            "-u",
            "list.m3u8",
            "-H",
            "Referer: https://example.com",
            "--header",
            "Cookie: a=1",
        ])
        .unwrap();
        assert_eq!(args.headers.len(), 2);
    }

    #[test]
    fn log_filter_levels() {
        use tracing_subscriber::filter::LevelFilter;

        assert_eq!(log_filter(false, true).max_level_hint(), Some(LevelFilter::ERROR));
        assert_eq!(log_filter(true, false).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[tokio::test]
    async fn downloads_playlist_into_named_output() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
            #EXTINF:4.0,\ns0.ts\n#EXTINF:4.0,\ns1.ts\n#EXTINF:4.0,\ns2.ts\n#EXT-X-ENDLIST\n";
        Mock::given(method("GET"))
            .and(path("/vod/index.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
            .mount(&server)
            .await;
        for name in ["s0", "s1", "s2"] {
            Mock::given(method("GET"))
                .and(path(format!("/vod/{name}.ts")))
                .respond_with(ResponseTemplate::new(200).set_body_string(name))
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/vod/index.m3u8", server.uri());
        let output = dir.path().join("movie");
        let args = Args::try_parse_from([
            "vodfetch",
            "--url",
            url.as_str(),
            "--output",
            output.to_str().unwrap(),
            "--concurrent",
            "2",
            "--json",
        ])
        .unwrap();

        run(args).await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("movie.ts")).unwrap(),
            b"s0s1s2"
        );
    }

    #[tokio::test]
    async fn key_file_must_be_sixteen_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.key");
        let bad = dir.path().join("bad.key");
        std::fs::write(&good, [7u8; 16]).unwrap();
        std::fs::write(&bad, [7u8; 15]).unwrap();

        assert_eq!(load_key_file(&good).await.unwrap().len(), 16);
        assert!(matches!(
            load_key_file(&bad).await,
            Err(AppError::InvalidKey(15))
        ));
    }
}
