// Shrine node: listen, dial bootstrap peers, serve replicas until shut down.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use shrine_core::FileServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `--put` waits for bootstrap peers before replicating.
const PUT_PEER_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Default, PartialEq)]
struct Args {
    version: bool,
    config: Option<PathBuf>,
    put: Option<(String, PathBuf)>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                out.config = Some(PathBuf::from(path));
            }
            "--put" => {
                let key = args.next().context("--put needs a key and a path")?;
                let path = args.next().context("--put needs a key and a path")?;
                out.put = Some((key, PathBuf::from(path)));
            }
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("shrine {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = config::load(args.config.as_deref())?;
    tracing::info!(
        listen = %cfg.listen_addr,
        bootstrap = ?cfg.bootstrap,
        root = %cfg.storage_root.display(),
        "config loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = FileServer::new(cfg.into_server_config());
        server.start().await.context("starting file server")?;

        if let Some((key, path)) = args.put {
            put(&server, &key, &path).await;
        }

        shutdown_signal().await?;
        server.stop().await;
        Ok::<_, anyhow::Error>(())
    })
}

/// Replicate one file once peers show up. Failures are logged; the node keeps serving.
async fn put(server: &FileServer, key: &str, path: &std::path::Path) {
    let deadline = tokio::time::Instant::now() + PUT_PEER_WAIT;
    while server.peer_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot open file to put");
            return;
        }
    };
    match server.store(key, file).await {
        Ok(size) => tracing::info!(key, size, peers = server.peer_count(), "put complete"),
        Err(e) => tracing::error!(key, error = %e, "put failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown signal received");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Args> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn flags() {
        assert_eq!(parse(&[]).unwrap(), Args::default());
        assert!(parse(&["-V"]).unwrap().version);
        let args = parse(&["--config", "/etc/x.toml", "--put", "hello", "./a.txt"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/x.toml")));
        assert_eq!(
            args.put,
            Some(("hello".to_string(), PathBuf::from("./a.txt")))
        );
    }

    #[test]
    fn bad_flags() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--put", "only-key"]).is_err());
        assert!(parse(&["--proxy"]).is_err());
    }
}
