//! Serves HTTP (or HTTPS with a config file) until Ctrl-C, then drains.
//!
//! ```text
//! RUST_LOG=graceful_web=debug cargo run --example graceful [config.json]
//! curl localhost:8080/
//! curl localhost:8080/slow   # registers 3s of background work
//! ```
//!
//! The process only exits after in-flight requests and `/slow` routines finish.

use std::time::Duration;

use graceful_web::{Request, Response, Server, StatusCode};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = match std::env::args().nth(1) {
        Some(path) => Server::from_config_file(path)?,
        None => Server::new(),
    };
    let routines = server.routines();

    let addr = server.listen("127.0.0.1:8080").await?;
    info!(%addr, "listening");

    let (tx, mut rx) = mpsc::channel(1);
    server
        .serve(
            move |req: Request| {
                let routines = routines.clone();
                async move {
                    match req.path() {
                        "/" => Response::new(StatusCode::Ok).body("Success"),
                        "/slow" => {
                            let guard = routines.guard();
                            tokio::spawn(async move {
                                tokio::time::sleep(Duration::from_secs(3)).await;
                                info!("background work done");
                                drop(guard);
                            });
                            Response::new(StatusCode::Accepted).body("Working on it")
                        }
                        _ => Response::new(StatusCode::NotFound).body("Not Found"),
                    }
                }
            },
            tx,
        )
        .await?;

    tokio::signal::ctrl_c().await?;
    info!(pending = server.pending_work(), "shutting down");
    server.shutdown();

    match rx.recv().await {
        Some(outcome) if outcome.is_graceful() => info!("{outcome}"),
        Some(outcome) => error!("{outcome}"),
        None => error!("server task ended without an outcome"),
    }
    Ok(())
}
