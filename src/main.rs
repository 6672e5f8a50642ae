#![warn(rust_2018_idioms)]

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio::net::TcpListener;
use tracing::info;

use std::sync::Arc;

use veil::proxy::{ProxyConfig, ProxyHandler};

mod opt;

use crate::opt::Opt;

const DEFAULT_ADDR: &str = ":3128";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    let addr = opt.listen_addr(DEFAULT_ADDR);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind on {}", addr))?;
    info!("proxy is up on {}", addr);

    let handler = Arc::new(ProxyHandler::new(ProxyConfig::default()));
    handler.serve(listener).await?;
    Ok(())
}
