#![warn(rust_2018_idioms)]

use anyhow::{Context, Result};
use structopt::{
    clap::AppSettings::{ColoredHelp, DeriveDisplayOrder},
    StructOpt,
};
use tokio::net::TcpListener;
use tracing::info;

use std::env;

const DEFAULT_ADDR: &str = ":4000";

#[derive(StructOpt, Debug)]
#[structopt(name = "mirage-api", about = "json request service over the fingerprint dialer", global_settings(&[ColoredHelp, DeriveDisplayOrder]))]
struct Opt {
    /// HOST:PORT address to listen on
    #[structopt(long = "addr", name = "ADDR")]
    addr: Option<String>,
}

impl Opt {
    fn listen_addr(&self) -> String {
        let addr = match &self.addr {
            Some(addr) => addr.clone(),
            None => match env::var("PORT") {
                Ok(port) if !port.is_empty() => format!(":{}", port),
                _ => DEFAULT_ADDR.to_string(),
            },
        };
        if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    let addr = opt.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind on {}", addr))?;
    info!("api service is up on {}", addr);

    veil::api::serve(listener).await?;
    Ok(())
}
