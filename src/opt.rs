use structopt::{
    clap::AppSettings::{ColoredHelp, DeriveDisplayOrder},
    StructOpt,
};

use std::env;

#[derive(StructOpt, Debug)]
#[structopt(name = "mirage", about = "http tls proxy service", global_settings(&[ColoredHelp, DeriveDisplayOrder]))]
pub struct Opt {
    /// HOST:PORT address to listen on
    #[structopt(long = "addr", name = "ADDR")]
    pub addr: Option<String>,
}

impl Opt {
    /// Listen address: an explicit `--addr` wins; otherwise the `PORT`
    /// environment variable overrides the given default port.
    pub fn listen_addr(&self, default: &str) -> String {
        let addr = match &self.addr {
            Some(addr) => addr.clone(),
            None => match env::var("PORT") {
                Ok(port) if !port.is_empty() => format!(":{}", port),
                _ => default.to_string(),
            },
        };
        normalize(&addr)
    }
}

// a bare ":port" means every interface
fn normalize(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}
