use std::error::Error;

use clap::Parser;
use log::{error, info};
use portico::{
    config::ServerSettings,
    server::virtual_host::handler_fn,
    Portico, Response,
};

#[derive(Parser)]
#[command(
    name = "portico",
    about = "portico - multi-protocol server bootstrap",
    long_about = r#"
portico - multi-protocol server bootstrap

Usage:
    portico [OPTIONS]

Options:
    -h, --help       Print help information
    -V, --version    Print version information
    -c, --config     <CONFIG>
                     YAML settings file to use
    -p, --port       <PORT>
                     Port of the HTTP listener used without a config file
        --host       <HOST>
                     Host of the HTTP listener used without a config file
"#
)]
struct Args {
    #[arg(short, long, required = false, help = "YAML settings file to use.")]
    config: Option<String>,
    #[arg(short, long, default_value_t = 8080, help = "Port of the default HTTP listener.")]
    port: u16,
    #[arg(long, default_value = "0.0.0.0", help = "Host of the default HTTP listener.")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let args = Args::parse();

    let mut builder = Portico::builder();
    match &args.config {
        Some(path) => {
            info!("Loading settings from {}", path);
            ServerSettings::from_file(path)?.apply(&mut builder)?;
        }
        None => {
            builder.add_listener(args.port, args.host.as_str());
        }
    }

    builder.set_default_handler(handler_fn(|request| async move {
        let host = request
            .host()
            .unwrap_or_else(|| "unknown host".to_string());
        Ok(Response::builder().text(&format!("Hello from portico ({})", host)))
    }));

    let server = match builder.build() {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    server
        .run()
        .await?;

    Ok(())
}
