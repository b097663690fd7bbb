use anyhow::Result;
use clap::Parser;

use biribit_server::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "biribit-server")]
#[command(about = "Biribit room server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = biribit::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value = "Biribit Server")]
    name: String,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, help = "Require this password to connect")]
    password: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = ServerConfig {
        name: args.name,
        max_clients: args.max_clients,
        password: args.password,
        ..Default::default()
    };

    let mut server = Server::new(&bind_addr, config)?;
    log::info!("server listening on {}", server.local_addr());
    server.run();
    log::info!("server shutting down");

    Ok(())
}
