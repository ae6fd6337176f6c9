use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use browsermcp_server::server::contract;
use browsermcp_server::AppContext;

#[derive(Parser)]
#[command(name = "browsermcp", version, about = "Browser automation server for AI agents (JSON-RPC over stdio)")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the stdio JSON-RPC server (default).
    Serve,
    /// Emit the tool catalog (JSON) and its markdown rendering.
    Contract {
        /// Print only the markdown rendering.
        #[arg(long)]
        markdown: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout belongs to the JSON-RPC stream.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let app = AppContext::init();
            let result = browsermcp_server::server::rpc::serve(&app).await;
            app.shutdown().await;
            result
        }
        Command::Contract { markdown } => {
            if markdown {
                println!("{}", contract::contract_markdown());
            } else {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&contract::tools_list())?
                );
                println!("{}", contract::contract_markdown());
            }
            Ok(())
        }
    }
}
