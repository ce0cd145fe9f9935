use agora_node::{cli::handle_command_line_args, config::NodeConfig, run_node};
use dotenvy::dotenv;
use log::info;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    if handle_command_line_args() {
        return;
    }
    let config = NodeConfig::from_env_or_default();

    info!("🚀️ Starting Agora node with store at {}", config.database_url);
    match run_node(config).await {
        Ok(_) => println!("Bye!"),
        Err(e) => eprintln!("{e}"),
    }
}
