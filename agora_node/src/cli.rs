use std::{env, env::VarError};

/// The node has no real CLI. Any argument prints the help text and the current configuration.
pub fn handle_command_line_args() -> bool {
    let has_cli_args = env::args().count() > 1;
    if has_cli_args {
        display_readme();
        display_envs();
    }
    has_cli_args
}

fn display_readme() {
    const README: &str = include_str!("./cli-help.txt");
    println!("\n{README}\n");
}

fn display_envs() {
    // Keys and the wallet password are deliberately absent
    const DISPLAY_ENVS: [&str; 13] = [
        "RUST_LOG",
        "AGORA_DATABASE_URL",
        "AGORA_PUBLIC_DATA_DIR",
        "AGORA_WALLET_COINS",
        "AGORA_WALLET_BIRTHDAY",
        "AGORA_EXCHANGE_RATE_SOURCES",
        "AGORA_EXCHANGE_RATE_TTL",
        "AGORA_MESSENGER_RETRY_BASE",
        "AGORA_MESSENGER_RETRY_CAP",
        "AGORA_DIRECT_CONNECT_TIMEOUT",
        "AGORA_PUBLISH_INTERVAL",
        "AGORA_PRICE_TOLERANCE",
        "AGORA_SKIP_MIGRATIONS",
    ];

    println!("Current environment values (EXCLUDING variables that contain secrets):");
    DISPLAY_ENVS.iter().for_each(|&name| {
        let val = match env::var(name) {
            Ok(s) => s,
            Err(VarError::NotPresent) => "Not set".into(),
            Err(VarError::NotUnicode(s)) => format!("Invalid value: {}", s.to_string_lossy()),
        };
        println!("  {name:<35} {val:<15}");
    })
}
