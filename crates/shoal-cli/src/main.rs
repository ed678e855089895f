// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use shoal_core::{
    EncryptionKey, FileServer, FileServerConfig, ServerConfig, TcpTransport, TcpTransportConfig,
    load_config,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Replicated content-addressed file store")]
struct Cli {
    /// JSON cluster config: an array of { "port", "peers", "key_path" }.
    #[arg(long, default_value = "servers.json")]
    config: String,
    /// Which spawned server the REPL drives (a "port" value from the
    /// config). Defaults to the first entry.
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let configs = load_config(&cli.config).context("load cluster config")?;
    if configs.is_empty() {
        anyhow::bail!("config lists no servers");
    }

    // Spin every server up, slightly staggered so early dials find their
    // bootstrap targets listening.
    let mut servers: HashMap<String, Arc<FileServer>> = HashMap::new();
    let mut launch_order = Vec::new();
    for entry in &configs {
        let server = make_server(entry).await.with_context(|| format!("start {}", entry.port))?;
        launch_order.push(entry.port.clone());
        servers.insert(entry.port.clone(), server);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let session = cli.session.unwrap_or_else(|| launch_order[0].clone());
    let server = servers
        .get(&session)
        .with_context(|| format!("no server listening on {session}"))?
        .clone();
    tracing::info!(
        servers = servers.len(),
        session = %session,
        "cluster online, REPL attached"
    );

    run_command_loop(server).await
}

async fn make_server(entry: &ServerConfig) -> anyhow::Result<Arc<FileServer>> {
    let enc_key = match &entry.key_path {
        Some(path) => EncryptionKey::load_or_generate(path)?,
        None => EncryptionKey::generate(),
    };
    let config = FileServerConfig::for_addr(entry.port.clone(), entry.peers.clone(), enc_key);
    let transport = TcpTransport::new(TcpTransportConfig::new(config.listen_addr.clone()));
    let server = FileServer::new(config, transport)?;
    server.start().await?;
    Ok(server)
}

fn help_text(command: &str) -> &'static str {
    match command {
        "store" => "store <file-path>\n Stores the file at the given path and replicates it to connected peers.",
        "get" => "get <filename>\n Fetches the file from local storage or from any peer that holds it.",
        "delete" => "delete <filename>\n Deletes the file locally and on every peer.",
        "deletelocal" => "deletelocal <filename>\n Deletes only this node's copy.",
        "deleteremote" => {
            "deleteremote <filename> <peers>\n Deletes the file on the listed peers (comma separated host:port)."
        }
        "quit" => "quit\n Exits the program.",
        _ => "No help for that command.",
    }
}

async fn run_command_loop(server: Arc<FileServer>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b">>> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }

        match args[0].to_lowercase().as_str() {
            "store" => {
                if args.len() != 2 {
                    println!("Usage: store <file-path>");
                    continue;
                }
                let mut file = match tokio::fs::File::open(args[1]).await {
                    Ok(file) => file,
                    Err(err) => {
                        println!("{err}");
                        continue;
                    }
                };
                let key = Path::new(args[1])
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| args[1].to_string());
                match server.store_file(&key, &mut file).await {
                    Ok(outcome) => println!(
                        "Stored {key}: {} bytes on disk, {} replica(s)",
                        outcome.size_on_disk, outcome.replicas
                    ),
                    Err(err) => println!("Error storing data: {err}"),
                }
            }
            "get" => {
                if args.len() != 2 {
                    println!("Usage: get <filename>");
                    continue;
                }
                let key = args[1];
                let mut contents = Vec::new();
                match server.get(key, &mut contents).await {
                    Ok(outcome) => {
                        println!("File stored at: {}", outcome.path.display());
                        if Path::new(key).extension().is_none() {
                            println!("{}", String::from_utf8_lossy(&contents));
                        }
                    }
                    Err(err) => println!("Error getting file: {err}"),
                }
            }
            "delete" => {
                if args.len() != 2 {
                    println!("Usage: delete <filename>");
                    continue;
                }
                match server.delete(args[1]).await {
                    Ok(outcome) => println!(
                        "Deleted {} (local: {}, remote acks: {})",
                        args[1], outcome.removed_local, outcome.remote_acks
                    ),
                    Err(err) => println!("Error deleting file: {err}"),
                }
            }
            "deletelocal" => {
                if args.len() != 2 {
                    println!("Usage: deletelocal <filename>");
                    continue;
                }
                match server.delete_local(args[1]).await {
                    Ok(true) => println!("Deleted local copy of {}", args[1]),
                    Ok(false) => println!("No local copy of {}", args[1]),
                    Err(err) => println!("Error deleting local file: {err}"),
                }
            }
            "deleteremote" => {
                if args.len() != 3 {
                    println!("Usage: deleteremote <filename> <peer list separated by comma (ip:port)>");
                    continue;
                }
                let targets: Vec<String> = args[2].split(',').map(str::to_string).collect();
                match server.delete_remote(args[1], &targets).await {
                    Ok(outcome) => {
                        println!("Deleted {} on {} peer(s)", args[1], outcome.remote_acks)
                    }
                    Err(err) => println!("Error deleting remote file: {err}"),
                }
            }
            "help" => {
                if args.len() != 2 {
                    println!("Usage: help <command>");
                    continue;
                }
                println!("{}", help_text(args[1]));
            }
            "quit" => {
                println!("Exiting...");
                return Ok(());
            }
            _ => {
                println!(
                    "Unknown command. Supported: store, get, delete, deletelocal, deleteremote, help, quit"
                );
            }
        }
    }
    Ok(())
}
