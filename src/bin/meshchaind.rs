use std::io::Write;
use std::sync::Arc;

use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};

use meshchain::net::Peer;

fn banner() {
    println!("{}", " __  __ ___ ____  _  _  ___ _  _   _   ___ _  _ ".bright_cyan());
    println!("{}", "|  \\/  | __/ ___|| || |/ __| || | /_\\ |_ _| \\| |".bright_cyan().bold());
    println!("{}", "| |\\/| | _|\\___ \\| __ | (__| __ |/ _ \\ | || .` |".bright_cyan().bold());
    println!("{}", "|_|  |_|___|____/|_||_|\\___|_||_/_/ \\_\\___|_|\\_|".blue());
    println!();
    println!(
        "{}",
        "            a small gossiping proof-of-work chain            "
            .bright_green()
            .bold()
    );
    println!();
}

fn print_help() {
    println!("{}", "commands:".bright_yellow().bold());
    println!("  {} <port>        start listening and mining on <port>", "init".bright_black());
    println!("  {} <host:port>    hand-shake with a neighbour", "add".bright_black());
    println!("  {} <data>      mine a block carrying <data>", "insert".bright_black());
    println!("  {}                 print the local chain", "print".bright_black());
    println!("  {}                  quit", "exit".bright_black());
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    banner();
    print_help();

    let mut peer: Option<Arc<Peer>> = None;
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    print!("{} ", ">".bright_black());
    std::io::stdout().flush().ok();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.trim().splitn(2, ' ');
        let command = parts.next().unwrap_or("").trim();
        let rest = parts.next().unwrap_or("").trim();

        match command {
            "init" => match rest.parse::<u16>() {
                Ok(port) => {
                    let p = Peer::new(port);
                    match p.start().await {
                        Ok(()) => {
                            println!("{} listening on port {port}", "[init]".bright_blue().bold());
                            peer = Some(p);
                        }
                        Err(e) => println!("{} failed to start: {e}", "[init]".bright_red().bold()),
                    }
                }
                Err(_) => println!("{} usage: init <port>", "[error]".bright_red().bold()),
            },
            "add" => match &peer {
                Some(p) => {
                    if rest.is_empty() {
                        println!("{} usage: add <host:port>", "[error]".bright_red().bold());
                    } else {
                        match p.add_peer(rest).await {
                            Ok(()) => println!("{} neighbour {rest} added", "[add]".bright_green().bold()),
                            Err(e) => println!("{} handshake with {rest} failed: {e}", "[add]".bright_red().bold()),
                        }
                    }
                }
                None => println!("{} run init <port> first", "[error]".bright_red().bold()),
            },
            "insert" => match &peer {
                Some(p) => {
                    let mined = p.chain().add(rest.as_bytes().to_vec()).await;
                    println!(
                        "{} mined block {} (difficulty {})",
                        "[insert]".bright_green().bold(),
                        mined.index,
                        mined.difficulty
                    );
                }
                None => println!("{} run init <port> first", "[error]".bright_red().bold()),
            },
            "print" => match &peer {
                Some(p) => p.chain().print().await,
                None => println!("{} run init <port> first", "[error]".bright_red().bold()),
            },
            "help" => print_help(),
            "exit" | "quit" => break,
            "" => {}
            other => println!("{} unknown command {other:?}", "[error]".bright_red().bold()),
        }

        print!("{} ", ">".bright_black());
        std::io::stdout().flush().ok();
    }

    println!("{}", "[shutdown] done".bright_red().bold());
    Ok(())
}
