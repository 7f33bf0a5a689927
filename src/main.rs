//! CLI for Peril
//!
//! Subcommands:
//! - `setup`: declare the exchanges and the dead-letter queue
//! - `server`: broadcast pause/resume and collect game logs
//! - `client`: follow the pause state and publish game logs

use std::io::Write;

use chrono::Utc;
use clap::Parser;
use peril_pubsub::config::load_config;
use peril_pubsub::pubsub::{
    AckDecision, QueueDurability, publish_bincode, publish_json, subscribe_bincode,
    subscribe_json,
};
use peril_pubsub::routing::{
    DEAD_LETTER_QUEUE, EXCHANGE_PERIL_DIRECT, EXCHANGE_PERIL_DLX, EXCHANGE_PERIL_TOPIC,
    GAME_LOG_SLUG, GameLog, PAUSE_KEY, PlayingState, routing_key, wildcard,
};
use peril_pubsub::transport::{Channel, Connection, ExchangeKind, QueueOptions, amqp};
use peril_pubsub::utils::logging;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "peril")]
enum Command {
    /// Declare the exchanges and the dead-letter queue
    Setup,
    /// Run the game server
    Server,
    /// Run a game client
    Client {
        /// Player name; also names this client's queues
        #[arg(long)]
        username: String,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&config.log.level);

    let uri = config.broker.uri;
    let result = match cmd {
        Command::Setup => run_setup(&uri).await,
        Command::Server => run_server(&uri).await,
        Command::Client { username } => run_client(&uri, username).await,
    };

    if let Err(e) = result {
        error!("peril failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_setup(uri: &str) -> CliResult {
    let conn = amqp::connect(uri).await?;
    let channel = conn.open_channel().await?;

    channel
        .declare_exchange(EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct)
        .await?;
    channel
        .declare_exchange(EXCHANGE_PERIL_TOPIC, ExchangeKind::Topic)
        .await?;
    channel
        .declare_exchange(EXCHANGE_PERIL_DLX, ExchangeKind::Fanout)
        .await?;

    let options = QueueOptions {
        durable: true,
        ..QueueOptions::default()
    };
    channel.declare_queue(DEAD_LETTER_QUEUE, &options).await?;
    channel
        .bind_queue(DEAD_LETTER_QUEUE, EXCHANGE_PERIL_DLX, "")
        .await?;

    info!("Exchanges and dead-letter queue are in place");
    conn.close(200, "setup complete").await?;
    Ok(())
}

async fn run_server(uri: &str) -> CliResult {
    info!("Starting Peril server...");
    let conn = amqp::connect(uri).await?;
    let channel = conn.open_channel().await?;

    let game_logs = subscribe_bincode(
        &conn,
        EXCHANGE_PERIL_TOPIC,
        GAME_LOG_SLUG,
        &wildcard(GAME_LOG_SLUG),
        QueueDurability::Durable,
        |log: GameLog| {
            info!(
                username = %log.username,
                at = %log.current_time,
                "{}",
                log.message
            );
            AckDecision::Ack
        },
    )
    .await?;
    info!(queue = game_logs.queue(), "Collecting game logs");

    print_server_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(words) = next_command(&mut lines).await? {
        match words[0].as_str() {
            "pause" => {
                let state = PlayingState { is_paused: true };
                publish_json(&channel, EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &state).await?;
                info!("Game paused");
            }
            "resume" => {
                let state = PlayingState { is_paused: false };
                publish_json(&channel, EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &state).await?;
                info!("Game resumed");
            }
            "help" => print_server_help(),
            "quit" => break,
            other => {
                warn!(command = other, "Unknown command");
                print_server_help();
            }
        }
    }

    info!("Closing connection...");
    conn.close(200, "server shutting down").await?;
    Ok(())
}

async fn run_client(uri: &str, username: String) -> CliResult {
    info!(%username, "Starting Peril client...");
    let conn = amqp::connect(uri).await?;
    let channel = conn.open_channel().await?;

    subscribe_json(
        &conn,
        EXCHANGE_PERIL_DIRECT,
        &routing_key(PAUSE_KEY, &username),
        PAUSE_KEY,
        QueueDurability::Transient,
        |state: PlayingState| {
            if state.is_paused {
                info!("The server paused the game");
            } else {
                info!("The server resumed the game");
            }
            AckDecision::Ack
        },
    )
    .await?;

    print_client_help();
    let log_key = routing_key(GAME_LOG_SLUG, &username);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(words) = next_command(&mut lines).await? {
        match words[0].as_str() {
            "log" if words.len() > 1 => {
                let log = GameLog {
                    current_time: Utc::now(),
                    message: words[1..].join(" "),
                    username: username.clone(),
                };
                if let Err(e) = publish_bincode(&channel, EXCHANGE_PERIL_TOPIC, &log_key, &log).await
                {
                    warn!("Failed to publish game log: {}", e);
                }
            }
            "help" => print_client_help(),
            "quit" => break,
            other => {
                warn!(command = other, "Unknown command");
                print_client_help();
            }
        }
    }

    info!("Closing connection...");
    conn.close(200, "client shutting down").await?;
    Ok(())
}

/// Prompts and reads the next non-empty command line, split into words.
/// `None` on end of input or ctrl-c.
async fn next_command(
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<Option<Vec<String>>, std::io::Error> {
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(None);
            }
        };
        let Some(line) = line else {
            return Ok(None);
        };

        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if !words.is_empty() {
            return Ok(Some(words));
        }
    }
}

fn print_server_help() {
    println!("Possible commands:");
    println!("* pause  - pause the game for every client");
    println!("* resume - resume the game");
    println!("* help   - show this message");
    println!("* quit   - exit the server");
}

fn print_client_help() {
    println!("Possible commands:");
    println!("* log <message> - publish a game log line");
    println!("* help          - show this message");
    println!("* quit          - exit the client");
}
