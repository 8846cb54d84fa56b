//! Operator CLI for the answer signing service.
//!
//! `serve` runs the HTTP service; the remaining subcommands drive the same
//! workflows directly against a database file for inspection and scripting.

use answer_signer::{
    compose, digest_at, open_stores, AccountService, AnswerSubmission, AppState, Clock, Identity,
    ServiceConfig, SigningCoordinator, StoreKind, Stores, SystemClock, TokenAuthority, Verifier,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "signer")]
#[command(about = "Atomically replace, seal and verify answer sets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service
    Serve {
        /// Listen address (overrides SIGNER_LISTEN)
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// SQLite database file (overrides SIGNER_DB_PATH)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Keep everything in memory
        #[arg(long)]
        memory: bool,
    },
    /// Print the canonical string and digest of an answers file
    Digest {
        /// JSON array of {question_id, text}
        #[arg(long)]
        answers: PathBuf,
        /// Unix seconds to seal at (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Replace an identity's answers and pin a new signature
    Sign {
        /// Identity (email) to sign for
        #[arg(long)]
        identity: String,
        /// JSON array of {question_id, text}
        #[arg(long)]
        answers: PathBuf,
        /// SQLite database file (overrides SIGNER_DB_PATH)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Look a signature up and print the stored answers
    Verify {
        /// Identity (email) the signature belongs to
        #[arg(long)]
        identity: String,
        /// Hex signature to check
        #[arg(long)]
        signature: String,
        /// SQLite database file (overrides SIGNER_DB_PATH)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Mint a bearer token with the configured secret
    Token {
        /// Identity (email) to issue the token for
        #[arg(long)]
        identity: String,
    },
}

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

#[actix_web::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "answer_signer=info"
                    .parse()
                    .unwrap_or_else(|err| fatal(&format!("invalid log directive: {err}"))),
            ),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig::from_env();

    match cli.command {
        Command::Serve { listen, db, memory } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if memory {
                config.store = StoreKind::Memory;
            }
            serve(config).await;
        }
        Command::Digest { answers, timestamp } => {
            let answers = load_answers(&answers);
            let timestamp = timestamp.unwrap_or_else(|| SystemClock.unix_now());
            let report = json!({
                "canonical": compose(&answers, timestamp),
                "signature": digest_at(&answers, timestamp),
                "timestamp": timestamp,
            });
            print_json(&report);
        }
        Command::Sign {
            identity,
            answers,
            db,
        } => {
            if let Some(db) = db {
                config.db_path = db;
            }
            let identity = parse_identity(&identity);
            let answers = load_answers(&answers);
            let stores = open(&config).await;
            let coordinator = SigningCoordinator::new(
                stores.answers,
                Arc::new(SystemClock),
                config.coordinator(),
            );
            match coordinator.sign(&identity, &answers).await {
                Ok(signed) => print_json(&json!({
                    "signature": signed.signature,
                    "timestamp": signed.timestamp,
                })),
                Err(err) => fatal(&format!("sign failed: {err}")),
            }
        }
        Command::Verify {
            identity,
            signature,
            db,
        } => {
            if let Some(db) = db {
                config.db_path = db;
            }
            let stores = open(&config).await;
            let verifier = Verifier::new(stores.answers, config.tx_timeout);
            match verifier.verify_raw(&identity, &signature).await {
                Ok(result) => {
                    print_json(&result);
                    if !result.valid {
                        std::process::exit(2);
                    }
                }
                Err(err) => fatal(&format!("verify failed: {err}")),
            }
        }
        Command::Token { identity } => {
            let identity = parse_identity(&identity);
            let tokens = token_authority(&config);
            match tokens.issue(&identity) {
                Ok(token) => println!("{token}"),
                Err(err) => fatal(&format!("token error: {err}")),
            }
        }
    }
}

async fn serve(config: ServiceConfig) {
    let tokens = Arc::new(token_authority(&config));
    let stores = open(&config).await;
    let clock = Arc::new(SystemClock);
    let state = AppState {
        coordinator: SigningCoordinator::new(
            stores.answers.clone(),
            clock.clone(),
            config.coordinator(),
        ),
        verifier: Verifier::new(stores.answers, config.tx_timeout),
        accounts: AccountService::new(stores.users, tokens.clone(), clock),
        resolver: tokens,
        request_timeout: config.request_timeout,
    };
    if let Err(err) = answer_signer::run_server(config.listen, state).await {
        fatal(&format!("server error: {err}"));
    }
}

fn token_authority(config: &ServiceConfig) -> TokenAuthority {
    let secret = config
        .require_secret()
        .unwrap_or_else(|err| fatal(&err.to_string()));
    TokenAuthority::from_secret(secret, config.token_ttl, Arc::new(SystemClock))
        .unwrap_or_else(|err| fatal(&format!("token authority: {err}")))
}

async fn open(config: &ServiceConfig) -> Stores {
    open_stores(config.store_options())
        .await
        .unwrap_or_else(|err| fatal(&format!("failed to open store: {err}")))
}

fn parse_identity(raw: &str) -> Identity {
    Identity::parse(raw).unwrap_or_else(|err| fatal(&format!("{raw}: {err}")))
}

fn load_answers(path: &Path) -> Vec<AnswerSubmission> {
    let bytes = fs::read(path)
        .unwrap_or_else(|err| fatal(&format!("failed to read {}: {err}", path.display())));
    serde_json::from_slice(&bytes)
        .unwrap_or_else(|err| fatal(&format!("failed to parse {}: {err}", path.display())))
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => fatal(&format!("failed to encode output: {err}")),
    }
}
