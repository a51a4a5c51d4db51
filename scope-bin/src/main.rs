use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use scope_core::{
    AppState,
    client::ScopeClient,
    config::{Config, EnvDefaults},
    http_client::HttpClient,
    relay::{AudioUpload, Relay},
    run_server,
    session::{CONNECTION_LOST_NOTICE, ChatSession},
    store::SETTING_API_KEY,
    telemetry::LogSink,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "scope chat relay and terminal client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        #[arg(long, help = "Config file (JSON or TOML)")]
        config: Option<PathBuf>,
        #[arg(long, help = "Override the bind address")]
        bind: Option<String>,
    },
    /// Interactive chat against a running server
    Chat {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        web_search: bool,
        #[arg(long)]
        think_harder: bool,
        #[arg(long, help = "Continue a stored conversation")]
        resume: Option<String>,
    },
    /// List chat models available through the server
    Models {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,scope_core=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind } => serve(config, bind).await,
        Commands::Chat { server, model, web_search, think_harder, resume } => {
            let client = ScopeClient::new(HttpClient::new_default()?, server);
            let mut session = match resume {
                Some(id) => ChatSession::resume(client, &id).await?,
                None => ChatSession::new(client),
            };
            session.model = model;
            session.web_search = web_search;
            session.think_harder = think_harder;
            chat_loop(session).await
        }
        Commands::Models { server } => {
            let client = ScopeClient::new(HttpClient::new_default()?, server);
            for m in client.list_models().await? {
                println!("{}", m.id);
            }
            Ok(())
        }
    }
}

async fn serve(config: Option<PathBuf>, bind: Option<String>) -> anyhow::Result<()> {
    let cfg = match config {
        Some(path) => Config::from_path(&path)?,
        None => Config::default(),
    };
    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let env = EnvDefaults::from_env(&cfg.upstream);
    if env.api_key.is_none() {
        tracing::info!(var = %cfg.upstream.api_key_env, "no environment credential; relying on stored settings");
    }
    let http = HttpClient::from_cfg(&cfg.http)?;
    let relay = Relay::new(http, cfg.upstream.base_url.clone()).with_sink(Arc::new(LogSink));
    let state = AppState::in_memory(cfg, env, relay)?;
    run_server(state, &bind).await?;
    Ok(())
}

async fn chat_loop(mut session: ChatSession) -> anyhow::Result<()> {
    for entry in session.transcript().entries() {
        println!("[{:?}] {}", entry.message.role, entry.message.content);
    }
    eprintln!("commands: /new /history /web /think /model <id> /key <value> /transcribe <file> /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut line = line;
        let command = line.trim().to_string();
        match command.as_str() {
            "/quit" => break,
            "/history" => {
                match session.client().list_conversations().await {
                    Ok(all) => all.iter().for_each(|c| println!("{}  {}", c.id, c.title)),
                    Err(e) => eprintln!("[error: {e}]"),
                }
                continue;
            }
            cmd if cmd.starts_with("/key") => {
                let key = cmd.trim_start_matches("/key").trim();
                let result = if key.is_empty() {
                    session.client().delete_setting(SETTING_API_KEY).await
                } else {
                    session.client().set_setting(SETTING_API_KEY, key).await
                };
                match result {
                    Ok(()) => eprintln!("[api key {}]", if key.is_empty() { "cleared" } else { "saved" }),
                    Err(e) => eprintln!("[error: {e}]"),
                }
                continue;
            }
            cmd if cmd.starts_with("/transcribe") => {
                let path = cmd.trim_start_matches("/transcribe").trim();
                match transcribe_file(&session, path).await {
                    Ok(text) if !text.trim().is_empty() => {
                        println!("[transcript] {text}");
                        line = text;
                    }
                    Ok(_) => {
                        eprintln!("[no speech recognised]");
                        continue;
                    }
                    Err(e) => {
                        eprintln!("[error: {e}]");
                        continue;
                    }
                }
            }
            "/new" => {
                session.start_new();
                eprintln!("[new conversation]");
                continue;
            }
            "/web" => {
                session.web_search = !session.web_search;
                eprintln!("[web search: {}]", session.web_search);
                continue;
            }
            "/think" => {
                session.think_harder = !session.think_harder;
                eprintln!("[think harder: {}]", session.think_harder);
                continue;
            }
            cmd if cmd.starts_with("/model") => {
                let id = cmd.trim_start_matches("/model").trim();
                session.model = (!id.is_empty()).then(|| id.to_string());
                eprintln!("[model: {}]", session.model.as_deref().unwrap_or("default"));
                continue;
            }
            _ => {}
        }

        // Each commit extends the previous one; print only the new suffix.
        let mut printed = 0usize;
        let mut observer = |content: &str| {
            print!("{}", &content[printed..]);
            let _ = std::io::stdout().flush();
            printed = content.len();
        };
        tokio::select! {
            outcome = session.send(&line, &mut observer) => {
                if let Some(outcome) = outcome {
                    println!();
                    if let Some(err) = outcome.error {
                        eprintln!("{CONNECTION_LOST_NOTICE} ({err})");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                eprintln!("[aborted]");
            }
        }
    }
    Ok(())
}

async fn transcribe_file(session: &ChatSession, path: &str) -> anyhow::Result<String> {
    let path = PathBuf::from(path);
    let bytes = tokio::fs::read(&path).await?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("wav") => Some("audio/wav"),
        Some("mp3") => Some("audio/mpeg"),
        Some("m4a") => Some("audio/mp4"),
        Some("ogg") => Some("audio/ogg"),
        Some("webm") => Some("audio/webm"),
        _ => None,
    };
    let audio = AudioUpload {
        file_name: path.file_name().and_then(|n| n.to_str()).map(str::to_string),
        content_type: content_type.map(str::to_string),
        bytes: bytes.into(),
    };
    Ok(session.client().transcribe(audio).await?)
}
