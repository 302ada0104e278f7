//! QuizCtl - Command line client for QuizCluster
//!
//! Usage:
//!   quizctl discover         - Print the current primary
//!   quizctl cluster          - Print the directory's view of the cluster
//!   quizctl shell            - Interactive quiz session with failover

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use quizcluster::api::StatusResponse;
use quizcluster::client::{ClientEvent, Connector};
use quizcluster::config::ClusterConfig;
use quizcluster::quiz::{Request, Response, Role};

/// QuizCluster Control Tool
#[derive(Parser)]
#[command(name = "quizctl")]
#[command(about = "Use and monitor a QuizCluster", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "quizcluster.toml")]
    config: PathBuf,

    /// Directory address (host:port, overrides config)
    #[arg(short, long)]
    directory: Option<String>,

    /// Directory status API (host:port)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current primary
    Discover,
    /// Print registered nodes and their roles
    Cluster {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive session (type `help` for commands)
    Shell,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let result = match &cli.command {
        Commands::Discover => discover(&cli).await,
        Commands::Cluster { json } => cluster(&cli.api, *json).await,
        Commands::Shell => shell(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn client_config(cli: &Cli) -> anyhow::Result<quizcluster::config::ClientConfig> {
    let mut config = ClusterConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?
        .client;
    if let Some(directory) = &cli.directory {
        config.directory_address = directory.clone();
    }
    Ok(config)
}

// ============ Commands ============

async fn discover(cli: &Cli) -> anyhow::Result<()> {
    let (tx, _events) = mpsc::unbounded_channel();
    let connector = Connector::new(client_config(cli)?, tx).await?;

    match connector.discover().await {
        Ok(primary) => {
            println!("Primary: {}", primary);
            Ok(())
        }
        Err(e) => bail!("{}", e),
    }
}

async fn cluster(api: &str, json: bool) -> anyhow::Result<()> {
    let url = format!("http://{}/status", api);
    let response = reqwest::get(&url).await.with_context(|| format!("requesting {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let status: StatusResponse = response.json().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("QuizCluster Status (quizctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("Nodes: {}", status.cluster_size);
    match &status.registry.primary {
        Some(primary) => println!("Primary: {}", primary),
        None => println!("Primary: NONE"),
    }
    println!();

    println!(
        "{:<24} {:<10} {:<10} {:<10} {:<12}",
        "ADDRESS", "TRANSFER", "VERSION", "ROLE", "HEARTBEAT"
    );
    println!("{}", "-".repeat(68));

    for node in &status.registry.nodes {
        let role_padded = format!("{:<10}", node.role);
        let role_colored = if node.role == "PRIMARY" {
            format!("\x1b[1;34m{}\x1b[0m", role_padded)
        } else {
            role_padded
        };

        println!(
            "{:<24} {:<10} {:<10} {} {:<12}",
            format!("{}:{}", node.address, node.client_port),
            node.transfer_port,
            node.version,
            role_colored,
            format!("{} ms ago", node.heartbeat_age_ms)
        );
    }
    println!();

    Ok(())
}

const HELP: &str = "\
Commands:
  signup <user> <password> <instructor|student>
  login <user> <password>
  logout
  ask <correct> <prompt> | <choice> | <choice> ...
  list
  answer <question-id> <choice>
  ping
  quit";

async fn shell(cli: &Cli) -> anyhow::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut connector = Connector::new(client_config(cli)?, tx).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Notification(n) => println!("* server: {:?}", n),
                ClientEvent::Retrying { reason, delay } => {
                    println!("* {}; retrying in {:.1}s...", reason, delay.as_secs_f32())
                }
                ClientEvent::Reconnected { primary, reauthenticated } => {
                    if reauthenticated {
                        println!("* reconnected to {} (session restored)", primary);
                    } else {
                        println!("* reconnected to {}", primary);
                    }
                }
            }
        }
    });

    println!("Looking for the primary...");
    let primary = connector.connect().await?;
    println!("Connected to {}. Type `help` for commands.", primary);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            "help" => {
                println!("{}", HELP);
                continue;
            }
            _ => {}
        }

        let request = match parse_command(line) {
            Ok(r) => r,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };

        let is_logout = request == Request::Logout;
        let outcome = if is_logout {
            connector.logout().await
        } else {
            connector.call(request).await
        };

        match outcome {
            Ok(response) => print_response(&response),
            Err(e) if e.is_retryable() => {
                // A request cut off mid-flight is not resent; its effect is unknown
                println!("* request interrupted: {}", e);
                let primary = connector.recover().await?;
                println!("* now talking to {}; repeat the request if needed", primary);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn parse_command(line: &str) -> Result<Request, String> {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    match (command, args.as_slice()) {
        ("ping", []) => Ok(Request::Ping),
        ("list", []) => Ok(Request::ListQuestions),
        ("logout", []) => Ok(Request::Logout),
        ("login", [user, password]) => Ok(Request::Login {
            username: user.to_string(),
            password: password.to_string(),
        }),
        ("signup", [user, password, role]) => {
            let role = Role::parse(role).ok_or_else(|| format!("unknown role '{}'", role))?;
            Ok(Request::SignUp {
                username: user.to_string(),
                password: password.to_string(),
                role,
            })
        }
        ("answer", [id, choice]) => Ok(Request::SubmitAnswer {
            question_id: id.parse().map_err(|_| format!("bad question id '{}'", id))?,
            choice: choice.parse().map_err(|_| format!("bad choice '{}'", choice))?,
        }),
        ("ask", [correct, ..]) => {
            let correct: u32 = correct.parse().map_err(|_| format!("bad choice index '{}'", correct))?;
            let text = rest[correct_len(rest)..].trim();
            let mut parts = text.split('|').map(str::trim);
            let prompt = parts.next().unwrap_or_default().to_string();
            let choices: Vec<String> = parts.filter(|c| !c.is_empty()).map(String::from).collect();
            if prompt.is_empty() || choices.len() < 2 {
                return Err("usage: ask <correct> <prompt> | <choice> | <choice> ...".into());
            }
            Ok(Request::CreateQuestion {
                prompt,
                choices,
                correct,
            })
        }
        _ => Err(format!("unrecognized command; {}", HELP)),
    }
}

/// Length of the first whitespace-separated word of `s`
fn correct_len(s: &str) -> usize {
    s.find(char::is_whitespace).unwrap_or(s.len())
}

fn print_response(response: &Response) {
    match response {
        Response::Pong { version } => println!("pong (store v{})", version),
        Response::SignedUp { user_id } => println!("signed up as user #{}", user_id),
        Response::LoggedIn { username, role } => println!("logged in as {} ({})", username, role),
        Response::LoggedOut => println!("logged out"),
        Response::QuestionCreated { question_id } => println!("question #{} created", question_id),
        Response::Questions(questions) if questions.is_empty() => println!("no questions yet"),
        Response::Questions(questions) => {
            for q in questions {
                println!("#{} {} (by {})", q.id, q.prompt, q.author);
                for (i, choice) in q.choices.iter().enumerate() {
                    let mut marks = String::new();
                    if q.correct == Some(i as u32) {
                        marks.push_str(" [correct]");
                    }
                    if q.answered == Some(i as u32) {
                        marks.push_str(" [your answer]");
                    }
                    println!("   {}. {}{}", i, choice, marks);
                }
            }
        }
        Response::AnswerRecorded { correct: true } => println!("correct!"),
        Response::AnswerRecorded { correct: false } => println!("recorded; not the right answer"),
        Response::Failure { code, message } => println!("failed ({:?}): {}", code, message),
    }
}
