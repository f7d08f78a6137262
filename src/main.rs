//! gpt CLI
//!
//! Chat with a hosted model from the terminal while it keeps a bounded,
//! summarized memory of the conversation between runs.

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use cortex_chat::config::{self, ChatConfig};
use cortex_chat::llm::OpenAiClient;
use cortex_chat::memory::memory_intro;
use cortex_chat::render::{self, render_header, render_reply};
use cortex_chat::transcript::TranscriptLog;
use cortex_chat::{
    Abandoned, ConversationMemory, MemoryStore, MemoryWindow, ModelClient, Role,
    SessionController, SessionSettings, Warning,
};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_TEMPLATE: &str = "\
# gpt configuration. OPENAI_* environment variables override these values.
# api_key = \"sk-...\"
# model = \"gpt-4o\"
# default_prompt = \"\"
# temperature = 0.5
# max_tokens = 4096
# max_summary_tokens = 2048
# memory_limit = 10
# summary_threshold = 10
# stream = false
# markdown = true
";

/// gpt - terminal chat with long-lived memory
#[derive(Parser, Debug)]
#[command(name = "gpt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print the reply as it is generated
    #[arg(long)]
    stream: bool,

    /// Print replies as plain text instead of rendered markdown
    #[arg(long)]
    no_markdown: bool,

    /// Forget the conversation memory and exit
    #[arg(long)]
    reset: bool,

    /// Print the rolling summary and exit
    #[arg(long)]
    summary: bool,

    /// Print the transcript log and exit
    #[arg(long)]
    log: bool,

    /// Delete the transcript log and exit
    #[arg(long)]
    clear_log: bool,

    /// Check that the API is reachable with the configured key
    #[arg(long)]
    ping: bool,

    /// Open the configuration file in $EDITOR
    #[arg(long)]
    env: bool,

    /// Save an API key to the configuration file (prompts when omitted)
    #[arg(long, value_name = "KEY", num_args = 0..=1, default_missing_value = "")]
    set_key: Option<String>,

    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the persistent memory file
    #[arg(long)]
    memory_file: Option<PathBuf>,

    /// Verbose output: debug logging on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Prompt to send. Without one, piped stdin is used, or an interactive
    /// session starts.
    #[arg(trailing_var_arg = true)]
    prompt: Vec<String>,
}

/// How replies are shown
struct Output {
    model: String,
    stream: bool,
    markdown: bool,
    styled: bool,
    width: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };

    if let Some(key) = cli.set_key.as_deref() {
        return set_key(&config_path, key);
    }
    if cli.env {
        return edit_config(&config_path);
    }

    let mut config = ChatConfig::load(Some(&config_path))?;
    if let Some(memory_file) = cli.memory_file.clone() {
        config = config.with_memory_path(memory_file);
    }
    if cli.stream {
        config = config.with_stream(true);
    }
    if cli.no_markdown {
        config = config.with_markdown(false);
    }
    config.validate()?;

    let transcript = TranscriptLog::new(config.log_file.clone());
    if cli.log {
        match transcript.read().await? {
            Some(content) => print!("{}", content),
            None => println!("No log entries yet."),
        }
        return Ok(());
    }
    if cli.clear_log {
        if transcript.clear().await? {
            println!("Log cleared.");
        } else {
            println!("Log is already empty.");
        }
        return Ok(());
    }

    let client = OpenAiClient::new(
        config.api_key.clone(),
        config.api_base.clone(),
        config.model.clone(),
    )?;

    if cli.ping {
        require_api_key(&config)?;
        client.ping().await?;
        println!("API reachable at {}", config.api_base);
        return Ok(());
    }

    let settings = SessionSettings {
        system_prompt: system_prompt(&config),
        window: config.window(),
        options: config.completion_options(),
        max_summary_tokens: config.max_summary_tokens,
    };
    let store = MemoryStore::new(config.memory_path.clone());
    let (mut session, warnings) = SessionController::open(client, store, settings).await;
    print_warnings(&warnings);

    if cli.reset {
        session.reset().await?;
        println!("Memory reset.");
        return Ok(());
    }
    if cli.summary {
        print_summary(session.memory(), &config.window());
        return Ok(());
    }

    require_api_key(&config)?;
    let styled = io::stdout().is_terminal();
    let display = Output {
        model: config.model.clone(),
        stream: config.stream,
        markdown: config.markdown && styled,
        styled,
        width: render::terminal_width(),
    };

    match read_input(&cli.prompt).await? {
        Some(input) => run_turn(&mut session, &transcript, &display, &input).await,
        None => run_interactive(&mut session, &transcript, &display).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn require_api_key(config: &ChatConfig) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        anyhow::bail!("No API key configured. Set OPENAI_API_KEY or run `gpt --set-key`.");
    }
    Ok(())
}

/// Memory intro plus the user's standing instructions
fn system_prompt(config: &ChatConfig) -> String {
    let intro = memory_intro(&config.window());
    let instructions = config.default_prompt.trim();
    if instructions.is_empty() {
        intro
    } else {
        format!("{}\n\nINSTRUCTIONS: {}", intro, instructions)
    }
}

/// Prompt from args, else piped stdin. `None` means interactive.
async fn read_input(prompt: &[String]) -> anyhow::Result<Option<String>> {
    if !prompt.is_empty() {
        return Ok(Some(prompt.join(" ")));
    }
    if io::stdin().is_terminal() {
        return Ok(None);
    }

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    if input.trim().is_empty() {
        anyhow::bail!("No input received on stdin");
    }
    Ok(Some(input))
}

async fn run_interactive<C: ModelClient>(
    session: &mut SessionController<C>,
    transcript: &TranscriptLog,
    display: &Output,
) -> anyhow::Result<()> {
    info!("Starting interactive session");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }

        if let Err(e) = run_turn(session, transcript, display, input).await {
            eprintln!("Error: {:#}", e);
        }
    }

    Ok(())
}

async fn run_turn<C: ModelClient>(
    session: &mut SessionController<C>,
    transcript: &TranscriptLog,
    display: &Output,
    input: &str,
) -> anyhow::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    println!(
        "{}",
        render_header(&display.model, &timestamp, display.width, display.styled)
    );

    // Ctrl-C only interrupts the model call. Once the reply is in memory
    // the turn is summarized and saved without interruption.
    let stream = display.stream;
    let exchange = tokio::select! {
        result = session.exchange(input, |chunk| {
            if stream {
                print!("{}", chunk);
                let _ = io::stdout().flush();
            }
        }) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    if stream {
        println!();
    }
    let Some(result) = exchange else {
        return report_interrupted(session, transcript, input).await;
    };
    let reply = result?;

    let settled = session.settle().await;
    if !stream {
        println!("{}", render_reply(&reply, display.markdown, display.width));
    }
    print_warnings(&settled.warnings);

    if let Err(e) = transcript.append(input, &reply).await {
        warn!("Could not write transcript: {}", e);
    }
    Ok(())
}

async fn report_interrupted<C: ModelClient>(
    session: &mut SessionController<C>,
    transcript: &TranscriptLog,
    input: &str,
) -> anyhow::Result<()> {
    match session.abandon_turn().await {
        Abandoned::NotRecorded => {
            eprintln!("Interrupted. Nothing was recorded for this turn.");
        }
        Abandoned::Kept { warnings } => {
            eprintln!("Interrupted after the reply arrived. The exchange was kept.");
            print_warnings(&warnings);
            let reply = session
                .memory()
                .recent()
                .last()
                .filter(|turn| turn.role == Role::Assistant)
                .map(|turn| turn.content.clone());
            if let Some(reply) = reply {
                if let Err(e) = transcript.append(input, &reply).await {
                    warn!("Could not write transcript: {}", e);
                }
            }
        }
    }
    Ok(())
}

fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        eprintln!("Warning: {}", warning);
    }
}

fn print_summary(memory: &ConversationMemory, window: &MemoryWindow) {
    if memory.summary().trim().is_empty() {
        println!("No summary yet.");
    } else {
        println!("{}", memory.summary());
    }
    println!(
        "\n{} of {} recent messages kept verbatim; older ones are summarized once there are more than {}.",
        memory.recent().len(),
        window.memory_limit,
        window.summary_threshold
    );
}

fn set_key(config_path: &Path, key: &str) -> anyhow::Result<()> {
    let key = if key.trim().is_empty() {
        prompt_for_key()?
    } else {
        key.trim().to_string()
    };
    if key.is_empty() {
        anyhow::bail!("No API key given");
    }

    config::set_api_key(config_path, &key)
        .with_context(|| format!("Failed to update {}", config_path.display()))?;
    println!("API key saved to {}", config_path.display());
    Ok(())
}

fn prompt_for_key() -> anyhow::Result<String> {
    print!("OpenAI API key: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Open the config file in the user's editor, creating it from a template
/// first, and check the result still parses.
fn edit_config(config_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    if !config_path.exists() {
        std::fs::write(config_path, CONFIG_TEMPLATE)?;
    }

    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());
    let mut parts = editor.split_whitespace();
    let program = parts.next().unwrap_or("vi");

    let status = std::process::Command::new(program)
        .args(parts)
        .arg(config_path)
        .status()
        .with_context(|| format!("Failed to launch editor `{}`", editor))?;
    if !status.success() {
        anyhow::bail!("Editor exited with {}", status);
    }

    ChatConfig::from_file(config_path)?
        .validate()
        .with_context(|| format!("{} is not a valid configuration", config_path.display()))?;
    Ok(())
}
