//! SmolChat - on-device chat with small language models
//!
//! Command line front end: interactive or one-shot chat, image description
//! with a vision model, and GGUF inspection.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smolchat::config::{default_settings_path, load_settings, Settings};
use smolchat::inference::{
    read_gguf_metadata, validate_gguf, LlamaCppBackend, ModelError, SessionWorker, StreamToken,
};
use smolchat::session::{MultimodalSession, SessionError, TextSession};
use smolchat::storage::{
    list_transcripts, load_transcript, save_transcript, transcripts_dir, StorageError,
    Transcript,
};
use smolchat::truncate_str;
use smolchat::types::{Role, RGB_CHANNELS};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Generation failed: {0}")]
    Generation(String),
}

#[derive(Debug, Parser)]
#[command(name = "smolchat", version, about = "Chat with small GGUF models on-device")]
struct Cli {
    /// Settings file (defaults to the platform data directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Route llama.cpp's own logs through the logger
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Chat with a text model
    Chat(ChatArgs),
    /// Describe one or more images with a vision model
    Describe(DescribeArgs),
    /// Print the metadata of a GGUF file
    Inspect {
        /// Path to the GGUF file
        model: PathBuf,
    },
    /// List saved transcripts, most recent first
    Transcripts,
}

#[derive(Debug, Args)]
struct ChatArgs {
    /// Path to the GGUF model
    #[arg(short, long)]
    model: PathBuf,

    /// Answer a single prompt and exit instead of starting a REPL
    #[arg(short, long)]
    prompt: Option<String>,

    /// System prompt for the conversation
    #[arg(long)]
    system: Option<String>,

    /// Forget each turn instead of keeping the history
    #[arg(long)]
    no_history: bool,

    /// Resume a saved transcript by id (see `smolchat transcripts`)
    #[arg(long)]
    resume: Option<String>,

    /// Save the conversation as a transcript on exit
    #[arg(long)]
    save: bool,
}

#[derive(Debug, Args)]
struct DescribeArgs {
    /// Path to the GGUF vision model
    #[arg(short, long)]
    model: PathBuf,

    /// Path to the multimodal projector
    #[arg(long)]
    mmproj: PathBuf,

    /// Image files, in order
    #[arg(short, long = "frame", required = true)]
    frames: Vec<PathBuf>,

    #[arg(short, long, default_value = "Describe what you see.")]
    prompt: String,
}

fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("smolchat=info")),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting SmolChat v{}", env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let settings_path = match cli.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let mut settings = load_settings(&settings_path);
    settings.verbose |= cli.verbose;

    match cli.command {
        Command::Chat(args) => chat(&settings, args),
        Command::Describe(args) => describe(&settings, args),
        Command::Inspect { model } => inspect(&model),
        Command::Transcripts => transcripts(),
    }
}

fn chat(settings: &Settings, args: ChatArgs) -> Result<(), CliError> {
    let mut params = settings.inference.clone();
    if args.no_history {
        params.store_chats = false;
    }
    let verbose = settings.verbose;

    let dir = transcripts_dir()?;
    let mut transcript = match &args.resume {
        Some(id) => load_transcript(&dir, id)?,
        None => Transcript::new(Some(args.model.display().to_string())),
    };

    let model = args.model.clone();
    let worker = SessionWorker::spawn(move || {
        let backend = LlamaCppBackend::load(&model, &params, verbose)?;
        Ok(TextSession::new(backend, params.store_chats))
    })?;

    if args.resume.is_none() {
        if let Some(system) = &args.system {
            worker.add_message(Role::System, system)?;
        }
    }
    for message in &transcript.messages {
        worker.add_message(message.role, &message.content)?;
    }

    match &args.prompt {
        Some(prompt) => {
            stream_reply(&worker, prompt)?;
        }
        None => repl(&worker)?,
    }

    if args.save {
        transcript.update(&worker.history()?);
        let path = save_transcript(&dir, &transcript)?;
        println!("Saved transcript {} to {}", transcript.id, path.display());
    }
    Ok(())
}

fn repl(worker: &SessionWorker) -> Result<(), CliError> {
    println!("Type a message, /stats for counters, /quit to exit.");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/stats" => {
                let stats = worker.stats()?;
                println!(
                    "{} tokens at {:.2} tok/s, context {}/{}",
                    stats.tokens_generated,
                    stats.tokens_per_second,
                    stats.context_used,
                    stats.context_size
                );
            }
            prompt => stream_reply(worker, prompt)?,
        }
    }
    Ok(())
}

/// Prints fragments as they arrive.
fn stream_reply(worker: &SessionWorker, prompt: &str) -> Result<(), CliError> {
    let (token_rx, _stop) = worker.generate(prompt)?;
    let mut stdout = io::stdout();
    for token in token_rx {
        match token {
            StreamToken::Token(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamToken::Done => break,
            StreamToken::Error(e) => {
                writeln!(stdout)?;
                return Err(CliError::Generation(e));
            }
        }
    }
    writeln!(stdout)?;

    let stats = worker.stats()?;
    info!(
        "{} tokens, {:.2} tok/s, context {}/{}",
        stats.tokens_generated, stats.tokens_per_second, stats.context_used, stats.context_size
    );
    Ok(())
}

fn describe(settings: &Settings, args: DescribeArgs) -> Result<(), CliError> {
    let params = settings.multimodal.clone();
    let verbose = settings.verbose;
    let (model, mmproj) = (args.model.clone(), args.mmproj.clone());

    let worker = SessionWorker::spawn(move || {
        let backend = LlamaCppBackend::load_multimodal(&model, &mmproj, &params, verbose)?;
        Ok(MultimodalSession::new(backend))
    })?;

    for path in &args.frames {
        let image = image::open(path)
            .map_err(|source| CliError::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        let (width, height) = image.dimensions();
        worker.add_frame(image.into_raw(), width, height, RGB_CHANNELS)?;
        info!("Loaded frame {} ({}x{})", path.display(), width, height);
    }

    stream_reply(&worker, &args.prompt)
}

fn inspect(path: &Path) -> Result<(), CliError> {
    let header = validate_gguf(path)?;
    let metadata = read_gguf_metadata(path)?;

    println!("File:            {}", path.display());
    println!("GGUF version:    {}", header.version);
    println!("Tensors:         {}", header.tensor_count);
    println!("Metadata keys:   {}", header.metadata_kv_count);
    println!(
        "Architecture:    {}",
        metadata.architecture.as_deref().unwrap_or("unknown")
    );
    match metadata.context_length {
        Some(n) => println!("Context length:  {n}"),
        None => println!("Context length:  unknown"),
    }
    match &metadata.chat_template {
        Some(template) => println!("Chat template:   {}...", truncate_str(template, 80)),
        None => println!("Chat template:   none (built-in ChatML is used)"),
    }
    Ok(())
}

fn transcripts() -> Result<(), CliError> {
    let listed = list_transcripts(&transcripts_dir()?)?;
    if listed.is_empty() {
        println!("No saved transcripts.");
        return Ok(());
    }
    for transcript in &listed {
        println!(
            "{}  {}  {:>3} messages  {}",
            transcript.id,
            transcript.saved_at.format("%Y-%m-%d %H:%M"),
            transcript.messages.len(),
            transcript.title
        );
    }
    Ok(())
}
