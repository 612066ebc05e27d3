use anyhow::Result;
use clap::Args;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use pixelsense::config::Config;
use pixelsense::imaging::footprint_kb;
use pixelsense::inference::Query;
use pixelsense::session::{
    capture_with_command, ImageService, InputMethod, SessionContext, SessionState,
};

use super::common::{make_service, read_file};

#[derive(Args)]
pub struct SessionArgs {
    /// Run inference in-process instead of calling the backend
    #[arg(long)]
    pub local: bool,

    /// Backend URL (overrides config and BACKEND_URL)
    #[arg(long)]
    pub backend_url: Option<String>,
}

const HELP: &str = "\
Commands:
  /upload <path>   Use an image file
  /capture         Take a picture with the configured capture command
  /save            Save the current image
  /caption         Caption the saved image
  /ask <question>  Ask about the saved image (plain text works too)
  /listen <path>   Transcribe an audio file and ask it as a question
  /status          Show session and backend state
  /reset           Clear the image, reference and answer
  /help            Show this help
  /quit            Exit
";

pub async fn run(args: SessionArgs, mut config: Config) -> Result<()> {
    if let Some(url) = args.backend_url {
        config.client.backend_url = url;
    }
    let service = make_service(&config, args.local)?;
    let mut session = SessionContext::new(config.image.max_dim);

    println!(
        "PixelSense v{} | {}\n",
        env!("CARGO_PKG_VERSION"),
        if args.local {
            "in-process".to_string()
        } else {
            format!("backend: {}", config.client.backend_url)
        }
    );
    println!("Type /help for commands, /quit to exit\n");

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("[{}] > ", state_label(session.state()));
        let input = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(input);

        let (command, rest) = match input.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (input, ""),
        };

        let result = match command {
            "/quit" | "/exit" => break,
            "/help" => {
                print!("{}", HELP);
                Ok(())
            }
            "/upload" => upload(&mut session, rest).await,
            "/capture" => capture(&mut session, &config).await,
            "/save" => save(&mut session, service.as_ref()).await,
            "/caption" => ask(&mut session, service.as_ref(), Query::Caption).await,
            "/ask" => ask(&mut session, service.as_ref(), Query::vqa(rest)).await,
            "/listen" => listen(&mut session, service.as_ref(), rest).await,
            "/status" => {
                show_status(&session);
                Ok(())
            }
            "/reset" => {
                session.reset(service.as_ref()).await;
                println!("Session cleared.");
                Ok(())
            }
            c if c.starts_with('/') => {
                eprintln!("Unknown command: {} (try /help)", c);
                Ok(())
            }
            _ => ask(&mut session, service.as_ref(), Query::vqa(input)).await,
        };

        if let Err(e) = result {
            eprintln!("⚠️  {}", e);
        }
    }

    // leave nothing behind on the server
    session.reset(service.as_ref()).await;
    Ok(())
}

fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::NoInput => "no input",
        SessionState::InputChosen => "waiting for image",
        SessionState::ImageCaptured => "unsaved",
        SessionState::ImageSaved => "saved",
        SessionState::AnswerReady => "answered",
    }
}

async fn upload(session: &mut SessionContext, path: &str) -> Result<()> {
    if path.is_empty() {
        anyhow::bail!("Usage: /upload <path>");
    }
    let (bytes, name) = read_file(path).await?;
    session.choose_input(InputMethod::Upload)?;
    let preview = session.capture(bytes)?;
    println!("{}: {}", name, preview.summary());
    println!("Use /save to store it.");
    Ok(())
}

async fn capture(session: &mut SessionContext, config: &Config) -> Result<()> {
    let template = config
        .capture
        .command
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("No capture command configured ([capture] command)"))?;
    session.choose_input(InputMethod::Capture)?;
    let bytes = capture_with_command(template).await?;
    let preview = session.capture(bytes)?;
    println!("Captured: {}", preview.summary());
    println!("Use /save to store it.");
    Ok(())
}

async fn save(session: &mut SessionContext, service: &dyn ImageService) -> Result<()> {
    let reference = session.save(service).await?;
    println!("✅ Image saved: {}", reference.location);
    Ok(())
}

async fn ask(session: &mut SessionContext, service: &dyn ImageService, query: Query) -> Result<()> {
    let answer = session.get_answer(service, query).await?;
    println!("\n{}\n", answer);
    Ok(())
}

async fn listen(session: &mut SessionContext, service: &dyn ImageService, path: &str) -> Result<()> {
    if path.is_empty() {
        anyhow::bail!("Usage: /listen <audio file>");
    }
    let (audio, name) = read_file(path).await?;
    let question = session.transcribe(service, &audio, &name).await?;
    println!("Heard: {}", question);
    ask(session, service, Query::vqa(question)).await
}

fn show_status(session: &SessionContext) {
    println!("State: {}", state_label(session.state()));
    if let Some(method) = session.input_method() {
        println!("Input: {:?}", method);
    }
    if let Some(asset) = session.asset() {
        println!(
            "Original: {}x{} {} ({} KB)",
            asset.width,
            asset.height,
            asset.media_type(),
            footprint_kb(asset.bytes.len())
        );
    }
    if let Some(preview) = session.preview() {
        println!("Prepared: {}", preview.summary());
    }
    if let Some(reference) = session.reference() {
        println!(
            "Stored: {} ({}, {})",
            reference.location,
            reference.backend.as_str(),
            reference.created_at.format("%H:%M:%S")
        );
    }
    if let Some(answer) = session.answer() {
        println!("Last answer: {}", answer);
    }
}
