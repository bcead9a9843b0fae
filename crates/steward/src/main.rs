//! Replays a scripted model in the terminal, running the built-in tools for
//! real.

#[macro_use]
extern crate tracing;

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use steward::AssistantBuilder;
use steward::core::event::{Event, EventKind, Received, Subscription};
use steward::core::permission::{Decision, PermissionGate, PermissionRequest};
use steward::core::{CancellationToken, EngineConfig};
use steward_test_model::{PresetResponse, TestModelProvider};
use tokio::io::{self, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::select;
use tokio::signal;
use tokio::time::sleep;

const BAR_CHAR: &str = "▎";

/// Chat with a scripted model.
#[derive(Parser, Debug)]
#[command(name = "steward", about = "Chat with a scripted model")]
struct Cli {
    /// JSON file with the responses of the model, in order.
    #[arg(long)]
    script: PathBuf,

    /// JSON file with the engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Approve every tool call without asking.
    #[arg(long)]
    yolo: bool,

    /// Print events as JSON lines instead of rendering them.
    #[arg(long)]
    json_events: bool,
}

type Input = Lines<BufReader<Stdin>>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let script: Vec<PresetResponse> = match load_json(&cli.script) {
        Ok(script) => script,
        Err(err) => {
            eprintln!("failed to load the script: {err}");
            return;
        }
    };
    let mut config = match &cli.config {
        Some(path) => match load_json::<EngineConfig>(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load the config: {err}");
                return;
            }
        },
        None => EngineConfig::default(),
    };
    if cli.yolo {
        config = config.with_bypass_permissions(true);
    }
    if config.system_prompt.is_none() {
        config = config.with_system_prompt(
            include_str!("./system_prompt.md")
                .replace("{{HOST_OS}}", host_os()),
        );
    }

    let provider = TestModelProvider::with_script(script);
    let mut assistant = AssistantBuilder::with_model_provider(provider)
        .with_config(config)
        .build();
    let mut events = assistant.subscribe();
    let gate = assistant.permissions();
    let mut input = BufReader::new(io::stdin()).lines();
    let mut frontend = Frontend::new(cli.json_events);

    loop {
        prompt("> ");
        let Some(line) = read_line(&mut input).await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        let turn = assistant.send_message(line, cancel.clone());
        let render = frontend.run(&mut events, &gate, &mut input, &cancel);
        let (outcome, ()) = tokio::join!(turn, render);
        debug!("turn ended: {outcome:?}");
    }
}

/// Renders the events of a turn and asks for permissions.
struct Frontend {
    json: bool,
    style: ProgressStyle,
    streaming: bool,
}

impl Frontend {
    fn new(json: bool) -> Self {
        let style = ProgressStyle::with_template("{spinner} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        Self {
            json,
            style,
            streaming: false,
        }
    }

    async fn run(
        &mut self,
        events: &mut Subscription,
        gate: &PermissionGate,
        input: &mut Input,
        cancel: &CancellationToken,
    ) {
        let mut progress_bar: Option<ProgressBar> = None;
        loop {
            if !self.json && !self.streaming {
                progress_bar
                    .get_or_insert_with(|| {
                        let progress_bar = ProgressBar::new_spinner();
                        progress_bar.set_style(self.style.clone());
                        progress_bar.set_message("🤔 Thinking...");
                        progress_bar
                    })
                    .inc(1);
            }

            let received = select! {
                received = events.recv() => received,
                _ = signal::ctrl_c(), if !cancel.is_cancelled() => {
                    cancel.cancel();
                    continue;
                }
                _ = sleep(Duration::from_millis(100)) => continue,
            };
            // Finish the progress bar before printing anything else.
            if let Some(progress_bar) = progress_bar.take() {
                progress_bar.finish_and_clear();
            }

            let event = match received {
                Some(Received::Event(event)) => event,
                Some(Received::Lagged(n)) => {
                    warn!("missed {n} events");
                    continue;
                }
                None => break,
            };
            self.render(&event);

            match event.kind {
                EventKind::PermissionRequested { request } => {
                    // Approved along with an earlier request.
                    if !gate.is_pending(&request.tool_call_id) {
                        continue;
                    }
                    let decision = ask(&request, input, cancel).await;
                    if let Some(decision) = decision
                        && let Err(err) =
                            gate.resolve(&request.tool_call_id, decision)
                    {
                        warn!("{err}");
                    }
                }
                kind if kind.is_terminal() => break,
                _ => {}
            }
        }
    }

    fn render(&mut self, event: &Event) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => error!("failed to serialize an event: {err}"),
            }
            return;
        }

        if self.streaming
            && !matches!(event.kind, EventKind::AssistantDelta { .. })
        {
            println!();
            self.streaming = false;
        }
        match &event.kind {
            EventKind::AssistantDelta { text, .. } => {
                if !self.streaming {
                    print!("{}🤖 ", BAR_CHAR.bright_cyan());
                    self.streaming = true;
                }
                print!("{}", text.bright_white());
                flush();
            }
            EventKind::ToolCallStarted { tool_name, .. } => {
                let bar = BAR_CHAR.bright_blue();
                println!("{bar}🔧 {}", tool_name.dimmed());
            }
            EventKind::ToolCallFinished { call } => {
                if let Some(result) = call.result_entry() {
                    let summary = result.content.lines().next().unwrap_or("");
                    println!(
                        "{}   {} {}",
                        BAR_CHAR.bright_blue(),
                        call.name.dimmed(),
                        summary.dimmed()
                    );
                }
            }
            EventKind::RequestRetrying {
                attempt,
                delay_ms,
                error,
            } => {
                println!(
                    "{}retrying in {delay_ms}ms (attempt {attempt}): {error}",
                    BAR_CHAR.yellow()
                );
            }
            EventKind::ContextCompacted { summarized, .. } => {
                let note = format!("summarized {summarized} earlier messages");
                println!("{}{}", BAR_CHAR.dimmed(), note.dimmed());
            }
            EventKind::PersistenceWarning { message } => {
                println!("{}{message}", BAR_CHAR.yellow());
            }
            EventKind::TurnFailed { failure } => {
                println!("{}❌ {}", BAR_CHAR.bright_red(), failure.red());
            }
            EventKind::TurnCancelled => {
                println!("{}interrupted", BAR_CHAR.dimmed());
            }
            _ => {}
        }
    }
}

/// Asks the user about `request`. Returns `None` if the turn got cancelled
/// in the meantime.
async fn ask(
    request: &PermissionRequest,
    input: &mut Input,
    cancel: &CancellationToken,
) -> Option<Decision> {
    let bar = BAR_CHAR.bright_yellow();
    eprintln!("\n{bar}⚠️  {}", request.description);
    eprintln!("{bar}{}", request.target.bright_white().bold());
    eprint!("Proceed? [y]es / [a]lways / [n]o: ");
    let _ = std::io::stderr().flush();

    let line = select! {
        line = read_line(input) => line,
        _ = signal::ctrl_c() => {
            cancel.cancel();
            return None;
        }
        _ = cancel.cancelled() => return None,
    };
    eprintln!();
    let decision = match line.as_deref().map(str::trim) {
        Some("" | "y" | "Y" | "yes") => Decision::ApprovedOnce,
        Some("a" | "A" | "always") => Decision::ApprovedAlways,
        _ => Decision::Denied {
            reason: Some("denied by the user".to_owned()),
        },
    };
    Some(decision)
}

fn load_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, String> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("{}: {err}", path.display()))?;
    serde_json::from_str(&text)
        .map_err(|err| format!("{}: {err}", path.display()))
}

async fn read_line(input: &mut Input) -> Option<String> {
    match input.next_line().await {
        Ok(line) => line,
        Err(err) => {
            error!("error reading input: {}", err);
            None
        }
    }
}

fn prompt(text: &str) {
    print!("{text}");
    flush();
}

#[inline]
fn flush() {
    let _ = std::io::stdout().flush();
}

#[inline]
fn host_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        _ => "some other OS",
    }
}
