use anyhow::Result;
use parley_cli::client::{BackendClient, ConnectionStatus};
use parley_cli::config::ClientConfig;
use parley_cli::conversation::Conversation;
use parley_cli::conversation_logger::ConversationLogger;
use parley_cli::coordinator::{StreamCoordinator, StreamFailure, StreamHandler, StreamSummary};
use parley_cli::image::load_data_url;
use parley_shared::{ChatMessage, ErrorCode, MessageId, TestResult, VisionResult};
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Results handed back to the console loop by callbacks.
enum AppEvent {
    Finished {
        message_id: MessageId,
        content: String,
        summary: StreamSummary,
    },
    Failed {
        message_id: MessageId,
        failure: StreamFailure,
    },
    Test(TestResult),
    Vision(VisionResult),
}

/// Prints deltas as they arrive and reports the outcome to the console loop.
struct ConsoleHandler {
    message_id: MessageId,
    full: String,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl StreamHandler for ConsoleHandler {
    fn on_chunk(&mut self, delta: &str, full: &str) {
        print!("{}", delta);
        let _ = std::io::stdout().flush();
        self.full = full.to_string();
    }

    fn on_done(&mut self, summary: StreamSummary) {
        let _ = self.events.send(AppEvent::Finished {
            message_id: self.message_id,
            content: std::mem::take(&mut self.full),
            summary,
        });
    }

    fn on_error(&mut self, failure: StreamFailure) {
        let _ = self.events.send(AppEvent::Failed {
            message_id: self.message_id,
            failure,
        });
    }
}

struct App {
    config: ClientConfig,
    coordinator: StreamCoordinator<BackendClient>,
    events: mpsc::UnboundedSender<AppEvent>,
    conversation: Conversation,
    connection_status: ConnectionStatus,
    logger: ConversationLogger,
}

impl App {
    fn new(config: ClientConfig, client: BackendClient, events: mpsc::UnboundedSender<AppEvent>) -> Self {
        let logger = ConversationLogger::new(&config.log_dir).unwrap_or_else(|e| {
            error!("Failed to create conversation logger: {}", e);
            ConversationLogger::disabled()
        });

        if let Some(path) = logger.get_current_log_path() {
            info!("Logging conversation to: {:?}", path);
        }

        Self {
            config,
            coordinator: StreamCoordinator::new(client),
            events,
            conversation: Conversation::new(),
            connection_status: ConnectionStatus::Disconnected,
            logger,
        }
    }

    /// Returns `false` once the user asked to quit.
    async fn handle_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "/quit" | "/exit" => return false,
            "/cancel" => {
                if !self.coordinator.cancel() {
                    println!("Nothing to cancel.");
                }
            }
            "/test" => {
                let events = self.events.clone();
                let request_id = self
                    .coordinator
                    .test_connection(&self.config.model, move |result| {
                        let _ = events.send(AppEvent::Test(result));
                    });
                info!(%request_id, "Connection test sent");
                println!("Testing connection to {}...", self.config.model.base_url);
            }
            "/image" => self.analyze_image(rest.trim()).await,
            "/clear" => {
                self.coordinator.cancel();
                self.conversation.clear();
                println!("Started a new conversation.");
            }
            "/status" => self.print_status(),
            _ if command.starts_with('/') => {
                println!("Unknown command {}. Try /cancel, /test, /image, /clear, /status or /quit.", command);
            }
            _ => self.send(line),
        }
        true
    }

    fn send(&mut self, text: &str) {
        let events = self.events.clone();
        let sent = self.conversation.submit(&mut self.coordinator, &self.config.model, text, |message_id| {
            Box::new(ConsoleHandler {
                message_id,
                full: String::new(),
                events,
            })
        });
        // refusals are reported through the handler
        if let Ok(message_id) = sent {
            self.logger.log_message(message_id, &ChatMessage::user(text), None);
        }
    }

    async fn analyze_image(&mut self, args: &str) {
        let (path, prompt) = args.split_once(' ').unwrap_or((args, ""));
        if path.is_empty() {
            println!("Usage: /image <path> [prompt]");
            return;
        }
        let image_url = match load_data_url(Path::new(path)).await {
            Ok(url) => url,
            Err(e) => {
                println!("{:#}", e);
                return;
            }
        };

        let events = self.events.clone();
        self.coordinator.analyze_image(
            &self.config.model,
            image_url,
            prompt.trim().to_string(),
            move |result| {
                let _ = events.send(AppEvent::Vision(result));
            },
        );
        println!("Analyzing {}...", path);
    }

    fn print_status(&self) {
        let connection = match &self.connection_status {
            ConnectionStatus::Connected => "connected".to_string(),
            ConnectionStatus::Connecting => "connecting".to_string(),
            ConnectionStatus::Disconnected => "disconnected".to_string(),
            ConnectionStatus::Error(e) => format!("error: {}", e),
        };
        println!("Host:      {} ({})", self.config.server_url, connection);
        println!("Provider:  {} / {}", self.config.model.provider, self.config.model.model);
        println!("API key:   {}", if self.config.model.has_credential() { "set" } else { "missing" });
        match self.coordinator.current_message_id() {
            Some(id) => println!("Streaming: message {}", id),
            None => println!("Streaming: idle"),
        }
        println!("Pending:   {} request(s)", self.coordinator.pending_requests());
        println!("History:   {} message(s)", self.conversation.history().len());
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        match &status {
            ConnectionStatus::Connected => println!("[connected to {}]", self.config.server_url),
            ConnectionStatus::Disconnected if self.connection_status == ConnectionStatus::Connected => {
                println!("[connection lost]");
            }
            _ => {}
        }
        if status == ConnectionStatus::Disconnected {
            self.coordinator.channel_lost();
        }
        self.connection_status = status;
    }

    fn on_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Finished {
                message_id,
                content,
                summary,
            } => {
                println!();
                let message = ChatMessage::assistant(content);
                self.logger.log_message(message_id, &message, summary.finish_reason);
                self.conversation.record_reply(message);
            }
            AppEvent::Failed { message_id, failure } => {
                println!();
                match failure.code {
                    Some(ErrorCode::Cancelled) => println!("[cancelled]"),
                    code => {
                        let code = code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
                        println!("[error: {} ({})]", failure.message, code);
                    }
                }
                self.logger.log_failure(message_id, failure.code, &failure.message);
            }
            AppEvent::Test(result) => {
                if result.success {
                    let elapsed = result.response_time_ms.map(|ms| format!(" in {} ms", ms)).unwrap_or_default();
                    println!("{}{}", result.message, elapsed);
                } else {
                    let code = result.error.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
                    println!("{} ({})", result.message, code);
                }
            }
            AppEvent::Vision(result) => match result.description {
                Some(description) if result.success => {
                    println!("{}", description);
                    println!("[{} ms, {}]", result.analysis_time_ms, result.model.unwrap_or_default());
                }
                _ => println!("Image analysis failed: {}", result.error.unwrap_or_default()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // log to a file so tracing output does not interleave with the console
    if let Ok(file) = std::fs::File::create("parley-cli.log") {
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }
    dotenv::dotenv().ok();

    let config = ClientConfig::from_env()?;
    if !config.model.has_credential() {
        println!("No API key configured (AI_API_KEY); requests will fail with missing_credential.");
    }

    let (client, mut server_rx, mut status_rx) = BackendClient::new(config.server_url.to_string());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut app = App::new(config, client, events_tx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !app.handle_line(&line).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(event) = server_rx.recv() => app.coordinator.handle_event(event),
            Some(status) = status_rx.recv() => app.on_status(status),
            Some(event) = events_rx.recv() => app.on_event(event),
        }
    }

    app.coordinator.shutdown();
    Ok(())
}
