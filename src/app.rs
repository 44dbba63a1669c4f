use anyhow::Result;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::chat::{EngineEvent, Message, MessageSyncEngine, SendOutcome};
use crate::config::Config;
use crate::session::Session;
use crate::transport::{RestApi, SocketIoConnector};

#[derive(Debug, Clone, PartialEq)]
pub enum AppState {
    Idle,
    Connecting,
    Live,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    pub should_quit: bool,
    pub state: AppState,
    pub input_mode: InputMode,
    pub input: String,
    pub cursor_position: usize,
    pub scroll_offset: usize,

    pub session: Session,
    pub config: Config,
    pub engine: MessageSyncEngine,

    pub current_peer: Option<String>,
    pub peer_name: String,
    pub status_messages: Vec<String>,
    /// Unread live messages per peer, fed by messages for closed conversations.
    pub unread: HashMap<String, usize>,

    event_rx: mpsc::UnboundedReceiver<EngineEvent>,
    views: mpsc::UnboundedSender<ViewCommand>,
}

/// Conversation switches, applied to the engine strictly in the order the
/// user asked for them.
enum ViewCommand {
    Open(String),
    Close(oneshot::Sender<()>),
}

fn spawn_view_worker(engine: MessageSyncEngine) -> mpsc::UnboundedSender<ViewCommand> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                ViewCommand::Open(peer) => engine.open(&peer).await,
                ViewCommand::Close(done) => {
                    engine.close().await;
                    let _ = done.send(());
                }
            }
        }
    });
    tx
}

impl App {
    pub async fn new(config: Config, session: Session, auto_peer: Option<&str>) -> Result<Self> {
        let api = RestApi::new(&config.api_url, session.token.clone(), config.request_timeout())?;
        let push = SocketIoConnector::new(
            &config.ws_base(),
            session.token.clone(),
            config.connect_timeout(),
        )?;
        info!("API at {}, realtime at {}", config.api_url, push.endpoint());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = MessageSyncEngine::new(
            session.clone(),
            Arc::new(api),
            Arc::new(push),
            config.pending_timeout(),
            event_tx,
        );

        Ok(Self::with_engine(config, session, engine, event_rx, auto_peer))
    }

    pub fn with_engine(
        config: Config,
        session: Session,
        engine: MessageSyncEngine,
        event_rx: mpsc::UnboundedReceiver<EngineEvent>,
        auto_peer: Option<&str>,
    ) -> Self {
        let views = spawn_view_worker(engine.clone());
        let mut app = Self {
            should_quit: false,
            state: AppState::Idle,
            input_mode: InputMode::Normal,
            input: String::new(),
            cursor_position: 0,
            scroll_offset: 0,

            session,
            config,
            engine,

            current_peer: None,
            peer_name: "User".to_string(),
            status_messages: Vec::new(),
            unread: HashMap::new(),

            event_rx,
            views,
        };

        app.add_status_message(format!("GigChat - signed in as {}", app.session.display_name()));

        if let Some(peer) = auto_peer {
            app.open_conversation(peer);
        } else {
            app.add_status_message("Use /open <userId> to start a conversation.".to_string());
        }

        app
    }

    pub async fn handle_input(&mut self, event: Event) -> Result<()> {
        if let Event::Key(key) = event {
            if key.kind == KeyEventKind::Press {
                self.handle_key_event(key).await?;
            }
        }
        Ok(())
    }

    async fn handle_key_event(&mut self, key: KeyEvent) -> Result<()> {
        match self.input_mode {
            InputMode::Normal => match key.code {
                KeyCode::Char('q') => {
                    self.quit().await;
                }
                KeyCode::Char('i') => {
                    self.input_mode = InputMode::Editing;
                }
                KeyCode::Up => {
                    self.scroll_offset = self.clamped_scroll().saturating_sub(1);
                }
                KeyCode::Down => {
                    self.scroll_offset = self.clamped_scroll() + 1;
                }
                KeyCode::PageUp => {
                    self.scroll_offset = self.clamped_scroll().saturating_sub(10);
                }
                KeyCode::PageDown => {
                    self.scroll_offset = self.clamped_scroll() + 10;
                }
                KeyCode::End => {
                    self.scroll_to_latest();
                }
                _ => {}
            },
            InputMode::Editing => match key.code {
                KeyCode::Enter => {
                    self.submit_input().await?;
                }
                KeyCode::Char(c) => {
                    self.input.insert(self.byte_index(), c);
                    self.cursor_position += 1;
                }
                KeyCode::Backspace => {
                    if self.cursor_position > 0 {
                        self.cursor_position -= 1;
                        self.input.remove(self.byte_index());
                    }
                }
                KeyCode::Delete => {
                    if self.cursor_position < self.input.chars().count() {
                        self.input.remove(self.byte_index());
                    }
                }
                KeyCode::Left => {
                    self.cursor_position = self.cursor_position.saturating_sub(1);
                }
                KeyCode::Right => {
                    if self.cursor_position < self.input.chars().count() {
                        self.cursor_position += 1;
                    }
                }
                KeyCode::Home => {
                    self.cursor_position = 0;
                }
                KeyCode::End => {
                    self.cursor_position = self.input.chars().count();
                }
                KeyCode::Esc => {
                    self.clear_input();
                    self.input_mode = InputMode::Normal;
                }
                _ => {}
            },
        }
        Ok(())
    }

    fn byte_index(&self) -> usize {
        self.input
            .char_indices()
            .nth(self.cursor_position)
            .map(|(idx, _)| idx)
            .unwrap_or(self.input.len())
    }

    fn clear_input(&mut self) {
        self.input.clear();
        self.cursor_position = 0;
    }

    async fn submit_input(&mut self) -> Result<()> {
        let input = self.input.trim().to_string();
        if input.is_empty() {
            return Ok(());
        }

        if input.starts_with('/') {
            self.clear_input();
            self.handle_command(&input).await?;
        } else {
            self.send_message(&input);
        }

        Ok(())
    }

    async fn handle_command(&mut self, input: &str) -> Result<()> {
        let parts: Vec<&str> = input[1..].split_whitespace().collect();
        if parts.is_empty() {
            return Ok(());
        }

        match parts[0].to_lowercase().as_str() {
            "open" | "o" | "chat" => {
                if parts.len() != 2 {
                    self.add_status_message("Usage: /open <userId>".to_string());
                    return Ok(());
                }
                self.open_conversation(parts[1]);
            }
            "close" | "c" => {
                if self.current_peer.is_some() {
                    self.close_conversation();
                } else {
                    self.add_status_message("No conversation to close".to_string());
                }
            }
            "full" | "web" => {
                self.open_full_view();
            }
            "unread" => {
                self.list_unread();
            }
            "help" | "h" | "commands" => {
                self.show_help();
            }
            "quit" | "q" | "exit" => {
                self.quit().await;
            }
            _ => {
                self.add_status_message(format!(
                    "Unknown command: {}. Type /help for available commands.",
                    parts[0]
                ));
            }
        }

        Ok(())
    }

    pub fn open_conversation(&mut self, peer: &str) {
        if peer == self.session.user_id {
            self.add_status_message("You cannot open a conversation with yourself".to_string());
            return;
        }

        self.current_peer = Some(peer.to_string());
        self.peer_name = "User".to_string();
        self.state = AppState::Connecting;
        self.unread.remove(peer);
        self.scroll_to_latest();

        self.add_status_message(format!("Opening conversation with {}", peer));
        let _ = self.views.send(ViewCommand::Open(peer.to_string()));
    }

    /// Queue a close behind any pending opens. The receiver resolves once
    /// the engine has released the conversation.
    fn request_close(&self) -> oneshot::Receiver<()> {
        let (done, closed) = oneshot::channel();
        let _ = self.views.send(ViewCommand::Close(done));
        closed
    }

    fn close_conversation(&mut self) {
        let _ = self.request_close();
        if let Some(peer) = self.current_peer.take() {
            self.add_status_message(format!("Closed conversation with {}", peer));
        }
        self.state = AppState::Idle;
        self.peer_name = "User".to_string();
        self.scroll_offset = 0;
    }

    fn send_message(&mut self, text: &str) {
        let Some(peer) = self.current_peer.clone() else {
            self.add_status_message(
                "No conversation open. Use /open <userId> to start one.".to_string(),
            );
            return;
        };

        if self.engine.current_peer().as_deref() != Some(peer.as_str()) {
            self.add_status_message(format!("Still opening the conversation with {}", peer));
            return;
        }

        match self.engine.stage_for(&peer, text) {
            Some(pending) => {
                self.clear_input();
                let engine = self.engine.clone();
                let temp_id = pending.temp_id().to_string();
                tokio::spawn(async move {
                    match engine.deliver(pending).await {
                        SendOutcome::Confirmed { id } => debug!("{} stored as {}", temp_id, id),
                        SendOutcome::FellBack { .. } => {
                            debug!("{} waiting for a realtime echo", temp_id)
                        }
                        SendOutcome::Ignored => {}
                    }
                });
            }
            None if self.engine.is_sending() => {
                self.add_status_message("Still sending the previous message...".to_string());
            }
            None => {}
        }
    }

    fn open_full_view(&mut self) {
        let Some(peer) = self.current_peer.clone() else {
            self.add_status_message("No conversation open".to_string());
            return;
        };

        let url = self.config.full_chat_url(&peer);
        match open::that(&url) {
            Ok(()) => self.add_status_message(format!("Opened {} in the browser", url)),
            Err(e) => {
                warn!("Failed to open {}: {}", url, e);
                self.add_status_message(format!("Could not open browser: {}", e));
            }
        }
    }

    fn list_unread(&mut self) {
        if self.unread.is_empty() {
            self.add_status_message("No unread messages".to_string());
            return;
        }

        let mut peers: Vec<(String, usize)> =
            self.unread.iter().map(|(p, c)| (p.clone(), *c)).collect();
        peers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (peer, count) in peers {
            self.add_status_message(format!("{} ({} unread)", peer, count));
        }
    }

    fn show_help(&mut self) {
        let help_text = [
            "GigChat Commands:",
            "/open <userId> - Open a conversation",
            "/close - Close the current conversation",
            "/full - Open the current conversation in the browser",
            "/unread - List conversations with unread messages",
            "/help - Show this help",
            "/quit - Exit",
            "",
            "Keyboard Commands:",
            "i=enter input mode, Esc=exit to normal mode, q=quit (normal mode)",
            "Up/Down=scroll messages, Page Up/Down=fast scroll, End=latest",
        ];

        for line in help_text {
            self.add_status_message(line.to_string());
        }
    }

    async fn quit(&mut self) {
        let _ = self.request_close().await;
        self.should_quit = true;
    }

    pub fn add_status_message(&mut self, message: String) {
        self.status_messages.push(format!(
            "[{}] {}",
            chrono::Local::now().format("%H:%M:%S"),
            message
        ));

        if self.status_messages.len() > 1000 {
            self.status_messages.remove(0);
        }
    }

    pub async fn on_tick(&mut self) -> Result<()> {
        while let Ok(event) = self.event_rx.try_recv() {
            self.apply_event(event);
        }
        Ok(())
    }

    fn is_current(&self, peer: &str) -> bool {
        self.current_peer.as_deref() == Some(peer)
    }

    fn apply_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ScrollToLatest => self.scroll_to_latest(),
            EngineEvent::TranscriptChanged { peer } => {
                debug!("Transcript of {} changed", peer);
            }
            EngineEvent::PeerResolved { peer, name } => {
                if self.is_current(&peer) {
                    self.peer_name = name;
                }
            }
            EngineEvent::ForeignMessage(message) => {
                let other = message.counterpart(&self.session.user_id).to_string();
                *self.unread.entry(other.clone()).or_default() += 1;
                self.add_status_message(format!("New message from {}", other));
            }
            EngineEvent::DeliveryFailed { peer, temp_id } => {
                debug!("Delivery of {} gave up", temp_id);
                self.add_status_message(format!("A message to {} could not be delivered", peer));
            }
            EngineEvent::LiveConnected { peer } => {
                if self.is_current(&peer) {
                    self.state = AppState::Live;
                }
            }
            EngineEvent::LiveDisconnected { peer } => {
                if self.is_current(&peer) {
                    self.state = AppState::Disconnected;
                    self.add_status_message(
                        "Live updates unavailable; messages may arrive late".to_string(),
                    );
                }
            }
        }
    }

    fn scroll_to_latest(&mut self) {
        self.scroll_offset = usize::MAX;
    }

    fn clamped_scroll(&self) -> usize {
        self.scroll_offset.min(self.engine.transcript().len())
    }

    pub fn get_visible_messages(&self, height: usize) -> Vec<Message> {
        let messages = self.engine.transcript();
        let start = self.scroll_offset.min(messages.len().saturating_sub(height));
        let end = (start + height).min(messages.len());
        messages[start..end].to_vec()
    }

    pub fn get_visible_status_messages(&self, height: usize) -> Vec<&String> {
        let start = self.status_messages.len().saturating_sub(height);
        self.status_messages[start..].iter().collect()
    }
}
