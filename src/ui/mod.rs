use chrono::Local;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};

use crate::app::{App, AppState, InputMode};
use crate::chat::{DeliveryState, Message};

pub fn draw(f: &mut Frame<'_>, app: &App) {
    let size = f.size();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title bar
            Constraint::Min(0),    // Main content
            Constraint::Length(3), // Input area
        ])
        .split(size);

    draw_title_bar(f, app, chunks[0]);

    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(72), // Conversation
            Constraint::Percentage(28), // Info panel
        ])
        .split(chunks[1]);

    draw_chat_area(f, app, main_chunks[0]);
    draw_info_panel(f, app, main_chunks[1]);

    draw_input_area(f, app, chunks[2]);
}

fn state_label(state: &AppState) -> &'static str {
    match state {
        AppState::Idle => "idle",
        AppState::Connecting => "connecting...",
        AppState::Live => "live",
        AppState::Disconnected => "offline",
    }
}

fn state_style(state: &AppState) -> Style {
    match state {
        AppState::Live => Style::default().fg(Color::Green),
        AppState::Connecting => Style::default().fg(Color::Yellow),
        AppState::Idle => Style::default().fg(Color::White),
        AppState::Disconnected => Style::default().fg(Color::Red),
    }
}

fn draw_title_bar(f: &mut Frame, app: &App, area: Rect) {
    let peer = match &app.current_peer {
        Some(peer) => format!("{} ({})", app.peer_name, peer),
        None => "no conversation".to_string(),
    };
    let title = format!(
        " {} | {} | {} ",
        app.session.display_name(),
        peer,
        state_label(&app.state)
    );

    let title_block = Block::default()
        .borders(Borders::ALL)
        .style(state_style(&app.state))
        .title(" GigChat ");

    let title_paragraph = Paragraph::new(title)
        .block(title_block)
        .alignment(Alignment::Center);

    f.render_widget(title_paragraph, area);
}

/// One transcript line: time, sender, body and the delivery marker.
fn message_line<'a>(message: &'a Message, app: &'a App) -> Line<'a> {
    let own = message.is_own(&app.session.user_id);
    let sender = if own {
        app.session.display_name()
    } else {
        app.peer_name.as_str()
    };

    let mut spans = vec![
        Span::styled(
            format!(
                "[{}] ",
                message.created_at.with_timezone(&Local).format("%H:%M")
            ),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(
            format!("<{}> ", sender),
            Style::default().fg(if own { Color::Green } else { Color::Magenta }),
        ),
        Span::raw(message.body.as_str()),
    ];

    match message.delivery_state {
        DeliveryState::Pending => spans.push(Span::styled(
            " · sending…",
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        )),
        DeliveryState::Failed => spans.push(Span::styled(
            " · failed",
            Style::default().fg(Color::Red),
        )),
        DeliveryState::Confirmed => {}
    }

    Line::from(spans)
}

fn draw_chat_area(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(match &app.current_peer {
            Some(_) => format!(" Chat with {} ", app.peer_name),
            None => " GigChat - Status ".to_string(),
        })
        .style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let height = inner.height as usize;
    let messages = if app.current_peer.is_some() {
        app.get_visible_messages(height)
    } else {
        Vec::new()
    };
    let mut lines = Vec::new();

    if app.current_peer.is_some() {
        for message in &messages {
            lines.push(message_line(message, app));
        }
        if lines.is_empty() {
            lines.push(Line::from(Span::styled(
                "No messages yet. Press 'i', type a message and press Enter to send.",
                Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
            )));
        }
    } else {
        for status in app.get_visible_status_messages(height) {
            lines.push(Line::from(Span::styled(
                status.as_str(),
                Style::default().fg(Color::Gray),
            )));
        }
    }

    let messages_widget = Paragraph::new(lines).wrap(Wrap { trim: false });
    f.render_widget(messages_widget, inner);
}

fn draw_info_panel(f: &mut Frame<'_>, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4), // Identity
            Constraint::Length(4), // Connection
            Constraint::Length(8), // Unread
            Constraint::Min(0),    // Status log
        ])
        .split(area);

    let identity_block = Block::default()
        .borders(Borders::ALL)
        .title(" Identity ")
        .style(Style::default().fg(Color::Blue));

    let identity_text = vec![
        Line::from(vec![
            Span::raw("User: "),
            Span::styled(app.session.display_name(), Style::default().fg(Color::Green)),
        ]),
        Line::from(vec![
            Span::raw("Auth: "),
            Span::styled(
                if app.session.token.is_some() { "token" } else { "none" },
                Style::default().fg(if app.session.token.is_some() {
                    Color::Green
                } else {
                    Color::Yellow
                }),
            ),
        ]),
    ];

    f.render_widget(Paragraph::new(identity_text).block(identity_block), chunks[0]);

    let connection_block = Block::default()
        .borders(Borders::ALL)
        .title(" Connection ")
        .style(Style::default().fg(Color::Blue));

    let connection_text = vec![
        Line::from(vec![
            Span::raw("Live: "),
            Span::styled(state_label(&app.state), state_style(&app.state)),
        ]),
        Line::from(vec![
            Span::raw("Sending: "),
            Span::styled(
                if app.engine.is_sending() { "yes" } else { "no" },
                Style::default().fg(Color::Cyan),
            ),
        ]),
    ];

    f.render_widget(
        Paragraph::new(connection_text).block(connection_block),
        chunks[1],
    );

    let unread_block = Block::default()
        .borders(Borders::ALL)
        .title(" Unread ")
        .style(Style::default().fg(Color::Blue));

    let mut unread: Vec<(&String, &usize)> = app.unread.iter().collect();
    unread.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    let unread_list = if unread.is_empty() {
        List::new(vec![ListItem::new("Nothing new").style(Style::default().fg(Color::Gray))])
    } else {
        List::new(
            unread
                .into_iter()
                .map(|(peer, count)| {
                    ListItem::new(format!("{} ({})", peer, count))
                        .style(Style::default().fg(Color::White).add_modifier(Modifier::BOLD))
                })
                .collect::<Vec<_>>(),
        )
    }
    .block(unread_block);

    f.render_widget(unread_list, chunks[2]);

    let status_block = Block::default()
        .borders(Borders::ALL)
        .title(" Status ")
        .style(Style::default().fg(Color::Blue));
    let status_height = status_block.inner(chunks[3]).height as usize;

    let status_lines: Vec<Line> = if app.current_peer.is_some() {
        app.get_visible_status_messages(status_height)
            .into_iter()
            .map(|status| Line::from(Span::styled(status.as_str(), Style::default().fg(Color::Gray))))
            .collect()
    } else {
        Vec::new()
    };

    f.render_widget(
        Paragraph::new(status_lines)
            .block(status_block)
            .wrap(Wrap { trim: true }),
        chunks[3],
    );
}

fn draw_input_area(f: &mut Frame, app: &App, area: Rect) {
    let input_style = match app.input_mode {
        InputMode::Normal => Style::default().fg(Color::White),
        InputMode::Editing => Style::default().fg(Color::Green),
    };

    let mode_indicator = match app.input_mode {
        InputMode::Normal => "[NORMAL] Press 'i' to enter input mode",
        InputMode::Editing if app.engine.is_sending() => "[INPUT] sending...",
        InputMode::Editing => "[INPUT] ESC=normal, ENTER=send",
    };

    let input_block = Block::default()
        .borders(Borders::ALL)
        .title(mode_indicator)
        .style(input_style);

    let input_text = if app.input_mode == InputMode::Editing {
        app.input.as_str()
    } else {
        ""
    };

    let input_paragraph = Paragraph::new(input_text)
        .block(input_block)
        .wrap(Wrap { trim: false });

    f.render_widget(input_paragraph, area);

    if app.input_mode == InputMode::Editing {
        f.set_cursor(area.x + app.cursor_position as u16 + 1, area.y + 1);
    }
}
