use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
};

use hiddenclick_core::types::{TargetStatus, WorkerState};
use crate::App;

/// Overall state shown in the banner.
fn banner(targets: &[TargetStatus]) -> (&'static str, Color) {
    if targets.is_empty() {
        ("NO TARGETS (check settings.json)", Color::DarkGray)
    } else if targets.iter().any(|t| t.state == WorkerState::Running) {
        ("RUNNING (Press P to pause)", Color::Green)
    } else if targets.iter().all(|t| t.state == WorkerState::Idle) {
        ("STOPPED (Press S to start)", Color::Red)
    } else {
        ("PAUSED (Press R to resume)", Color::Yellow)
    }
}

fn key(k: &'static str) -> Span<'static> {
    Span::styled(k, Style::default().fg(Color::Yellow))
}

pub fn draw(f: &mut Frame, app: &App) {
    let chunks = if app.log_visible {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(f.area())
    } else {
        Layout::default()
            .constraints([Constraint::Percentage(100)])
            .split(f.area())
    };

    let targets = app.targets();
    let (banner_label, banner_bg) = banner(&targets);

    let mut lines: Vec<Line> = vec![
        Line::from(vec![
            Span::raw(" "),
            key("j"),
            Span::raw("/"),
            key("k"),
            Span::raw(" select, "),
            key("space"),
            Span::raw(" toggle, "),
            key("s"),
            Span::raw("/"),
            key("p"),
            Span::raw("/"),
            key("r"),
            Span::raw(" start/pause/resume, "),
            key("q"),
            Span::raw(" quit"),
        ]),
        Line::from(""),
    ];

    for (i, status) in targets.iter().enumerate() {
        let prefix = if i == app.selected { "> " } else { "  " };
        let (mark, color) = match status.state {
            WorkerState::Running => ("[●]", Color::Green),
            WorkerState::Paused => ("[‖]", Color::Yellow),
            WorkerState::Idle => ("[ ]", Color::DarkGray),
        };
        lines.push(Line::from(vec![
            Span::raw(prefix),
            Span::styled(mark, Style::default().fg(color)),
            Span::raw(" "),
            Span::styled(
                status.target.name.clone(),
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("  #{:x}", status.target.window_id),
                Style::default().fg(Color::DarkGray),
            ),
            Span::styled(format!("  {} passes", status.passes), Style::default().fg(Color::Cyan)),
        ]));
    }

    if !app.actions.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(" Actions:", Style::default().fg(Color::Cyan))));
        for (i, a) in app.actions.iter().enumerate() {
            lines.push(Line::from(Span::styled(
                format!("  {}. {}", i + 1, a),
                Style::default().fg(Color::DarkGray),
            )));
        }
    }

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(chunks[0]);

    let banner_width = left_chunks[0].width as usize;
    let pad_total = banner_width.saturating_sub(banner_label.chars().count());
    let pad_left = pad_total / 2;
    let pad_right = pad_total - pad_left;
    let centered = format!("{}{}{}", " ".repeat(pad_left), banner_label, " ".repeat(pad_right));
    let banner = Paragraph::new(Line::from(Span::styled(
        centered,
        Style::default().fg(Color::Black).bg(banner_bg).add_modifier(Modifier::BOLD),
    )));
    f.render_widget(banner, left_chunks[0]);

    let target_list = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(target_list, left_chunks[1]);

    if app.log_visible && chunks.len() > 1 {
        let visible_height = chunks[1].height.saturating_sub(2) as usize;
        let log_lines: Vec<Line> = app.logs.visible(visible_height).map(|m| parse_log_line(m)).collect();

        let log_panel = Paragraph::new(log_lines)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" Logs ")
                    .border_style(Style::default().fg(Color::Yellow)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(log_panel, chunks[1]);
    }
}

/// Parse a structured log line (level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage)
/// into a colored Line.
fn parse_log_line(raw: &str) -> Line<'_> {
    let parts: Vec<&str> = raw.splitn(5, '\x1f').collect();
    if parts.len() < 5 {
        return Line::from(raw);
    }

    let (level, prefix, timestamp, message) = (parts[0], parts[1], parts[3], parts[4]);
    let color = match parts[2].parse::<u8>().unwrap_or(0) {
        1 => Color::DarkGray,
        2 => Color::LightBlue,
        _ => Color::White,
    };

    let mut spans = vec![
        Span::styled(timestamp, Style::default().fg(Color::DarkGray)),
        Span::raw(" "),
    ];
    match level {
        "ERROR" => spans.push(Span::styled("error ", Style::default().fg(Color::Red))),
        "WARN" => spans.push(Span::styled("warn ", Style::default().fg(Color::Yellow))),
        _ => {}
    }
    if !prefix.is_empty() {
        spans.push(Span::styled(prefix, Style::default().fg(color).add_modifier(Modifier::BOLD)));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(message, Style::default().fg(color)));

    Line::from(spans)
}
