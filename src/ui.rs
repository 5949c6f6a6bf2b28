pub mod screen;
pub mod stimuli;

use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Widget, Wrap},
};

use crate::app::{App, ControlPanel, PanelInput};
use crate::clock::Clock;
use crate::lang::Texts;
use crate::util::format_readout;

use self::screen::current_screen;

const HORIZONTAL_MARGIN: u16 = 2;
const PANEL_WIDTH: u16 = 60;
const PANEL_HEIGHT: u16 = 18;

impl<C: Clock + Clone> Widget for &App<C> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .horizontal_margin(HORIZONTAL_MARGIN)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(1),
                Constraint::Length(1),
            ])
            .split(area);

        render_header(self, chunks[0], buf);
        current_screen::<C>(self.flow.stage()).render(self, chunks[1], buf);
        render_footer(self, chunks[2], buf);

        if let Some(panel) = &self.panel {
            render_panel(self, panel, area, buf);
        }
    }
}

fn render_header<C: Clock + Clone>(app: &App<C>, area: Rect, buf: &mut Buffer) {
    let texts = app.texts();
    let halves = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    if app.flow.admin().mode_active() {
        Paragraph::new(Span::styled(
            texts.get("admin_mode_indicator"),
            Style::default()
                .fg(Color::Black)
                .bg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ))
        .render(halves[0], buf);
    }

    if let Some(elapsed) = app.screen().readout {
        Paragraph::new(Span::styled(
            format!("{}{}", texts.get("timer_display"), format_readout(elapsed)),
            Style::default().fg(Color::Magenta),
        ))
        .alignment(Alignment::Right)
        .render(halves[1], buf);
    }
}

fn render_footer<C: Clock + Clone>(app: &App<C>, area: Rect, buf: &mut Buffer) {
    let dim = Style::default().add_modifier(Modifier::DIM);
    let mut spans = vec![];
    if let Some(status) = &app.status {
        spans.push(Span::styled(
            format!("{status}   "),
            Style::default().fg(Color::Yellow),
        ));
    }
    spans.push(Span::styled(
        format!(
            "(esc) quit  (l) {}  (a) panel",
            app.flow.language().toggle().code()
        ),
        dim,
    ));
    Paragraph::new(Line::from(spans))
        .alignment(Alignment::Center)
        .render(area, buf);
}

fn centered(width: u16, height: u16, area: Rect) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    )
}

fn panel_lines<C: Clock + Clone>(
    app: &App<C>,
    panel: &ControlPanel,
    texts: &'static Texts,
) -> Vec<Line<'static>> {
    let bold = Style::default().add_modifier(Modifier::BOLD);
    let masked = "*".repeat(panel.input.chars().count());
    let mut lines = vec![];

    match panel.collecting {
        Some(PanelInput::Password) => {
            lines.push(Line::raw(texts.get("admin_password")));
            lines.push(Line::styled(format!("> {masked}"), bold));
        }
        Some(PanelInput::ClearPassword) => {
            lines.push(Line::styled(texts.get("clear_sheet"), bold));
            lines.push(Line::raw(texts.get("admin_password")));
            lines.push(Line::styled(format!("> {masked}"), bold));
        }
        Some(PanelInput::ClearCode) => {
            lines.push(Line::styled(texts.get("verification_code_title"), bold));
            lines.push(Line::raw(texts.get("verification_code_message")));
            lines.push(Line::raw(texts.get("verification_code_expiry")));
            lines.push(Line::styled(format!("> {}", panel.input), bold));
        }
        None => {
            let mode = if app.flow.admin().mode_active() { "on" } else { "off" };
            let commands = [
                ('m', texts.format("admin_mode_toggle", &[&mode])),
                ('i', texts.get("skip_instructions").to_string()),
                ('n', texts.get("skip_no_change_training").to_string()),
                ('c', texts.get("skip_change_training").to_string()),
                ('p', texts.get("skip_practice").to_string()),
                ('s', texts.get("skip_all_trials").to_string()),
                ('b', texts.get("bypass_participation").to_string()),
                ('x', texts.get("clear_local").to_string()),
                ('w', texts.get("clear_sheet").to_string()),
                ('o', texts.get("open_spreadsheet").to_string()),
                ('l', "logout".to_string()),
                ('q', texts.get("close_panel").to_string()),
            ];
            lines.extend(
                commands
                    .into_iter()
                    .map(|(key, label)| Line::raw(format!("({key}) {label}"))),
            );
        }
    }

    if let Some(message) = &panel.message {
        lines.push(Line::raw(""));
        lines.push(Line::styled(
            message.clone(),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::ITALIC),
        ));
    }
    lines
}

fn render_panel<C: Clock + Clone>(app: &App<C>, panel: &ControlPanel, area: Rect, buf: &mut Buffer) {
    let texts = app.texts();
    let rect = centered(PANEL_WIDTH, PANEL_HEIGHT, area);
    Clear.render(rect, buf);
    Paragraph::new(panel_lines(app, panel, texts))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(texts.get("control_panel_header")),
        )
        .wrap(Wrap { trim: true })
        .render(rect, buf);
}
