use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block as Frame, Borders, Paragraph, Widget, Wrap},
};

use crate::app::App;
use crate::clock::Clock;
use crate::engine::{Block, Feedback, Phase};
use crate::flow::{SaveStatus, Stage};
use crate::lang::Texts;
use crate::ui::stimuli::{fit_field, render_stimuli};
use crate::util::{mean, std_dev};

/// A UI Screen boundary: renders one stage of the experiment
pub trait Screen<C: Clock + Clone> {
    fn render(&self, app: &App<C>, area: Rect, buf: &mut Buffer);
}

fn alignment(texts: &Texts) -> Alignment {
    if texts.language().is_rtl() {
        Alignment::Right
    } else {
        Alignment::Left
    }
}

fn paragraph<'a>(lines: Vec<Line<'a>>, texts: &Texts) -> Paragraph<'a> {
    Paragraph::new(lines)
        .alignment(alignment(texts))
        .wrap(Wrap { trim: true })
}

fn bold() -> Style {
    Style::default().add_modifier(Modifier::BOLD)
}

pub struct ConnectingScreen;

impl<C: Clock + Clone> Screen<C> for ConnectingScreen {
    fn render(&self, _app: &App<C>, area: Rect, buf: &mut Buffer) {
        Paragraph::new(Span::styled("…", bold()))
            .alignment(Alignment::Center)
            .render(area, buf);
    }
}

pub struct ConnectionErrorScreen;

impl<C: Clock + Clone> Screen<C> for ConnectionErrorScreen {
    fn render(&self, app: &App<C>, area: Rect, buf: &mut Buffer) {
        let t = app.texts();
        paragraph(
            vec![
                Line::styled(t.get("connection_error_1"), bold().fg(Color::Red)),
                Line::raw(t.get("connection_error_2")),
                Line::raw(""),
                Line::styled(t.get("retry_connection"), bold()),
            ],
            t,
        )
        .render(area, buf);
    }
}

pub struct ParticipationScreen;

impl<C: Clock + Clone> Screen<C> for ParticipationScreen {
    fn render(&self, app: &App<C>, area: Rect, buf: &mut Buffer) {
        let t = app.texts();
        let mut lines = vec![
            Line::styled(t.get("participation_title"), bold().fg(Color::Yellow)),
            Line::raw(t.get("participation_text")),
        ];
        if app.flow.admin().is_authenticated() {
            lines.push(Line::raw(""));
            lines.push(Line::styled(
                format!("[a] {}", t.get("bypass_participation")),
                Style::default().add_modifier(Modifier::ITALIC),
            ));
        }
        paragraph(lines, t).render(area, buf);
    }
}

pub struct InstructionsScreen;

impl<C: Clock + Clone> Screen<C> for InstructionsScreen {
    fn render(&self, app: &App<C>, area: Rect, buf: &mut Buffer) {
        let t = app.texts();
        let limit = app.flow.engine().config().response_time_limit_secs();
        let mut lines = vec![
            Line::styled(t.get("instructions_title"), bold()),
            Line::raw(""),
            Line::raw(t.get("instructions_text_1")),
            Line::raw(t.get("instructions_text_2")),
        ];
        lines.extend(
            ["instructions_step_1", "instructions_step_2", "instructions_step_3", "instructions_step_4"]
                .iter()
                .enumerate()
                .map(|(i, key)| Line::raw(format!("{}. {}", i + 1, t.get(key)))),
        );
        lines.push(Line::raw(t.get("instructions_text_3")));
        lines.push(Line::raw(t.get("instructions_text_4")));
        lines.push(Line::styled(
            t.format("instructions_text_5", &[&limit]),
            bold().fg(Color::Yellow),
        ));
        lines.push(Line::raw(""));

        let remaining = app.flow.countdown_remaining();
        if remaining > 0 {
            lines.push(Line::styled(
                t.format("instructions_timer_remaining", &[&remaining]),
                Style::default().add_modifier(Modifier::DIM),
            ));
        } else {
            lines.push(Line::styled(t.get("instructions_understood"), bold().fg(Color::Green)));
        }
        paragraph(lines, t).render(area, buf);
    }
}

/// Any of the four trial blocks: header, stimulus field, feedback
pub struct TrialScreen {
    pub block: Block,
}

impl TrialScreen {
    fn header(&self, app: &App<impl Clock + Clone>) -> Vec<Line<'static>> {
        let t = app.texts();
        let engine = app.flow.engine();
        let cfg = engine.config();
        let limit = cfg.response_time_limit_secs();
        let idle = engine.phase() == Phase::Idle;

        let (title, intro): (&str, Vec<String>) = match self.block {
            Block::NoChangeTraining => (
                "no_change_title",
                ["no_change_text_1", "no_change_text_2", "no_change_text_3", "no_change_text_4"]
                    .iter()
                    .map(|k| t.get(k).to_string())
                    .collect(),
            ),
            Block::ChangeTraining => (
                "change_title",
                ["change_text_1", "change_text_2", "change_text_3", "change_text_4"]
                    .iter()
                    .map(|k| t.get(k).to_string())
                    .collect(),
            ),
            Block::Practice => (
                "practice_title",
                vec![
                    t.format("practice_text_1", &[&cfg.practice_trials]),
                    t.get("practice_text_2").to_string(),
                    t.format("practice_text_3", &[&cfg.practice_trials]),
                    t.format("practice_text_4", &[&limit]),
                ],
            ),
            Block::Main => ("", vec![t.get("main_instructions").to_string()]),
        };

        let mut lines = vec![];
        match self.block {
            Block::Main => {
                let progress = engine.progress();
                let shown = (progress.current_trial + 1).min(progress.total_trials);
                lines.push(Line::styled(
                    t.format("trial_counter", &[&shown, &progress.total_trials]),
                    bold(),
                ));
            }
            Block::Practice => {
                let practice = engine.practice();
                let shown = (practice.practice_index + 1).min(practice.trials.len());
                lines.push(Line::styled(t.get(title).to_string(), bold()));
                lines.push(Line::raw(format!(
                    "{}   {}",
                    t.format("practice_trial_number", &[&shown, &practice.trials.len()]),
                    t.format("practice_attempt", &[&practice.attempt_number]),
                )));
            }
            _ => lines.push(Line::styled(t.get(title).to_string(), bold())),
        }
        if idle {
            lines.extend(intro.into_iter().map(Line::raw));
        }
        lines
    }

    fn footer(&self, app: &App<impl Clock + Clone>) -> Vec<Line<'static>> {
        let t = app.texts();
        let engine = app.flow.engine();
        let screen = app.screen();
        let mut lines = vec![];

        if screen.timeout_notice {
            lines.push(Line::styled(
                t.get("timeout_message").to_string(),
                bold().fg(Color::Red),
            ));
        }
        if let Some((block, feedback)) = screen.feedback {
            let practice_n = engine.config().practice_trials;
            let (text, color) = match (block, feedback) {
                (Block::NoChangeTraining, Feedback::Correct) => {
                    (t.get("no_change_feedback_correct").to_string(), Color::Green)
                }
                (Block::NoChangeTraining, _) => {
                    (t.get("no_change_feedback_incorrect").to_string(), Color::Red)
                }
                (Block::ChangeTraining, Feedback::Correct) => {
                    (t.get("change_feedback_correct").to_string(), Color::Green)
                }
                (Block::ChangeTraining, _) => {
                    (t.get("change_feedback_incorrect").to_string(), Color::Red)
                }
                (_, Feedback::Correct) => (t.get("practice_feedback_correct").to_string(), Color::Green),
                (_, Feedback::PracticeComplete) => {
                    (t.get("practice_feedback_complete").to_string(), Color::Green)
                }
                (_, Feedback::Incorrect) => (
                    t.format("practice_feedback_incorrect", &[&practice_n]),
                    Color::Red,
                ),
            };
            lines.push(Line::styled(text, bold().fg(color)));
        }

        if screen.responses_enabled {
            lines.push(Line::styled(t.get("response_keys").to_string(), bold()));
        } else if engine.phase() == Phase::Idle {
            let hint = match self.block {
                Block::Main => "start_button",
                Block::Practice => "start_practice",
                _ if engine.session().current_layout.is_empty() => "start_training",
                _ => "training_retry",
            };
            lines.push(Line::styled(
                t.get(hint).to_string(),
                Style::default().add_modifier(Modifier::ITALIC),
            ));
        }
        lines
    }
}

impl<C: Clock + Clone> Screen<C> for TrialScreen {
    fn render(&self, app: &App<C>, area: Rect, buf: &mut Buffer) {
        let t = app.texts();
        let header = self.header(app);
        let footer = self.footer(app);

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(header.len() as u16 + 1),
                Constraint::Min(4),
                Constraint::Length(footer.len().max(1) as u16),
            ])
            .split(area);

        paragraph(header, t).render(chunks[0], buf);

        let cfg = app.flow.engine().config();
        let frame = Frame::default().borders(Borders::ALL);
        let inner = frame.inner(chunks[1]);
        let field = fit_field(cfg, inner);
        frame.render(
            Rect::new(field.x.saturating_sub(1), field.y.saturating_sub(1), field.width + 2, field.height + 2)
                .intersection(chunks[1]),
            buf,
        );
        if let Some((layout, colors)) = &app.screen().stimuli {
            render_stimuli(cfg, layout, colors, field, buf);
        }

        Paragraph::new(footer)
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true })
            .render(chunks[2], buf);
    }
}

pub struct FinishedScreen;

impl<C: Clock + Clone> Screen<C> for FinishedScreen {
    fn render(&self, app: &App<C>, area: Rect, buf: &mut Buffer) {
        let t = app.texts();
        let mut lines = vec![Line::styled(t.get("thank_you"), bold())];

        match app.flow.save_status() {
            SaveStatus::NotAttempted => lines.push(Line::raw(t.get("saving"))),
            SaveStatus::Saved => {
                lines.push(Line::styled(t.get("results_saved"), Style::default().fg(Color::Green)))
            }
            SaveStatus::Failed(reason) => {
                lines.push(Line::styled(
                    format!("{} {}", t.get("error_saving"), reason),
                    Style::default().fg(Color::Red),
                ));
                lines.push(Line::styled(t.get("retry_button"), bold()));
            }
        }

        if let Some(code) = app.flow.completion_code() {
            lines.push(Line::raw(""));
            lines.push(Line::raw(t.get("completion_code_text")));
            lines.push(Line::styled(
                code.to_string(),
                bold().fg(Color::Cyan).add_modifier(Modifier::UNDERLINED),
            ));
        }

        if app.flow.admin().privileged_controls_visible() {
            let session = app.flow.engine().session();
            let times = &session.response_times;
            lines.push(Line::raw(""));
            lines.push(Line::styled(t.get("results_title"), bold()));
            lines.push(Line::raw(format!(
                "{} {}",
                t.get("trials_completed"),
                session.current_trial_index
            )));
            lines.push(Line::raw(format!(
                "{} {}",
                t.get("correct_responses"),
                session.correct_count
            )));
            lines.push(Line::raw(format!(
                "{} {:.1}%",
                t.get("accuracy"),
                session.accuracy_pct()
            )));
            lines.push(Line::raw(format!(
                "rt {:.2}s ± {:.2}s",
                mean(times).unwrap_or(0.0),
                std_dev(times).unwrap_or(0.0)
            )));
        }

        paragraph(lines, t).render(area, buf);
    }
}

/// Helper to construct the appropriate screen for the current stage
pub fn current_screen<C: Clock + Clone>(stage: Stage) -> Box<dyn Screen<C>> {
    match stage {
        Stage::Connecting => Box::new(ConnectingScreen),
        Stage::ConnectionError => Box::new(ConnectionErrorScreen),
        Stage::ParticipationWarning => Box::new(ParticipationScreen),
        Stage::Instructions => Box::new(InstructionsScreen),
        Stage::Finished => Box::new(FinishedScreen),
        stage => Box::new(TrialScreen {
            block: stage.block().unwrap_or(Block::Main),
        }),
    }
}
