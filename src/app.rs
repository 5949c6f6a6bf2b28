use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use tracing::{info, warn};
use webbrowser::Browser;

use crate::clock::{Clock, SystemClock};
use crate::engine::{Block, Feedback, Presenter};
use crate::flow::{Experiment, FlowError, SaveStatus, Stage};
use crate::lang::{response_for_key, Texts};
use crate::layout::Position;
use crate::session::Progress;
use crate::submission::SubmitOutcome;

/// What the engine has asked to be on screen
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScreenModel {
    pub stimuli: Option<(Vec<Position>, Vec<usize>)>,
    pub responses_enabled: bool,
    pub timeout_notice: bool,
    pub feedback: Option<(Block, Feedback)>,
    pub progress: Option<Progress>,
    pub readout: Option<Duration>,
}

impl Presenter for ScreenModel {
    fn show_stimuli(&mut self, layout: &[Position], colors: &[usize]) {
        self.stimuli = Some((layout.to_vec(), colors.to_vec()));
    }

    fn clear_stimuli(&mut self) {
        self.stimuli = None;
    }

    fn set_responses_enabled(&mut self, enabled: bool) {
        self.responses_enabled = enabled;
    }

    fn show_timeout_notice(&mut self, visible: bool) {
        self.timeout_notice = visible;
    }

    fn show_feedback(&mut self, block: Block, feedback: Option<Feedback>) {
        self.feedback = feedback.map(|f| (block, f));
    }

    fn progress_changed(&mut self, progress: &Progress) {
        self.progress = Some(progress.clone());
    }

    fn elapsed_readout(&mut self, elapsed: Option<Duration>) {
        self.readout = elapsed;
    }
}

/// What the control panel's text field is collecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelInput {
    Password,
    ClearPassword,
    ClearCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlPanel {
    pub input: String,
    /// `None` while the authenticated menu is shown
    pub collecting: Option<PanelInput>,
    pub message: Option<String>,
}

impl ControlPanel {
    fn new(authenticated: bool) -> Self {
        Self {
            input: String::new(),
            collecting: if authenticated {
                None
            } else {
                Some(PanelInput::Password)
            },
            message: None,
        }
    }
}

pub struct App<C: Clock + Clone = SystemClock> {
    pub flow: Experiment<C, ScreenModel>,
    pub panel: Option<ControlPanel>,
    pub status: Option<String>,
    pub should_quit: bool,
    spreadsheet_url: Option<String>,
}

impl<C: Clock + Clone> App<C> {
    pub fn new(flow: Experiment<C, ScreenModel>, spreadsheet_url: Option<String>) -> Self {
        Self {
            flow,
            panel: None,
            status: None,
            should_quit: false,
            spreadsheet_url,
        }
    }

    pub fn texts(&self) -> &'static Texts {
        self.flow.language().texts()
    }

    pub fn screen(&self) -> &ScreenModel {
        self.flow.engine().presenter()
    }

    pub fn on_tick(&mut self) {
        self.flow.tick();
    }

    pub fn on_focus_lost(&mut self) {
        self.flow.on_focus_lost();
        if let Some(panel) = &mut self.panel {
            *panel = ControlPanel::new(false);
        }
    }

    pub fn on_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }
        if self.panel.is_some() {
            self.on_panel_key(key);
            return;
        }

        match key.code {
            KeyCode::Esc => self.should_quit = true,
            KeyCode::Enter | KeyCode::Char(' ') => self.on_continue(),
            KeyCode::Char('a') => {
                self.panel = Some(ControlPanel::new(self.flow.admin().is_authenticated()));
            }
            KeyCode::Char('l') => {
                let next = self.flow.language().toggle();
                self.flow.set_language(next);
            }
            KeyCode::Char('r') if self.flow.stage() == Stage::Finished => self.retry_save(),
            KeyCode::Char(c) => {
                if let Some(response) = response_for_key(c) {
                    self.flow.respond(response);
                }
            }
            _ => {}
        }
    }

    fn on_continue(&mut self) {
        let result = match self.flow.stage() {
            Stage::ConnectionError => self.flow.retry_connection().map(|_| ()),
            Stage::Instructions => self.flow.acknowledge_instructions(),
            stage if stage.block().is_some() => self.flow.start_trial(),
            _ => Ok(()),
        };
        match result {
            Ok(()) => self.status = None,
            Err(FlowError::StillReading(_)) | Err(FlowError::Engine(_)) => {}
            Err(err) => self.status = Some(err.to_string()),
        }
    }

    fn retry_save(&mut self) {
        if !matches!(self.flow.save_status(), SaveStatus::Failed(_)) {
            return;
        }
        let texts = self.texts();
        self.status = match self.flow.retry_save() {
            Ok(SubmitOutcome::Failed(reason)) => {
                Some(format!("{} {}", texts.get("error_saving"), reason))
            }
            Ok(_) => Some(texts.get("results_saved").to_string()),
            Err(err) => Some(err.to_string()),
        };
    }

    /// Open the configured results spreadsheet in the system browser.
    pub fn open_spreadsheet(&mut self) -> Result<(), String> {
        self.flow.admin().authorize().map_err(|e| e.to_string())?;
        let url = self
            .spreadsheet_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| "no spreadsheet url configured".to_string())?;
        if !Browser::is_available() {
            return Err("no browser available".to_string());
        }
        info!(%url, "opening spreadsheet");
        webbrowser::open(url).map_err(|e| e.to_string())
    }

    fn on_panel_key(&mut self, key: KeyEvent) {
        let Some(panel) = self.panel.as_mut() else {
            return;
        };

        if key.code == KeyCode::Esc {
            if panel.collecting.is_some() && self.flow.admin().is_authenticated() {
                if panel.collecting == Some(PanelInput::ClearCode) {
                    self.flow.cancel_clear();
                }
                panel.collecting = None;
                panel.input.clear();
            } else {
                self.panel = None;
            }
            return;
        }

        match panel.collecting {
            Some(input) => match key.code {
                KeyCode::Enter => {
                    let value = std::mem::take(&mut panel.input);
                    self.submit_panel_input(input, &value);
                }
                KeyCode::Backspace => {
                    panel.input.pop();
                }
                KeyCode::Char(c) => panel.input.push(c),
                _ => {}
            },
            None => {
                if let KeyCode::Char(c) = key.code {
                    self.run_panel_command(c);
                }
            }
        }
    }

    fn submit_panel_input(&mut self, input: PanelInput, value: &str) {
        let texts = self.texts();
        let (collecting, message) = match input {
            PanelInput::Password => match self.flow.login(value) {
                Ok(()) => (None, None),
                Err(FlowError::Admin(crate::admin::AdminError::PasswordRequired)) => {
                    (Some(input), Some(texts.get("password_required").to_string()))
                }
                Err(err) => {
                    warn!(%err, "control panel login failed");
                    (Some(input), Some(texts.get("login_error").to_string()))
                }
            },
            PanelInput::ClearPassword => match self.flow.request_clear_code(value) {
                Ok(()) => (
                    Some(PanelInput::ClearCode),
                    Some(texts.get("code_sent").to_string()),
                ),
                Err(err) => (Some(input), Some(err.to_string())),
            },
            PanelInput::ClearCode => match self.flow.confirm_clear(value) {
                Ok(()) => (None, Some(texts.get("sheet_cleared").to_string())),
                Err(FlowError::Admin(crate::admin::AdminError::InvalidCodeFormat)) => {
                    (Some(input), Some(texts.get("invalid_code_format").to_string()))
                }
                Err(err) => (None, Some(err.to_string())),
            },
        };
        if let Some(panel) = self.panel.as_mut() {
            panel.collecting = collecting;
            panel.message = message;
        }
    }

    fn run_panel_command(&mut self, command: char) {
        let texts = self.texts();
        let result: Result<Option<String>, String> = match command {
            'm' => {
                let active = !self.flow.admin().mode_active();
                self.flow
                    .set_admin_mode(active)
                    .map(|_| None)
                    .map_err(|e| e.to_string())
            }
            'i' => self.flow.skip_instructions().map(|_| None).map_err(|e| e.to_string()),
            'n' => self.flow.skip_no_change_training().map(|_| None).map_err(|e| e.to_string()),
            'c' => self.flow.skip_change_training().map(|_| None).map_err(|e| e.to_string()),
            'p' => self.flow.skip_practice().map(|_| None).map_err(|e| e.to_string()),
            's' => self.flow.skip_all_trials().map(|_| None).map_err(|e| e.to_string()),
            'b' => self
                .flow
                .bypass_participation_check()
                .map(|_| None)
                .map_err(|e| e.to_string()),
            'x' => self
                .flow
                .clear_local_data()
                .map(|n| Some(texts.format("local_cleared", &[&n])))
                .map_err(|e| e.to_string()),
            'w' => {
                if let Some(panel) = self.panel.as_mut() {
                    panel.collecting = Some(PanelInput::ClearPassword);
                }
                Ok(None)
            }
            'o' => self.open_spreadsheet().map(|_| None),
            'l' => {
                self.flow.logout();
                if let Some(panel) = self.panel.as_mut() {
                    *panel = ControlPanel::new(false);
                }
                Ok(None)
            }
            'q' => {
                self.panel = None;
                return;
            }
            _ => return,
        };

        if let Some(panel) = self.panel.as_mut() {
            panel.message = match result {
                Ok(message) => message,
                Err(err) => Some(err),
            };
        }
    }
}
