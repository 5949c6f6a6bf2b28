//! Admin authorization gate.
//!
//! Authentication lives only in [`SessionAuth`], which is created fresh for
//! every run and dropped on focus loss; the admin-mode toggle lives in the
//! durable store. Privileged operations ask for an [`AdminGrant`] at the
//! moment they run, so controls rendered while authenticated stop working
//! as soon as authentication lapses.

use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::network::{post_json, AdminRequest, Endpoint, Reply, TransportError};
use crate::storage::{self, DurableStore, ADMIN_MODE_ACTIVE_KEY};

/// How long an emailed verification code stays valid.
pub const CLEAR_CODE_TTL: Duration = Duration::from_secs(5 * 60);

pub const CLEAR_CODE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    LoggedOut,
    Authenticating,
    Authenticated,
}

#[derive(Debug, Error, PartialEq)]
pub enum AdminError {
    #[error("admin login required")]
    NotAuthenticated,
    #[error("password is required")]
    PasswordRequired,
    #[error("incorrect password")]
    WrongPassword,
    #[error("please enter a 6-digit code")]
    InvalidCodeFormat,
    #[error("no verification code has been requested")]
    NoCodeRequested,
    #[error("verification code expired")]
    CodeExpired,
    #[error("verification code rejected: {0}")]
    CodeRejected(String),
    #[error("endpoint refused the request: {0}")]
    Refused(String),
    #[error("could not reach the endpoint: {0}")]
    Transport(String),
    #[error("could not update local storage: {0}")]
    Storage(String),
}

impl From<TransportError> for AdminError {
    fn from(err: TransportError) -> Self {
        AdminError::Transport(err.to_string())
    }
}

impl From<storage::StoreError> for AdminError {
    fn from(err: storage::StoreError) -> Self {
        AdminError::Storage(err.to_string())
    }
}

/// Proof that admin was authenticated when the grant was issued. It borrows
/// the gate, so it cannot be kept past the current call.
#[derive(Debug)]
pub struct AdminGrant<'a> {
    _gate: PhantomData<&'a ()>,
}

/// In-memory, per-run authentication state
#[derive(Debug, Default)]
pub struct SessionAuth {
    state: AuthState,
}

impl SessionAuth {
    pub fn state(&self) -> AuthState {
        self.state
    }
}

#[derive(Debug)]
struct PendingClear {
    admin_password: String,
    requested_at: Duration,
}

pub struct AdminGate<C: Clock> {
    session: SessionAuth,
    durable: Rc<dyn DurableStore>,
    endpoint: Rc<dyn Endpoint>,
    local_password: Option<String>,
    clock: C,
    mode_active: bool,
    pending_clear: Option<PendingClear>,
}

impl<C: Clock> AdminGate<C> {
    /// Start logged out regardless of anything persisted.
    pub fn new(
        durable: Rc<dyn DurableStore>,
        endpoint: Rc<dyn Endpoint>,
        local_password: Option<String>,
        clock: C,
    ) -> Self {
        let mode_active = storage::get_flag(durable.as_ref(), ADMIN_MODE_ACTIVE_KEY);
        Self {
            session: SessionAuth::default(),
            durable,
            endpoint,
            local_password,
            clock,
            mode_active,
            pending_clear: None,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.session.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.state() == AuthState::Authenticated
    }

    pub fn mode_active(&self) -> bool {
        self.mode_active
    }

    /// Admin surfaces are shown only while the mode is on and the session
    /// is authenticated, even if the persisted toggle says otherwise.
    pub fn privileged_controls_visible(&self) -> bool {
        self.mode_active && self.is_authenticated()
    }

    pub fn authorize(&self) -> Result<AdminGrant<'_>, AdminError> {
        if self.is_authenticated() {
            Ok(AdminGrant {
                _gate: PhantomData,
            })
        } else {
            Err(AdminError::NotAuthenticated)
        }
    }

    /// Verify `password` with the endpoint, falling back to the locally
    /// configured password when the endpoint cannot give an answer.
    pub fn login(&mut self, password: &str) -> Result<(), AdminError> {
        if password.is_empty() {
            return Err(AdminError::PasswordRequired);
        }
        self.session.state = AuthState::Authenticating;

        let request = AdminRequest::AdminLogin {
            password: password.to_string(),
        };
        let verdict = match post_json(self.endpoint.as_ref(), &request) {
            Ok(Reply::Confirmed(body)) => Ok(body.is_success()),
            Ok(Reply::Assumed) => self.verify_locally(password).ok_or(AdminError::WrongPassword),
            Err(err) => {
                warn!(%err, "remote admin login unavailable, checking locally");
                self.verify_locally(password)
                    .ok_or_else(|| AdminError::from(err))
            }
        };

        match verdict {
            Ok(true) => {
                self.session.state = AuthState::Authenticated;
                info!("admin login successful");
                Ok(())
            }
            Ok(false) => {
                self.session.state = AuthState::LoggedOut;
                info!("admin login failed");
                Err(AdminError::WrongPassword)
            }
            Err(err) => {
                self.session.state = AuthState::LoggedOut;
                info!(%err, "admin login failed");
                Err(err)
            }
        }
    }

    fn verify_locally(&self, password: &str) -> Option<bool> {
        self.local_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|expected| expected == password)
    }

    pub fn logout(&mut self) {
        if self.session.state != AuthState::LoggedOut {
            info!("admin logged out");
        }
        self.session = SessionAuth::default();
        self.pending_clear = None;
    }

    /// Terminal lost focus: authentication does not survive it.
    pub fn on_focus_lost(&mut self) {
        if self.is_authenticated() {
            info!("focus lost, admin session ended");
        }
        self.logout();
    }

    /// Turn admin mode on or off. Turning it on needs a live login and does
    /// not start one; the toggle is left as it was on failure.
    pub fn set_mode_active(&mut self, active: bool) -> Result<(), AdminError> {
        if active && !self.is_authenticated() {
            info!("admin mode toggle refused, login first");
            return Err(AdminError::NotAuthenticated);
        }
        storage::set_flag(self.durable.as_ref(), ADMIN_MODE_ACTIVE_KEY, active)?;
        self.mode_active = active;
        info!(active, "admin mode toggled");
        Ok(())
    }

    /// Remove every participation record from the durable store.
    pub fn clear_local_data(&self) -> Result<usize, AdminError> {
        let _grant = self.authorize()?;
        let removed = storage::clear_participation(self.durable.as_ref())?;
        info!(removed, "local participation data cleared");
        Ok(removed)
    }

    /// First factor of the remote wipe: re-confirm the password and have a
    /// verification code sent out of band.
    pub fn request_clear_code(&mut self, password: &str) -> Result<(), AdminError> {
        self.authorize()?;
        if password.is_empty() {
            return Err(AdminError::PasswordRequired);
        }
        if self.verify_locally(password) == Some(false) {
            return Err(AdminError::WrongPassword);
        }

        let request = AdminRequest::RequestClearCode {
            admin_password: password.to_string(),
        };
        match post_json(self.endpoint.as_ref(), &request)? {
            Reply::Confirmed(body) if !body.is_success() => {
                warn!(reason = %body.reason(), "verification code not sent");
                return Err(AdminError::Refused(body.reason()));
            }
            Reply::Confirmed(_) => info!("verification code sent"),
            Reply::Assumed => info!("verification code request delivered unconfirmed"),
        }

        self.pending_clear = Some(PendingClear {
            admin_password: password.to_string(),
            requested_at: self.clock.now(),
        });
        Ok(())
    }

    pub fn clear_pending(&self) -> bool {
        self.pending_clear.is_some()
    }

    pub fn cancel_clear(&mut self) {
        self.pending_clear = None;
    }

    /// Second factor: submit the code and, if accepted, wipe remote data.
    pub fn confirm_clear(&mut self, code: &str) -> Result<(), AdminError> {
        self.authorize()?;
        let code = code.trim();
        if code.len() != CLEAR_CODE_LEN || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(AdminError::InvalidCodeFormat);
        }
        let pending = self
            .pending_clear
            .as_ref()
            .ok_or(AdminError::NoCodeRequested)?;
        if self.clock.now().saturating_sub(pending.requested_at) > CLEAR_CODE_TTL {
            self.pending_clear = None;
            info!("verification code expired");
            return Err(AdminError::CodeExpired);
        }

        let request = AdminRequest::ClearSheet {
            admin_password: pending.admin_password.clone(),
            verification_code: code.to_string(),
        };
        match post_json(self.endpoint.as_ref(), &request)? {
            Reply::Confirmed(body) if !body.is_success() => {
                warn!(reason = %body.reason(), "clear request rejected");
                Err(AdminError::CodeRejected(body.reason()))
            }
            reply => {
                self.pending_clear = None;
                if reply == Reply::Assumed {
                    warn!("clear request delivered unconfirmed");
                }
                info!("remote data cleared");
                Ok(())
            }
        }
    }
}
