//! Completion payload, completion code and the one-shot save to the endpoint.

use std::rc::Rc;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::device::hash_u32;
use crate::lang::Language;
use crate::network::{post_json, Endpoint, Reply};
use crate::session::SessionState;

pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LEN: usize = 8;

/// Eight characters: four derived from the device id, so codes from one
/// device look related, and four drawn at random.
///
/// The stable half is the device hash read five bits at a time from the
/// low end, one alphabet symbol per group.
pub fn completion_code<R: Rng + ?Sized>(device_id: &str, rng: &mut R) -> String {
    let hash = hash_u32(device_id);
    let stable = (0..CODE_LEN / 2).map(|i| {
        let group = (hash >> (5 * i)) & 0x1f;
        char::from(CODE_ALPHABET[group as usize])
    });
    let random = (0..CODE_LEN / 2)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect::<Vec<_>>();
    stable.chain(random).collect()
}

/// Who is submitting, and under which settings
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionContext {
    pub device_id: String,
    pub language: Language,
    pub admin_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub device_id: String,
    pub trials_completed: usize,
    pub correct_responses: usize,
    pub accuracy: String,
    pub completion_code: String,
    pub language: String,
    pub admin_mode: bool,
    pub response_times: String,
    pub trial_statuses: String,
    pub submitted_at: DateTime<Utc>,
}

impl CompletionPayload {
    pub fn build(session: &SessionState, ctx: &SubmissionContext, completion_code: String) -> Self {
        Self {
            device_id: ctx.device_id.clone(),
            trials_completed: session.current_trial_index,
            correct_responses: session.correct_count,
            accuracy: format!("{:.1}", session.accuracy_pct()),
            completion_code,
            language: ctx.language.code().to_string(),
            admin_mode: ctx.admin_mode,
            response_times: session
                .response_times
                .iter()
                .map(|t| format!("{t:.2}"))
                .join(","),
            trial_statuses: session.trial_outcomes.iter().join(","),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Delivery {
    Confirmed,
    Assumed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Sent(Delivery),
    AlreadySubmitted,
    Failed(String),
}

impl SubmitOutcome {
    pub fn delivery(&self) -> Option<Delivery> {
        match self {
            SubmitOutcome::Sent(d) => Some(*d),
            SubmitOutcome::AlreadySubmitted => None,
            SubmitOutcome::Failed(_) => Some(Delivery::Failed),
        }
    }
}

/// Builds the payload once and sends it until one send succeeds.
pub struct Submitter {
    endpoint: Rc<dyn Endpoint>,
    prepared: Option<CompletionPayload>,
}

impl Submitter {
    pub fn new(endpoint: Rc<dyn Endpoint>) -> Self {
        Self {
            endpoint,
            prepared: None,
        }
    }

    pub fn payload(&self) -> Option<&CompletionPayload> {
        self.prepared.as_ref()
    }

    pub fn completion_code(&self) -> Option<&str> {
        self.prepared.as_ref().map(|p| p.completion_code.as_str())
    }

    /// Send the session's results. A session already marked submitted is
    /// left alone; a failed send keeps the prepared payload so a retry
    /// sends exactly the same data and code.
    pub fn finalize<R: Rng + ?Sized>(
        &mut self,
        session: &mut SessionState,
        ctx: &SubmissionContext,
        rng: &mut R,
    ) -> SubmitOutcome {
        if session.data_submitted {
            info!("data already saved, skipping save");
            return SubmitOutcome::AlreadySubmitted;
        }

        let payload = self
            .prepared
            .get_or_insert_with(|| {
                let code = completion_code(&ctx.device_id, rng);
                info!(code = %code, "generated completion code");
                CompletionPayload::build(session, ctx, code)
            })
            .clone();

        info!(
            trials = payload.trials_completed,
            correct = payload.correct_responses,
            "saving results"
        );
        match post_json(self.endpoint.as_ref(), &payload) {
            Ok(reply) if reply.succeeded() => {
                session.data_submitted = true;
                let delivery = if reply == Reply::Assumed {
                    warn!("results delivered without confirmation");
                    Delivery::Assumed
                } else {
                    Delivery::Confirmed
                };
                info!(%delivery, "results saved");
                SubmitOutcome::Sent(delivery)
            }
            Ok(Reply::Confirmed(body)) => {
                error!(reason = %body.reason(), "endpoint refused results");
                SubmitOutcome::Failed(body.reason())
            }
            Ok(Reply::Assumed) => SubmitOutcome::Failed("unconfirmed reply".into()),
            Err(err) => {
                error!(%err, "error saving results");
                SubmitOutcome::Failed(err.to_string())
            }
        }
    }
}
