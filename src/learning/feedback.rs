//! Feedback collection and aggregation.
//!
//! The collector keeps an append-only per-prompt feedback log plus per-user
//! sessions. Aggregation distills acceptance statistics, and the cross-user
//! analysis surfaces confusion patterns: prompt pairs users distinguish but
//! the current vector space does not, which drive contrastive space
//! adjustment.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Explicit user verdict on a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplicitFeedback {
    Accepted,
    Rejected,
}

/// Implicit behavioral signals attached to a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicitSignals {
    /// How many times the user asked for a regeneration
    pub regeneration_count: u32,
    /// How many manual edits followed
    pub edit_count: u32,
    /// Time spent looking at the result
    pub dwell_time_ms: u64,
    /// How many variations were clicked
    pub clicked_variants: u32,
}

/// One feedback event for a served result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// The prompt identity the result was generated for
    pub prompt_id: String,
    /// The served result
    pub result_id: String,
    /// Explicit verdict, when the user gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit: Option<ExplicitFeedback>,
    /// Behavioral signals
    #[serde(default)]
    pub implicit: ImplicitSignals,
    /// Submitting user, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Session the event belongs to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
}

impl FeedbackRecord {
    /// An accepted result.
    pub fn accepted(prompt_id: impl Into<String>, result_id: impl Into<String>) -> Self {
        Self::with_verdict(prompt_id, result_id, Some(ExplicitFeedback::Accepted))
    }

    /// A rejected result.
    pub fn rejected(prompt_id: impl Into<String>, result_id: impl Into<String>) -> Self {
        Self::with_verdict(prompt_id, result_id, Some(ExplicitFeedback::Rejected))
    }

    /// An implicit-only event.
    pub fn implicit_only(prompt_id: impl Into<String>, result_id: impl Into<String>) -> Self {
        Self::with_verdict(prompt_id, result_id, None)
    }

    fn with_verdict(
        prompt_id: impl Into<String>,
        result_id: impl Into<String>,
        explicit: Option<ExplicitFeedback>,
    ) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            result_id: result_id.into(),
            explicit,
            implicit: ImplicitSignals::default(),
            user_id: None,
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attribute the event to a user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach implicit signals.
    pub fn with_signals(mut self, implicit: ImplicitSignals) -> Self {
        self.implicit = implicit;
        self
    }
}

/// Per-user session lifecycle. Ended is terminal: events arriving after the
/// end are discarded with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Ended,
}

#[derive(Debug, Clone)]
struct UserSession {
    id: String,
    state: SessionState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

/// Distilled counts from the feedback log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPatterns {
    /// Records with an explicit accept
    pub accepted: usize,
    /// Records with an explicit reject
    pub rejected: usize,
    /// Records carrying only implicit signals
    pub implicit_only: usize,
    /// Prompts whose mean regeneration count signals dissatisfaction
    pub high_regeneration_prompts: Vec<String>,
}

/// Aggregate view of all collected feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSummary {
    /// Accepted / explicit verdicts, zero when no explicit feedback exists
    pub acceptance_rate: f32,
    /// Mean regeneration count across all records
    pub average_regeneration_count: f32,
    /// Distilled counts
    pub patterns: FeedbackPatterns,
}

/// A prompt pair users distinguish but the vector space does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossUserPattern {
    /// The confused pair, unordered
    pub prompt_pair: (String, String),
    /// Share of eligible users exhibiting the confusion, in [0, 1]
    pub confusion_rate: f32,
}

/// Append-only feedback log with per-user sessions.
#[derive(Debug, Default)]
pub struct FeedbackCollector {
    records: Vec<FeedbackRecord>,
    by_prompt: HashMap<String, Vec<usize>>,
    sessions: HashMap<String, UserSession>,
}

impl FeedbackCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart after an end) a session for a user. Returns the
    /// session id; an already-active session is kept and returned.
    pub fn start_session(&mut self, user_id: &str) -> String {
        if let Some(session) = self.sessions.get(user_id) {
            if session.state == SessionState::Active {
                warn!(user_id, "session already active, keeping it");
                return session.id.clone();
            }
        }
        let session = UserSession {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Active,
            started_at: Utc::now(),
            ended_at: None,
        };
        let id = session.id.clone();
        self.sessions.insert(user_id.to_string(), session);
        debug!(user_id, session = %id, "session started");
        id
    }

    /// End a user's session. Ended is terminal.
    pub fn end_session(&mut self, user_id: &str) -> bool {
        match self.sessions.get_mut(user_id) {
            Some(session) if session.state == SessionState::Active => {
                session.state = SessionState::Ended;
                session.ended_at = Some(Utc::now());
                debug!(user_id, session = %session.id, "session ended");
                true
            }
            Some(_) => {
                warn!(user_id, "session already ended, event discarded");
                false
            }
            None => {
                warn!(user_id, "no session to end");
                false
            }
        }
    }

    /// Session state for a user, if any session exists.
    pub fn session_state(&self, user_id: &str) -> Option<SessionState> {
        self.sessions.get(user_id).map(|session| session.state)
    }

    /// Append a feedback event.
    ///
    /// Events attributed to a user whose session has ended are discarded
    /// with a warning and `false` is returned. Events from users without a
    /// tracked session are accepted.
    pub fn record(&mut self, mut record: FeedbackRecord) -> bool {
        if let Some(user_id) = &record.user_id {
            match self.sessions.get(user_id) {
                Some(session) if session.state == SessionState::Ended => {
                    warn!(
                        user_id = %user_id,
                        prompt = %record.prompt_id,
                        "feedback after session end discarded"
                    );
                    return false;
                }
                Some(session) => {
                    record.session_id.get_or_insert_with(|| session.id.clone());
                }
                None => {}
            }
        }
        let index = self.records.len();
        self.by_prompt
            .entry(record.prompt_id.clone())
            .or_default()
            .push(index);
        self.records.push(record);
        true
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The full log, submission order.
    pub fn records(&self) -> &[FeedbackRecord] {
        &self.records
    }

    /// Events for one prompt, submission order.
    pub fn records_for_prompt(&self, prompt_id: &str) -> Vec<&FeedbackRecord> {
        self.by_prompt
            .get(prompt_id)
            .map(|indices| indices.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }

    /// The result a prompt most recently produced, if any feedback names it.
    pub fn result_for_prompt(&self, prompt_id: &str) -> Option<&str> {
        self.by_prompt
            .get(prompt_id)
            .and_then(|indices| indices.last())
            .map(|&i| self.records[i].result_id.as_str())
    }

    /// Aggregate the whole log.
    pub fn aggregate(&self) -> FeedbackSummary {
        let mut accepted = 0usize;
        let mut rejected = 0usize;
        let mut implicit_only = 0usize;
        let mut regen_total = 0u64;
        for record in &self.records {
            match record.explicit {
                Some(ExplicitFeedback::Accepted) => accepted += 1,
                Some(ExplicitFeedback::Rejected) => rejected += 1,
                None => implicit_only += 1,
            }
            regen_total += u64::from(record.implicit.regeneration_count);
        }

        let explicit_total = accepted + rejected;
        let acceptance_rate = if explicit_total > 0 {
            accepted as f32 / explicit_total as f32
        } else {
            0.0
        };
        let average_regeneration_count = if self.records.is_empty() {
            0.0
        } else {
            regen_total as f32 / self.records.len() as f32
        };

        let mut high_regeneration_prompts: Vec<String> = self
            .by_prompt
            .iter()
            .filter_map(|(prompt_id, indices)| {
                let total: u64 = indices
                    .iter()
                    .map(|&i| u64::from(self.records[i].implicit.regeneration_count))
                    .sum();
                let mean = total as f32 / indices.len() as f32;
                (mean >= 2.0).then(|| prompt_id.clone())
            })
            .collect();
        high_regeneration_prompts.sort();

        FeedbackSummary {
            acceptance_rate,
            average_regeneration_count,
            patterns: FeedbackPatterns {
                accepted,
                rejected,
                implicit_only,
                high_regeneration_prompts,
            },
        }
    }

    /// Surface prompt pairs confused across users.
    ///
    /// Within one user's submission-ordered log, a rejected result followed
    /// by an accepted result for a different prompt marks the pair as
    /// confused for that user. The confusion rate of a pair is the share of
    /// eligible users (two or more events) exhibiting it, so a pattern only
    /// gains weight when independent users reproduce it.
    pub fn cross_user_patterns(&self) -> Vec<CrossUserPattern> {
        let mut per_user: HashMap<&str, Vec<&FeedbackRecord>> = HashMap::new();
        for record in &self.records {
            if let Some(user_id) = &record.user_id {
                per_user.entry(user_id.as_str()).or_default().push(record);
            }
        }

        let eligible = per_user.values().filter(|log| log.len() >= 2).count();
        if eligible == 0 {
            return Vec::new();
        }

        let mut pair_users: HashMap<(String, String), HashSet<&str>> = HashMap::new();
        for (user_id, log) in &per_user {
            for window in log.windows(2) {
                let (first, second) = (window[0], window[1]);
                if first.explicit == Some(ExplicitFeedback::Rejected)
                    && second.explicit == Some(ExplicitFeedback::Accepted)
                    && first.prompt_id != second.prompt_id
                {
                    let pair = if first.prompt_id <= second.prompt_id {
                        (first.prompt_id.clone(), second.prompt_id.clone())
                    } else {
                        (second.prompt_id.clone(), first.prompt_id.clone())
                    };
                    pair_users.entry(pair).or_default().insert(*user_id);
                }
            }
        }

        let mut patterns: Vec<CrossUserPattern> = pair_users
            .into_iter()
            .map(|(prompt_pair, users)| CrossUserPattern {
                prompt_pair,
                confusion_rate: (users.len() as f32 / eligible as f32).clamp(0.0, 1.0),
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.confusion_rate
                .partial_cmp(&a.confusion_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        patterns
    }
}
