//! Validation and rate limiting for events submitted by publishers.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::IntakeLimits;
use crate::models::{Event, EventKind};

const DEFAULT_EVENT_TYPE: &str = "donation";
const ANONYMOUS_USER: &str = "Anónimo";

/// Why a submitted event was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid data format")]
    NotAnObject,
    #[error("Event type must be a string")]
    InvalidType,
    #[error("Reserved event type: {0}")]
    ReservedType(String),
    #[error("Amount must be a number")]
    InvalidAmount,
    #[error("Amount must be positive")]
    NonPositiveAmount,
    #[error("Amount exceeds maximum (${0})")]
    AmountTooLarge(f64),
}

/// Validate and sanitize a publish request body into an event.
pub fn validate(body: &Value, limits: &IntakeLimits) -> Result<Event, ValidationError> {
    let fields = body.as_object().ok_or(ValidationError::NotAnObject)?;

    let kind = match fields.get("type") {
        None | Some(Value::Null) => EventKind::from(DEFAULT_EVENT_TYPE),
        Some(Value::String(name)) => EventKind::from(name.as_str()),
        Some(_) => return Err(ValidationError::InvalidType),
    };
    if kind.is_reserved() {
        return Err(ValidationError::ReservedType(kind.to_string()));
    }

    let user = text_field(body, "user")
        .map(|user| truncate(&user, limits.max_user_length))
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());

    let event = match kind {
        EventKind::Walker => Event::walker(&user),
        EventKind::Donation => {
            let amount = parse_amount(fields.get("amount"))?;
            if amount <= 0.0 {
                return Err(ValidationError::NonPositiveAmount);
            }
            if amount > limits.max_amount {
                return Err(ValidationError::AmountTooLarge(limits.max_amount));
            }
            let message = text_field(body, "message").unwrap_or_default();
            Event::donation(
                &user,
                (amount * 100.0).round() / 100.0,
                &truncate(&message, limits.max_message_length),
            )
        }
        EventKind::ChatMessage => {
            let text = text_field(body, "text").unwrap_or_default();
            Event::chat_message(&user, &truncate(&text, limits.max_message_length))
        }
        other => Event::custom(other.as_str(), body.clone()),
    };
    Ok(event)
}

/// Turn a subscriber message into an event for the other subscribers.
///
/// Objects naming a non-reserved `type` pass the same checks as published
/// events. Anything else is wrapped as a `message` event.
pub fn relayed(body: Value, limits: &IntakeLimits) -> Result<Event, ValidationError> {
    let typed = body
        .get("type")
        .and_then(Value::as_str)
        .map(EventKind::from)
        .is_some_and(|kind| !kind.is_reserved());
    if typed {
        validate(&body, limits)
    } else {
        Ok(Event::custom("message", body))
    }
}

/// String form of a field; non-string scalars are stringified.
fn text_field(body: &Value, name: &str) -> Option<String> {
    match body.get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_amount(value: Option<&Value>) -> Result<f64, ValidationError> {
    let amount = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    amount
        .filter(|a| a.is_finite())
        .ok_or(ValidationError::InvalidAmount)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Sliding-window request limiter keyed by client address.
///
/// Clients whose window has emptied are forgotten, so memory stays bounded by
/// the number of clients active within one window.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: HashMap<String, VecDeque<Instant>>,
}

/// Serializable rate limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterState {
    pub disabled: bool,
    pub max_requests: usize,
    pub window_secs: u64,
    pub total_requests_last_window: usize,
    pub active_clients: usize,
}

impl RateLimiter {
    /// Allow `max_requests` per `window`; zero disables limiting.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: HashMap::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max_requests == 0
    }

    /// Record a request from `client` if it is within budget.
    pub fn check(&mut self, client: &str) -> bool {
        self.check_at(client, Instant::now())
    }

    pub fn check_at(&mut self, client: &str, now: Instant) -> bool {
        if self.is_disabled() {
            return true;
        }
        self.prune(now);

        let window = self.requests.entry(client.to_string()).or_default();
        if window.len() >= self.max_requests {
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn get_state(&mut self) -> RateLimiterState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&mut self, now: Instant) -> RateLimiterState {
        self.prune(now);
        RateLimiterState {
            disabled: self.is_disabled(),
            max_requests: self.max_requests,
            window_secs: self.window.as_secs(),
            total_requests_last_window: self.requests.values().map(VecDeque::len).sum(),
            active_clients: self.requests.len(),
        }
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        self.requests.retain(|_, window| {
            while window.front().is_some_and(|&at| at <= cutoff) {
                window.pop_front();
            }
            !window.is_empty()
        });
    }
}
