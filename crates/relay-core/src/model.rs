//! Model routing for the Agent Invoker: a light/heavy tier choice plus a
//! circuit breaker tracking consecutive failures and rate-limit backoff,
//! adapted from the router's model circuit breaker. The ensemble-era
//! `ModelId` set (one entry per specific model) is replaced with the two
//! logical tiers the relay actually routes between.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Light,
    Heavy,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Light => "light",
            ModelTier::Heavy => "heavy",
        }
    }
}

/// Heuristic used by the claude-style invoker to pick an initial tier:
/// long prompts or ones containing reasoning-style keywords route to heavy.
pub fn classify_prompt(prompt: &str) -> ModelTier {
    const REASONING_KEYWORDS: &[&str] = &["architecture", "design tradeoffs", "prove", "root cause", "investigate"];
    if prompt.len() >= 1200 {
        return ModelTier::Heavy;
    }
    let lowered = prompt.to_lowercase();
    if REASONING_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return ModelTier::Heavy;
    }
    ModelTier::Light
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Tracks per-tier consecutive failures and rate-limit backoff.
pub struct CircuitBreaker {
    consecutive_failures: HashMap<ModelTier, u32>,
    last_failure_secs: HashMap<ModelTier, u64>,
    rate_limit_hits: HashMap<ModelTier, u32>,
    rate_limit_until: HashMap<ModelTier, u64>,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(3, 60)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        CircuitBreaker {
            consecutive_failures: HashMap::new(),
            last_failure_secs: HashMap::new(),
            rate_limit_hits: HashMap::new(),
            rate_limit_until: HashMap::new(),
            failure_threshold,
            cooldown_secs,
        }
    }

    pub fn record_success(&mut self, tier: ModelTier) {
        self.consecutive_failures.insert(tier, 0);
        self.rate_limit_hits.insert(tier, 0);
    }

    pub fn record_failure(&mut self, tier: ModelTier) {
        let count = self.consecutive_failures.entry(tier).or_insert(0);
        *count += 1;
        self.last_failure_secs.insert(tier, unix_now());
    }

    pub fn record_rate_limit(&mut self, tier: ModelTier) {
        let hits = self.rate_limit_hits.entry(tier).or_insert(0);
        *hits += 1;
        let backoff = 2u64.saturating_mul(2u64.saturating_pow(hits.saturating_sub(1))).min(120);
        self.rate_limit_until.insert(tier, unix_now() + backoff);
    }

    pub fn rate_limit_cooldown(&self, tier: ModelTier) -> Option<u64> {
        let until = *self.rate_limit_until.get(&tier)?;
        let now = unix_now();
        if until > now {
            Some(until - now)
        } else {
            None
        }
    }

    pub fn state(&self, tier: ModelTier) -> CircuitState {
        if self.rate_limit_cooldown(tier).is_some() {
            return CircuitState::Open;
        }
        let failures = *self.consecutive_failures.get(&tier).unwrap_or(&0);
        if failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        let last = *self.last_failure_secs.get(&tier).unwrap_or(&0);
        if unix_now().saturating_sub(last) >= self.cooldown_secs {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn is_available(&self, tier: ModelTier) -> bool {
        !matches!(self.state(tier), CircuitState::Open)
    }

    pub fn failure_count(&self, tier: ModelTier) -> u32 {
        *self.consecutive_failures.get(&tier).unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_long_prompt_as_heavy() {
        let prompt = "x".repeat(2000);
        assert_eq!(classify_prompt(&prompt), ModelTier::Heavy);
    }

    #[test]
    fn classifies_short_prompt_as_light() {
        assert_eq!(classify_prompt("fix the typo"), ModelTier::Light);
    }

    #[test]
    fn classifies_reasoning_keyword_as_heavy() {
        assert_eq!(classify_prompt("please investigate this bug"), ModelTier::Heavy);
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(2, 60);
        cb.record_failure(ModelTier::Heavy);
        assert!(cb.is_available(ModelTier::Heavy));
        cb.record_failure(ModelTier::Heavy);
        assert!(!cb.is_available(ModelTier::Heavy));
    }

    #[test]
    fn success_resets_failure_count() {
        let mut cb = CircuitBreaker::new(2, 60);
        cb.record_failure(ModelTier::Heavy);
        cb.record_success(ModelTier::Heavy);
        assert_eq!(cb.failure_count(ModelTier::Heavy), 0);
    }

    #[test]
    fn rate_limit_backoff_grows_and_caps() {
        let mut cb = CircuitBreaker::new(99, 60);
        cb.record_rate_limit(ModelTier::Light);
        let first = cb.rate_limit_cooldown(ModelTier::Light).unwrap();
        assert!(first <= 2);
        for _ in 0..10 {
            cb.record_rate_limit(ModelTier::Light);
        }
        let capped = cb.rate_limit_cooldown(ModelTier::Light).unwrap();
        assert!(capped <= 120);
    }
}
