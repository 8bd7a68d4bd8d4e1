/// Host selection for connection attempts.
///
/// The first attempt of every retry cycle goes to the primary host (or
/// a still-valid preferred fallback). Each later attempt in the same
/// cycle draws from the fallback list in randomized, non-repeating
/// order; once the list is exhausted the primary is tried again. All
/// inputs arrive via configuration, never package globals.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::debug;

struct PreferredHost {
    host: String,
    confirmed_at: Instant,
}

pub struct HostSelector {
    primary: String,
    fallbacks: Vec<String>,
    preference_ttl: Duration,
    preferred: Option<PreferredHost>,
    /// Shuffled order for the cycle in progress.
    cycle_order: Vec<String>,
    cycle_attempts: usize,
}

impl HostSelector {
    pub fn new(primary: String, fallbacks: Vec<String>, preference_ttl: Duration) -> Self {
        Self {
            primary,
            fallbacks,
            preference_ttl,
            preferred: None,
            cycle_order: Vec::new(),
            cycle_attempts: 0,
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn fallback_count(&self) -> usize {
        self.fallbacks.len()
    }

    /// Start a fresh disconnected/suspended retry cycle.
    pub fn begin_cycle(&mut self) {
        self.cycle_order = self.fallbacks.clone();
        self.cycle_order.shuffle(&mut rand::thread_rng());
        self.cycle_attempts = 0;
    }

    /// Host for the next connection attempt within the current cycle.
    pub fn next_host(&mut self) -> String {
        let attempt = self.cycle_attempts;
        self.cycle_attempts += 1;

        if attempt == 0 {
            return self.preferred_host().unwrap_or_else(|| self.primary.clone());
        }
        match self.cycle_order.get(attempt - 1) {
            Some(host) => host.clone(),
            // Fallbacks exhausted: back to the primary.
            None => self.primary.clone(),
        }
    }

    /// A fallback host that answered stays preferred until it fails or
    /// its preference expires.
    pub fn note_success(&mut self, host: &str) {
        if host == self.primary {
            // First success against the primary clears any preference.
            if self.preferred.take().is_some() {
                debug!("primary host '{}' healthy again, clearing fallback preference", host);
            }
            return;
        }
        debug!("fallback host '{}' confirmed, preferring it", host);
        self.preferred = Some(PreferredHost {
            host: host.to_string(),
            confirmed_at: Instant::now(),
        });
    }

    pub fn note_failure(&mut self, host: &str) {
        if let Some(preferred) = &self.preferred {
            if preferred.host == host {
                debug!("preferred host '{}' failed, falling back to primary", host);
                self.preferred = None;
            }
        }
    }

    fn preferred_host(&mut self) -> Option<String> {
        let expired = self
            .preferred
            .as_ref()
            .map(|p| p.confirmed_at.elapsed() >= self.preference_ttl)
            .unwrap_or(false);
        if expired {
            self.preferred = None;
        }
        self.preferred.as_ref().map(|p| p.host.clone())
    }
}
