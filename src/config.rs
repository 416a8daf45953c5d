//! Tunable limits for session state.

/// Limits applied by the ratchet engine and the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Maximum number of skipped message keys cached per session. The oldest entry
    /// is evicted once the cap is exceeded.
    pub max_skipped_keys: usize,

    /// Maximum number of message keys a single envelope may force the receiver to
    /// derive ahead of its chain.
    pub max_skip_per_message: u32,

    /// Number of superseded receiving chains kept around for late messages
    pub max_receiving_chains: usize,

    /// Superseded sessions kept per peer so in-flight messages on them still decrypt
    pub max_previous_sessions: usize,

    /// One-time prekeys generated when the manager is constructed
    pub initial_one_time_prekeys: u32,
}

impl SessionConfig {
    #[must_use]
    pub fn with_max_skipped_keys(mut self, max_skipped_keys: usize) -> Self {
        self.max_skipped_keys = max_skipped_keys;
        self
    }

    #[must_use]
    pub fn with_max_skip_per_message(mut self, max_skip_per_message: u32) -> Self {
        self.max_skip_per_message = max_skip_per_message;
        self
    }

    #[must_use]
    pub fn with_max_receiving_chains(mut self, max_receiving_chains: usize) -> Self {
        self.max_receiving_chains = max_receiving_chains;
        self
    }

    #[must_use]
    pub fn with_max_previous_sessions(mut self, max_previous_sessions: usize) -> Self {
        self.max_previous_sessions = max_previous_sessions;
        self
    }

    #[must_use]
    pub fn with_initial_one_time_prekeys(mut self, count: u32) -> Self {
        self.initial_one_time_prekeys = count;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: 1000,
            max_skip_per_message: 2000,
            max_receiving_chains: 5,
            max_previous_sessions: 3,
            initial_one_time_prekeys: 1,
        }
    }
}
