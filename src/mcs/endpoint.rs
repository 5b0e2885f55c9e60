use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointChoice {
    Primary,
    Secondary,
}

impl EndpointChoice {
    pub fn other(self) -> Self {
        match self {
            EndpointChoice::Primary => EndpointChoice::Secondary,
            EndpointChoice::Secondary => EndpointChoice::Primary,
        }
    }
}

impl std::fmt::Display for EndpointChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointChoice::Primary => write!(f, "primary"),
            EndpointChoice::Secondary => write!(f, "secondary"),
        }
    }
}

/// Which MCS host reads go to
///
/// Switches to the other host after `failover_threshold` consecutive failures and stays
/// there until that host fails just as often. Lives for the duration of a run only.
#[derive(Debug, Clone)]
pub struct EndpointState {
    primary: String,
    secondary: String,
    active: EndpointChoice,
    consecutive_failures: u32,
    failover_threshold: u32,
}

impl EndpointState {
    pub fn new(
        primary: impl Into<String>,
        secondary: impl Into<String>,
        failover_threshold: u32,
    ) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
            active: EndpointChoice::Primary,
            consecutive_failures: 0,
            failover_threshold: failover_threshold.max(1),
        }
    }

    pub fn active(&self) -> EndpointChoice {
        self.active
    }

    pub fn url(&self, choice: EndpointChoice) -> &str {
        match choice {
            EndpointChoice::Primary => &self.primary,
            EndpointChoice::Secondary => &self.secondary,
        }
    }

    pub fn active_url(&self) -> &str {
        self.url(self.active)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                "{} endpoint recovered after {} failure(s)",
                self.active, self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    /// Count a failure against the active host, returns true if this caused a switch
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures < self.failover_threshold {
            return false;
        }

        let from = self.active;
        self.active = from.other();
        self.consecutive_failures = 0;
        warn!(
            "{from} endpoint failed {} times in a row, switching to {} ({})",
            self.failover_threshold,
            self.active,
            self.active_url()
        );
        true
    }
}
