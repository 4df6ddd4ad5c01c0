//! Context gathering cycle.
//!
//! When a fight is triggered the assistant is not interrupted right away.
//! Its exploration output is buffered as context for the fight, and the
//! cycle ends on whichever comes first: the assistant starts editing (a
//! transition signal), it goes idle, or the maximum gathering time passes.
//!
//! ## State machine
//!
//! ```text
//! (none)     → trigger accepted       → GATHERING
//! GATHERING  → transition after min   → finish
//!            → idle + context / max   → finish (on check)
//!            → force after min        → finish
//!            → cancel                 → (none)
//! finish     → already-done phrasing  → SKIPPED
//!            → otherwise              → FIRED
//! ```
//!
//! Only the bookkeeping lives here; the monitor turns a finished cycle into
//! cooldown, interrupts and the launch.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info};

/// Lines showing the assistant is still exploring. Plain prose is not
/// activity, so narration after the exploration counts as idle.
static ACTIVITY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^[⎿✳⏺]",
        r"(?:Read|Grep|Glob|Search|Explore|Task)\(",
        r"(?i)Reading\s|Searching\s|Exploring\s|Thinking|Improvising|Whirring|Churning",
        r"[├└]─",
        r"^\s*\d+→",
        r"(?i)thought for|tokens",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Lines showing the assistant is about to edit rather than explore.
static TRANSITION_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:Edit|Write|Update)\(",
        r"Entered plan mode",
        r"(?i)Let me implement",
        r"(?i)I'll (?:start|begin) (?:with|by|implement)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Broader phrasing used by the arena watch, which has no context to lose.
static IMPLEMENTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)I'll (?:now |go ahead |proceed )?(?:make|create|add|update|modify|edit|write)")
        .unwrap()
});

/// The assistant concluded there is nothing to build.
static ALREADY_DONE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)already (?:fully |completely )?(?:implemented|complete|functional|exists|done|present|in place)",
        r"(?i)no (?:changes|work|modifications) (?:needed|required|necessary)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

pub fn is_activity(line: &str) -> bool {
    ACTIVITY_RES.iter().any(|re| re.is_match(line))
}

pub fn is_transition(line: &str) -> bool {
    TRANSITION_RES.iter().any(|re| re.is_match(line))
}

/// Transition signals plus looser "I'll now make …" phrasing.
pub fn is_implementing(line: &str) -> bool {
    is_transition(line) || IMPLEMENTING_RE.is_match(line)
}

pub fn is_already_done(context: &str) -> bool {
    ALREADY_DONE_RES.iter().any(|re| re.is_match(context))
}

/// Timing knobs for a gathering cycle.
#[derive(Debug, Clone)]
pub struct GatheringConfig {
    /// Finish once no activity line arrived for this long.
    pub idle_timeout: Duration,
    /// Finish unconditionally after this long.
    pub max_timeout: Duration,
    /// Never finish on a signal before this much time has passed.
    pub min_wait: Duration,
    /// Interval of the periodic check.
    pub check_interval: Duration,
    /// The idle finish needs more raw context than this.
    pub min_context_chars: usize,
}

impl Default for GatheringConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(20),
            max_timeout: Duration::from_secs(120),
            min_wait: Duration::from_secs(3),
            check_interval: Duration::from_secs(2),
            min_context_chars: 50,
        }
    }
}

/// The single in-flight cycle.
#[derive(Debug, Clone)]
pub struct PendingCycle {
    pub task: String,
    pub context: String,
    pub started_at: Instant,
    pub last_activity: Instant,
    /// The scheduled check. Dropping the cycle drops the schedule with it.
    pub next_check_at: Instant,
    pub force_requested: bool,
}

impl PendingCycle {
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Why a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Transition,
    Idle,
    MaxTimeout,
    Forced,
}

/// A cycle taken out of the coordinator, ready for the fire/skip decision.
#[derive(Debug, Clone)]
pub struct FinishedCycle {
    pub task: String,
    pub context: String,
    pub reason: FinishReason,
    pub elapsed: Duration,
}

/// Result of feeding one line.
#[derive(Debug, Clone)]
pub enum FeedOutcome {
    /// No cycle is active.
    Inactive,
    /// Still gathering.
    Progress {
        task: String,
        context_length: usize,
        elapsed: Duration,
    },
    /// The line was a transition signal after the minimum wait.
    Finished(FinishedCycle),
}

/// Owns at most one pending cycle.
#[derive(Debug)]
pub struct Gatherer {
    config: GatheringConfig,
    cycle: Option<PendingCycle>,
}

impl Gatherer {
    pub fn new(config: GatheringConfig) -> Self {
        Self {
            config,
            cycle: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cycle.is_some()
    }

    #[cfg(test)]
    pub fn cycle(&self) -> Option<&PendingCycle> {
        self.cycle.as_ref()
    }

    /// Begin a cycle. An existing cycle is discarded together with its
    /// scheduled check.
    pub fn start(&mut self, task: &str, now: Instant) {
        if let Some(old) = self.cycle.take() {
            debug!(task = %old.task, "discarding pending cycle");
        }
        info!(task = %task, "context gathering started");
        self.cycle = Some(PendingCycle {
            task: task.to_string(),
            context: String::new(),
            started_at: now,
            last_activity: now,
            next_check_at: now + self.config.check_interval,
            force_requested: false,
        });
    }

    /// Buffer one output line.
    pub fn feed(&mut self, line: &str, now: Instant) -> FeedOutcome {
        let min_wait = self.config.min_wait;
        let Some(cycle) = self.cycle.as_mut() else {
            return FeedOutcome::Inactive;
        };

        if !line.is_empty() {
            cycle.context.push_str(line);
            cycle.context.push('\n');
        }

        if is_activity(line) {
            cycle.last_activity = now;
        }

        let elapsed = cycle.elapsed(now);
        if is_transition(line) && elapsed > min_wait {
            info!(
                line = %line.chars().take(60).collect::<String>(),
                "transition detected"
            );
            return match self.take(FinishReason::Transition, now) {
                Some(finished) => FeedOutcome::Finished(finished),
                None => FeedOutcome::Inactive,
            };
        }

        FeedOutcome::Progress {
            task: cycle.task.clone(),
            context_length: cycle.context.len(),
            elapsed,
        }
    }

    /// Run the periodic check if it is due.
    ///
    /// A no-op without a cycle, so a check that fires after the cycle was
    /// cleared cannot revive it.
    pub fn check(&mut self, now: Instant) -> Option<FinishedCycle> {
        let config = self.config.clone();
        let cycle = self.cycle.as_mut()?;
        if now < cycle.next_check_at {
            return None;
        }

        let elapsed = cycle.elapsed(now);
        let idle = now.saturating_duration_since(cycle.last_activity);

        if elapsed > config.max_timeout {
            info!(elapsed_secs = elapsed.as_secs(), "gathering hit max timeout");
            return self.take(FinishReason::MaxTimeout, now);
        }

        if idle > config.idle_timeout
            && elapsed > config.min_wait
            && cycle.context.len() > config.min_context_chars
        {
            info!(
                idle_secs = idle.as_secs(),
                chars = cycle.context.len(),
                "gathering went idle"
            );
            return self.take(FinishReason::Idle, now);
        }

        if cycle.force_requested && elapsed > config.min_wait {
            return self.take(FinishReason::Forced, now);
        }

        cycle.next_check_at = now + config.check_interval;
        None
    }

    /// Finish now, skipping the idle and max checks. Before the minimum
    /// wait the request is remembered and honored by the first check after
    /// it.
    pub fn force(&mut self, now: Instant) -> Option<FinishedCycle> {
        let min_wait = self.config.min_wait;
        let cycle = self.cycle.as_mut()?;
        if cycle.elapsed(now) > min_wait {
            info!("gathering force-triggered");
            return self.take(FinishReason::Forced, now);
        }
        debug!("force requested before minimum wait, deferring");
        cycle.force_requested = true;
        None
    }

    /// Drop the cycle without finishing it. Returns its task.
    pub fn cancel(&mut self) -> Option<String> {
        self.cycle.take().map(|c| c.task)
    }

    fn take(&mut self, reason: FinishReason, now: Instant) -> Option<FinishedCycle> {
        self.cycle.take().map(|c| FinishedCycle {
            elapsed: c.elapsed(now),
            task: c.task,
            context: c.context,
            reason,
        })
    }
}
