//! Status-polling synchronization with a triggered instrument.
//!
//! The reference DMM is armed, bus-triggered, and then polled on its
//! operation-condition register until the register reads one of the
//! recognized completion words. Only then is the reading fetched, so no
//! fixed delay has to guess how long an integration takes.
//!
//! Status words are compared by exact equality against [`StatusCode`]. A
//! word with any additional bit set is "not done yet" and polling goes on.
//! Polling is bounded by [`PollPolicy::timeout`]; running out of budget is a
//! [`BenchError::SynchronizationTimeout`].

use crate::error::{BenchError, BenchResult};
use crate::instrument::Instrument;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Recognized operation-condition words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 512: idle, nothing pending
    Idle,
    /// 8192: measurement complete
    MeasurementComplete,
    /// 8704: measurement complete with overrange/error flag
    CompleteWithOverrange,
}

impl StatusCode {
    /// All recognized words.
    pub const ALL: [StatusCode; 3] = [
        StatusCode::Idle,
        StatusCode::MeasurementComplete,
        StatusCode::CompleteWithOverrange,
    ];

    /// Register value of this code.
    pub fn word(self) -> u32 {
        match self {
            StatusCode::Idle => 512,
            StatusCode::MeasurementComplete => 8192,
            StatusCode::CompleteWithOverrange => 8704,
        }
    }

    /// Exact match against a raw register value.
    pub fn from_word(word: u32) -> Option<Self> {
        StatusCode::ALL.into_iter().find(|code| code.word() == word)
    }

    /// Whether the reading that goes with this code is flagged.
    pub fn is_overrange(self) -> bool {
        self == StatusCode::CompleteWithOverrange
    }
}

/// Poll cadence and budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second poll
    pub interval: Duration,
    /// Multiplier applied to the delay after each poll (1.0 = fixed)
    pub backoff: f64,
    /// Upper bound on the delay
    pub max_interval: Duration,
    /// Total wait before giving up
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(20),
            backoff: 1.0,
            max_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.backoff.max(1.0);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Where one acquisition cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No acquisition pending
    #[default]
    Idle,
    /// Initiated, waiting for a trigger
    Armed,
    /// Bus trigger sent
    Triggered,
    /// Polling for completion
    Measuring,
    /// Completion seen and reading fetched
    Done,
}

/// A fetched reading and the status word that released it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fetched {
    /// Parsed reading
    pub value: f64,
    /// Completion word observed before the fetch
    pub status: StatusCode,
}

/// Drives one triggered instrument through initiate, trigger, poll and fetch.
#[derive(Debug, Clone)]
pub struct StatusSynchronizer {
    policy: PollPolicy,
    recognized: Vec<StatusCode>,
    state: SyncState,
}

impl StatusSynchronizer {
    /// Synchronizer recognizing all three completion words.
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            recognized: StatusCode::ALL.to_vec(),
            state: SyncState::Idle,
        }
    }

    /// Restrict which completion words end the poll.
    pub fn with_recognized(mut self, codes: &[StatusCode]) -> Self {
        self.recognized = codes.to_vec();
        self
    }

    /// Current cycle state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Poll policy in use.
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Arm for one acquisition and fire the bus trigger.
    pub async fn initiate_and_trigger(&mut self, instrument: &Instrument) -> BenchResult<()> {
        self.state = SyncState::Idle;
        instrument.initiate().await?;
        self.state = SyncState::Armed;
        instrument.bus_trigger().await?;
        self.state = SyncState::Triggered;
        Ok(())
    }

    /// Poll until a recognized completion word appears, then fetch.
    ///
    /// Issues `*WAI` after the fetch and returns to [`SyncState::Idle`].
    pub async fn await_and_fetch(&mut self, instrument: &Instrument) -> BenchResult<Fetched> {
        self.state = SyncState::Measuring;
        let started = Instant::now();
        let mut interval = self.policy.interval;
        let mut polls = 0u32;

        let status = loop {
            let word = instrument.status_condition().await?;
            polls += 1;
            let recognized = StatusCode::from_word(word).filter(|c| self.recognized.contains(c));
            if let Some(code) = recognized {
                debug!(
                    instrument = %instrument.role(),
                    status = word,
                    polls,
                    "acquisition complete"
                );
                break code;
            }

            let waited = started.elapsed();
            if waited >= self.policy.timeout {
                warn!(
                    instrument = %instrument.role(),
                    last_status = word,
                    polls,
                    "status poll budget exhausted"
                );
                return Err(BenchError::SynchronizationTimeout {
                    instrument: instrument.role().to_string(),
                    waited,
                    last_status: Some(word),
                });
            }
            sleep(interval.min(self.policy.timeout - waited)).await;
            interval = self.policy.next_interval(interval);
        };

        let value = instrument.fetch().await?;
        self.state = SyncState::Done;
        instrument.wait().await?;
        self.state = SyncState::Idle;
        Ok(Fetched { value, status })
    }

    /// One full cycle: initiate, trigger, poll, fetch.
    pub async fn acquire(&mut self, instrument: &Instrument) -> BenchResult<Fetched> {
        self.initiate_and_trigger(instrument).await?;
        self.await_and_fetch(instrument).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::commands::GenericScpi;
    use crate::instrument::mock::{SimulatedBehaviour, SimulatedBench};
    use crate::instrument::Role;
    use std::sync::Arc;

    fn dmm(bench: &SimulatedBench) -> Instrument {
        Instrument::new(
            Role::Dmm,
            Arc::new(bench.endpoint(Role::Dmm)),
            Arc::new(GenericScpi),
            None,
        )
    }

    #[test]
    fn status_words_match_exactly() {
        assert_eq!(StatusCode::from_word(512), Some(StatusCode::Idle));
        assert_eq!(StatusCode::from_word(8704), Some(StatusCode::CompleteWithOverrange));
        assert_eq!(StatusCode::from_word(8192 | 16), None);
        assert_eq!(StatusCode::from_word(0), None);
        assert!(StatusCode::CompleteWithOverrange.is_overrange());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = PollPolicy {
            interval: Duration::from_millis(100),
            backoff: 2.0,
            max_interval: Duration::from_millis(300),
            timeout: Duration::from_secs(1),
        };
        let second = policy.next_interval(policy.interval);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(policy.next_interval(second), Duration::from_millis(300));
    }

    #[test]
    fn huge_backoff_saturates_at_cap() {
        let policy = PollPolicy {
            backoff: f64::INFINITY,
            ..PollPolicy::default()
        };
        assert_eq!(policy.next_interval(policy.interval), policy.max_interval);
        let policy = PollPolicy {
            backoff: 1e300,
            ..PollPolicy::default()
        };
        assert_eq!(policy.next_interval(policy.interval), policy.max_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_returns_to_idle() {
        let bench = SimulatedBench::with_behaviour(SimulatedBehaviour {
            dmm_offset: 1.5,
            polls_before_complete: 3,
            ..Default::default()
        });
        let dmm = dmm(&bench);
        let mut sync = StatusSynchronizer::new(PollPolicy::default());

        sync.initiate_and_trigger(&dmm).await.unwrap();
        assert_eq!(sync.state(), SyncState::Triggered);
        let fetched = sync.await_and_fetch(&dmm).await.unwrap();

        assert_eq!(fetched.value, 1.5);
        assert_eq!(fetched.status, StatusCode::MeasurementComplete);
        assert_eq!(sync.state(), SyncState::Idle);

        let commands = bench.commands(Role::Dmm);
        let polls = commands.iter().filter(|c| *c == "STAT:OPER:COND?").count();
        assert_eq!(polls, 4);
        assert_eq!(commands.last().map(String::as_str), Some("*WAI"));
    }

    #[tokio::test(start_paused = true)]
    async fn overrange_is_reported() {
        let bench = SimulatedBench::with_behaviour(SimulatedBehaviour {
            completion_code: 8704,
            ..Default::default()
        });
        let mut sync = StatusSynchronizer::new(PollPolicy::default());
        let fetched = sync.acquire(&dmm(&bench)).await.unwrap();
        assert!(fetched.status.is_overrange());
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_word_keeps_polling_until_timeout() {
        let bench = SimulatedBench::with_behaviour(SimulatedBehaviour {
            never_complete: true,
            ..Default::default()
        });
        let policy = PollPolicy {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let mut sync = StatusSynchronizer::new(policy);
        let started = Instant::now();
        let err = sync.acquire(&dmm(&bench)).await.unwrap_err();

        match err {
            BenchError::SynchronizationTimeout {
                instrument,
                waited,
                last_status,
            } => {
                assert_eq!(instrument, "dmm");
                assert!(waited >= Duration::from_millis(200));
                assert_eq!(last_status, Some(16));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!bench.commands(Role::Dmm).contains(&"FETC?".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn restricted_set_ignores_idle() {
        let bench = SimulatedBench::new();
        let dmm = dmm(&bench);
        let policy = PollPolicy {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        // nothing initiated: the DMM sits at 512
        let mut sync = StatusSynchronizer::new(policy)
            .with_recognized(&[StatusCode::MeasurementComplete]);
        assert!(matches!(
            sync.await_and_fetch(&dmm).await,
            Err(BenchError::SynchronizationTimeout { last_status: Some(512), .. })
        ));
    }
}
