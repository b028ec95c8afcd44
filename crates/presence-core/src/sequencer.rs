//! The challenge-response state machine.
//!
//! A sequencer owns one liveness attempt: the drawn list of challenges,
//! the active gesture detector, the per-challenge deadline and the
//! RUNNING / PASSED / FAILED lifecycle. Frame arrivals and timer
//! expiries both funnel through this one state owner, so the classic
//! "timeout races gesture completion" bug cannot split the decision
//! across two independently mutated flags. Time is always passed in by
//! the caller, which keeps the machine deterministic under test.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::gesture::{GestureConfig, GestureDetector, GestureKind};
use crate::signal::SignalSample;

/// One unit of the challenge-response protocol: a gesture the subject
/// must perform, with the instruction shown while it is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    pub kind: GestureKind,
    pub prompt: &'static str,
}

impl Challenge {
    fn new(kind: GestureKind) -> Self {
        Self {
            kind,
            prompt: kind.prompt(),
        }
    }
}

/// How the challenge list is chosen when an attempt starts.
#[derive(Debug, Clone)]
pub enum ChallengePlan {
    /// Uniform random draw with replacement from the pool. Consecutive
    /// duplicates are allowed.
    Random,
    /// A fixed, ordered list. Overrides `required`.
    Fixed(Vec<GestureKind>),
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Number of gestures that must be satisfied. Clamped to at least 1.
    pub required: usize,
    /// Pool the random plan draws from. Falls back to every kind when
    /// left empty.
    pub pool: Vec<GestureKind>,
    /// Per-challenge deadline, restarted each time a challenge is
    /// presented.
    pub timeout: Duration,
    pub plan: ChallengePlan,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            required: 4,
            pool: GestureKind::ALL.to_vec(),
            timeout: Duration::from_millis(5000),
            plan: ChallengePlan::Random,
        }
    }
}

/// Lifecycle of one liveness attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Waiting for the current gesture.
    Running,
    /// Every required gesture was satisfied. Terminal success.
    Passed,
    /// The per-challenge deadline expired. Terminal until `retry`.
    Failed,
}

/// The liveness state machine for one verification attempt.
#[derive(Debug)]
pub struct ChallengeSequencer {
    config: SequencerConfig,
    gesture_config: GestureConfig,
    detector: GestureDetector,
    challenges: Vec<Challenge>,
    current: usize,
    satisfied: usize,
    deadline: Instant,
    state: SequencerState,
}

impl ChallengeSequencer {
    /// Start an attempt, drawing challenges with the thread RNG.
    pub fn start(config: SequencerConfig, gesture_config: GestureConfig, now: Instant) -> Self {
        Self::start_with_rng(config, gesture_config, &mut rand::thread_rng(), now)
    }

    /// Start an attempt with a caller-supplied RNG (deterministic tests).
    pub fn start_with_rng<R: Rng>(
        config: SequencerConfig,
        gesture_config: GestureConfig,
        rng: &mut R,
        now: Instant,
    ) -> Self {
        let challenges = draw_challenges(&config, rng);
        tracing::info!(
            count = challenges.len(),
            first = challenges[0].kind.as_str(),
            "liveness attempt started"
        );
        Self {
            deadline: now + config.timeout,
            detector: GestureDetector::new(gesture_config.clone()),
            challenges,
            current: 0,
            satisfied: 0,
            state: SequencerState::Running,
            config,
            gesture_config,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// The challenge currently presented to the subject, while running.
    pub fn current_challenge(&self) -> Option<&Challenge> {
        match self.state {
            SequencerState::Running => self.challenges.get(self.current),
            _ => None,
        }
    }

    /// Gestures satisfied so far.
    pub fn satisfied(&self) -> usize {
        self.satisfied
    }

    /// Total gestures this attempt requires.
    pub fn required(&self) -> usize {
        self.challenges.len()
    }

    /// Deadline of the active challenge. Meaningful only while running.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Process one frame's signals.
    ///
    /// The deadline is checked before the detector runs: a frame that
    /// lands in the same turn as the expiry resolves in favor of the
    /// timeout. Output after PASSED or FAILED is silently ignored so a
    /// stale callback can never corrupt a decided attempt.
    pub fn on_frame(&mut self, sample: &SignalSample, now: Instant) -> SequencerState {
        if self.state != SequencerState::Running {
            return self.state;
        }
        if now >= self.deadline {
            return self.fail();
        }

        let challenge = self.challenges[self.current];
        if self.detector.observe(challenge.kind, sample) {
            self.advance(challenge.kind, now);
        }
        self.state
    }

    /// Independent timer input. Fires the FAILED transition once the
    /// deadline has passed; a no-op in any other situation.
    pub fn on_tick(&mut self, now: Instant) -> SequencerState {
        if self.state == SequencerState::Running && now >= self.deadline {
            return self.fail();
        }
        self.state
    }

    /// Explicit retry: redraw challenges and clear every attempt-local
    /// value (baseline, hysteresis, count, deadline), re-entering
    /// RUNNING. Valid from any state.
    pub fn retry(&mut self, now: Instant) {
        self.retry_with_rng(&mut rand::thread_rng(), now);
    }

    pub fn retry_with_rng<R: Rng>(&mut self, rng: &mut R, now: Instant) {
        self.challenges = draw_challenges(&self.config, rng);
        self.current = 0;
        self.satisfied = 0;
        self.deadline = now + self.config.timeout;
        self.detector = GestureDetector::new(self.gesture_config.clone());
        self.state = SequencerState::Running;
        tracing::info!("liveness attempt reset");
    }

    fn advance(&mut self, kind: GestureKind, now: Instant) {
        self.satisfied += 1;
        tracing::debug!(
            gesture = kind.as_str(),
            step = self.satisfied,
            of = self.challenges.len(),
            "gesture satisfied"
        );

        if self.satisfied >= self.challenges.len() {
            self.state = SequencerState::Passed;
            tracing::info!(gestures = self.satisfied, "liveness passed");
            return;
        }

        // Next challenge: fresh detector baseline, fresh deadline.
        self.current += 1;
        self.detector.reset();
        self.deadline = now + self.config.timeout;
    }

    fn fail(&mut self) -> SequencerState {
        self.state = SequencerState::Failed;
        tracing::warn!(
            satisfied = self.satisfied,
            required = self.challenges.len(),
            "challenge timed out"
        );
        self.state
    }
}

fn draw_challenges<R: Rng>(config: &SequencerConfig, rng: &mut R) -> Vec<Challenge> {
    match &config.plan {
        ChallengePlan::Fixed(kinds) if !kinds.is_empty() => {
            kinds.iter().copied().map(Challenge::new).collect()
        }
        _ => {
            let pool: &[GestureKind] = if config.pool.is_empty() {
                &GestureKind::ALL
            } else {
                &config.pool
            };
            let required = config.required.max(1);
            (0..required)
                .map(|_| Challenge::new(pool[rng.gen_range(0..pool.len())]))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixed(kinds: &[GestureKind]) -> SequencerConfig {
        SequencerConfig {
            plan: ChallengePlan::Fixed(kinds.to_vec()),
            ..Default::default()
        }
    }

    fn eyes(openness: f32) -> SignalSample {
        SignalSample {
            eye_openness: Some(openness),
            ..Default::default()
        }
    }

    fn nose(x: f32) -> SignalSample {
        SignalSample {
            nose_x: Some(x),
            ..Default::default()
        }
    }

    fn mouth(openness: f32) -> SignalSample {
        SignalSample {
            mouth_openness: Some(openness),
            ..Default::default()
        }
    }

    /// Drive a complete blink (close then reopen).
    fn blink(seq: &mut ChallengeSequencer, now: Instant) -> SequencerState {
        seq.on_frame(&eyes(0.004), now);
        seq.on_frame(&eyes(0.025), now)
    }

    #[test]
    fn single_blink_challenge_passes() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::Blink]),
            GestureConfig::default(),
            t0,
        );
        assert_eq!(seq.state(), SequencerState::Running);
        assert_eq!(seq.current_challenge().unwrap().kind, GestureKind::Blink);

        let state = blink(&mut seq, t0 + Duration::from_millis(500));
        assert_eq!(state, SequencerState::Passed);
        assert_eq!(seq.satisfied(), 1);
    }

    #[test]
    fn full_sequence_satisfies_each_challenge_in_order() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[
                GestureKind::Blink,
                GestureKind::TurnLeft,
                GestureKind::TurnRight,
                GestureKind::MouthOpen,
            ]),
            GestureConfig::default(),
            t0,
        );

        blink(&mut seq, t0 + Duration::from_millis(500));
        assert_eq!(seq.satisfied(), 1);

        // Turn left: baseline frame, then displacement past -30
        let t1 = t0 + Duration::from_millis(1500);
        seq.on_frame(&nose(500.0), t1);
        seq.on_frame(&nose(460.0), t1);
        assert_eq!(seq.satisfied(), 2);

        // Turn right gets its own fresh baseline
        let t2 = t0 + Duration::from_millis(2500);
        seq.on_frame(&nose(470.0), t2);
        seq.on_frame(&nose(510.0), t2);
        assert_eq!(seq.satisfied(), 3);

        let t3 = t0 + Duration::from_millis(3500);
        let state = seq.on_frame(&mouth(0.04), t3);
        assert_eq!(state, SequencerState::Passed);
        assert_eq!(seq.satisfied(), 4);
        assert!(seq.current_challenge().is_none());
    }

    #[test]
    fn wrong_gesture_does_not_advance() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::TurnLeft]),
            GestureConfig::default(),
            t0,
        );
        // A rightward trajectory never satisfies a turn-left challenge
        seq.on_frame(&nose(500.0), t0);
        seq.on_frame(&nose(540.0), t0 + Duration::from_millis(100));
        assert_eq!(seq.state(), SequencerState::Running);
        assert_eq!(seq.satisfied(), 0);
    }

    #[test]
    fn deadline_restarts_per_challenge() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::Blink, GestureKind::MouthOpen]),
            GestureConfig::default(),
            t0,
        );
        assert_eq!(seq.deadline(), t0 + Duration::from_millis(5000));

        let t1 = t0 + Duration::from_millis(4000);
        blink(&mut seq, t1);
        // Second challenge gets a full fresh window from its presentation
        assert_eq!(seq.deadline(), t1 + Duration::from_millis(5000));
    }

    #[test]
    fn timeout_reaches_failed_without_frames() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::Blink]),
            GestureConfig::default(),
            t0,
        );
        assert_eq!(
            seq.on_tick(t0 + Duration::from_millis(4999)),
            SequencerState::Running
        );
        assert_eq!(
            seq.on_tick(t0 + Duration::from_millis(5000)),
            SequencerState::Failed
        );
    }

    #[test]
    fn same_turn_tie_resolves_to_timeout() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::MouthOpen]),
            GestureConfig::default(),
            t0,
        );
        // Frame arrives exactly at the deadline and would have satisfied
        // the gesture — timeout wins
        let state = seq.on_frame(&mouth(0.04), t0 + Duration::from_millis(5000));
        assert_eq!(state, SequencerState::Failed);
        assert_eq!(seq.satisfied(), 0);
    }

    #[test]
    fn frames_after_terminal_states_are_ignored() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::Blink]),
            GestureConfig::default(),
            t0,
        );
        seq.on_tick(t0 + Duration::from_millis(5001));
        assert_eq!(seq.state(), SequencerState::Failed);

        // A stale satisfying frame cannot resurrect the attempt
        let state = blink(&mut seq, t0 + Duration::from_millis(5002));
        assert_eq!(state, SequencerState::Failed);
        assert_eq!(seq.satisfied(), 0);
    }

    #[test]
    fn tick_after_passed_is_a_noop() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::Blink]),
            GestureConfig::default(),
            t0,
        );
        blink(&mut seq, t0 + Duration::from_millis(100));
        assert_eq!(seq.state(), SequencerState::Passed);
        assert_eq!(
            seq.on_tick(t0 + Duration::from_secs(60)),
            SequencerState::Passed
        );
    }

    #[test]
    fn retry_from_failed_yields_fresh_running_state() {
        let t0 = Instant::now();
        let mut seq = ChallengeSequencer::start(
            fixed(&[GestureKind::TurnLeft]),
            GestureConfig::default(),
            t0,
        );
        seq.on_frame(&nose(500.0), t0); // baseline captured
        seq.on_tick(t0 + Duration::from_millis(6000));
        assert_eq!(seq.state(), SequencerState::Failed);

        let t1 = t0 + Duration::from_millis(7000);
        seq.retry(t1);
        assert_eq!(seq.state(), SequencerState::Running);
        assert_eq!(seq.satisfied(), 0);
        assert_eq!(seq.deadline(), t1 + Duration::from_millis(5000));

        // Baseline was cleared: the first frame after retry only
        // re-captures it, it is never compared against the old one
        seq.on_frame(&nose(400.0), t1);
        assert_eq!(seq.state(), SequencerState::Running);
        assert_eq!(seq.satisfied(), 0);
        seq.on_frame(&nose(360.0), t1 + Duration::from_millis(100));
        assert_eq!(seq.state(), SequencerState::Passed);
    }

    #[test]
    fn random_plan_draws_from_pool_with_replacement() {
        use rand::rngs::mock::StepRng;

        let config = SequencerConfig {
            required: 8,
            pool: vec![GestureKind::Blink, GestureKind::MouthOpen],
            ..Default::default()
        };
        let mut rng = StepRng::new(0, 0x9E3779B97F4A7C15);
        let seq = ChallengeSequencer::start_with_rng(
            config,
            GestureConfig::default(),
            &mut rng,
            Instant::now(),
        );
        assert_eq!(seq.required(), 8);
        // Every drawn challenge comes from the configured pool
        for i in 0..8 {
            let kind = seq.challenges[i].kind;
            assert!(kind == GestureKind::Blink || kind == GestureKind::MouthOpen);
        }
    }

    #[test]
    fn required_is_clamped_to_at_least_one() {
        let config = SequencerConfig {
            required: 0,
            ..Default::default()
        };
        let seq = ChallengeSequencer::start(config, GestureConfig::default(), Instant::now());
        assert_eq!(seq.required(), 1);
    }
}
