//! Threshold alarms over pipeline health metrics.
//!
//! Each alarm samples one metric every evaluation period and fires after the
//! configured number of consecutive breaching periods. Transitions in both
//! directions are notified, so operators see recovery as well as failure.

mod window;

pub use window::PipelineWindow;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AlarmConfig, AlertingConfig};
use crate::emit;
use crate::metrics::events::AlarmStateChanged;
use crate::queue::DeadLetterQueue;

/// Current state of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Ok,
    Firing,
}

/// One alarm state transition, handed to the notifier.
#[derive(Debug, Clone)]
pub struct AlarmTransition {
    pub alarm: &'static str,
    pub channel: String,
    pub state: AlarmState,
    /// Observed value that caused the transition.
    pub value: f64,
    pub threshold: f64,
}

/// Destination for alarm transitions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, transition: &AlarmTransition);
}

/// Notifier that writes transitions to the log. The channel reference is
/// carried through untouched for downstream log routing.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, transition: &AlarmTransition) {
        match transition.state {
            AlarmState::Firing => warn!(
                alarm = transition.alarm,
                channel = %transition.channel,
                value = transition.value,
                threshold = transition.threshold,
                "ALARM firing"
            ),
            AlarmState::Ok => info!(
                alarm = transition.alarm,
                channel = %transition.channel,
                value = transition.value,
                "ALARM cleared"
            ),
        }
    }
}

/// Metric an alarm samples each evaluation period.
pub enum AlarmSource {
    /// Failed invocations over the rolling window.
    Errors(Arc<PipelineWindow>),
    /// Throttled receive attempts over the rolling window.
    Throttles(Arc<PipelineWindow>),
    /// p95 invocation duration in seconds.
    DurationP95(Arc<PipelineWindow>),
    /// Current dead-letter queue depth.
    DlqDepth(Arc<DeadLetterQueue>),
}

impl AlarmSource {
    pub async fn sample(&self) -> f64 {
        match self {
            AlarmSource::Errors(window) => window.error_count() as f64,
            AlarmSource::Throttles(window) => window.throttle_count() as f64,
            AlarmSource::DurationP95(window) => window.p95_duration_secs(),
            AlarmSource::DlqDepth(dlq) => dlq.depth().await as f64,
        }
    }
}

/// Threshold alarm with consecutive-period evaluation.
pub struct Alarm {
    name: &'static str,
    config: AlarmConfig,
    state: AlarmState,
    /// Consecutive breaching periods observed so far.
    breaches: u32,
}

impl Alarm {
    pub fn new(name: &'static str, config: AlarmConfig) -> Self {
        Self {
            name,
            config,
            state: AlarmState::Ok,
            breaches: 0,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    /// Feed one period's observation. Returns a transition when the alarm
    /// changes state.
    pub fn observe(&mut self, value: f64) -> Option<AlarmTransition> {
        let breaching = value >= self.config.threshold;

        if breaching {
            self.breaches = self.breaches.saturating_add(1);
        } else {
            self.breaches = 0;
        }

        let next_state = if self.breaches >= self.config.evaluation_periods {
            AlarmState::Firing
        } else {
            AlarmState::Ok
        };

        if next_state == self.state {
            return None;
        }
        self.state = next_state;
        Some(AlarmTransition {
            alarm: self.name,
            channel: self.config.channel.clone(),
            state: next_state,
            value,
            threshold: self.config.threshold,
        })
    }
}

/// One alarm bound to its metric source.
pub struct AlarmSpec {
    pub alarm: Alarm,
    pub source: AlarmSource,
}

/// Build the standard alarm set from configuration. Disabled alarms are
/// omitted entirely.
pub fn standard_alarms(
    config: &AlertingConfig,
    window: Arc<PipelineWindow>,
    dlq: Arc<DeadLetterQueue>,
) -> Vec<AlarmSpec> {
    let mut specs = Vec::new();

    if config.errors.enabled {
        specs.push(AlarmSpec {
            alarm: Alarm::new("errors", config.errors.clone()),
            source: AlarmSource::Errors(window.clone()),
        });
    }
    if config.throttles.enabled {
        specs.push(AlarmSpec {
            alarm: Alarm::new("throttles", config.throttles.clone()),
            source: AlarmSource::Throttles(window.clone()),
        });
    }
    if config.duration_p95.enabled {
        specs.push(AlarmSpec {
            alarm: Alarm::new("duration_p95", config.duration_p95.clone()),
            source: AlarmSource::DurationP95(window),
        });
    }
    if config.dlq.enabled {
        specs.push(AlarmSpec {
            alarm: Alarm::new("dlq_depth", config.dlq.clone()),
            source: AlarmSource::DlqDepth(dlq),
        });
    }

    specs
}

/// Spawn one evaluation task per alarm. Tasks run until cancelled.
pub fn spawn_evaluators(
    specs: Vec<AlarmSpec>,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
) -> JoinSet<()> {
    let mut tasks = JoinSet::new();

    for spec in specs {
        let notifier = notifier.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let AlarmSpec { mut alarm, source } = spec;
            let mut interval = tokio::time::interval(alarm.config.evaluation_period());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so each sample
            // covers a full period.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        let value = source.sample().await;
                        debug!(alarm = alarm.name, value, "Alarm evaluation");
                        if let Some(transition) = alarm.observe(value) {
                            emit!(AlarmStateChanged {
                                alarm: transition.alarm,
                                firing: transition.state == AlarmState::Firing,
                            });
                            notifier.notify(&transition).await;
                        }
                    }
                }
            }
        });
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn alarm(threshold: f64, periods: u32) -> Alarm {
        Alarm::new(
            "test",
            AlarmConfig {
                enabled: true,
                threshold,
                evaluation_period_secs: 60,
                evaluation_periods: periods,
                channel: "ops-channel".to_string(),
            },
        )
    }

    #[test]
    fn test_fires_on_breach() {
        let mut alarm = alarm(5.0, 1);
        assert!(alarm.observe(4.0).is_none());
        let transition = alarm.observe(5.0).unwrap();
        assert_eq!(transition.state, AlarmState::Firing);
        assert_eq!(transition.value, 5.0);
    }

    #[test]
    fn test_requires_consecutive_periods() {
        let mut alarm = alarm(5.0, 3);
        assert!(alarm.observe(10.0).is_none());
        assert!(alarm.observe(10.0).is_none());
        // A non-breaching period resets the streak
        assert!(alarm.observe(1.0).is_none());
        assert!(alarm.observe(10.0).is_none());
        assert!(alarm.observe(10.0).is_none());
        assert_eq!(alarm.observe(10.0).unwrap().state, AlarmState::Firing);
    }

    #[test]
    fn test_clears_after_recovery() {
        let mut alarm = alarm(5.0, 1);
        alarm.observe(10.0).unwrap();
        assert_eq!(alarm.state(), AlarmState::Firing);

        // Still firing, no duplicate notification
        assert!(alarm.observe(10.0).is_none());

        let transition = alarm.observe(0.0).unwrap();
        assert_eq!(transition.state, AlarmState::Ok);
        assert_eq!(alarm.state(), AlarmState::Ok);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut alarm = alarm(1.0, 1);
        assert_eq!(alarm.observe(1.0).unwrap().state, AlarmState::Firing);
    }

    #[test]
    fn test_disabled_alarms_omitted() {
        let mut config = AlertingConfig::default();
        config.errors.enabled = false;
        config.throttles.enabled = false;

        let window = Arc::new(PipelineWindow::new(Duration::from_secs(60)));
        let dlq = Arc::new(DeadLetterQueue::new());
        let specs = standard_alarms(&config, window, dlq);

        let names: Vec<_> = specs.iter().map(|s| s.alarm.name).collect();
        assert_eq!(names, vec!["duration_p95", "dlq_depth"]);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        transitions: std::sync::Mutex<Vec<AlarmTransition>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, transition: &AlarmTransition) {
            self.transitions.lock().unwrap().push(transition.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluator_notifies_on_breach() {
        // Long real-time window so samples never age out under the paused
        // tokio clock
        let window = Arc::new(PipelineWindow::new(Duration::from_secs(3600)));
        window.record_error();

        let spec = AlarmSpec {
            alarm: Alarm::new(
                "errors",
                AlarmConfig {
                    enabled: true,
                    threshold: 1.0,
                    evaluation_period_secs: 60,
                    evaluation_periods: 1,
                    channel: "ops-channel".to_string(),
                },
            ),
            source: AlarmSource::Errors(window.clone()),
        };

        let notifier = Arc::new(RecordingNotifier::default());
        let shutdown = CancellationToken::new();
        let mut tasks = spawn_evaluators(vec![spec], notifier.clone(), shutdown.clone());

        // First full evaluation period observes the breach
        tokio::time::sleep(Duration::from_secs(130)).await;
        shutdown.cancel();
        while tasks.join_next().await.is_some() {}

        let transitions = notifier.transitions.lock().unwrap();
        assert!(!transitions.is_empty());
        assert_eq!(transitions[0].alarm, "errors");
        assert_eq!(transitions[0].state, AlarmState::Firing);
        assert_eq!(transitions[0].channel, "ops-channel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dlq_alarm_fires_within_one_period() {
        let dlq = Arc::new(DeadLetterQueue::new());
        let mut alarm = alarm(1.0, 1);
        let source = AlarmSource::DlqDepth(dlq.clone());

        assert!(alarm.observe(source.sample().await).is_none());

        // Simulate a redriven job landing in the DLQ between evaluations
        let entry = {
            use crate::queue::{DeadLetterEntry, TransformationJob};
            use chrono::Utc;
            DeadLetterEntry {
                job: TransformationJob::new("b", "uploads/poison.jpg", Utc::now()),
                receive_count: 5,
                enqueued_at: Utc::now(),
                moved_at: Utc::now(),
            }
        };
        dlq.push_for_tests(entry).await;

        let transition = alarm.observe(source.sample().await).unwrap();
        assert_eq!(transition.state, AlarmState::Firing);
    }
}
