//! Per-step status recorded with every run

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    MetadataRetrieval,
    MediaUrlDiscovery,
    Download,
    Classification,
    TranscodeThumbnail,
    Persist,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::MetadataRetrieval,
        Step::MediaUrlDiscovery,
        Step::Download,
        Step::Classification,
        Step::TranscodeThumbnail,
        Step::Persist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::MetadataRetrieval => "metadata_retrieval",
            Step::MediaUrlDiscovery => "media_url_discovery",
            Step::Download => "download",
            Step::Classification => "classification",
            Step::TranscodeThumbnail => "transcode_thumbnail",
            Step::Persist => "persist",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepStatus {
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle for a running step
#[derive(Debug)]
#[must_use = "a started step must be finished"]
pub struct StepTimer {
    step: Step,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineMetadata {
    steps: BTreeMap<Step, StepStatus>,
}

impl PipelineMetadata {
    pub fn new() -> Self {
        Self {
            steps: Step::ALL
                .iter()
                .map(|step| (*step, StepStatus::default()))
                .collect(),
        }
    }

    pub fn start(&mut self, step: Step) -> StepTimer {
        self.entry(step).state = StepState::Running;
        StepTimer {
            step,
            started: Instant::now(),
        }
    }

    pub fn succeed(&mut self, timer: StepTimer) {
        let status = self.entry(timer.step);
        status.state = StepState::Success;
        status.duration_ms = Some(elapsed_ms(timer.started));
        status.error = None;
    }

    pub fn fail(&mut self, timer: StepTimer, error: impl fmt::Display) {
        let status = self.entry(timer.step);
        status.state = StepState::Error;
        status.duration_ms = Some(elapsed_ms(timer.started));
        status.error = Some(error.to_string());
    }

    /// Finish a step from an outcome
    pub fn finish<T, E: fmt::Display>(&mut self, timer: StepTimer, outcome: &Result<T, E>) {
        match outcome {
            Ok(_) => self.succeed(timer),
            Err(e) => self.fail(timer, e),
        }
    }

    pub fn get(&self, step: Step) -> StepStatus {
        self.steps.get(&step).cloned().unwrap_or_default()
    }

    pub fn state(&self, step: Step) -> StepState {
        self.get(step).state
    }

    /// First step that ended in error
    pub fn first_error(&self) -> Option<(Step, String)> {
        Step::ALL.iter().find_map(|step| {
            let status = self.steps.get(step)?;
            match (&status.state, &status.error) {
                (StepState::Error, Some(e)) => Some((*step, e.clone())),
                _ => None,
            }
        })
    }

    fn entry(&mut self, step: Step) -> &mut StepStatus {
        self.steps.entry(step).or_default()
    }
}

impl Default for PipelineMetadata {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
