use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::GenerationEngine;
use crate::request::ModelIdentity;

/// Sampling schedules the orchestrator can configure on a pipeline. The wire
/// names follow the upstream scheduler class names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    #[serde(rename = "DPMSolverMultistepScheduler")]
    DpmSolverMultistep,
    #[serde(rename = "DDIMScheduler")]
    Ddim,
    #[serde(rename = "EulerDiscreteScheduler")]
    Euler,
    #[serde(rename = "EulerAncestralDiscreteScheduler")]
    EulerAncestral,
    #[serde(rename = "LMSDiscreteScheduler")]
    LmsDiscrete,
    #[serde(rename = "PNDMScheduler")]
    Pndm,
    #[serde(rename = "UniPCMultistepScheduler")]
    UniPcMultistep,
}

serde_plain::derive_display_from_serialize!(Schedule);
serde_plain::derive_fromstr_from_deserialize!(Schedule);

pub const DEFAULT_SCHEDULE: Schedule = Schedule::DpmSolverMultistep;

const SCHEDULES: &[Schedule] = &[
    Schedule::DpmSolverMultistep,
    Schedule::Ddim,
    Schedule::Euler,
    Schedule::EulerAncestral,
    Schedule::LmsDiscrete,
    Schedule::Pndm,
    Schedule::UniPcMultistep,
];

/// Every registered schedule name, in registry order.
pub fn schedule_names() -> Vec<String> {
    SCHEDULES.iter().map(Schedule::to_string).collect()
}

/// A schedule bound to one model. The numeric parameters (trained noise
/// schedule and friends) come from the model itself, so a config is never
/// reused for a different model under the same name.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub schedule: Schedule,
    pub model: String,
    pub params: Value,
}

/// The requested name is not a registered schedule.
#[derive(Debug, thiserror::Error)]
#[error("unknown scheduler \"{requested}\"")]
pub struct UnknownSchedule {
    pub requested: String,
    pub available: Vec<String>,
}

/// Derive the scheduler configuration for `identity` from its model-specific
/// parameters. Fails with the full set of registered names when `name` is
/// not one of them.
pub fn resolve(
    engine: &dyn GenerationEngine,
    identity: &ModelIdentity,
    name: &str,
) -> Result<SchedulerConfig, UnknownSchedule> {
    let schedule = name.parse::<Schedule>().map_err(|_| UnknownSchedule {
        requested: name.to_string(),
        available: schedule_names(),
    })?;
    Ok(SchedulerConfig {
        schedule,
        model: identity.normalized(),
        params: engine.schedule_params(identity),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_round_trip() {
        for name in schedule_names() {
            let schedule = name.parse::<Schedule>().unwrap();
            assert_eq!(schedule.to_string(), name);
        }
    }

    #[test]
    fn default_schedule_is_registered() {
        assert!(schedule_names().contains(&DEFAULT_SCHEDULE.to_string()));
    }

    #[test]
    fn unknown_name_lists_every_registered_schedule() {
        let err = "TurboScheduler".parse::<Schedule>();
        assert!(err.is_err());
        let names = schedule_names();
        assert_eq!(names.len(), 7);
        assert!(!names.contains(&"TurboScheduler".to_string()));
    }
}
