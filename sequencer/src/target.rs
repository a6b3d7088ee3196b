//! Scheduled targets as produced by the scheduler.
//!
//! The orchestrator consumes these in order and never recomputes them.

use std::path::Path;

use chrono::{DateTime, Utc};
use hardware::seestar::{Coordinates, ExposureRequest};
use serde::{Deserialize, Serialize};
use shared::ImagingDefaults;

/// What to point at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub name: String,
    pub coordinates: Coordinates,
    /// Overrides the configured default filter for this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// One entry of a scheduled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTarget {
    pub target: Target,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub recommended_exposure_seconds: f64,
    pub recommended_frame_count: u32,
    pub score: f64,
}

impl ScheduledTarget {
    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Build the exposure for this target on top of the imaging defaults.
    pub fn exposure_request(&self, defaults: &ImagingDefaults) -> ExposureRequest {
        ExposureRequest {
            target_name: self.target.name.clone(),
            coordinates: self.target.coordinates,
            exposure_seconds: self.recommended_exposure_seconds,
            gain: defaults.gain,
            binning: defaults.binning,
            filter: self
                .target
                .filter
                .clone()
                .or_else(|| defaults.filter.clone()),
            frame_count: self.recommended_frame_count,
            dither: defaults.dither,
        }
    }
}

/// Load a plan: a JSON array of scheduled targets, in execution order.
pub fn load_plan(path: &Path) -> Result<Vec<ScheduledTarget>, std::io::Error> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const PLAN: &str = r#"[
        {
            "target": {
                "name": "M42",
                "coordinates": {"raHours": 5.5883, "decDegrees": -5.391}
            },
            "startTime": "2026-01-10T21:00:00Z",
            "endTime": "2026-01-10T21:30:00Z",
            "recommendedExposureSeconds": 10.0,
            "recommendedFrameCount": 180,
            "score": 0.92
        },
        {
            "target": {
                "name": "M31",
                "coordinates": {"raHours": 0.7123, "decDegrees": 41.269},
                "filter": "LP"
            },
            "startTime": "2026-01-10T21:30:00Z",
            "endTime": "2026-01-10T22:15:00Z",
            "recommendedExposureSeconds": 20.0,
            "recommendedFrameCount": 90,
            "score": 0.81
        }
    ]"#;

    #[test]
    fn test_load_plan_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, PLAN).unwrap();

        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].name(), "M42");
        assert_eq!(plan[1].name(), "M31");
        assert!(plan[0].end_time > plan[0].start_time);
        assert_relative_eq!(plan[1].target.coordinates.dec_degrees, 41.269);
    }

    #[test]
    fn test_load_plan_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, "{\"not\": \"a list\"}").unwrap();

        let err = load_plan(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_exposure_request_uses_defaults_and_overrides() {
        let plan: Vec<ScheduledTarget> = serde_json::from_str(PLAN).unwrap();
        let defaults = ImagingDefaults {
            filter: Some("UV/IR".to_string()),
            ..Default::default()
        };

        let m42 = plan[0].exposure_request(&defaults);
        assert_eq!(m42.target_name, "M42");
        assert_eq!(m42.frame_count, 180);
        assert_eq!(m42.gain, 80);
        assert_eq!(m42.filter.as_deref(), Some("UV/IR"));
        assert_relative_eq!(m42.total_seconds(), 1800.0);

        let m31 = plan[1].exposure_request(&defaults);
        assert_eq!(m31.filter.as_deref(), Some("LP"));
    }
}
