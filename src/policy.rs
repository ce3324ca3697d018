//! The variable speed limit decision rule.

use crate::config::PolicyConfig;
use crate::predictor::DensityForecast;
use serde::{Deserialize, Serialize};

/// The speed limit regime posted on the segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyAction {
    #[default]
    Normal,
    Restricted,
}

/// Decides the next action from a forecast density.
///
/// Restricts when the forecast exceeds the critical density. Once restricted, the
/// forecast must drop below `critical_density × release_margin` before the limit is
/// lifted, so a forecast hovering near the threshold does not flip the limit every tick.
pub fn decide(forecast: f64, current: PolicyAction, critical_density: f64, release_margin: f64) -> PolicyAction {
    match current {
        PolicyAction::Normal if forecast > critical_density => PolicyAction::Restricted,
        PolicyAction::Restricted if forecast < critical_density * release_margin => PolicyAction::Normal,
        current => current,
    }
}

/// Maps forecasts to speed limits.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeedPolicy {
    /// In veh/km.
    critical_density: f64,
    release_margin: f64,
    /// In km/h.
    normal_limit: f64,
    /// In km/h.
    restricted_limit: f64,
}

impl SpeedPolicy {
    pub fn new(config: &PolicyConfig, critical_density: f64) -> Self {
        Self {
            critical_density,
            release_margin: config.release_margin,
            normal_limit: config.normal_limit,
            restricted_limit: config.restricted_limit,
        }
    }

    pub fn critical_density(&self) -> f64 {
        self.critical_density
    }

    /// The density below which a restriction is lifted, in veh/km.
    pub fn release_density(&self) -> f64 {
        self.critical_density * self.release_margin
    }

    pub fn decide(&self, forecast: &DensityForecast, current: PolicyAction) -> PolicyAction {
        decide(
            forecast.predicted_density,
            current,
            self.critical_density,
            self.release_margin,
        )
    }

    /// The speed limit posted under an action, in km/h.
    pub fn speed_limit(&self, action: PolicyAction) -> f64 {
        match action {
            PolicyAction::Normal => self.normal_limit,
            PolicyAction::Restricted => self.restricted_limit,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use PolicyAction::*;

    fn run(forecasts: &[f64]) -> Vec<PolicyAction> {
        forecasts
            .iter()
            .scan(Normal, |action, forecast| {
                *action = decide(*forecast, *action, 45.0, 0.9);
                Some(*action)
            })
            .collect()
    }

    #[test]
    fn restricts_then_releases() {
        assert_eq!(
            run(&[30.0, 40.0, 50.0, 47.0, 38.0, 30.0]),
            [Normal, Normal, Restricted, Restricted, Normal, Normal]
        );
    }

    #[test]
    fn holds_inside_the_band() {
        let forecasts = [46.0, 41.0, 44.9, 40.6, 45.0, 42.0, 40.8, 43.0];
        let actions = run(&forecasts);
        assert!(actions.iter().all(|a| *a == Restricted));
    }

    #[test]
    fn threshold_itself_does_not_restrict() {
        assert_eq!(run(&[45.0, 44.0, 45.0]), [Normal, Normal, Normal]);
    }

    #[test]
    fn posted_limits() {
        let policy = SpeedPolicy::new(&PolicyConfig::default(), 45.0);
        assert_eq!(policy.speed_limit(Normal), 90.0);
        assert_eq!(policy.speed_limit(Restricted), 70.0);
        assert!((policy.release_density() - 40.5).abs() < 1e-9);
    }

    #[test]
    fn per_segment_base_limits() {
        let config = PolicyConfig::default();
        let policy = SpeedPolicy::new(&config.with_base_limit(120.0), 45.0);
        assert_eq!(policy.speed_limit(Normal), 120.0);
        assert_eq!(policy.speed_limit(Restricted), 70.0);

        let policy = SpeedPolicy::new(&config.with_base_limit(60.0), 45.0);
        assert_eq!(policy.speed_limit(Normal), 60.0);
        assert_eq!(policy.speed_limit(Restricted), 60.0);
    }
}
