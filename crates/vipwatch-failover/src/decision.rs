//! Failover decision: pure functions of their inputs.

use vipwatch_core::{Action, HealthObservation, LifecycleState, ReplaceReason};

/// Judge one observation.
///
/// `NoAction` iff the instance exists, is running, and answered the probe.
pub fn decide(observation: &HealthObservation) -> Action {
    if !observation.exists {
        return Action::Replace(ReplaceReason::NotFound);
    }
    match &observation.state {
        Some(state) if state.is_running() => {
            if observation.reachable {
                Action::NoAction
            } else {
                Action::Replace(ReplaceReason::Unreachable)
            }
        }
        Some(state) => Action::Replace(ReplaceReason::NotRunning(state.clone())),
        // An existing instance always reports a state; without one nothing
        // can be said about it.
        None => Action::Replace(ReplaceReason::NotRunning(LifecycleState::Other(
            "unknown".to_string(),
        ))),
    }
}

/// First zone, in provider order, that differs from `current_zone`.
///
/// Deterministic: no weighting and no memory of zones that failed before.
pub fn pick_target_zone<'a>(zones: &'a [String], current_zone: &str) -> Option<&'a str> {
    zones
        .iter()
        .map(String::as_str)
        .find(|zone| *zone != current_zone)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn running(reachable: bool) -> HealthObservation {
        HealthObservation::probed(1_700_000_000, reachable)
    }

    #[test]
    fn healthy_instance_needs_nothing() {
        assert_eq!(decide(&running(true)), Action::NoAction);
    }

    #[test]
    fn missing_instance_is_not_found() {
        assert_eq!(
            decide(&HealthObservation::not_found(1)),
            Action::Replace(ReplaceReason::NotFound)
        );
    }

    #[test]
    fn terminated_instance_is_not_running() {
        let obs = HealthObservation::not_running(1, LifecycleState::Terminated);
        assert_eq!(
            decide(&obs),
            Action::Replace(ReplaceReason::NotRunning(LifecycleState::Terminated))
        );
    }

    #[test]
    fn single_failed_probe_replaces_running_instance() {
        assert_eq!(
            decide(&running(false)),
            Action::Replace(ReplaceReason::Unreachable)
        );
    }

    #[test]
    fn target_zone_skips_current() {
        let zones: Vec<String> = ["us-east-1a", "us-east-1b", "us-east-1c"]
            .iter()
            .map(|z| z.to_string())
            .collect();
        assert_eq!(pick_target_zone(&zones, "us-east-1a"), Some("us-east-1b"));
        assert_eq!(pick_target_zone(&zones, "us-east-1b"), Some("us-east-1a"));
        assert_eq!(pick_target_zone(&zones, "eu-west-1a"), Some("us-east-1a"));
    }

    #[test]
    fn no_alternate_zone() {
        let zones = vec!["us-east-1a".to_string()];
        assert_eq!(pick_target_zone(&zones, "us-east-1a"), None);
        assert_eq!(pick_target_zone(&[], "us-east-1a"), None);
    }

    fn lifecycle_state() -> impl Strategy<Value = LifecycleState> {
        prop_oneof![
            Just(LifecycleState::Pending),
            Just(LifecycleState::Running),
            Just(LifecycleState::ShuttingDown),
            Just(LifecycleState::Terminated),
            Just(LifecycleState::Stopping),
            Just(LifecycleState::Stopped),
            "[a-z-]{1,12}".prop_map(LifecycleState::from),
        ]
    }

    fn observation() -> impl Strategy<Value = HealthObservation> {
        (
            any::<u64>(),
            any::<bool>(),
            proptest::option::of(lifecycle_state()),
            any::<bool>(),
        )
            .prop_map(|(observed_at, exists, state, reachable)| HealthObservation {
                observed_at,
                exists,
                state,
                reachable,
            })
    }

    proptest! {
        #[test]
        fn no_action_iff_exists_running_and_reachable(obs in observation()) {
            let healthy = obs.exists
                && obs.state.as_ref().is_some_and(LifecycleState::is_running)
                && obs.reachable;
            prop_assert_eq!(decide(&obs) == Action::NoAction, healthy);
        }

        #[test]
        fn decision_depends_only_on_its_input(obs in observation(), other in observation()) {
            let first = decide(&obs);
            let _ = decide(&other);
            prop_assert_eq!(decide(&obs.clone()), first);
        }

        #[test]
        fn timestamp_never_changes_the_decision(obs in observation(), at in any::<u64>()) {
            let shifted = HealthObservation { observed_at: at, ..obs.clone() };
            prop_assert_eq!(decide(&shifted), decide(&obs));
        }

        #[test]
        fn picked_zone_differs_from_current(
            zones in proptest::collection::vec("[a-c]", 0..5),
            current in "[a-c]",
        ) {
            if let Some(target) = pick_target_zone(&zones, &current) {
                prop_assert_ne!(target, current.as_str());
            } else {
                prop_assert!(zones.iter().all(|z| *z == current));
            }
        }
    }
}
