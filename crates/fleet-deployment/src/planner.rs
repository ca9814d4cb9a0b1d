//! The deployment planner.
//!
//! Diffs a current root group against a target root group and emits an
//! ordered [`DeploymentPlan`]. Actions land in dependency layers: anything
//! a spec depends on is handled in a strictly earlier step. Within one
//! layer, starts precede scales and stops, which precede restarts; within
//! one step every action touches a distinct spec, so steps execute their
//! actions concurrently.

use std::collections::BTreeMap;
use tracing::{debug, info};

use fleet_model::{
    DeploymentAction, DeploymentPlan, DeploymentStep, Group, PathId, RunSpec, ValidationError,
};

use crate::{Error, Result};

/// Compute the plan that converges `original` to `target`.
///
/// Planning a target whose dependency graph contains a cycle fails with the
/// `cyclic dependencies` error and produces no plan.
pub fn plan_deployment(original: &Group, target: &Group) -> Result<DeploymentPlan> {
    match target.validate() {
        Ok(()) => {}
        Err(ValidationError::CyclicDependency) => {
            return Err(Error::Plan("cyclic dependencies".to_string()));
        }
        Err(other) => return Err(Error::Model(other)),
    }

    let original_specs = original.transitive_run_specs();
    let target_specs = target.transitive_run_specs();
    let layers = dependency_layers(target);

    // (layer, phase) -> actions; phases order starts before scales/stops
    // before restarts inside one layer.
    const PHASE_START: u8 = 0;
    const PHASE_SCALE_STOP: u8 = 1;
    const PHASE_RESTART: u8 = 2;
    let mut buckets: BTreeMap<(usize, u8), Vec<DeploymentAction>> = BTreeMap::new();
    let mut artifacts: Vec<(String, String)> = Vec::new();

    for (id, spec) in &target_specs {
        let layer = layers.get(id).copied().unwrap_or(0);
        match original_specs.get(id) {
            None => {
                debug!(spec = %id, "plan: start");
                collect_artifacts(spec, &mut artifacts);
                buckets.entry((layer, PHASE_START)).or_default().push(
                    DeploymentAction::StartApplication {
                        spec: spec.clone(),
                        scale_to: spec.instances(),
                    },
                );
            }
            Some(existing) if existing.is_upgrade(spec) => {
                debug!(spec = %id, "plan: restart");
                collect_artifacts(spec, &mut artifacts);
                buckets
                    .entry((layer, PHASE_RESTART))
                    .or_default()
                    .push(DeploymentAction::RestartApplication { spec: spec.clone() });
            }
            Some(existing) if existing.instances() != spec.instances() => {
                // A pure scale change never produces a restart.
                debug!(spec = %id, from = existing.instances(), to = spec.instances(), "plan: scale");
                buckets.entry((layer, PHASE_SCALE_STOP)).or_default().push(
                    DeploymentAction::ScaleApplication {
                        spec: spec.clone(),
                        scale_to: spec.instances(),
                        to_kill: None,
                    },
                );
            }
            Some(_) => {}
        }
    }

    for (id, spec) in &original_specs {
        if !target_specs.contains_key(id) {
            debug!(spec = %id, "plan: stop");
            buckets
                .entry((0, PHASE_SCALE_STOP))
                .or_default()
                .push(DeploymentAction::StopApplication { spec: spec.clone() });
        }
    }

    let mut steps = Vec::new();
    if !artifacts.is_empty() {
        steps.push(DeploymentStep::new(vec![DeploymentAction::ResolveArtifacts {
            urls: artifacts,
        }]));
    }
    for (_, actions) in buckets {
        if !actions.is_empty() {
            steps.push(DeploymentStep::new(actions));
        }
    }

    let plan =
        DeploymentPlan::new(original.clone(), target.clone(), steps, target.version);
    info!(
        plan = plan.id,
        steps = plan.steps.len(),
        specs = plan.affected_run_specs().len(),
        "deployment planned"
    );
    Ok(plan)
}

/// Dependency depth per spec: 0 for roots of the dependency forest, one
/// more than the deepest dependency otherwise.
fn dependency_layers(target: &Group) -> BTreeMap<PathId, usize> {
    let dependencies = target.dependency_map();
    let mut layers: BTreeMap<PathId, usize> = BTreeMap::new();

    fn depth(
        id: &PathId,
        dependencies: &BTreeMap<PathId, std::collections::BTreeSet<PathId>>,
        layers: &mut BTreeMap<PathId, usize>,
    ) -> usize {
        if let Some(known) = layers.get(id) {
            return *known;
        }
        // Mark before recursing; validation already rejected cycles, this
        // only guards against pathological re-entry.
        layers.insert(id.clone(), 0);
        let level = dependencies
            .get(id)
            .map(|deps| {
                deps.iter().map(|d| depth(d, dependencies, layers) + 1).max().unwrap_or(0)
            })
            .unwrap_or(0);
        layers.insert(id.clone(), level);
        level
    }

    let ids: Vec<PathId> = dependencies.keys().cloned().collect();
    for id in &ids {
        depth(id, &dependencies, &mut layers);
    }
    layers
}

fn collect_artifacts(spec: &RunSpec, out: &mut Vec<(String, String)>) {
    if let RunSpec::App(app) = spec {
        for url in &app.fetch {
            let file = url.rsplit('/').next().unwrap_or("artifact").to_string();
            let dest = format!("{}/{}", app.id.safe_id(), file);
            if !out.iter().any(|(u, _)| u == url) {
                out.push((url.clone(), dest));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_model::AppSpec;
    use std::collections::BTreeSet;

    fn app(id: &str) -> AppSpec {
        let mut app = AppSpec::new(PathId::parse(id).unwrap());
        app.cmd = Some("run".to_string());
        app.instances = 2;
        app
    }

    fn path(s: &str) -> PathId {
        PathId::parse(s).unwrap()
    }

    fn action_kinds(plan: &DeploymentPlan) -> Vec<Vec<&'static str>> {
        plan.steps
            .iter()
            .map(|s| s.actions.iter().map(DeploymentAction::kind).collect())
            .collect()
    }

    #[test]
    fn test_identical_roots_plan_no_steps() {
        let mut root = Group::empty_root(Utc::now());
        root.put_app(app("/a"), Utc::now());
        let plan = plan_deployment(&root, &root.clone()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_new_app_is_started() {
        let original = Group::empty_root(Utc::now());
        let mut target = original.clone();
        target.put_app(app("/a"), Utc::now());

        let plan = plan_deployment(&original, &target).unwrap();
        assert_eq!(action_kinds(&plan), vec![vec!["StartApplication"]]);
    }

    #[test]
    fn test_scale_only_never_restarts() {
        let mut original = Group::empty_root(Utc::now());
        original.put_app(app("/a"), Utc::now());
        let mut target = original.clone();
        target.scale_run_spec(&path("/a"), 7, Utc::now()).unwrap();

        let plan = plan_deployment(&original, &target).unwrap();
        assert_eq!(action_kinds(&plan), vec![vec!["ScaleApplication"]]);

        // Scaling back to the original count also plans no restart.
        let mut back = target.clone();
        back.scale_run_spec(&path("/a"), 2, Utc::now()).unwrap();
        let plan = plan_deployment(&target, &back).unwrap();
        assert_eq!(action_kinds(&plan), vec![vec!["ScaleApplication"]]);
    }

    #[test]
    fn test_config_change_restarts_independent_of_scaling() {
        let mut original = Group::empty_root(Utc::now());
        original.put_app(app("/a"), Utc::now());
        let mut target = original.clone();
        let mut changed = app("/a");
        changed.cmd = Some("run-v2".to_string());
        changed.instances = 9;
        target.put_app(changed, Utc::now());

        let plan = plan_deployment(&original, &target).unwrap();
        assert_eq!(action_kinds(&plan), vec![vec!["RestartApplication"]]);
    }

    #[test]
    fn test_removed_app_is_stopped() {
        let mut original = Group::empty_root(Utc::now());
        original.put_app(app("/a"), Utc::now());
        let target = Group::empty_root(Utc::now());

        let plan = plan_deployment(&original, &target).unwrap();
        assert_eq!(action_kinds(&plan), vec![vec!["StopApplication"]]);
    }

    #[test]
    fn test_dependency_layers_order_steps() {
        let original = Group::empty_root(Utc::now());
        let mut target = original.clone();
        target.put_app(app("/db"), Utc::now());
        let mut service = app("/service");
        service.dependencies = BTreeSet::from([path("/db")]);
        target.put_app(service, Utc::now());
        let mut frontend = app("/frontend");
        frontend.dependencies = BTreeSet::from([path("/service")]);
        target.put_app(frontend, Utc::now());

        let plan = plan_deployment(&original, &target).unwrap();
        assert_eq!(plan.steps.len(), 3);
        let ids: Vec<PathId> = plan
            .steps
            .iter()
            .map(|s| s.actions[0].run_spec().unwrap().id().clone())
            .collect();
        assert_eq!(ids, vec![path("/db"), path("/service"), path("/frontend")]);
    }

    #[test]
    fn test_cycle_is_rejected_with_named_error() {
        let original = Group::empty_root(Utc::now());
        let mut target = original.clone();
        let mut a = app("/a");
        a.dependencies = BTreeSet::from([path("/b")]);
        let mut b = app("/b");
        b.dependencies = BTreeSet::from([path("/a")]);
        target.put_app(a, Utc::now());
        target.put_app(b, Utc::now());

        match plan_deployment(&original, &target) {
            Err(Error::Plan(message)) => assert_eq!(message, "cyclic dependencies"),
            other => panic!("expected cyclic dependencies error, got {other:?}"),
        }
    }

    #[test]
    fn test_artifacts_resolve_first() {
        let original = Group::empty_root(Utc::now());
        let mut target = original.clone();
        let mut fetched = app("/a");
        fetched.fetch = vec!["https://repo.example.com/bundle.tgz".to_string()];
        target.put_app(fetched, Utc::now());

        let plan = plan_deployment(&original, &target).unwrap();
        assert_eq!(
            action_kinds(&plan),
            vec![vec!["ResolveArtifacts"], vec!["StartApplication"]]
        );
    }

    #[test]
    fn test_stop_and_start_share_no_step() {
        let mut original = Group::empty_root(Utc::now());
        original.put_app(app("/old"), Utc::now());
        let mut target = Group::empty_root(Utc::now());
        target.put_app(app("/new"), Utc::now());

        let plan = plan_deployment(&original, &target).unwrap();
        for step in &plan.steps {
            let ids: BTreeSet<_> =
                step.actions.iter().filter_map(|a| a.run_spec().map(|s| s.id())).collect();
            assert_eq!(ids.len(), step.actions.len());
        }
    }
}
