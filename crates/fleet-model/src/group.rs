//! The hierarchical group namespace.
//!
//! A group holds apps, pods and subgroups at one level of the path tree
//! plus an unordered set of dependency edges. The root group (path `/`)
//! carries the global version; every mutation flows through a transform on
//! the root and bumps versions along the touched path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::app::AppSpec;
use crate::error::{Result, ValidationError};
use crate::path::PathId;
use crate::pod::PodSpec;
use crate::runspec::RunSpec;

/// One level of the namespace tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Absolute id of this group.
    pub id: PathId,
    /// Applications directly at this level, keyed by absolute id.
    #[serde(default)]
    pub apps: BTreeMap<PathId, AppSpec>,
    /// Pods directly at this level, keyed by absolute id.
    #[serde(default)]
    pub pods: BTreeMap<PathId, PodSpec>,
    /// Child groups, keyed by absolute id.
    #[serde(default)]
    pub groups: BTreeMap<PathId, Group>,
    /// Dependency edges declared at group level; they apply to every
    /// descendant run spec.
    #[serde(default)]
    pub dependencies: BTreeSet<PathId>,
    /// Version timestamp; the root's version is the global version.
    pub version: DateTime<Utc>,
}

impl Group {
    /// An empty group at the given path.
    pub fn empty(id: PathId, version: DateTime<Utc>) -> Self {
        Group {
            id,
            apps: BTreeMap::new(),
            pods: BTreeMap::new(),
            groups: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            version,
        }
    }

    /// An empty root group.
    pub fn empty_root(version: DateTime<Utc>) -> Self {
        Group::empty(PathId::root(), version)
    }

    /// All run specs in this subtree, keyed by id.
    pub fn transitive_run_specs(&self) -> BTreeMap<PathId, RunSpec> {
        let mut out = BTreeMap::new();
        self.collect_run_specs(&mut out);
        out
    }

    fn collect_run_specs(&self, out: &mut BTreeMap<PathId, RunSpec>) {
        for (id, app) in &self.apps {
            out.insert(id.clone(), RunSpec::App(app.clone()));
        }
        for (id, pod) in &self.pods {
            out.insert(id.clone(), RunSpec::Pod(pod.clone()));
        }
        for child in self.groups.values() {
            child.collect_run_specs(out);
        }
    }

    /// All groups in this subtree including `self`, keyed by id.
    pub fn transitive_groups(&self) -> BTreeMap<PathId, &Group> {
        let mut out = BTreeMap::new();
        self.collect_groups(&mut out);
        out
    }

    fn collect_groups<'a>(&'a self, out: &mut BTreeMap<PathId, &'a Group>) {
        out.insert(self.id.clone(), self);
        for child in self.groups.values() {
            child.collect_groups(out);
        }
    }

    /// Look up a run spec anywhere in the subtree.
    pub fn run_spec(&self, id: &PathId) -> Option<RunSpec> {
        if let Some(app) = self.find_group_of(id).and_then(|g| g.apps.get(id)) {
            return Some(RunSpec::App(app.clone()));
        }
        self.find_group_of(id).and_then(|g| g.pods.get(id)).map(|p| RunSpec::Pod(p.clone()))
    }

    /// Look up a group anywhere in the subtree.
    pub fn group(&self, id: &PathId) -> Option<&Group> {
        if *id == self.id {
            return Some(self);
        }
        self.groups
            .values()
            .find(|g| id.is_under(&g.id))
            .and_then(|g| g.group(id))
    }

    fn find_group_of(&self, spec_id: &PathId) -> Option<&Group> {
        self.group(&spec_id.parent())
    }

    /// Insert or replace an app, creating intermediate groups. Replacing an
    /// existing app records whether the change is configuration or pure
    /// scaling in the new rendition's version info.
    pub fn put_app(&mut self, mut app: AppSpec, now: DateTime<Utc>) {
        let parent = app.id.parent();
        let existing = self.find_group_of(&app.id).and_then(|g| g.apps.get(&app.id)).cloned();
        app.version = now;
        app.version_info = match existing {
            Some(old) if old.config_equivalent(&app) => {
                old.version_info.with_scaling(now)
            }
            Some(old) => old.version_info.with_config_change(now),
            None => crate::app::VersionInfo::new(now),
        };
        let group = self.ensure_group_mut(&parent, now);
        group.apps.insert(app.id.clone(), app);
        self.touch_path(&parent, now);
    }

    /// Insert or replace a pod, creating intermediate groups.
    pub fn put_pod(&mut self, mut pod: PodSpec, now: DateTime<Utc>) {
        let parent = pod.id.parent();
        let existing = self.find_group_of(&pod.id).and_then(|g| g.pods.get(&pod.id)).cloned();
        pod.version = now;
        pod.version_info = match existing {
            Some(old) if old.config_equivalent(&pod) => old.version_info.with_scaling(now),
            Some(old) => old.version_info.with_config_change(now),
            None => crate::app::VersionInfo::new(now),
        };
        let group = self.ensure_group_mut(&parent, now);
        group.pods.insert(pod.id.clone(), pod);
        self.touch_path(&parent, now);
    }

    /// Remove an app; returns the removed spec.
    pub fn remove_app(&mut self, id: &PathId, now: DateTime<Utc>) -> Option<AppSpec> {
        let parent = id.parent();
        let removed = self.group_mut(&parent)?.apps.remove(id);
        if removed.is_some() {
            self.touch_path(&parent, now);
        }
        removed
    }

    /// Remove a pod; returns the removed spec.
    pub fn remove_pod(&mut self, id: &PathId, now: DateTime<Utc>) -> Option<PodSpec> {
        let parent = id.parent();
        let removed = self.group_mut(&parent)?.pods.remove(id);
        if removed.is_some() {
            self.touch_path(&parent, now);
        }
        removed
    }

    /// Remove a whole subtree; returns the removed group.
    pub fn remove_group(&mut self, id: &PathId, now: DateTime<Utc>) -> Option<Group> {
        let parent = id.parent();
        let removed = self.group_mut(&parent)?.groups.remove(id);
        if removed.is_some() {
            self.touch_path(&parent, now);
        }
        removed
    }

    /// Change the instance count of a run spec in place, recording a
    /// scaling-only change.
    pub fn scale_run_spec(
        &mut self,
        id: &PathId,
        instances: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let spec = self
            .run_spec(id)
            .ok_or_else(|| ValidationError::InvalidRunSpec(id.clone(), "unknown".to_string()))?;
        match spec.with_instances(instances, now) {
            RunSpec::App(app) => {
                let group = self.ensure_group_mut(&app.id.parent(), now);
                group.apps.insert(app.id.clone(), app);
            }
            RunSpec::Pod(pod) => {
                let group = self.ensure_group_mut(&pod.id.parent(), now);
                group.pods.insert(pod.id.clone(), pod);
            }
        }
        self.touch_path(&id.parent(), now);
        Ok(())
    }

    fn group_mut(&mut self, id: &PathId) -> Option<&mut Group> {
        if *id == self.id {
            return Some(self);
        }
        let child_id = {
            let depth = self.id.segments().len();
            let segment = id.segments().get(depth)?;
            self.id.join(segment)
        };
        self.groups.get_mut(&child_id).and_then(|g| g.group_mut(id))
    }

    fn ensure_group_mut(&mut self, id: &PathId, now: DateTime<Utc>) -> &mut Group {
        if *id == self.id {
            return self;
        }
        let depth = self.id.segments().len();
        let segment = id.segments()[depth].clone();
        let child_id = self.id.join(&segment);
        let child = self
            .groups
            .entry(child_id.clone())
            .or_insert_with(|| Group::empty(child_id, now));
        child.ensure_group_mut(id, now)
    }

    /// Bump versions along the path from the root to `id`.
    fn touch_path(&mut self, id: &PathId, now: DateTime<Utc>) {
        self.version = now;
        if *id != self.id {
            let depth = self.id.segments().len();
            if let Some(segment) = id.segments().get(depth) {
                let child_id = self.id.join(segment);
                if let Some(child) = self.groups.get_mut(&child_id) {
                    child.touch_path(id, now);
                }
            }
        }
    }

    /// Effective dependency edges at run-spec granularity: each spec's own
    /// dependencies plus those of its enclosing groups, with group targets
    /// expanded to every spec beneath them.
    pub fn dependency_map(&self) -> BTreeMap<PathId, BTreeSet<PathId>> {
        let specs = self.transitive_run_specs();
        let groups = self.transitive_groups();
        let mut out: BTreeMap<PathId, BTreeSet<PathId>> = BTreeMap::new();
        for (id, spec) in &specs {
            let mut declared: BTreeSet<PathId> = spec.dependencies().clone();
            for ancestor in id.ancestors() {
                if let Some(group) = groups.get(&ancestor) {
                    declared.extend(group.dependencies.iter().cloned());
                }
            }
            let mut resolved = BTreeSet::new();
            for dep in declared {
                if specs.contains_key(&dep) {
                    resolved.insert(dep);
                } else {
                    // A group dependency means every spec beneath it.
                    resolved.extend(
                        specs.keys().filter(|s| s.is_under(&dep) && *s != id).cloned(),
                    );
                }
            }
            resolved.remove(id);
            out.insert(id.clone(), resolved);
        }
        out
    }

    /// Validate the subtree: immediate ids must be unique across apps, pods
    /// and subgroups, every entity must live under its parent, specs must be
    /// individually valid, and the dependency graph must be acyclic.
    pub fn validate(&self) -> Result<()> {
        self.validate_structure()?;
        let dependencies = self.dependency_map();
        // Kahn's algorithm; leftovers mean a cycle.
        let mut in_degree: BTreeMap<&PathId, usize> =
            dependencies.keys().map(|id| (id, 0)).collect();
        for deps in dependencies.values() {
            for dep in deps {
                if let Some(degree) = in_degree.get_mut(dep) {
                    *degree += 1;
                }
            }
        }
        let mut queue: VecDeque<&PathId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for dep in &dependencies[id] {
                if let Some(degree) = in_degree.get_mut(dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }
        if processed != dependencies.len() {
            return Err(ValidationError::CyclicDependency);
        }
        Ok(())
    }

    fn validate_structure(&self) -> Result<()> {
        let mut immediate = BTreeSet::new();
        for id in self.apps.keys().chain(self.pods.keys()).chain(self.groups.keys()) {
            if id.parent() != self.id {
                return Err(ValidationError::NotAChild(id.clone(), self.id.clone()));
            }
            let base = id.basename().unwrap_or_default().to_string();
            if !immediate.insert(base.clone()) {
                return Err(ValidationError::DuplicateId(self.id.clone(), base));
            }
        }
        for app in self.apps.values() {
            app.validate()?;
        }
        for pod in self.pods.values() {
            pod.validate()?;
        }
        for child in self.groups.values() {
            child.validate_structure()?;
        }
        Ok(())
    }
}
