//! Recovery plans: the declarative input to an execution.
//!
//! A plan is an ordered list of waves. Each wave names the protection groups
//! whose servers are recovered together as one external job, and may carry a
//! pause gate or an auto-advance delay.
//!
//! ## Invariants
//!
//! - Wave numbers are unique and strictly increasing.
//! - Every wave references at least one protection group.
//! - A server must not appear in more than one protection group of the same
//!   plan. This depends on live group membership, so it is checked at
//!   authoring time with [`RecoveryPlan::find_server_conflicts`], not at
//!   execution time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::ServerId;
use crate::resolver::ServerResolver;

/// How partial server failures inside a completed job affect the wave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveFailurePolicy {
    /// The wave succeeds if at least one server launched.
    #[default]
    AnyLaunched,
    /// The wave succeeds only if every server launched.
    AllLaunched,
}

impl WaveFailurePolicy {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::AnyLaunched => "any_launched",
            Self::AllLaunched => "all_launched",
        }
    }
}

impl std::str::FromStr for WaveFailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any_launched" | "any" => Ok(Self::AnyLaunched),
            "all_launched" | "all" => Ok(Self::AllLaunched),
            other => Err(Error::configuration(format!(
                "unknown wave failure policy '{other}' (expected any_launched or all_launched)"
            ))),
        }
    }
}

/// One ordered stage of a recovery plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveDefinition {
    /// Ordering key, unique within the plan.
    pub wave_number: u32,
    /// Protection groups recovered by this wave.
    pub protection_group_ids: Vec<String>,
    /// If true, the wave does not start until an explicit resume.
    #[serde(default)]
    pub pause_before_execution: bool,
    /// Delay before auto-advancing into this wave when it is not gated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_secs: Option<u64>,
}

impl WaveDefinition {
    /// Creates an ungated wave with no auto-advance delay.
    #[must_use]
    pub fn new<I, S>(wave_number: u32, protection_group_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            wave_number,
            protection_group_ids: protection_group_ids.into_iter().map(Into::into).collect(),
            pause_before_execution: false,
            wait_time_secs: None,
        }
    }

    /// Requires an explicit resume before this wave starts.
    #[must_use]
    pub fn paused(mut self) -> Self {
        self.pause_before_execution = true;
        self
    }

    /// Delays auto-advance into this wave.
    #[must_use]
    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time_secs = Some(wait.as_secs());
        self
    }

    /// Returns the auto-advance delay (zero when unset).
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs.unwrap_or(0))
    }
}

/// A declarative, multi-wave recovery plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlan {
    /// Unique plan identifier.
    pub plan_id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ordered wave definitions.
    pub waves: Vec<WaveDefinition>,
    /// Overrides the orchestrator's default partial-failure policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<WaveFailurePolicy>,
}

/// A server referenced by more than one protection group of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConflict {
    /// The doubly-referenced server.
    pub server_id: ServerId,
    /// The protection groups that resolve to it, sorted.
    pub protection_group_ids: Vec<String>,
}

impl RecoveryPlan {
    /// Starts building a plan.
    #[must_use]
    pub fn builder(plan_id: impl Into<String>) -> RecoveryPlanBuilder {
        RecoveryPlanBuilder {
            plan: Self {
                plan_id: plan_id.into(),
                name: None,
                waves: Vec::new(),
                failure_policy: None,
            },
        }
    }

    /// Validates the structural invariants of the plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlan`] describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Error::InvalidPlan {
            plan_id: self.plan_id.clone(),
            message,
        };

        if self.plan_id.trim().is_empty() {
            return Err(invalid("plan id must not be empty".into()));
        }
        if self.waves.is_empty() {
            return Err(invalid("plan must contain at least one wave".into()));
        }

        let mut previous: Option<u32> = None;
        for wave in &self.waves {
            if let Some(prev) = previous {
                if wave.wave_number <= prev {
                    return Err(invalid(format!(
                        "wave numbers must be unique and strictly increasing ({prev} followed by {})",
                        wave.wave_number
                    )));
                }
            }
            if wave.protection_group_ids.is_empty() {
                return Err(invalid(format!(
                    "wave {} references no protection groups",
                    wave.wave_number
                )));
            }
            previous = Some(wave.wave_number);
        }

        Ok(())
    }

    /// Returns the wave with the given number.
    #[must_use]
    pub fn wave(&self, wave_number: u32) -> Option<&WaveDefinition> {
        self.waves.iter().find(|w| w.wave_number == wave_number)
    }

    /// Returns every protection group referenced by the plan, deduplicated.
    #[must_use]
    pub fn protection_group_ids(&self) -> BTreeSet<&str> {
        self.waves
            .iter()
            .flat_map(|w| w.protection_group_ids.iter().map(String::as_str))
            .collect()
    }

    /// Resolves every referenced protection group and reports servers that
    /// belong to more than one of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver fails for any group.
    pub async fn find_server_conflicts(
        &self,
        resolver: &dyn ServerResolver,
    ) -> Result<Vec<ServerConflict>> {
        let mut owners: BTreeMap<ServerId, BTreeSet<String>> = BTreeMap::new();
        for group in self.protection_group_ids() {
            for server in resolver.resolve_servers(group).await? {
                owners.entry(server).or_default().insert(group.to_string());
            }
        }

        Ok(owners
            .into_iter()
            .filter(|(_, groups)| groups.len() > 1)
            .map(|(server_id, groups)| ServerConflict {
                server_id,
                protection_group_ids: groups.into_iter().collect(),
            })
            .collect())
    }
}

/// Builder for [`RecoveryPlan`] that validates on [`RecoveryPlanBuilder::build`].
#[derive(Debug, Clone)]
pub struct RecoveryPlanBuilder {
    plan: RecoveryPlan,
}

impl RecoveryPlanBuilder {
    /// Sets the human-readable name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.plan.name = Some(name.into());
        self
    }

    /// Appends a wave.
    #[must_use]
    pub fn wave(mut self, wave: WaveDefinition) -> Self {
        self.plan.waves.push(wave);
        self
    }

    /// Overrides the partial-failure policy for this plan.
    #[must_use]
    pub fn failure_policy(mut self, policy: WaveFailurePolicy) -> Self {
        self.plan.failure_policy = Some(policy);
        self
    }

    /// Validates and returns the plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlan`] if the plan violates an invariant.
    pub fn build(self) -> Result<RecoveryPlan> {
        self.plan.validate()?;
        Ok(self.plan)
    }
}

/// Read access to recovery plans.
#[async_trait]
pub trait PlanSource: Send + Sync {
    /// Gets a plan by ID. Returns `None` if it does not exist.
    async fn get_plan(&self, plan_id: &str) -> Result<Option<RecoveryPlan>>;
}

/// Plan source backed by a process-local map.
#[derive(Debug, Default)]
pub struct InMemoryPlanSource {
    plans: RwLock<HashMap<String, RecoveryPlan>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryPlanSource {
    /// Creates an empty plan source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a plan source holding the given plans.
    ///
    /// # Errors
    ///
    /// Returns an error if any plan fails validation.
    pub fn from_plans(plans: impl IntoIterator<Item = RecoveryPlan>) -> Result<Self> {
        let source = Self::new();
        for plan in plans {
            source.insert(plan)?;
        }
        Ok(source)
    }

    /// Validates and stores a plan, replacing any plan with the same ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan fails validation.
    pub fn insert(&self, plan: RecoveryPlan) -> Result<()> {
        plan.validate()?;
        self.plans
            .write()
            .map_err(poison_err)?
            .insert(plan.plan_id.clone(), plan);
        Ok(())
    }
}

#[async_trait]
impl PlanSource for InMemoryPlanSource {
    async fn get_plan(&self, plan_id: &str) -> Result<Option<RecoveryPlan>> {
        let plans = self.plans.read().map_err(poison_err)?;
        Ok(plans.get(plan_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticServerResolver;

    fn three_wave_plan() -> Result<RecoveryPlan> {
        RecoveryPlan::builder("plan-web")
            .name("web tier")
            .wave(WaveDefinition::new(1, ["pg-db"]))
            .wave(WaveDefinition::new(2, ["pg-app"]).paused())
            .wave(WaveDefinition::new(3, ["pg-web"]).with_wait_time(Duration::from_secs(30)))
            .build()
    }

    #[test]
    fn builder_accepts_valid_plan() -> Result<()> {
        let plan = three_wave_plan()?;
        assert_eq!(plan.waves.len(), 3);
        assert!(plan.wave(2).is_some_and(|w| w.pause_before_execution));
        assert_eq!(plan.wave(3).map(WaveDefinition::wait_time), Some(Duration::from_secs(30)));
        Ok(())
    }

    #[test]
    fn rejects_empty_plan() {
        let err = RecoveryPlan::builder("empty").build().unwrap_err();
        assert!(err.to_string().contains("at least one wave"));
    }

    #[test]
    fn rejects_duplicate_or_decreasing_wave_numbers() {
        let duplicate = RecoveryPlan::builder("dup")
            .wave(WaveDefinition::new(1, ["a"]))
            .wave(WaveDefinition::new(1, ["b"]))
            .build();
        assert!(matches!(duplicate, Err(Error::InvalidPlan { .. })));

        let decreasing = RecoveryPlan::builder("dec")
            .wave(WaveDefinition::new(2, ["a"]))
            .wave(WaveDefinition::new(1, ["b"]))
            .build();
        assert!(matches!(decreasing, Err(Error::InvalidPlan { .. })));
    }

    #[test]
    fn rejects_wave_without_groups() {
        let plan = RecoveryPlan::builder("bare")
            .wave(WaveDefinition::new(1, Vec::<String>::new()))
            .build();
        assert!(plan.unwrap_err().to_string().contains("no protection groups"));
    }

    #[test]
    fn deserializes_camel_case_document() -> Result<()> {
        let json = r#"{
            "planId": "plan-1",
            "waves": [
                {"waveNumber": 1, "protectionGroupIds": ["pg-1"]},
                {"waveNumber": 2, "protectionGroupIds": ["pg-2"], "pauseBeforeExecution": true, "waitTimeSecs": 5}
            ],
            "failurePolicy": "all_launched"
        }"#;
        let plan: RecoveryPlan =
            serde_json::from_str(json).map_err(|e| Error::serialization(e.to_string()))?;
        plan.validate()?;
        assert_eq!(plan.failure_policy, Some(WaveFailurePolicy::AllLaunched));
        assert!(!plan.waves[0].pause_before_execution);
        assert_eq!(plan.waves[1].wait_time(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn failure_policy_parses_names() {
        assert_eq!(
            "ALL_LAUNCHED".parse::<WaveFailurePolicy>().ok(),
            Some(WaveFailurePolicy::AllLaunched)
        );
        assert!("most".parse::<WaveFailurePolicy>().is_err());
    }

    #[tokio::test]
    async fn detects_servers_shared_between_groups() -> Result<()> {
        let resolver = StaticServerResolver::new();
        resolver.set_group("pg-db", ["s-1", "s-2"])?;
        resolver.set_group("pg-app", ["s-2", "s-3"])?;
        resolver.set_group("pg-web", ["s-4"])?;

        let conflicts = three_wave_plan()?.find_server_conflicts(&resolver).await?;

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server_id, ServerId::from("s-2"));
        assert_eq!(conflicts[0].protection_group_ids, vec!["pg-app", "pg-db"]);
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_source_validates_on_insert() -> Result<()> {
        let source = InMemoryPlanSource::from_plans([three_wave_plan()?])?;
        assert!(source.get_plan("plan-web").await?.is_some());
        assert!(source.get_plan("missing").await?.is_none());

        let invalid = RecoveryPlan {
            plan_id: "bad".into(),
            name: None,
            waves: vec![],
            failure_policy: None,
        };
        assert!(source.insert(invalid).is_err());
        Ok(())
    }
}
