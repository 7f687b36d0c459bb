//! Job router: classify an incoming job into a queue, priority, and
//! resource profile.
//!
//! Routing is deterministic and side-effect-free. Rules apply in order,
//! first match wins:
//!
//! 1. capability labels (`gpu`, `high-memory`) pick the profile directly;
//! 2. the repository rule table picks the profile;
//! 3. otherwise the default profile.
//!
//! Priority starts at the repository tier's base and shifts with event
//! metadata: default-branch jobs move up one, pull-request jobs move
//! down one, clamped to 1..=5.

use crate::config::{RouterConfig, RunnerConfig};
use crate::kernel::jobs::ResourceProfile;

/// Repository service tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoTier {
    Gold,
    Silver,
    Bronze,
}

impl RepoTier {
    fn base_priority(&self) -> i16 {
        match self {
            RepoTier::Gold => 1,
            RepoTier::Silver => 2,
            RepoTier::Bronze => 4,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "gold" => Some(RepoTier::Gold),
            "silver" => Some(RepoTier::Silver),
            "bronze" => Some(RepoTier::Bronze),
            _ => None,
        }
    }
}

/// The routing result attached to a job before it is enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub queue_name: String,
    pub priority: i16,
    pub profile: ResourceProfile,
    pub required_labels: Vec<String>,
}

/// The classifier. Built once from config, then pure.
pub struct Router {
    profile_rules: Vec<(String, String)>,
    tier_rules: Vec<(String, RepoTier)>,
    default_image: String,
}

impl Router {
    pub fn new(config: &RouterConfig, runner: &RunnerConfig) -> Self {
        Self {
            profile_rules: config.rules.clone(),
            tier_rules: config
                .tiers
                .iter()
                .filter_map(|(pattern, tier)| {
                    RepoTier::parse(tier).map(|t| (pattern.clone(), t))
                })
                .collect(),
            default_image: runner.default_image.clone(),
        }
    }

    /// Classify a job request.
    ///
    /// `on_default_branch`: `Some(true)` for default-branch pushes,
    /// `Some(false)` for pull requests, `None` when the delivery
    /// carried no branch metadata.
    pub fn route(
        &self,
        repository: &str,
        requested_labels: &[String],
        on_default_branch: Option<bool>,
    ) -> RouteDecision {
        let profile = self.pick_profile(repository, requested_labels);
        let priority = self.priority_for(repository, on_default_branch);
        // Critical-priority work on the stock profile gets the fast
        // lane; specialized profiles keep their own queues.
        let queue_name = if priority == 1 && profile.name == "default" {
            "critical".to_string()
        } else {
            queue_for_profile(&profile.name)
        };
        let required_labels = requested_labels
            .iter()
            .filter(|l| !is_capability_tag(l))
            .cloned()
            .collect();

        RouteDecision {
            queue_name,
            priority,
            profile,
            required_labels,
        }
    }

    fn pick_profile(&self, repository: &str, labels: &[String]) -> ResourceProfile {
        // 1. Capability tags win outright.
        if labels.iter().any(|l| l == "gpu") {
            return ResourceProfile::gpu(&self.default_image);
        }
        if labels.iter().any(|l| l == "high-memory") {
            return ResourceProfile::high_memory(&self.default_image);
        }

        // 2. Repository rules, first match wins.
        for (pattern, profile_name) in &self.profile_rules {
            if pattern_matches(pattern, repository) {
                return ResourceProfile::by_name(profile_name, &self.default_image);
            }
        }

        // 3. Default profile.
        ResourceProfile::default_profile(&self.default_image)
    }

    fn priority_for(&self, repository: &str, on_default_branch: Option<bool>) -> i16 {
        let base = self
            .tier_rules
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, repository))
            .map(|(_, tier)| tier.base_priority())
            .unwrap_or(3);

        let adjusted = match on_default_branch {
            Some(true) => base - 1,
            Some(false) => base + 1,
            None => base,
        };
        adjusted.clamp(1, 5)
    }
}

fn queue_for_profile(profile_name: &str) -> String {
    match profile_name {
        "gpu" => "gpu".to_string(),
        "high-memory" => "heavy".to_string(),
        _ => "default".to_string(),
    }
}

fn is_capability_tag(label: &str) -> bool {
    matches!(label, "gpu" | "high-memory")
}

/// Match `pattern` against a repository name. A trailing `*` matches any
/// suffix; otherwise the comparison is exact.
fn pattern_matches(pattern: &str, repository: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => repository.starts_with(prefix),
        None => pattern == repository,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;

    fn runner_config() -> RunnerConfig {
        RunnerConfig {
            default_image: "ghcr.io/runfleet/runner:latest".into(),
            allowed_image_prefixes: vec!["ghcr.io/runfleet/".into()],
            allowed_bind_paths: vec![],
            max_execution: std::time::Duration::from_secs(3_600),
        }
    }

    fn router() -> Router {
        Router::new(
            &RouterConfig {
                rules: vec![
                    ("acme/data-*".into(), "high-memory".into()),
                    ("ml/*".into(), "gpu".into()),
                ],
                tiers: vec![
                    ("acme/*".into(), "gold".into()),
                    ("community/*".into(), "bronze".into()),
                ],
            },
            &runner_config(),
        )
    }

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_labels_route_to_default_queue_at_priority_three() {
        let plain = Router::new(&RouterConfig::default(), &runner_config());
        let decision = plain.route("acme/web", &labels(&["self-hosted", "x64"]), None);
        assert_eq!(decision.queue_name, "default");
        assert_eq!(decision.priority, 3);
        assert_eq!(decision.profile.name, "default");
    }

    #[test]
    fn gpu_label_overrides_repo_rules() {
        let decision = router().route("acme/data-etl", &labels(&["gpu"]), None);
        assert_eq!(decision.profile.name, "gpu");
        assert_eq!(decision.queue_name, "gpu");
    }

    #[test]
    fn repo_rule_applies_without_capability_tag() {
        let decision = router().route("acme/data-etl", &labels(&["self-hosted"]), None);
        assert_eq!(decision.profile.name, "high-memory");
        assert_eq!(decision.queue_name, "heavy");
    }

    #[test]
    fn first_matching_rule_wins() {
        let decision = router().route("ml/train", &labels(&[]), None);
        assert_eq!(decision.profile.name, "gpu");
    }

    #[test]
    fn gold_tier_stock_profile_takes_the_fast_lane() {
        let decision = router().route("acme/web", &labels(&["self-hosted"]), None);
        assert_eq!(decision.priority, 1);
        assert_eq!(decision.queue_name, "critical");
    }

    #[test]
    fn tier_sets_base_priority() {
        let r = router();
        assert_eq!(r.route("acme/web", &[], None).priority, 1);
        assert_eq!(r.route("community/tool", &[], None).priority, 4);
        assert_eq!(r.route("other/repo", &[], None).priority, 3);
    }

    #[test]
    fn branch_metadata_shifts_priority_within_bounds() {
        let r = router();
        // Gold tier is already at 1; the default-branch bump clamps.
        assert_eq!(r.route("acme/web", &[], Some(true)).priority, 1);
        assert_eq!(r.route("acme/web", &[], Some(false)).priority, 2);
        assert_eq!(r.route("community/tool", &[], Some(false)).priority, 5);
    }

    #[test]
    fn capability_tags_are_stripped_from_required_labels() {
        let decision = router().route("x/y", &labels(&["self-hosted", "gpu", "x64"]), None);
        assert_eq!(decision.required_labels, labels(&["self-hosted", "x64"]));
    }

    #[test]
    fn routing_is_deterministic() {
        let r = router();
        let a = r.route("acme/web", &labels(&["self-hosted"]), Some(false));
        let b = r.route("acme/web", &labels(&["self-hosted"]), Some(false));
        assert_eq!(a, b);
    }

    #[test]
    fn pattern_matching_semantics() {
        assert!(pattern_matches("acme/*", "acme/web"));
        assert!(pattern_matches("acme/web", "acme/web"));
        assert!(!pattern_matches("acme/web", "acme/web2"));
        assert!(!pattern_matches("acme/*", "other/web"));
    }
}
