//! Fallback executor — runs a single-node operation against an ordered
//! node list
//!
//! The executor privileges the head of the rotation (the presumed master
//! or the last node that worked) with a small retry budget, then falls
//! through to the remaining nodes one attempt each, stopping at the first
//! success. Nodes are tried strictly sequentially: running a mutating
//! operation against two nodes at once risks duplicate side effects.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::nodes::NodeAddress;

/// Outcome of one attempt against one node. Both kinds trigger fallback;
/// the distinction only matters for the final user-facing message.
#[derive(Debug, Clone)]
pub enum AttemptError {
    /// Node reachable but the application refused (non-2xx, or a 2xx
    /// body carrying a `status:"error"` envelope)
    Node(String),
    /// DNS/connect/timeout failure before the node could answer
    Transport(String),
}

impl AttemptError {
    pub fn message(&self) -> &str {
        match self {
            AttemptError::Node(m) | AttemptError::Transport(m) => m,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Terminal failure of a whole fallback session
#[derive(Debug, Clone)]
pub enum FallbackError {
    /// Caller supplied no nodes — fails fast, no network activity
    NoNodes,
    /// Every node and retry was used without success. Carries the *last*
    /// node's error text: it is often the only actionable diagnostic.
    Exhausted { last_error: String, nodes_tried: usize },
}

impl fmt::Display for FallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackError::NoNodes => f.write_str("No nodes available"),
            FallbackError::Exhausted { last_error, nodes_tried } => {
                write!(f, "{} ({} nodes tried)", last_error, nodes_tried)
            }
        }
    }
}

/// Retry knobs. The defaults match the production constants but are
/// deliberately a struct, not hard invariants.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts against the head of the rotation before moving on
    pub master_attempts: u32,
    /// Delay between those attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { master_attempts: 3, retry_delay: Duration::from_millis(2000) }
    }
}

/// A successful session. `switched_from` is set when the winning node is
/// not the one the session started out preferring — the UI shows this as
/// an informational "switched node" notice with the old node's error.
#[derive(Debug)]
pub struct FallbackSuccess<T> {
    pub payload: T,
    pub node: NodeAddress,
    pub switched_from: Option<(NodeAddress, String)>,
}

/// Sticky active-node cache, scoped per app+component. Read at session
/// start, written at session success. Cross-session races are benign:
/// worst case is one extra failed attempt before rediscovery.
#[derive(Default)]
pub struct ActiveNodeCache {
    inner: RwLock<HashMap<String, NodeAddress>>,
}

impl ActiveNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(app: &str, component: &str) -> String {
        format!("{}/{}", app, component)
    }

    pub fn get(&self, app: &str, component: &str) -> Option<NodeAddress> {
        self.inner.read().unwrap().get(&Self::key(app, component)).cloned()
    }

    pub fn set(&self, app: &str, component: &str, node: NodeAddress) {
        self.inner.write().unwrap().insert(Self::key(app, component), node);
    }

    /// Forget the sticky node — the next session starts from the master
    pub fn clear(&self, app: &str, component: &str) {
        self.inner.write().unwrap().remove(&Self::key(app, component));
    }
}

/// Run `op` against `nodes` with master retry and fallback.
///
/// Rotation starts at the cached active node when it is still present in
/// the ordered list, otherwise at the head. Only the first position of
/// the rotation gets the retry budget; every later node is tried once.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    cache: &ActiveNodeCache,
    app: &str,
    component: &str,
    nodes: &[NodeAddress],
    op: F,
) -> Result<FallbackSuccess<T>, FallbackError>
where
    F: Fn(NodeAddress) -> Fut,
    Fut: std::future::Future<Output = Result<T, AttemptError>>,
{
    if nodes.is_empty() {
        return Err(FallbackError::NoNodes);
    }

    let previous = cache.get(app, component);
    let start = previous
        .as_ref()
        .and_then(|p| nodes.iter().position(|n| n.same_host(p)))
        .unwrap_or(0);

    // Rotate so iteration begins at the sticky node and wraps through the
    // rest in their original relative order
    let rotated: Vec<&NodeAddress> = nodes[start..].iter().chain(nodes[..start].iter()).collect();

    let mut last_error: Option<String> = None;

    for (idx, node) in rotated.iter().enumerate() {
        let attempts = if idx == 0 { policy.master_attempts.max(1) } else { 1 };

        for attempt in 1..=attempts {
            debug!(
                "{}/{}: attempt {}/{} against {}",
                app, component, attempt, attempts, node
            );
            match op((*node).clone()).await {
                Ok(payload) => {
                    let switched_from = match &previous {
                        Some(prev) if !prev.same_host(node) => {
                            Some((prev.clone(), last_error.clone().unwrap_or_default()))
                        }
                        None if idx > 0 => {
                            Some((rotated[0].clone(), last_error.clone().unwrap_or_default()))
                        }
                        _ => None,
                    };
                    if let Some((ref from, ref reason)) = switched_from {
                        info!(
                            "{}/{}: switched from {} to {} ({})",
                            app, component, from, node, reason
                        );
                    }
                    cache.set(app, component, (*node).clone());
                    return Ok(FallbackSuccess { payload, node: (*node).clone(), switched_from });
                }
                Err(e) => {
                    warn!("{}/{}: {} failed: {}", app, component, node, e);
                    last_error = Some(e.message().to_string());
                    if attempt < attempts {
                        tokio::time::sleep(policy.retry_delay).await;
                    }
                }
            }
        }
    }

    Err(FallbackError::Exhausted {
        last_error: last_error.unwrap_or_else(|| "No nodes available".to_string()),
        nodes_tried: rotated.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn addr(s: &str) -> NodeAddress {
        NodeAddress::parse(s).unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy { master_attempts: 3, retry_delay: Duration::from_millis(10) }
    }

    /// Scripted per-host outcomes: each op call pops the next result for
    /// that host and records the attempt in a shared log.
    struct Script {
        log: Arc<Mutex<Vec<String>>>,
        outcomes: Arc<Mutex<HashMap<String, Vec<Result<String, AttemptError>>>>>,
    }

    impl Script {
        fn new(outcomes: Vec<(&str, Vec<Result<String, AttemptError>>)>) -> Self {
            let map = outcomes
                .into_iter()
                .map(|(h, mut v)| {
                    v.reverse(); // pop from the back in call order
                    (h.to_string(), v)
                })
                .collect();
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                outcomes: Arc::new(Mutex::new(map)),
            }
        }

        fn op(&self) -> impl Fn(NodeAddress) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, AttemptError>> + Send>> + use<> {
            let log = self.log.clone();
            let outcomes = self.outcomes.clone();
            move |node: NodeAddress| {
                let log = log.clone();
                let outcomes = outcomes.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(node.host.clone());
                    outcomes
                        .lock()
                        .unwrap()
                        .get_mut(&node.host)
                        .and_then(|v| v.pop())
                        .unwrap_or_else(|| Err(AttemptError::Node(format!("Node {} exhausted script", node.host))))
                })
            }
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn node_err(msg: &str) -> Result<String, AttemptError> {
        Err(AttemptError::Node(msg.to_string()))
    }

    #[tokio::test]
    async fn empty_node_list_fails_fast() {
        let cache = ActiveNodeCache::new();
        let result = execute(&fast_policy(), &cache, "app", "web", &[], |_n| async {
            Ok::<(), AttemptError>(())
        })
        .await;
        assert!(matches!(result, Err(FallbackError::NoNodes)));
    }

    #[tokio::test]
    async fn master_retries_then_succeeds_without_touching_second_node() {
        // Scenario: head fails twice, succeeds on the third attempt
        let script = Script::new(vec![
            ("10.0.0.5", vec![node_err("boom"), node_err("boom"), Ok("ok".into())]),
            ("10.0.0.9", vec![Ok("never".into())]),
        ]);
        let cache = ActiveNodeCache::new();
        let nodes = vec![addr("10.0.0.5"), addr("10.0.0.9")];

        let started = Instant::now();
        let result = execute(&fast_policy(), &cache, "app", "web", &nodes, script.op())
            .await
            .unwrap();

        assert_eq!(result.payload, "ok");
        assert_eq!(result.node.host, "10.0.0.5");
        assert!(result.switched_from.is_none());
        assert_eq!(script.calls(), vec!["10.0.0.5", "10.0.0.5", "10.0.0.5"]);
        // Two inter-attempt delays elapsed
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn falls_through_to_second_node_with_switch_event() {
        let script = Script::new(vec![
            ("10.0.0.5", vec![node_err("502 from five"), node_err("502 from five"), node_err("502 from five")]),
            ("10.0.0.9", vec![Ok("ok".into())]),
        ]);
        let cache = ActiveNodeCache::new();
        let nodes = vec![addr("10.0.0.5"), addr("10.0.0.9")];

        let result = execute(&fast_policy(), &cache, "app", "web", &nodes, script.op())
            .await
            .unwrap();

        assert_eq!(result.node.host, "10.0.0.9");
        let (from, reason) = result.switched_from.expect("switch event");
        assert_eq!(from.host, "10.0.0.5");
        assert_eq!(reason, "502 from five");
        // Head gets the full budget, the second node exactly one attempt
        assert_eq!(
            script.calls(),
            vec!["10.0.0.5", "10.0.0.5", "10.0.0.5", "10.0.0.9"]
        );
    }

    #[tokio::test]
    async fn exhaustion_reports_last_node_error() {
        let script = Script::new(vec![
            ("10.0.0.5", vec![node_err("error from five"); 3]),
            ("10.0.0.9", vec![node_err("Node 10.0.0.9 returned 502")]),
        ]);
        let cache = ActiveNodeCache::new();
        let nodes = vec![addr("10.0.0.5"), addr("10.0.0.9")];

        let err = execute(&fast_policy(), &cache, "app", "web", &nodes, script.op())
            .await
            .unwrap_err();

        match err {
            FallbackError::Exhausted { last_error, nodes_tried } => {
                assert_eq!(last_error, "Node 10.0.0.9 returned 502");
                assert_eq!(nodes_tried, 2);
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sticky_node_starts_next_rotation() {
        let cache = ActiveNodeCache::new();
        let nodes = vec![addr("10.0.0.5"), addr("10.0.0.9")];

        // First session: head fails out, second node wins and becomes sticky
        let script = Script::new(vec![
            ("10.0.0.5", vec![node_err("down"); 3]),
            ("10.0.0.9", vec![Ok("ok".into())]),
        ]);
        execute(&fast_policy(), &cache, "app", "web", &nodes, script.op())
            .await
            .unwrap();
        assert_eq!(cache.get("app", "web").unwrap().host, "10.0.0.9");

        // Second session over the same ordered list starts at the sticky
        // node — 10.0.0.5 is not contacted at all
        let script2 = Script::new(vec![
            ("10.0.0.9", vec![Ok("ok again".into())]),
        ]);
        let result = execute(&fast_policy(), &cache, "app", "web", &nodes, script2.op())
            .await
            .unwrap();
        assert_eq!(result.node.host, "10.0.0.9");
        assert!(result.switched_from.is_none());
        assert_eq!(script2.calls(), vec!["10.0.0.9"]);
    }

    #[tokio::test]
    async fn sticky_position_carries_the_retry_budget() {
        // The retry budget belongs to the rotation head, wherever the
        // sticky node sits in the ordered list
        let cache = ActiveNodeCache::new();
        cache.set("app", "web", addr("10.0.0.9"));
        let nodes = vec![addr("10.0.0.5"), addr("10.0.0.9")];

        let script = Script::new(vec![
            ("10.0.0.9", vec![node_err("flaky"), Ok("ok".into())]),
        ]);
        let result = execute(&fast_policy(), &cache, "app", "web", &nodes, script.op())
            .await
            .unwrap();
        assert_eq!(result.node.host, "10.0.0.9");
        assert_eq!(script.calls(), vec!["10.0.0.9", "10.0.0.9"]);
    }

    #[tokio::test]
    async fn success_on_other_node_than_sticky_reports_switch() {
        let cache = ActiveNodeCache::new();
        cache.set("app", "web", addr("10.0.0.9"));
        let nodes = vec![addr("10.0.0.5"), addr("10.0.0.9")];

        let script = Script::new(vec![
            ("10.0.0.9", vec![node_err("gone"); 3]),
            ("10.0.0.5", vec![Ok("ok".into())]),
        ]);
        let result = execute(&fast_policy(), &cache, "app", "web", &nodes, script.op())
            .await
            .unwrap();
        assert_eq!(result.node.host, "10.0.0.5");
        let (from, _) = result.switched_from.unwrap();
        assert_eq!(from.host, "10.0.0.9");
        // Rotation wrapped: sticky first with retries, then the other node
        assert_eq!(
            script.calls(),
            vec!["10.0.0.9", "10.0.0.9", "10.0.0.9", "10.0.0.5"]
        );
        // Cache now points at the new winner
        assert_eq!(cache.get("app", "web").unwrap().host, "10.0.0.5");
    }

    #[tokio::test]
    async fn clearing_the_cache_resets_rotation_to_head() {
        let cache = ActiveNodeCache::new();
        cache.set("app", "web", addr("10.0.0.9"));
        cache.clear("app", "web");
        let nodes = vec![addr("10.0.0.5"), addr("10.0.0.9")];

        let script = Script::new(vec![("10.0.0.5", vec![Ok("ok".into())])]);
        let result = execute(&fast_policy(), &cache, "app", "web", &nodes, script.op())
            .await
            .unwrap();
        assert_eq!(result.node.host, "10.0.0.5");
    }
}
