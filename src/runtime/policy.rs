/// Per-node execution policy resolution
///
/// Timeout, retry and rate-limit settings are layered platform default → node (author)
/// policy → per-run override, each value capped by the platform ceiling. Authors write
/// policies as strings (`"30s"`, `"PT1M"`, `"3"`); a value that does not parse is
/// skipped with a debug log and the previous layer's value stays in effect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Resolved retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait_duration: Duration,
}

/// Resolved rate-limit settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub limit_for_period: u32,
    pub refresh_period: Duration,
    pub timeout_duration: Duration,
}

/// Fully resolved policy for one node dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePolicy {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitPolicy,
}

/// Platform defaults and the ceilings no layer may exceed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformPolicy {
    pub defaults: NodePolicy,
    pub ceilings: NodePolicy,
}

impl Default for PlatformPolicy {
    /// Defaults with ENV_VAR support for the node timeout
    fn default() -> Self {
        let timeout_secs = std::env::var("MECHAWAY_NODE_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(30);
        Self {
            defaults: NodePolicy {
                timeout: Duration::from_secs(timeout_secs),
                retry: RetryPolicy {
                    max_attempts: 3,
                    wait_duration: Duration::from_secs(1),
                },
                rate_limit: RateLimitPolicy {
                    limit_for_period: 100,
                    refresh_period: Duration::from_secs(1),
                    timeout_duration: Duration::from_secs(5),
                },
            },
            ceilings: NodePolicy {
                timeout: Duration::from_secs(10 * 60),
                retry: RetryPolicy {
                    max_attempts: 10,
                    wait_duration: Duration::from_secs(5 * 60),
                },
                rate_limit: RateLimitPolicy {
                    limit_for_period: 10_000,
                    refresh_period: Duration::from_secs(60 * 60),
                    timeout_duration: Duration::from_secs(60),
                },
            },
        }
    }
}

/// Authored `policy.retry` block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: Option<Value>,
    pub wait_duration: Option<Value>,
}

/// Authored `policy.rateLimit` block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub limit_for_period: Option<Value>,
    pub refresh_period: Option<Value>,
    pub timeout_duration: Option<Value>,
}

/// Authored `policy` block, values kept as written
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    pub timeout: Option<Value>,
    pub retry: Option<RetryConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl PlatformPolicy {
    /// Layer node and per-run policy over the platform defaults
    pub fn resolve(&self, node: Option<&PolicyConfig>, run_override: Option<&PolicyConfig>) -> NodePolicy {
        let mut policy = self.defaults.clone();
        self.cap(&mut policy);
        for (layer, config) in [("node", node), ("run", run_override)] {
            if let Some(config) = config {
                self.apply(&mut policy, config, layer);
            }
        }
        policy
    }

    fn cap(&self, policy: &mut NodePolicy) {
        let ceilings = &self.ceilings;
        policy.timeout = policy.timeout.min(ceilings.timeout);
        policy.retry.max_attempts = policy.retry.max_attempts.min(ceilings.retry.max_attempts);
        policy.retry.wait_duration = policy.retry.wait_duration.min(ceilings.retry.wait_duration);
        policy.rate_limit.limit_for_period =
            policy.rate_limit.limit_for_period.min(ceilings.rate_limit.limit_for_period);
        policy.rate_limit.refresh_period =
            policy.rate_limit.refresh_period.min(ceilings.rate_limit.refresh_period);
        policy.rate_limit.timeout_duration =
            policy.rate_limit.timeout_duration.min(ceilings.rate_limit.timeout_duration);
    }

    fn apply(&self, policy: &mut NodePolicy, config: &PolicyConfig, layer: &str) {
        layer_duration(config.timeout.as_ref(), "timeout", layer, &mut policy.timeout);

        if let Some(retry) = &config.retry {
            layer_count(retry.max_attempts.as_ref(), "retry.maxAttempts", layer, &mut policy.retry.max_attempts);
            layer_duration(retry.wait_duration.as_ref(), "retry.waitDuration", layer, &mut policy.retry.wait_duration);
        }

        if let Some(rate) = &config.rate_limit {
            layer_count(
                rate.limit_for_period.as_ref(),
                "rateLimit.limitForPeriod",
                layer,
                &mut policy.rate_limit.limit_for_period,
            );
            layer_duration(
                rate.refresh_period.as_ref(),
                "rateLimit.refreshPeriod",
                layer,
                &mut policy.rate_limit.refresh_period,
            );
            layer_duration(
                rate.timeout_duration.as_ref(),
                "rateLimit.timeoutDuration",
                layer,
                &mut policy.rate_limit.timeout_duration,
            );
        }

        self.cap(policy);
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn layer_duration(raw: Option<&Value>, field: &str, layer: &str, target: &mut Duration) {
    let Some(raw) = raw else { return };
    match value_text(raw).as_deref().and_then(parse_duration) {
        Some(duration) => *target = duration,
        None => tracing::debug!("🔧 Ignoring malformed {} policy {} = {}, keeping {:?}", layer, field, raw, target),
    }
}

fn layer_count(raw: Option<&Value>, field: &str, layer: &str, target: &mut u32) {
    let Some(raw) = raw else { return };
    match value_text(raw).and_then(|text| text.trim().parse::<u32>().ok()) {
        Some(count) => *target = count,
        None => tracing::debug!("🔧 Ignoring malformed {} policy {} = {}, keeping {}", layer, field, raw, target),
    }
}

/// Parse `500ms`, `30s`, `5m`, `1h`, bare milliseconds or ISO-8601 `PT…` durations
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.starts_with(['P', 'p']) {
        return parse_iso_duration(text);
    }
    if let Ok(millis) = text.parse::<u64>() {
        return Some(Duration::from_millis(millis));
    }

    let (number, unit_millis) = if let Some(n) = text.strip_suffix("ms") {
        (n.trim(), 1u64)
    } else if let Some(n) = text.strip_suffix('s') {
        (n.trim(), 1_000)
    } else if let Some(n) = text.strip_suffix('m') {
        (n.trim(), 60_000)
    } else if let Some(n) = text.strip_suffix('h') {
        (n.trim(), 3_600_000)
    } else {
        return None;
    };
    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(unit_millis).map(Duration::from_millis);
    }
    let amount: f64 = number.parse().ok()?;
    Duration::try_from_secs_f64(amount * unit_millis as f64 / 1000.0).ok()
}

/// `PnDTnHnMn.nS`; years and months are rejected (no fixed length)
fn parse_iso_duration(text: &str) -> Option<Duration> {
    let upper = text.to_ascii_uppercase();
    let body = upper.strip_prefix('P')?;
    let (date, time) = match body.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut secs = 0.0;
    let mut any = false;
    for (part, units) in [(date, &[('D', 86_400.0)][..]), (time.unwrap_or(""), &[('H', 3600.0), ('M', 60.0), ('S', 1.0)][..])] {
        let mut rest = part;
        for (designator, scale) in units {
            if let Some((amount, tail)) = rest.split_once(*designator) {
                secs += amount.parse::<f64>().ok()? * scale;
                rest = tail;
                any = true;
            }
        }
        if !rest.is_empty() {
            return None;
        }
    }
    if time == Some("") || !any {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_duration_forms() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("PT30S"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("PT1M30S"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("P1DT1H"), Some(Duration::from_secs(90_000)));
        assert_eq!(parse_duration("pt0.5s"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn rejects_malformed_durations() {
        for raw in ["", "abc", "10x", "-5s", "PT", "P1Y", "PTS"] {
            assert_eq!(parse_duration(raw), None, "{raw}");
        }
    }

    #[test]
    fn layers_override_in_order_and_respect_ceilings() {
        let platform = PlatformPolicy::default();
        let node: PolicyConfig = serde_json::from_value(json!({
            "timeout": "45s",
            "retry": {"maxAttempts": 5, "waitDuration": "2s"}
        }))
        .unwrap();
        let run: PolicyConfig = serde_json::from_value(json!({
            "timeout": "2h",
            "rateLimit": {"limitForPeriod": "50"}
        }))
        .unwrap();

        let resolved = platform.resolve(Some(&node), Some(&run));
        assert_eq!(resolved.timeout, platform.ceilings.timeout);
        assert_eq!(resolved.retry.max_attempts, 5);
        assert_eq!(resolved.retry.wait_duration, Duration::from_secs(2));
        assert_eq!(resolved.rate_limit.limit_for_period, 50);
    }

    #[test]
    fn malformed_values_keep_previous_layer() {
        let platform = PlatformPolicy::default();
        let node: PolicyConfig = serde_json::from_value(json!({
            "timeout": "12s",
            "retry": {"maxAttempts": "many"}
        }))
        .unwrap();
        let run: PolicyConfig = serde_json::from_value(json!({"timeout": "soon"})).unwrap();

        let resolved = platform.resolve(Some(&node), Some(&run));
        assert_eq!(resolved.timeout, Duration::from_secs(12));
        assert_eq!(resolved.retry.max_attempts, platform.defaults.retry.max_attempts);
    }
}
