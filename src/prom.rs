// ============================================================================
// METRIC SOURCE
// ============================================================================
// Range-query interface to the upstream time-series database and the
// Prometheus HTTP API implementation of it.
// ============================================================================

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::debug;

use crate::constants::QUERY_TIMEOUT;
use crate::error::{CacheError, NetworkError, ObserveResult};
use crate::model::project::PrometheusIntegration;
use crate::model::{Labels, MetricValues, Project, ProjectId};
use crate::timeseries::{Duration, Time, TimeSeries};

/// Upstream of the metric cache and of PromQL alerting rules.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Evaluates `query` over `[from, to]` with resolution `step`.
    async fn query_range(&self, query: &str, from: Time, to: Time, step: Duration)
        -> ObserveResult<Vec<MetricValues>>;
}

/// Resolves the metric source of a project.
pub trait MetricSourceFactory: Send + Sync {
    fn source(&self, project: &Project) -> Option<Arc<dyn MetricSource>>;
}

// ----------------------------------------------------------------------------
// 1. Prometheus HTTP API client
// ----------------------------------------------------------------------------

pub struct PromClient {
    url: String,
    client: HttpClient,
    basic_auth: Option<(String, String)>,
    extra_selector: String,
    custom_headers: Vec<(String, String)>,
}

impl PromClient {
    pub fn new(cfg: &PrometheusIntegration) -> ObserveResult<Self> {
        url::Url::parse(&cfg.url).map_err(|e| NetworkError::InvalidUrl {
            url: cfg.url.clone(),
            message: e.to_string(),
        })?;
        let client = HttpClient::builder()
            .timeout(QUERY_TIMEOUT.to_std())
            .connect_timeout(StdDuration::from_secs(30))
            .danger_accept_invalid_certs(cfg.tls_skip_verify)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(NetworkError::from)?;
        Ok(Self {
            url: cfg.url.trim_end_matches('/').to_string(),
            client,
            basic_auth: cfg
                .basic_auth
                .as_ref()
                .filter(|a| !a.user.is_empty())
                .map(|a| (a.user.clone(), a.password.clone())),
            extra_selector: cfg.extra_selector.clone(),
            custom_headers: cfg
                .custom_headers
                .iter()
                .map(|h| (h.key.clone(), h.value.clone()))
                .collect(),
        })
    }
}

#[derive(Deserialize)]
struct QueryRangeResponse {
    status: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    data: Option<QueryRangeData>,
}

#[derive(Deserialize)]
struct QueryRangeData {
    #[serde(default)]
    result: Vec<RangeSeries>,
}

#[derive(Deserialize)]
struct RangeSeries {
    #[serde(default)]
    metric: Labels,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

#[async_trait]
impl MetricSource for PromClient {
    async fn query_range(
        &self,
        query: &str,
        from: Time,
        to: Time,
        step: Duration,
    ) -> ObserveResult<Vec<MetricValues>> {
        let query = query.replace("$RANGE", &format!("{}s", (step * 3).as_secs()));
        let query = add_extra_selector(&query, &self.extra_selector);
        let from = from.truncate(step);
        let to = to.truncate(step);
        let endpoint = format!("{}/api/v1/query_range", self.url);

        let form = [
            ("query", query.clone()),
            ("start", from.to_string()),
            ("end", to.to_string()),
            ("step", step.as_secs().to_string()),
        ];
        let mut req = self.client.post(&endpoint).form(&form);
        if let Some((user, password)) = &self.basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        for (k, v) in &self.custom_headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().await.map_err(NetworkError::from)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NetworkError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            }
            .into());
        }
        let body: QueryRangeResponse = resp.json().await.map_err(NetworkError::from)?;
        if body.status != "success" {
            return Err(CacheError::QueryFailed {
                query,
                message: body.error,
            }
            .into());
        }

        let points = ((to - from) / step + 1).max(0) as usize;
        let series = body.data.map(|d| d.result).unwrap_or_default();
        debug!(target: "cerebro::prom", query = %query, series = series.len(), "query_range done");
        Ok(series
            .into_iter()
            .map(|s| {
                let mut ts = TimeSeries::new(from, points, step);
                for (t, v) in s.values {
                    if let Ok(v) = v.parse::<f32>() {
                        ts.set(Time(t as i64), v);
                    }
                }
                MetricValues::new(s.metric, ts)
            })
            .collect())
    }
}

/// Appends the matchers of `extra` (`{a="b"}` or `a="b"`) to every vector
/// selector of `query`.
pub fn add_extra_selector(query: &str, extra: &str) -> String {
    let matchers = extra.trim().trim_start_matches('{').trim_end_matches('}').trim();
    if matchers.is_empty() {
        return query.to_string();
    }

    const KEYWORDS: &[&str] = &[
        "by", "without", "on", "ignoring", "group_left", "group_right", "bool", "and", "or", "unless",
        "offset",
    ];
    const GROUPING: &[&str] = &["by", "without", "on", "ignoring", "group_left", "group_right"];
    const AGGREGATIONS: &[&str] = &[
        "sum", "avg", "min", "max", "count", "group", "stddev", "stdvar", "topk", "bottomk", "quantile",
        "count_values",
    ];

    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len() + matchers.len() * 2);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' | '`' => {
                let end = skip_string(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' => {
                let end = chars[i..].iter().position(|&c| c == ']').map_or(chars.len(), |p| i + p + 1);
                out.extend(&chars[i..end]);
                i = end;
            }
            '{' => {
                // Bare label selector without a metric name.
                let end = skip_braces(&chars, i);
                out.push_str(&merge_matchers(&chars[i..end], matchers));
                i = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == ':') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                let next = chars.get(j).copied();
                out.push_str(&ident);
                if GROUPING.contains(&ident.as_str()) && next == Some('(') {
                    let end = chars[j..].iter().position(|&c| c == ')').map_or(chars.len(), |p| j + p + 1);
                    out.extend(&chars[i..end]);
                    i = end;
                } else if KEYWORDS.contains(&ident.as_str())
                    || AGGREGATIONS.contains(&ident.as_str())
                    || next == Some('(')
                {
                    // function or operator
                } else if next == Some('{') {
                    out.extend(&chars[i..j]);
                    let end = skip_braces(&chars, j);
                    out.push_str(&merge_matchers(&chars[j..end], matchers));
                    i = end;
                } else {
                    out.push('{');
                    out.push_str(matchers);
                    out.push('}');
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                // numbers and durations such as 5m or 1e3
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn skip_string(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\\' && quote != '`' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn skip_braces(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' | '\'' | '`' => i = skip_string(chars, i),
            '}' => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

fn merge_matchers(selector: &[char], extra: &str) -> String {
    let inner: String = selector.iter().collect();
    let inner = inner.trim_start_matches('{').trim_end_matches('}').trim().trim_end_matches(',');
    if inner.is_empty() {
        format!("{{{extra}}}")
    } else {
        format!("{{{inner}, {extra}}}")
    }
}

// ----------------------------------------------------------------------------
// 2. Per-project clients
// ----------------------------------------------------------------------------

/// Builds Prometheus clients from project settings and reuses them while
/// the settings are unchanged.
#[derive(Default)]
pub struct PromClientFactory {
    clients: DashMap<ProjectId, (PrometheusIntegration, Arc<PromClient>)>,
}

impl PromClientFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricSourceFactory for PromClientFactory {
    fn source(&self, project: &Project) -> Option<Arc<dyn MetricSource>> {
        let cfg = project.prometheus.as_ref()?;
        if let Some(entry) = self.clients.get(&project.id) {
            if &entry.0 == cfg {
                return Some(entry.1.clone());
            }
        }
        match PromClient::new(cfg) {
            Ok(client) => {
                let client = Arc::new(client);
                self.clients.insert(project.id.clone(), (cfg.clone(), client.clone()));
                Some(client)
            }
            Err(e) => {
                tracing::warn!(target: "cerebro::prom", project = %project.id, error = %e, "invalid prometheus settings");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("up", "up{env=\"prod\"}")]
    #[test_case("rate(http_requests_total[5m])", "rate(http_requests_total{env=\"prod\"}[5m])")]
    #[test_case(
        "sum by (job) (rate(a{code=\"500\"}[1m])) / sum by (job) (rate(a[1m]))",
        "sum by (job) (rate(a{code=\"500\", env=\"prod\"}[1m])) / sum by (job) (rate(a{env=\"prod\"}[1m]))"
    )]
    #[test_case("kube_pod_status_scheduled{condition=\"true\"} > 0", "kube_pod_status_scheduled{condition=\"true\", env=\"prod\"} > 0")]
    #[test_case("{__name__=~\"up|x\"}", "{__name__=~\"up|x\", env=\"prod\"}")]
    fn test_add_extra_selector(query: &str, expected: &str) {
        assert_eq!(add_extra_selector(query, "{env=\"prod\"}"), expected);
    }

    #[test]
    fn test_empty_extra_selector_is_noop() {
        assert_eq!(add_extra_selector("rate(x[5m])", ""), "rate(x[5m])");
        assert_eq!(add_extra_selector("rate(x[5m])", "{}"), "rate(x[5m])");
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{"__name__":"up","job":"node"},"values":[[60,"1"],[90.0,"NaN"],[120,"0"]]}
        ]}}"#;
        let parsed: QueryRangeResponse = serde_json::from_str(body).unwrap();
        let data = parsed.data.unwrap();
        assert_eq!(data.result.len(), 1);
        assert_eq!(data.result[0].values[1].1, "NaN");
        assert_eq!(data.result[0].metric.get("job").map(String::as_str), Some("node"));
    }

    #[test]
    fn test_factory_rejects_invalid_url() {
        let factory = PromClientFactory::new();
        let project = Project {
            id: "p".into(),
            prometheus: Some(PrometheusIntegration {
                url: "::not-a-url".into(),
                refresh_interval: StdDuration::from_secs(30),
                tls_skip_verify: false,
                basic_auth: None,
                extra_selector: String::new(),
                custom_headers: vec![],
                remote_write_url: String::new(),
            }),
            ..Default::default()
        };
        assert!(factory.source(&project).is_none());
    }
}
