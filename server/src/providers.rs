//! Generic JSON-over-HTTP adapters for the engine's I/O seams (§6).
//!
//! `HttpFetcher` and `HttpRuleProvider` are not a concrete Zabbix/Aliyun/
//! Volcengine SDK integration — those remain out of scope (§16) — but a
//! minimal concrete collaborator satisfying the documented wire contract, so
//! the server binary is runnable against any backend that speaks this shape.
//! Grounded on the monitoring system agent's `send_metrics_to_server`:
//! `reqwest::Client`, a JSON request body, a status-code check, and
//! `response.text()` pulled into the error on failure.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use engine::traits::{AggregationFunction, ContactGroup, Fetcher, LiveRule, MediaType, RuleBlockExpr, RuleOperator, RuleProvider, RuleSeverity, RuleSpec, TimeSeries};
use engine::{EngineError, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

/// Maps a non-2xx HTTP response into the engine's error taxonomy (§7):
/// 5xx and connection-level failures are transient, 4xx are permanent.
fn classify_status(status: StatusCode, body: String) -> EngineError {
    if status.is_server_error() {
        EngineError::ProviderTransient(format!("{status}: {body}"))
    } else {
        EngineError::ProviderPermanent(format!("{status}: {body}"))
    }
}

fn classify_transport_error(context: &str, err: reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() {
        EngineError::ProviderTransient(format!("{context}: {err}"))
    } else {
        EngineError::ProviderPermanent(format!("{context}: {err}"))
    }
}

/// Historical data source (§6 "Data source fetch"), backed by a JSON HTTP
/// endpoint.
pub struct HttpFetcher {
    client: Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| EngineError::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }
}

#[derive(Debug, Serialize)]
struct FetchDataRequest<'a> {
    datasource_id: &'a str,
    start_unix: i64,
    end_unix: i64,
    interval_seconds: i64,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesWire {
    name: String,
    labels: BTreeMap<String, String>,
    unique_key: String,
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl From<TimeSeriesWire> for TimeSeries {
    fn from(wire: TimeSeriesWire) -> Self {
        TimeSeries {
            name: wire.name,
            labels: wire.labels,
            unique_key: wire.unique_key,
            timestamps: wire.timestamps,
            values: wire.values,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_data(&self, datasource_id: &str, start_unix: i64, end_unix: i64, interval_seconds: i64) -> Result<Vec<TimeSeries>> {
        let url = format!("{}/fetch", self.base_url);
        let request = FetchDataRequest { datasource_id, start_unix, end_unix, interval_seconds };

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| classify_transport_error("fetch_data request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(classify_status(status, body));
        }

        let series: Vec<TimeSeriesWire> = response.json().await.map_err(|e| EngineError::ProviderPermanent(format!("parsing fetch_data response: {e}")))?;
        Ok(series.into_iter().map(TimeSeries::from).collect())
    }
}

/// Monitoring provider (§6 "Monitoring provider"), backed by a JSON HTTP
/// endpoint. One implementation per backend normally lives here; this one
/// speaks the generic shape `engine::rule_sync` was written against.
pub struct HttpRuleProvider {
    client: Client,
    base_url: String,
}

impl HttpRuleProvider {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| EngineError::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(classify_status(status, body))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RuleBlockExprWire {
    start_hour: f64,
    end_hour: f64,
    threshold: f64,
    operator: String,
    aggregation_function: String,
    aggregation_period_minutes: usize,
}

fn operator_to_str(op: RuleOperator) -> &'static str {
    match op {
        RuleOperator::GreaterThan => "gt",
        RuleOperator::LessThan => "lt",
    }
}

fn operator_from_str(s: &str) -> Result<RuleOperator> {
    match s {
        "gt" => Ok(RuleOperator::GreaterThan),
        "lt" => Ok(RuleOperator::LessThan),
        other => Err(EngineError::ProviderPermanent(format!("unknown rule operator '{other}'"))),
    }
}

fn aggregation_to_str(agg: AggregationFunction) -> &'static str {
    match agg {
        AggregationFunction::Min => "min",
        AggregationFunction::Max => "max",
    }
}

fn aggregation_from_str(s: &str) -> Result<AggregationFunction> {
    match s {
        "min" => Ok(AggregationFunction::Min),
        "max" => Ok(AggregationFunction::Max),
        other => Err(EngineError::ProviderPermanent(format!("unknown aggregation function '{other}'"))),
    }
}

fn severity_to_str(severity: RuleSeverity) -> &'static str {
    match severity {
        RuleSeverity::Critical => "critical",
        RuleSeverity::Warning => "warning",
        RuleSeverity::Info => "info",
    }
}

fn severity_from_str(s: &str) -> Result<RuleSeverity> {
    match s {
        "critical" => Ok(RuleSeverity::Critical),
        "warning" => Ok(RuleSeverity::Warning),
        "info" => Ok(RuleSeverity::Info),
        other => Err(EngineError::ProviderPermanent(format!("unknown rule severity '{other}'"))),
    }
}

impl From<&RuleBlockExpr> for RuleBlockExprWire {
    fn from(block: &RuleBlockExpr) -> Self {
        RuleBlockExprWire {
            start_hour: block.start_hour,
            end_hour: block.end_hour,
            threshold: block.threshold,
            operator: operator_to_str(block.operator).to_string(),
            aggregation_function: aggregation_to_str(block.aggregation_function).to_string(),
            aggregation_period_minutes: block.aggregation_period_minutes,
        }
    }
}

impl RuleBlockExprWire {
    fn try_into_block(&self) -> Result<RuleBlockExpr> {
        Ok(RuleBlockExpr {
            start_hour: self.start_hour,
            end_hour: self.end_hour,
            threshold: self.threshold,
            operator: operator_from_str(&self.operator)?,
            aggregation_function: aggregation_from_str(&self.aggregation_function)?,
            aggregation_period_minutes: self.aggregation_period_minutes,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RuleSpecWire {
    unique_key: String,
    name: String,
    blocks: Vec<RuleBlockExprWire>,
    tags: BTreeMap<String, String>,
    severity: String,
    contact_group_ids: Vec<String>,
    alert_methods: Vec<String>,
}

impl From<&RuleSpec> for RuleSpecWire {
    fn from(spec: &RuleSpec) -> Self {
        RuleSpecWire {
            unique_key: spec.unique_key.clone(),
            name: spec.name.clone(),
            blocks: spec.blocks.iter().map(RuleBlockExprWire::from).collect(),
            tags: spec.tags.clone(),
            severity: severity_to_str(spec.severity).to_string(),
            contact_group_ids: spec.contact_group_ids.clone(),
            alert_methods: spec.alert_methods.clone(),
        }
    }
}

impl RuleSpecWire {
    fn try_into_spec(&self) -> Result<RuleSpec> {
        Ok(RuleSpec {
            unique_key: self.unique_key.clone(),
            name: self.name.clone(),
            blocks: self.blocks.iter().map(RuleBlockExprWire::try_into_block).collect::<Result<Vec<_>>>()?,
            tags: self.tags.clone(),
            severity: severity_from_str(&self.severity)?,
            contact_group_ids: self.contact_group_ids.clone(),
            alert_methods: self.alert_methods.clone(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LiveRuleWire {
    unique_key: String,
    name: String,
    spec: RuleSpecWire,
}

#[derive(Debug, Deserialize)]
struct ContactGroupWire {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct MediaTypeWire {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct UpdateRuleRequest<'a> {
    spec: RuleSpecWire,
    existing_unique_key: &'a str,
}

#[derive(Debug, Serialize)]
struct DeleteRulesRequest<'a> {
    keys: &'a [String],
}

#[async_trait]
impl RuleProvider for HttpRuleProvider {
    async fn list_rules(&self, name_prefix: &str) -> Result<Vec<LiveRule>> {
        let url = format!("{}/rules", self.base_url);
        let response = self.client.get(&url).query(&[("name_prefix", name_prefix)]).send().await.map_err(|e| classify_transport_error("list_rules request failed", e))?;
        let response = self.check_status(response).await?;

        let wires: Vec<LiveRuleWire> = response.json().await.map_err(|e| EngineError::ProviderPermanent(format!("parsing list_rules response: {e}")))?;
        wires
            .into_iter()
            .map(|w| {
                Ok(LiveRule {
                    unique_key: w.unique_key,
                    name: w.name,
                    spec: w.spec.try_into_spec()?,
                })
            })
            .collect()
    }

    async fn create_rule(&self, spec: &RuleSpec) -> Result<()> {
        let url = format!("{}/rules", self.base_url);
        let wire = RuleSpecWire::from(spec);
        let response = self.client.post(&url).json(&wire).send().await.map_err(|e| classify_transport_error("create_rule request failed", e))?;
        self.check_status(response).await?;
        Ok(())
    }

    async fn update_rule(&self, spec: &RuleSpec, existing: &LiveRule) -> Result<()> {
        let url = format!("{}/rules", self.base_url);
        let request = UpdateRuleRequest { spec: RuleSpecWire::from(spec), existing_unique_key: &existing.unique_key };
        let response = self.client.put(&url).json(&request).send().await.map_err(|e| classify_transport_error("update_rule request failed", e))?;
        self.check_status(response).await?;
        Ok(())
    }

    async fn delete_rules(&self, keys: &[String]) -> Result<()> {
        let url = format!("{}/rules/delete", self.base_url);
        let request = DeleteRulesRequest { keys };
        let response = self.client.post(&url).json(&request).send().await.map_err(|e| classify_transport_error("delete_rules request failed", e))?;
        self.check_status(response).await?;
        Ok(())
    }

    async fn list_contact_groups(&self) -> Result<Vec<ContactGroup>> {
        let url = format!("{}/contact-groups", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| classify_transport_error("list_contact_groups request failed", e))?;
        let response = self.check_status(response).await?;
        let wires: Vec<ContactGroupWire> = response.json().await.map_err(|e| EngineError::ProviderPermanent(format!("parsing list_contact_groups response: {e}")))?;
        Ok(wires.into_iter().map(|w| ContactGroup { id: w.id, name: w.name }).collect())
    }

    async fn list_media_types(&self) -> Result<Vec<MediaType>> {
        let url = format!("{}/media-types", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| classify_transport_error("list_media_types request failed", e))?;
        let response = self.check_status(response).await?;
        let wires: Vec<MediaTypeWire> = response.json().await.map_err(|e| EngineError::ProviderPermanent(format!("parsing list_media_types response: {e}")))?;
        Ok(wires.into_iter().map(|w| MediaType { id: w.id, name: w.name }).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_block_wire_round_trips() {
        let block = RuleBlockExpr {
            start_hour: 0.0,
            end_hour: 24.0,
            threshold: 90.0,
            operator: RuleOperator::GreaterThan,
            aggregation_function: AggregationFunction::Max,
            aggregation_period_minutes: 5,
        };
        let wire = RuleBlockExprWire::from(&block);
        let back = wire.try_into_block().unwrap();
        assert_eq!(back.operator, RuleOperator::GreaterThan);
        assert_eq!(back.aggregation_function, AggregationFunction::Max);
        assert_eq!(back.threshold, 90.0);
    }

    #[test]
    fn server_error_status_is_transient() {
        let err = classify_status(StatusCode::BAD_GATEWAY, "down".to_string());
        assert!(err.is_transient());
    }

    #[test]
    fn client_error_status_is_permanent() {
        let err = classify_status(StatusCode::UNAUTHORIZED, "denied".to_string());
        assert!(!err.is_transient());
    }
}
