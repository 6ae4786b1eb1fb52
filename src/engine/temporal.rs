// Trigger engine backed by a Temporal server's HTTP API

//! # Temporal Schedule Adapter
//!
//! Maps [`TriggerEngine`] onto Temporal schedules through the server's HTTP
//! gateway:
//!
//! - create: `POST   /api/v1/namespaces/{ns}/schedules/{id}`
//! - get:    `GET    /api/v1/namespaces/{ns}/schedules/{id}`
//! - delete: `DELETE /api/v1/namespaces/{ns}/schedules/{id}`
//!
//! Trigger specs become one `structuredCalendar` entry. An empty set in a
//! [`TriggerSpec`] means "any", while an omitted calendar field means "0" to
//! Temporal for seconds, minutes and hours, so empty sets are sent as full
//! ranges. Seconds default to 0 (top of the minute).
//!
//! Workflow arguments travel as `json/plain` payloads with base64 data.
//!
//! Calls are not retried here. Errors go back to the lifecycle manager as-is.

use std::collections::BTreeSet;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::triggers::{TriggerAction, TriggerEngine, TriggerHandle};
use crate::models::TriggerSpec;
use crate::{KainosError, Result};

/// Calendar fields with their full ranges
const FIELDS: &[(&str, u32, u32)] = &[
    ("second", 0, 59),
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("dayOfMonth", 1, 31),
    ("month", 1, 12),
    ("dayOfWeek", 0, 6),
];

/// Temporal schedule client
#[derive(Debug, Clone)]
pub struct TemporalHttpEngine {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
}

impl TemporalHttpEngine {
    pub fn new(base_url: impl Into<String>, namespace: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
        })
    }

    fn schedule_url(&self, id: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/schedules/{}",
            self.base_url, self.namespace, id
        )
    }
}

fn ranges(values: &BTreeSet<u32>, min: u32, max: u32) -> Value {
    if values.is_empty() {
        return json!([{ "start": min, "end": max }]);
    }
    Value::Array(values.iter().map(|v| json!({ "start": v })).collect())
}

fn field_values<'a>(spec: &'a TriggerSpec, name: &str) -> &'a BTreeSet<u32> {
    match name {
        "second" => &spec.second,
        "minute" => &spec.minute,
        "hour" => &spec.hour,
        "dayOfMonth" => &spec.day_of_month,
        "month" => &spec.month,
        _ => &spec.day_of_week,
    }
}

/// Encode a spec as a Temporal `ScheduleSpec`
pub fn encode_spec(spec: &TriggerSpec) -> Value {
    let mut calendar = Map::new();
    for (name, min, max) in FIELDS {
        let values = field_values(spec, name);
        let encoded = if *name == "second" && values.is_empty() {
            json!([{ "start": 0 }])
        } else {
            ranges(values, *min, *max)
        };
        calendar.insert(name.to_string(), encoded);
    }
    if !spec.year.is_empty() {
        let years: Vec<Value> = spec.year.iter().map(|y| json!({ "start": y })).collect();
        calendar.insert("year".to_string(), Value::Array(years));
    }
    if let Some(comment) = &spec.comment {
        calendar.insert("comment".to_string(), json!(comment));
    }

    let mut out = Map::new();
    out.insert("structuredCalendar".to_string(), json!([calendar]));
    if let Some(zone) = &spec.time_zone {
        out.insert("timezoneName".to_string(), json!(zone));
    }
    Value::Object(out)
}

fn expand(ranges: Option<&Value>, min: u32, max: u32) -> BTreeSet<u32> {
    let mut values = BTreeSet::new();
    for range in ranges.and_then(Value::as_array).into_iter().flatten() {
        let start = range.get("start").and_then(Value::as_u64).unwrap_or(0) as u32;
        let end = range
            .get("end")
            .and_then(Value::as_u64)
            .map(|e| e as u32)
            .unwrap_or(start)
            .max(start);
        let step = range.get("step").and_then(Value::as_u64).unwrap_or(1).max(1) as usize;
        values.extend((start..=end).step_by(step));
    }
    let full = (max - min + 1) as usize;
    if values.len() == full {
        values.clear();
    }
    values
}

/// Decode the first `structuredCalendar` entry of a `ScheduleSpec`
pub fn decode_spec(value: &Value) -> TriggerSpec {
    let calendar = value
        .get("structuredCalendar")
        .and_then(|c| c.get(0))
        .cloned()
        .unwrap_or(Value::Null);

    let mut spec = TriggerSpec::default();
    for (name, min, max) in FIELDS {
        let values = expand(calendar.get(*name), *min, *max);
        match *name {
            "second" => spec.second = values.into_iter().filter(|s| *s != 0).collect(),
            "minute" => spec.minute = values,
            "hour" => spec.hour = values,
            "dayOfMonth" => spec.day_of_month = values,
            "month" => spec.month = values,
            _ => spec.day_of_week = values,
        }
    }
    spec.year = calendar
        .get("year")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("start").and_then(Value::as_i64))
        .map(|y| y as i32)
        .collect();
    spec.comment = calendar
        .get("comment")
        .and_then(Value::as_str)
        .map(str::to_string);
    spec.time_zone = value
        .get("timezoneName")
        .and_then(Value::as_str)
        .filter(|z| !z.is_empty())
        .map(str::to_string);
    spec
}

/// Encode workflow arguments as `json/plain` payloads
pub fn encode_payloads(args: &[Value]) -> Result<Value> {
    let encoding = BASE64.encode("json/plain");
    let payloads = args
        .iter()
        .map(|arg| {
            Ok(json!({
                "metadata": { "encoding": encoding },
                "data": BASE64.encode(serde_json::to_vec(arg)?),
            }))
        })
        .collect::<Result<Vec<Value>>>()?;
    Ok(json!({ "payloads": payloads }))
}

pub fn decode_payloads(value: &Value) -> Result<Vec<Value>> {
    value
        .get("payloads")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|payload| {
            let data = payload.get("data").and_then(Value::as_str).unwrap_or("");
            let bytes = BASE64
                .decode(data)
                .map_err(|e| KainosError::Engine(format!("bad payload encoding: {}", e)))?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .collect()
}

fn engine_error(status: reqwest::StatusCode, body: &str, what: &str) -> KainosError {
    KainosError::Engine(format!("{} failed with {}: {}", what, status, body))
}

#[async_trait::async_trait]
impl TriggerEngine for TemporalHttpEngine {
    async fn create_trigger(
        &self,
        id: &str,
        spec: &TriggerSpec,
        action: &TriggerAction,
    ) -> Result<TriggerHandle> {
        let body = json!({
            "schedule": {
                "spec": encode_spec(spec),
                "action": {
                    "startWorkflow": {
                        "workflowId": id,
                        "workflowType": { "name": action.workflow_type },
                        "taskQueue": { "name": action.task_queue },
                        "input": encode_payloads(&action.args)?,
                        "retryPolicy": { "maximumAttempts": action.max_attempts },
                    }
                },
                "policies": { "overlapPolicy": "SCHEDULE_OVERLAP_POLICY_SKIP" },
            },
            "requestId": Uuid::new_v4().to_string(),
        });

        let response = self
            .http
            .post(self.schedule_url(id))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(engine_error(status, &text, "create schedule"));
        }
        debug!("Temporal schedule {} created in {}", id, self.namespace);

        Ok(TriggerHandle {
            id: id.to_string(),
            spec: spec.clone(),
            action: action.clone(),
            created_at: Utc::now(),
        })
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<TriggerHandle>> {
        let response = self.http.get(self.schedule_url(id)).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(engine_error(status, &text, "describe schedule"));
        }

        let body: Value = response.json().await?;
        let schedule = body.get("schedule").cloned().unwrap_or(Value::Null);
        let start = &schedule["action"]["startWorkflow"];
        let action = TriggerAction {
            workflow_type: start["workflowType"]["name"].as_str().unwrap_or_default().to_string(),
            task_queue: start["taskQueue"]["name"].as_str().unwrap_or_default().to_string(),
            args: decode_payloads(&start["input"])?,
            max_attempts: start["retryPolicy"]["maximumAttempts"].as_u64().unwrap_or(0) as u32,
        };
        let created_at = body["info"]["createTime"]
            .as_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(TriggerHandle {
            id: id.to_string(),
            spec: decode_spec(&schedule["spec"]),
            action,
            created_at,
        }))
    }

    async fn delete_trigger(&self, id: &str) -> Result<bool> {
        let response = self.http.delete(self.schedule_url(id)).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(engine_error(status, &text, "delete schedule"));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schedule::translate;
    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::post,
        Json, Router,
    };
    use std::collections::HashMap;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    type Schedules = Arc<Mutex<HashMap<String, Value>>>;

    #[test]
    fn test_hourly_encodes_full_hour_range() {
        let spec = encode_spec(&translate("hourly").unwrap());
        let calendar = &spec["structuredCalendar"][0];
        assert_eq!(calendar["minute"], json!([{ "start": 0 }]));
        assert_eq!(calendar["hour"], json!([{ "start": 0, "end": 23 }]));
        assert_eq!(calendar["second"], json!([{ "start": 0 }]));
        assert!(spec.get("timezoneName").is_none());
    }

    #[test]
    fn test_each_calendar_field_reads_its_own_set() {
        let spec = encode_spec(&translate("monthly-first-9am").unwrap());
        let calendar = &spec["structuredCalendar"][0];
        assert_eq!(calendar["hour"], json!([{ "start": 9 }]));
        assert_eq!(calendar["dayOfMonth"], json!([{ "start": 1 }]));
        assert_eq!(calendar["month"], json!([{ "start": 1, "end": 12 }]));
        assert_eq!(calendar["dayOfWeek"], json!([{ "start": 0, "end": 6 }]));
    }

    #[test]
    fn test_spec_survives_encoding() {
        for preset in ["market-open", "every-15-minutes", "monthly-first-9am", "13:45"] {
            let spec = translate(preset).unwrap();
            assert_eq!(decode_spec(&encode_spec(&spec)), spec, "preset {}", preset);
        }
    }

    #[test]
    fn test_payloads_are_base64_json() {
        let encoded = encode_payloads(&[json!("sub-1"), json!({"k": 1})]).unwrap();
        let first = &encoded["payloads"][0];
        assert_eq!(first["metadata"]["encoding"], BASE64.encode("json/plain"));
        assert_eq!(first["data"], BASE64.encode("\"sub-1\""));
        assert_eq!(
            decode_payloads(&encoded).unwrap(),
            vec![json!("sub-1"), json!({"k": 1})]
        );
    }

    async fn fake_temporal() -> String {
        async fn create(
            State(store): State<Schedules>,
            Path((_ns, id)): Path<(String, String)>,
            Json(body): Json<Value>,
        ) -> StatusCode {
            let mut store = store.lock().unwrap();
            if store.contains_key(&id) {
                return StatusCode::CONFLICT;
            }
            store.insert(id, body);
            StatusCode::OK
        }
        async fn describe(
            State(store): State<Schedules>,
            Path((_ns, id)): Path<(String, String)>,
        ) -> std::result::Result<Json<Value>, StatusCode> {
            let store = store.lock().unwrap();
            let body = store.get(&id).ok_or(StatusCode::NOT_FOUND)?;
            Ok(Json(json!({ "schedule": body["schedule"].clone() })))
        }
        async fn remove(
            State(store): State<Schedules>,
            Path((_ns, id)): Path<(String, String)>,
        ) -> StatusCode {
            match store.lock().unwrap().remove(&id) {
                Some(_) => StatusCode::OK,
                None => StatusCode::NOT_FOUND,
            }
        }

        let router = Router::new()
            .route(
                "/api/v1/namespaces/:ns/schedules/:id",
                post(create).get(describe).delete(remove),
            )
            .with_state(Schedules::default());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(router.into_make_service()),
        );
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_schedule_crud_against_gateway() {
        let base = fake_temporal().await;
        let engine = TemporalHttpEngine::new(base, "default", Duration::from_secs(5)).unwrap();
        let spec = translate("weekdays-9am").unwrap();
        let action = TriggerAction::new("ExecuteAgentWorkflow", vec![json!("sub-1"), json!("digest")]);

        engine.create_trigger("workflow-1", &spec, &action).await.unwrap();
        let err = engine
            .create_trigger("workflow-1", &spec, &action)
            .await
            .unwrap_err();
        assert!(matches!(err, KainosError::Engine(_)));

        let handle = engine.get_trigger("workflow-1").await.unwrap().unwrap();
        assert_eq!(handle.spec, spec);
        assert_eq!(handle.action, action);

        assert!(engine.delete_trigger("workflow-1").await.unwrap());
        assert!(!engine.delete_trigger("workflow-1").await.unwrap());
        assert!(engine.get_trigger("workflow-1").await.unwrap().is_none());
    }
}
