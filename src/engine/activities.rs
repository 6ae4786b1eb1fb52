// Workflow entry point and activities run by triggers

//! # Agent Activities
//!
//! A fired trigger runs [`DEFAULT_ENTRYPOINT`] with `[subscription_id,
//! workflow_definition_id]`. The entry point runs two activities:
//!
//! 1. [`CALL_AGENT_ACTIVITY`] posts the run request to the agent API through
//!    the [`ResilientClient`]. If the breaker refuses the call the run is
//!    skipped rather than failed.
//! 2. [`STORE_RESULT_ACTIVITY`] records a [`WorkflowRun`] with the outcome.
//!
//! A failing agent call is recorded as `Failed` and the error is returned so
//! the engine can retry the run.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::local_scheduler::{WorkflowContext, WorkflowRegistry};
use super::resilient::ResilientClient;
use super::storage::SubscriptionStore;
use super::triggers::DEFAULT_ENTRYPOINT;
use crate::models::{RunOutcome, WorkflowRun};
use crate::{KainosError, Result};

pub const CALL_AGENT_ACTIVITY: &str = "CallAgentApi";
pub const STORE_RESULT_ACTIVITY: &str = "StoreWorkflowResult";

/// Agent API route that executes a workflow
pub const AGENT_EXECUTE_PATH: &str = "/api/workflows/execute";

/// Body sent to the agent API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub subscription_id: Uuid,
    pub workflow_id: String,
    pub requested_at: chrono::DateTime<Utc>,
}

/// What the agent call produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCallResult {
    pub outcome: RunOutcome,
    pub output: Option<Value>,
}

/// Activities bound to the agent API client and the store
pub struct AgentActivities {
    client: ResilientClient,
    store: Arc<dyn SubscriptionStore>,
}

impl AgentActivities {
    pub fn new(client: ResilientClient, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { client, store }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    /// Call the agent API for one subscription
    pub async fn call_agent(&self, subscription_id: Uuid, workflow_id: &str) -> Result<AgentCallResult> {
        let request = AgentRequest {
            subscription_id,
            workflow_id: workflow_id.to_string(),
            requested_at: Utc::now(),
        };

        match self
            .client
            .post_json::<_, Value>(AGENT_EXECUTE_PATH, &request)
            .await
        {
            Ok(output) => {
                info!("🤖 Agent run for subscription {} completed", subscription_id);
                Ok(AgentCallResult {
                    outcome: RunOutcome::Succeeded,
                    output: Some(output),
                })
            }
            Err(e) if e.is_guard() => {
                warn!(
                    subscription_id = %subscription_id,
                    breaker = %self.client.breaker().name(),
                    "⏭️ Skipping agent run: {}", e
                );
                Ok(AgentCallResult {
                    outcome: RunOutcome::Skipped,
                    output: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the outcome of a run
    pub async fn store_result(&self, subscription_id: Uuid, result: AgentCallResult) -> Result<WorkflowRun> {
        let run = WorkflowRun::new(subscription_id, result.outcome, result.output);
        self.store.record_run(run).await
    }

    /// Register the entry point and both activities with a local engine
    pub fn register(self: &Arc<Self>, registry: &WorkflowRegistry) {
        let activities = self.clone();
        registry.register_activity(CALL_AGENT_ACTIVITY, move |input: Value| {
            let activities = activities.clone();
            async move {
                let (subscription_id, workflow_id) = parse_call_input(&input)?;
                let result = activities.call_agent(subscription_id, &workflow_id).await?;
                Ok(serde_json::to_value(result)?)
            }
        });

        let activities = self.clone();
        registry.register_activity(STORE_RESULT_ACTIVITY, move |input: Value| {
            let activities = activities.clone();
            async move {
                let subscription_id = parse_uuid(&input["subscription_id"])?;
                let result: AgentCallResult = serde_json::from_value(input["result"].clone())?;
                let run = activities.store_result(subscription_id, result).await?;
                Ok(serde_json::to_value(run)?)
            }
        });

        registry.register_workflow(DEFAULT_ENTRYPOINT, execute_agent_workflow);
    }
}

fn parse_uuid(value: &Value) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| KainosError::InvalidInput(format!("expected a subscription id, got {}", value)))
}

fn parse_call_input(input: &Value) -> Result<(Uuid, String)> {
    let subscription_id = parse_uuid(&input["subscription_id"])?;
    let workflow_id = input["workflow_id"]
        .as_str()
        .ok_or_else(|| KainosError::InvalidInput("missing workflow_id".to_string()))?
        .to_string();
    Ok((subscription_id, workflow_id))
}

/// Entry point bound to every subscription trigger
pub async fn execute_agent_workflow(ctx: WorkflowContext, args: Vec<Value>) -> Result<Value> {
    let subscription_id = args.first().cloned().unwrap_or(Value::Null);
    let workflow_id = args.get(1).cloned().unwrap_or(Value::Null);
    parse_uuid(&subscription_id)?;

    let call = ctx
        .execute_activity(
            CALL_AGENT_ACTIVITY,
            json!({ "subscription_id": subscription_id, "workflow_id": workflow_id }),
        )
        .await;

    let (result, failure) = match call {
        Ok(value) => (serde_json::from_value::<AgentCallResult>(value)?, None),
        Err(e) => (
            AgentCallResult {
                outcome: RunOutcome::Failed,
                output: Some(json!({ "error": e.to_string(), "attempt": ctx.attempt })),
            },
            Some(e),
        ),
    };

    let run = ctx
        .execute_activity(
            STORE_RESULT_ACTIVITY,
            json!({ "subscription_id": subscription_id, "result": result }),
        )
        .await?;

    match failure {
        Some(e) => Err(e),
        None => Ok(run),
    }
}
