use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gatehouse_core::config::EngineConfig;
use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::flow::FlowDefinition;
use gatehouse_core::instance::{
    InstanceRecord, InstanceStatus, PendingToolExecution, ToolConfirmationSettings,
};
use gatehouse_core::traits::InstanceStore;
use gatehouse_core::types::{InstanceId, Step, ToolContext};

use crate::confirmation::{apply_confirmation, apply_denial, take_pending, ToolConfirmation, ToolDenial};
use crate::graph::{build, route, CompiledGraph, Route};
use crate::instance::{InstanceHandle, RunGuard};
use crate::node::{NodeContext, NodeInput, NodeKind};
use crate::registry::Capabilities;
use crate::stream::{PublicStep, StepEmitter, StepStream};

/// Snapshot of an instance for callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub definition_id: String,
    pub status: InstanceStatus,
    pub cursor: Option<String>,
    pub pending: Vec<PendingToolExecution>,
    pub settings: ToolConfirmationSettings,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceInfo {
    fn from_record(record: &InstanceRecord) -> Self {
        Self {
            id: record.id.clone(),
            definition_id: record.definition_id.clone(),
            status: record.status,
            cursor: record.cursor.clone(),
            pending: record.pending_tool_executions.values().cloned().collect(),
            settings: record.tool_confirmation_settings.clone(),
            step_count: record.history().len(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Where a run starts and what it carries in.
struct RunPlan {
    graph: Arc<CompiledGraph>,
    start: String,
    input: String,
    guidance: Option<String>,
    /// Step to emit before the first node runs.
    user_step: Option<Step>,
}

struct EngineInner {
    config: EngineConfig,
    caps: Capabilities,
    store: Arc<dyn InstanceStore>,
    definitions: RwLock<HashMap<String, FlowDefinition>>,
    instances: RwLock<HashMap<InstanceId, Arc<InstanceHandle>>>,
}

/// The flow engine. Cheap to clone; every clone drives the same instances.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    pub fn new(config: EngineConfig, caps: Capabilities, store: Arc<dyn InstanceStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                caps,
                store,
                definitions: RwLock::new(HashMap::new()),
                instances: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Check that a definition compiles against the current capabilities.
    pub fn validate(&self, def: &FlowDefinition) -> Result<()> {
        build(def, &self.inner.caps).map(|_| ())
    }

    /// Validate, persist and register a definition. Replaces any previous
    /// definition with the same id; running instances keep their compiled graph.
    pub async fn register_definition(&self, def: FlowDefinition) -> Result<()> {
        build(&def, &self.inner.caps)?;
        if let Err(e) = self.inner.store.save_definition(&def).await {
            warn!(definition_id = %def.id, error = %e, "Failed to persist flow definition");
        }
        info!(definition_id = %def.id, nodes = def.graph.nodes.len(), "Registered flow definition");
        self.inner.definitions.write().await.insert(def.id.clone(), def);
        Ok(())
    }

    pub async fn definition(&self, id: &str) -> Result<FlowDefinition> {
        self.inner.definition(id).await
    }

    /// Registered definitions, sorted by id.
    pub async fn list_definitions(&self) -> Result<Vec<FlowDefinition>> {
        let mut all: HashMap<String, FlowDefinition> = self
            .inner
            .store
            .list_definitions()
            .await?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        for (id, def) in self.inner.definitions.read().await.iter() {
            all.insert(id.clone(), def.clone());
        }
        let mut defs: Vec<FlowDefinition> = all.into_values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    pub async fn create_instance(&self, definition_id: &str) -> Result<InstanceInfo> {
        self.inner.definition(definition_id).await?;
        let record = InstanceRecord::new(definition_id, self.inner.config.initial_settings());
        let info = InstanceInfo::from_record(&record);
        self.inner.save(&record).await;
        info!(instance_id = %record.id, definition_id, "Created instance");
        self.inner
            .instances
            .write()
            .await
            .insert(record.id.clone(), Arc::new(InstanceHandle::new(record)));
        Ok(info)
    }

    pub async fn instance_info(&self, id: &InstanceId) -> Result<InstanceInfo> {
        let handle = self.inner.handle(id).await?;
        let record = handle.record.lock().await;
        Ok(InstanceInfo::from_record(&record))
    }

    /// Full history as observers may see it.
    pub async fn history(&self, id: &InstanceId) -> Result<Vec<PublicStep>> {
        let handle = self.inner.handle(id).await?;
        let record = handle.record.lock().await;
        Ok(record
            .history()
            .iter()
            .map(|s| PublicStep::from_step(id, s))
            .collect())
    }

    /// Start a turn with a user message.
    ///
    /// The turn starts at the flow's start node, or at the evaluator that asked
    /// for clarification. Rejected while a tool call is unsettled or a resume is
    /// due.
    pub async fn send(&self, id: &InstanceId, message: &str) -> Result<StepStream> {
        let handle = self.inner.handle(id).await?;
        let (guard, token) = handle.try_begin_run()?;
        match self.inner.plan_send(&handle, message).await {
            Ok(plan) => Ok(self.spawn_run(handle, guard, token, plan)),
            Err(e) => {
                handle.end_run();
                Err(e)
            }
        }
    }

    /// Continue at the cursor node after a tool call was confirmed or denied.
    pub async fn resume(&self, id: &InstanceId) -> Result<StepStream> {
        let handle = self.inner.handle(id).await?;
        let (guard, token) = handle.try_begin_run()?;
        match self.inner.plan_resume(&handle).await {
            Ok(plan) => Ok(self.spawn_run(handle, guard, token, plan)),
            Err(e) => {
                handle.end_run();
                Err(e)
            }
        }
    }

    fn spawn_run(
        &self,
        handle: Arc<InstanceHandle>,
        guard: RunGuard,
        token: CancellationToken,
        plan: RunPlan,
    ) -> StepStream {
        let (emitter, stream) =
            StepEmitter::channel(handle.id.clone(), self.inner.config.stream_buffer);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drive(&handle, token, emitter, plan).await;
            handle.end_run();
            drop(guard);
        });
        stream
    }

    /// Cancel the in-flight run. Returns false when nothing was running.
    pub async fn cancel(&self, id: &InstanceId) -> Result<bool> {
        let handle = self.inner.handle(id).await?;
        let cancelled = handle.cancel();
        if cancelled {
            info!(instance_id = %id, "Cancellation requested");
        }
        Ok(cancelled)
    }

    /// Run a parked tool call and record its result.
    pub async fn confirm(&self, id: &InstanceId, execution_id: &str) -> Result<ToolConfirmation> {
        let handle = self.inner.handle(id).await?;
        let pending = {
            let mut record = handle.record.lock().await;
            let pending = take_pending(&mut record, execution_id)?;
            // Saved before the tool runs so a restart cannot confirm it twice.
            self.inner.persist(&handle, &record).await;
            pending
        };

        let ctx = ToolContext {
            instance_id: id.clone(),
            node_id: pending.node_id.clone(),
        };
        let result = self
            .inner
            .caps
            .tools
            .execute_folded(&pending.tool_name, pending.tool_input.clone(), ctx)
            .await;

        let mut record = handle.record.lock().await;
        let outcome = apply_confirmation(&mut record, pending, result);
        self.inner.persist(&handle, &record).await;
        Ok(outcome)
    }

    /// Drop a parked tool call without running it.
    pub async fn deny(&self, id: &InstanceId, execution_id: &str) -> Result<ToolDenial> {
        let handle = self.inner.handle(id).await?;
        let mut record = handle.record.lock().await;
        let pending = take_pending(&mut record, execution_id)?;
        let denial = apply_denial(&mut record, pending);
        self.inner.persist(&handle, &record).await;
        Ok(denial)
    }

    pub async fn pending(&self, id: &InstanceId) -> Result<Vec<PendingToolExecution>> {
        let handle = self.inner.handle(id).await?;
        let record = handle.record.lock().await;
        Ok(record.pending_tool_executions.values().cloned().collect())
    }

    pub async fn settings(&self, id: &InstanceId) -> Result<ToolConfirmationSettings> {
        let handle = self.inner.handle(id).await?;
        let record = handle.record.lock().await;
        Ok(record.tool_confirmation_settings.clone())
    }

    /// Replace the confirmation settings. Calls already pending stay pending.
    pub async fn set_settings(
        &self,
        id: &InstanceId,
        settings: ToolConfirmationSettings,
    ) -> Result<ToolConfirmationSettings> {
        let handle = self.inner.handle(id).await?;
        let mut record = handle.record.lock().await;
        record.tool_confirmation_settings = settings.clone();
        record.touch();
        self.inner.persist(&handle, &record).await;
        debug!(instance_id = %id, confirm_all = settings.confirm_all, "Updated tool confirmation settings");
        Ok(settings)
    }

    pub async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        let loaded = self.inner.instances.write().await.remove(id);
        let stored = match &loaded {
            Some(handle) => {
                handle.mark_deleted();
                handle.cancel();
                let _record = handle.record.lock().await;
                self.inner.store.delete_instance(id).await?
            }
            None => self.inner.store.delete_instance(id).await?,
        };
        if loaded.is_none() && !stored {
            return Err(GatehouseError::InstanceNotFound(id.to_string()));
        }
        info!(instance_id = %id, "Deleted instance");
        Ok(())
    }

    /// Cancel every run, wait for them to stop, and flush loaded instances.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<InstanceHandle>> =
            self.inner.instances.read().await.values().cloned().collect();
        for handle in &handles {
            handle.cancel();
        }
        for handle in &handles {
            handle.wait_idle().await;
            let record = handle.record.lock().await;
            self.inner.persist(&handle, &record).await;
        }
        info!(instances = handles.len(), "Flow engine shut down");
    }
}

impl EngineInner {
    async fn definition(&self, id: &str) -> Result<FlowDefinition> {
        if let Some(def) = self.definitions.read().await.get(id) {
            return Ok(def.clone());
        }
        match self.store.load_definition(id).await? {
            Some(def) => {
                self.definitions
                    .write()
                    .await
                    .entry(id.to_string())
                    .or_insert_with(|| def.clone());
                Ok(def)
            }
            None => Err(GatehouseError::DefinitionNotFound(id.to_string())),
        }
    }

    /// A loaded instance, reading it from the store on first access.
    async fn handle(&self, id: &InstanceId) -> Result<Arc<InstanceHandle>> {
        if let Some(h) = self.instances.read().await.get(id) {
            return Ok(h.clone());
        }
        let record = self
            .store
            .load_instance(id)
            .await?
            .ok_or_else(|| GatehouseError::InstanceNotFound(id.to_string()))?;
        debug!(instance_id = %id, steps = record.history().len(), "Loaded instance from store");
        let mut instances = self.instances.write().await;
        let handle = instances
            .entry(id.clone())
            .or_insert_with(|| Arc::new(InstanceHandle::restore(record)));
        Ok(handle.clone())
    }

    async fn graph_for(&self, handle: &InstanceHandle, definition_id: &str) -> Result<Arc<CompiledGraph>> {
        handle
            .graph(|| async {
                let def = self.definition(definition_id).await?;
                Ok(Arc::new(build(&def, &self.caps)?))
            })
            .await
    }

    /// Save the record unless its instance was deleted. Callers hold the
    /// record lock, which `delete_instance` takes before removing the row.
    async fn persist(&self, handle: &InstanceHandle, record: &InstanceRecord) {
        if handle.is_deleted() {
            debug!(instance_id = %record.id, "Skipping save of deleted instance");
            return;
        }
        self.save(record).await;
    }

    async fn save(&self, record: &InstanceRecord) {
        if let Err(e) = self.store.save_instance(record).await {
            warn!(instance_id = %record.id, error = %e, "Failed to persist instance");
        }
    }

    async fn plan_send(&self, handle: &InstanceHandle, message: &str) -> Result<RunPlan> {
        let mut record = handle.record.lock().await;
        match record.status {
            InstanceStatus::AwaitingToolConfirmation => {
                return Err(GatehouseError::InvalidState(format!(
                    "instance {} has {} tool call(s) awaiting confirmation",
                    record.id,
                    record.pending_tool_executions.len()
                )))
            }
            InstanceStatus::ReadyToResume => {
                return Err(GatehouseError::InvalidState(format!(
                    "instance {} must be resumed before a new message",
                    record.id
                )))
            }
            _ => {}
        }

        let definition_id = record.definition_id.clone();
        let graph = self.graph_for(handle, &definition_id).await?;
        let start = match (record.status, record.cursor.as_ref()) {
            (InstanceStatus::AwaitingInput, Some(cursor)) if graph.node(cursor).is_some() => {
                cursor.clone()
            }
            _ => graph.start.clone(),
        };

        let user_step = Step::user(message);
        record.append(user_step.clone());
        record.last_input = Some(message.to_string());
        record.carried_guidance = None;
        record.cursor = Some(start.clone());
        record.status = InstanceStatus::Running;
        self.persist(handle, &record).await;

        info!(instance_id = %record.id, start = %start, "Starting turn");
        Ok(RunPlan {
            graph,
            start,
            input: message.to_string(),
            guidance: None,
            user_step: Some(user_step),
        })
    }

    async fn plan_resume(&self, handle: &InstanceHandle) -> Result<RunPlan> {
        let mut record = handle.record.lock().await;
        if record.status != InstanceStatus::ReadyToResume {
            return Err(GatehouseError::InvalidState(format!(
                "instance {} is {}, not ready to resume",
                record.id, record.status
            )));
        }
        let Some(start) = record.cursor.clone() else {
            return Err(GatehouseError::InvalidState(format!(
                "instance {} has no node to resume at",
                record.id
            )));
        };

        let definition_id = record.definition_id.clone();
        let graph = self.graph_for(handle, &definition_id).await?;
        let guidance = record.carried_guidance.take();
        let input = record.last_input.clone().unwrap_or_default();
        record.status = InstanceStatus::Running;
        record.touch();
        self.persist(handle, &record).await;

        info!(instance_id = %record.id, start = %start, "Resuming");
        Ok(RunPlan {
            graph,
            start,
            input,
            guidance,
            user_step: None,
        })
    }

    /// Run nodes until the flow ends, pauses, fails or is cancelled.
    async fn drive(
        &self,
        handle: &InstanceHandle,
        cancel: CancellationToken,
        emitter: StepEmitter,
        plan: RunPlan,
    ) {
        let RunPlan {
            graph,
            start,
            input,
            mut guidance,
            user_step,
        } = plan;
        if let Some(step) = &user_step {
            emitter.complete_step(step).await;
        }

        let mut current = start;
        let mut executed = 0usize;

        loop {
            if cancel.is_cancelled() {
                self.stop(handle, &emitter, InstanceStatus::Cancelled, "execution cancelled")
                    .await;
                return;
            }
            let Some(node) = graph.node(&current) else {
                let msg = format!("node '{}' is not part of flow '{}'", current, graph.definition_id);
                self.stop(handle, &emitter, InstanceStatus::Failed, &msg).await;
                return;
            };
            if executed >= self.config.max_steps_per_run {
                let msg = format!(
                    "run exceeded {} node executions without finishing",
                    self.config.max_steps_per_run
                );
                self.stop(handle, &emitter, InstanceStatus::Failed, &msg).await;
                return;
            }
            executed += 1;

            let settings = handle.record.lock().await.tool_confirmation_settings.clone();
            let ctx = NodeContext {
                instance_id: handle.id.clone(),
                node_id: current.clone(),
                settings,
                cancel: cancel.clone(),
                emitter: emitter.clone(),
            };
            debug!(instance_id = %handle.id, node_id = %current, kind = node.kind.as_str(), "Running node");
            let node_input = NodeInput {
                content: input.clone(),
                guidance: guidance.take(),
            };

            let output = match node.producer.produce(node_input, &ctx).await {
                Ok(output) => output,
                Err(GatehouseError::Cancelled) => {
                    info!(instance_id = %handle.id, node_id = %current, "Run cancelled");
                    self.stop(handle, &emitter, InstanceStatus::Cancelled, "execution cancelled")
                        .await;
                    return;
                }
                Err(e) => {
                    error!(instance_id = %handle.id, node_id = %current, error = %e, "Node failed");
                    self.stop(handle, &emitter, InstanceStatus::Failed, &e.to_string())
                        .await;
                    return;
                }
            };

            let next = match output.pending {
                Some(_) => None,
                None => Some(route(&output.step, &current, &node.transitions)),
            };
            let public = output.step.clone();

            let mut keep_going = false;
            {
                let mut record = handle.record.lock().await;
                record.append(output.step);
                match (output.pending, next) {
                    (Some(pending), _) => {
                        record
                            .pending_tool_executions
                            .insert(pending.id.clone(), pending);
                        record.status = InstanceStatus::AwaitingToolConfirmation;
                        record.cursor = Some(current.clone());
                    }
                    (None, Some(Route::Next(next)))
                        if next == current && node.kind == NodeKind::Evaluator =>
                    {
                        record.status = InstanceStatus::AwaitingInput;
                        record.cursor = Some(current.clone());
                    }
                    (None, Some(Route::Next(next))) => {
                        record.cursor = Some(next.clone());
                        current = next;
                        keep_going = true;
                    }
                    (None, Some(Route::End)) | (None, None) => {
                        record.status = InstanceStatus::Completed;
                        record.cursor = None;
                        record.carried_guidance = None;
                    }
                }
                self.persist(handle, &record).await;
                if !keep_going {
                    info!(instance_id = %handle.id, status = %record.status, steps = executed, "Run stopped");
                }
            }
            emitter.complete_step(&public).await;

            if !keep_going {
                return;
            }
            guidance = output.carry_guidance;
        }
    }

    /// End a run without a step and tell the observer why.
    async fn stop(
        &self,
        handle: &InstanceHandle,
        emitter: &StepEmitter,
        status: InstanceStatus,
        message: &str,
    ) {
        {
            let mut record = handle.record.lock().await;
            record.status = status;
            record.touch();
            self.persist(handle, &record).await;
        }
        if status == InstanceStatus::Failed {
            warn!(instance_id = %handle.id, error = %message, "Run failed");
        }
        emitter.error(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use gatehouse_core::config::ModelConfig;
    use gatehouse_core::types::{Decision, ResponderStatus, StepRole};
    use gatehouse_store::MemoryInstanceStore;
    use gatehouse_test_utils::{guarded_flow, RecordingTool, ScriptedLlm, ScriptedReply};
    use gatehouse_tools::ToolRegistry;

    use crate::stream::StreamEvent;

    struct Harness {
        engine: FlowEngine,
        llm: ScriptedLlm,
        tool: RecordingTool,
        store: Arc<MemoryInstanceStore>,
    }

    async fn harness(config: EngineConfig) -> Harness {
        let llm = ScriptedLlm::default();
        let tool = RecordingTool::new("calculator", "4");
        let mut tools = ToolRegistry::new();
        tools.register(tool.clone());
        let store = Arc::new(MemoryInstanceStore::default());
        let caps = Capabilities::new(Arc::new(llm.clone()), ModelConfig::new("test"), Arc::new(tools));
        let engine = FlowEngine::new(config, caps, store.clone());
        engine.register_definition(guarded_flow("chat")).await.unwrap();
        Harness {
            engine,
            llm,
            tool,
            store,
        }
    }

    async fn drain(stream: StepStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    fn steps(events: &[StreamEvent]) -> Vec<&PublicStep> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::CompleteStep(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn unknown_definition_cannot_be_instantiated() {
        let h = harness(EngineConfig::default()).await;
        let err = h.engine.create_instance("missing").await.unwrap_err();
        assert!(matches!(err, GatehouseError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_definition_is_not_registered() {
        let h = harness(EngineConfig::default()).await;
        let mut def = guarded_flow("broken");
        def.graph.start = "nowhere".into();
        assert!(matches!(
            h.engine.register_definition(def).await,
            Err(GatehouseError::Definition(_))
        ));
        assert!(h.engine.definition("broken").await.is_err());
    }

    #[tokio::test]
    async fn each_executed_node_appends_exactly_one_step() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::text("Hi there."));
        let info = h.engine.create_instance("chat").await.unwrap();

        let events = drain(h.engine.send(&info.id, "hello").await.unwrap()).await;
        let public = steps(&events);
        assert_eq!(public.len(), 3);
        assert_eq!(public[0].role, StepRole::User);
        assert_eq!(public[1].decision, Some(Decision::Allow));
        assert_eq!(public[2].next_status, Some(ResponderStatus::Complete));

        let info = h.engine.instance_info(&info.id).await.unwrap();
        assert_eq!(info.step_count, 3);
        assert_eq!(info.status, InstanceStatus::Completed);
        assert_eq!(h.llm.call_count(), 2);
    }

    #[tokio::test]
    async fn clarification_pauses_and_next_message_restarts_at_evaluator() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("NEEDS_CLARIFICATION", ""));
        let info = h.engine.create_instance("chat").await.unwrap();

        drain(h.engine.send(&info.id, "do the thing").await.unwrap()).await;
        let paused = h.engine.instance_info(&info.id).await.unwrap();
        assert_eq!(paused.status, InstanceStatus::AwaitingInput);
        assert_eq!(paused.cursor.as_deref(), Some("gate"));

        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::text("Done."));
        drain(h.engine.send(&info.id, "the blue thing").await.unwrap()).await;
        let info = h.engine.instance_info(&info.id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::Completed);
        assert_eq!(info.step_count, 5);
    }

    #[tokio::test]
    async fn send_is_rejected_while_a_tool_call_is_pending() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::tool_call("calculator", serde_json::json!({"expression": "2+2"})));
        let info = h.engine.create_instance("chat").await.unwrap();
        drain(h.engine.send(&info.id, "2+2?").await.unwrap()).await;

        let err = h.engine.send(&info.id, "hello?").await.unwrap_err();
        assert!(matches!(err, GatehouseError::InvalidState(_)));
        let err = h.engine.resume(&info.id).await.unwrap_err();
        assert!(matches!(err, GatehouseError::InvalidState(_)));
    }

    #[tokio::test]
    async fn confirm_then_resume_finishes_the_turn() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::tool_call("calculator", serde_json::json!({"expression": "2+2"})));
        let info = h.engine.create_instance("chat").await.unwrap();
        drain(h.engine.send(&info.id, "2+2?").await.unwrap()).await;

        let pending = h.engine.pending(&info.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        let confirmation = h.engine.confirm(&info.id, &pending[0].id).await.unwrap();
        assert_eq!(confirmation.result, "4");
        assert_eq!(h.tool.call_count(), 1);

        h.llm.push(ScriptedReply::text("It's 4."));
        let events = drain(h.engine.resume(&info.id).await.unwrap()).await;
        let public = steps(&events);
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].response, "It's 4.");

        // The resumed responder saw the tool result as hidden guidance.
        let last_request = h.llm.requests().pop().unwrap();
        assert!(last_request.iter().any(|m| m.content.contains("returned:\n4")));
        let info = h.engine.instance_info(&info.id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_confirms_execute_once() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::tool_call("calculator", serde_json::json!({})));
        let info = h.engine.create_instance("chat").await.unwrap();
        drain(h.engine.send(&info.id, "calc").await.unwrap()).await;
        let exec = h.engine.pending(&info.id).await.unwrap()[0].id.clone();

        let (a, b) = tokio::join!(
            h.engine.confirm(&info.id, &exec),
            h.engine.confirm(&info.id, &exec)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(h.tool.call_count(), 1);
        let tool_steps = h
            .engine
            .history(&info.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.role == StepRole::Tool)
            .count();
        assert_eq!(tool_steps, 1);
    }

    #[tokio::test]
    async fn settings_changes_leave_pending_calls_alone() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::tool_call("calculator", serde_json::json!({})));
        let info = h.engine.create_instance("chat").await.unwrap();
        drain(h.engine.send(&info.id, "calc").await.unwrap()).await;

        let mut settings = h.engine.settings(&info.id).await.unwrap();
        settings.confirm_all = false;
        h.engine.set_settings(&info.id, settings).await.unwrap();

        assert_eq!(h.engine.pending(&info.id).await.unwrap().len(), 1);
        assert_eq!(h.tool.call_count(), 0);
        let info = h.engine.instance_info(&info.id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::AwaitingToolConfirmation);
        assert!(!info.settings.confirm_all);
    }

    #[tokio::test]
    async fn responder_self_loop_is_bounded() {
        let config = EngineConfig {
            max_steps_per_run: 4,
            confirm_all_by_default: false,
            ..Default::default()
        };
        let h = harness(config).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        for _ in 0..5 {
            h.llm.push(ScriptedReply::tool_call("calculator", serde_json::json!({})));
        }
        let info = h.engine.create_instance("chat").await.unwrap();
        let events = drain(h.engine.send(&info.id, "loop").await.unwrap()).await;

        assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
        assert_eq!(h.tool.call_count(), 3);
        let info = h.engine.instance_info(&info.id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::Failed);
        assert_eq!(info.step_count, 5);
    }

    #[tokio::test]
    async fn cancelled_node_appends_no_step() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::Hang("Thinking about".into()));
        let info = h.engine.create_instance("chat").await.unwrap();
        let mut stream = h.engine.send(&info.id, "long question").await.unwrap();

        // Wait for the responder to start streaming.
        loop {
            match stream.next().await {
                Some(StreamEvent::PartialOutput(_)) => break,
                Some(_) => continue,
                None => panic!("stream ended before partial output"),
            }
        }
        assert!(h.engine.cancel(&info.id).await.unwrap());
        let rest: Vec<StreamEvent> = stream.collect().await;
        match rest.last() {
            Some(StreamEvent::Error(e)) => assert_eq!(e.message, "execution cancelled"),
            other => panic!("expected error event, got {:?}", other),
        }

        let info = h.engine.instance_info(&info.id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::Cancelled);
        assert_eq!(info.step_count, 2);
    }

    #[tokio::test]
    async fn second_send_while_running_is_busy() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::Hang("...".into()));
        let info = h.engine.create_instance("chat").await.unwrap();
        let _stream = h.engine.send(&info.id, "first").await.unwrap();

        let err = h.engine.send(&info.id, "second").await.unwrap_err();
        assert!(matches!(err, GatehouseError::InstanceBusy(_)));
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn reloaded_instance_keeps_history_without_rerunning() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("BLOCK", ""));
        let info = h.engine.create_instance("chat").await.unwrap();
        drain(h.engine.send(&info.id, "bad").await.unwrap()).await;

        let caps = Capabilities::new(
            Arc::new(h.llm.clone()),
            ModelConfig::new("test"),
            Arc::new(ToolRegistry::new()),
        );
        let fresh = FlowEngine::new(EngineConfig::default(), caps, h.store.clone());
        let history = fresh.history(&info.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].decision, Some(Decision::Block));
        assert_eq!(h.llm.call_count(), 1);

        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::text("Sure."));
        drain(fresh.send(&info.id, "fine").await.unwrap()).await;
        assert_eq!(fresh.history(&info.id).await.unwrap().len(), 5);
    }

    /// Reports, while executing, whether the store still lists any pending call.
    struct StoreCheckingTool {
        store: Arc<MemoryInstanceStore>,
        seen_pending: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    impl gatehouse_core::traits::Tool for StoreCheckingTool {
        fn name(&self) -> &str {
            "calculator"
        }

        fn description(&self) -> &str {
            "Looks at the store before answering."
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        fn execute(
            &self,
            _input: serde_json::Value,
            ctx: ToolContext,
        ) -> futures::future::BoxFuture<'_, Result<gatehouse_core::types::ToolResult>> {
            Box::pin(async move {
                let stored = self.store.load_instance(&ctx.instance_id).await?;
                let count = stored.map(|r| r.pending_tool_executions.len()).unwrap_or(usize::MAX);
                self.seen_pending.lock().unwrap().push(count);
                Ok(gatehouse_core::types::ToolResult::success("4"))
            })
        }
    }

    #[tokio::test]
    async fn confirmed_call_leaves_the_store_before_the_tool_runs() {
        let llm = ScriptedLlm::default();
        let store = Arc::new(MemoryInstanceStore::default());
        let seen_pending = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(StoreCheckingTool {
            store: store.clone(),
            seen_pending: seen_pending.clone(),
        });
        let caps = Capabilities::new(Arc::new(llm.clone()), ModelConfig::new("test"), Arc::new(tools));
        let engine = FlowEngine::new(EngineConfig::default(), caps, store.clone());
        engine.register_definition(guarded_flow("chat")).await.unwrap();

        llm.push(ScriptedReply::verdict("ALLOW", ""));
        llm.push(ScriptedReply::tool_call("calculator", serde_json::json!({"expression": "2+2"})));
        let info = engine.create_instance("chat").await.unwrap();
        drain(engine.send(&info.id, "2+2?").await.unwrap()).await;
        let exec = engine.pending(&info.id).await.unwrap()[0].id.clone();
        let before = store.load_instance(&info.id).await.unwrap().unwrap();
        assert!(before.pending_tool_executions.contains_key(&exec));

        engine.confirm(&info.id, &exec).await.unwrap();
        assert_eq!(*seen_pending.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn deleting_mid_run_is_not_undone_by_the_run() {
        let h = harness(EngineConfig::default()).await;
        h.llm.push(ScriptedReply::verdict("ALLOW", ""));
        h.llm.push(ScriptedReply::Hang("Working on".into()));
        let info = h.engine.create_instance("chat").await.unwrap();
        let mut stream = h.engine.send(&info.id, "long question").await.unwrap();
        loop {
            match stream.next().await {
                Some(StreamEvent::PartialOutput(_)) => break,
                Some(_) => continue,
                None => panic!("stream ended before partial output"),
            }
        }

        h.engine.delete_instance(&info.id).await.unwrap();
        let _rest: Vec<StreamEvent> = stream.collect().await;

        assert!(h.store.load_instance(&info.id).await.unwrap().is_none());
        assert!(h.engine.instance_info(&info.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_instance_everywhere() {
        let h = harness(EngineConfig::default()).await;
        let info = h.engine.create_instance("chat").await.unwrap();
        h.engine.delete_instance(&info.id).await.unwrap();
        assert!(h.engine.instance_info(&info.id).await.unwrap_err().is_not_found());
        assert!(h.engine.delete_instance(&info.id).await.unwrap_err().is_not_found());
    }
}
