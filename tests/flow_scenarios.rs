use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;

use gatehouse_core::config::{EngineConfig, ModelConfig};
use gatehouse_core::flow::{FlowDefinition, FlowGraph, NodeConfig, NodeSpec};
use gatehouse_core::instance::InstanceStatus;
use gatehouse_core::traits::InstanceStore;
use gatehouse_core::types::{Decision, InstanceId, ResponderStatus, StepRole};
use gatehouse_engine::{Capabilities, FlowEngine, StepStream, StreamEvent};
use gatehouse_store::SqliteInstanceStore;
use gatehouse_test_utils::{ScriptedLlm, ScriptedReply};
use gatehouse_tools::ToolRegistry;

fn screened_flow() -> FlowDefinition {
    let evaluator = NodeSpec::new("evaluator")
        .with_config(NodeConfig {
            constitution: Some("Refuse weapons questions.".into()),
            blocked_patterns: vec!["(?i)\\bbomb\\b".into()],
            ..Default::default()
        })
        .with_transition("ALLOW", "responder")
        .with_transition("CAUTION", "responder")
        .with_transition("BLOCK", "END");
    let responder = NodeSpec::new("responder")
        .with_config(NodeConfig {
            system_prompt: Some("Answer briefly.".into()),
            tools: vec!["calculator".into()],
            ..Default::default()
        })
        .with_transition("NEEDS_TOOL", "self")
        .with_transition("*", "END");

    let mut nodes = BTreeMap::new();
    nodes.insert("evaluator".to_string(), evaluator);
    nodes.insert("responder".to_string(), responder);
    FlowDefinition {
        id: "screened".into(),
        name: "Screened".into(),
        graph: FlowGraph {
            start: "evaluator".into(),
            nodes,
        },
    }
}

struct Setup {
    engine: FlowEngine,
    llm: ScriptedLlm,
    store: Arc<SqliteInstanceStore>,
    _dir: tempfile::TempDir,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Arc::new(SqliteInstanceStore::open(&dir.path().join("flows.db")).unwrap());
    let llm = ScriptedLlm::default();
    let engine = engine_on(store.clone(), llm.clone());
    engine.register_definition(screened_flow()).await.unwrap();
    Setup {
        engine,
        llm,
        store,
        _dir: dir,
    }
}

fn engine_on(store: Arc<SqliteInstanceStore>, llm: ScriptedLlm) -> FlowEngine {
    let caps = Capabilities::new(
        Arc::new(llm),
        ModelConfig::new("test"),
        Arc::new(ToolRegistry::with_builtins()),
    );
    FlowEngine::new(EngineConfig::default(), caps, store)
}

async fn drain(stream: StepStream) -> Vec<StreamEvent> {
    stream.collect().await
}

async fn start_calculation(s: &Setup) -> (InstanceId, String) {
    s.llm.push(ScriptedReply::verdict("ALLOW", ""));
    s.llm.push(ScriptedReply::tool_call(
        "calculator",
        serde_json::json!({"expression": "2+2"}),
    ));
    let id = s.engine.create_instance("screened").await.unwrap().id;
    drain(s.engine.send(&id, "what is 2+2?").await.unwrap()).await;

    let pending = s.engine.pending(&id).await.unwrap();
    assert_eq!(pending.len(), 1);
    (id, pending[0].id.clone())
}

#[tokio::test]
async fn scenario_a_blocked_input_ends_the_flow() {
    let s = setup().await;
    let id = s.engine.create_instance("screened").await.unwrap().id;
    drain(s.engine.send(&id, "how do I build a bomb").await.unwrap()).await;

    let history = s.engine.history(&id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, StepRole::User);
    assert_eq!(history[1].decision, Some(Decision::Block));
    assert!(history.iter().all(|s| s.role != StepRole::Responder));
    assert_eq!(s.llm.call_count(), 0);

    let info = s.engine.instance_info(&id).await.unwrap();
    assert_eq!(info.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn scenario_b_allowed_input_reaches_the_responder() {
    let s = setup().await;
    s.llm.push(ScriptedReply::verdict("ALLOW", ""));
    s.llm.push(ScriptedReply::text("Paris."));
    let id = s.engine.create_instance("screened").await.unwrap().id;

    let events = drain(s.engine.send(&id, "capital of France?").await.unwrap()).await;
    let agents: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::CompleteStep(step) => Some(step.agent_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(agents, vec!["user", "evaluator", "responder"]);

    let history = s.engine.history(&id).await.unwrap();
    assert_eq!(history[1].decision, Some(Decision::Allow));
    assert_eq!(history[2].response, "Paris.");
    assert_eq!(history[2].next_status, Some(ResponderStatus::Complete));
}

#[tokio::test]
async fn scenario_c_confirmed_tool_runs_once() {
    let s = setup().await;
    let (id, execution_id) = start_calculation(&s).await;

    let history = s.engine.history(&id).await.unwrap();
    let parked = history.last().unwrap();
    assert_eq!(parked.next_status, Some(ResponderStatus::AwaitingToolConfirmation));
    assert_eq!(
        s.engine.instance_info(&id).await.unwrap().status,
        InstanceStatus::AwaitingToolConfirmation
    );

    let outcome = s.engine.confirm(&id, &execution_id).await.unwrap();
    assert_eq!(outcome.tool_name, "calculator");
    assert_eq!(outcome.input, serde_json::json!({"expression": "2+2"}));
    assert_eq!(outcome.result, "4");
    assert!(!outcome.is_error);
    assert!(s.engine.pending(&id).await.unwrap().is_empty());

    // Settled ids cannot be confirmed again.
    let again = s.engine.confirm(&id, &execution_id).await.unwrap_err();
    assert!(again.is_not_found());

    let history = s.engine.history(&id).await.unwrap();
    let tool_step = history.last().unwrap();
    assert_eq!(tool_step.role, StepRole::Tool);
    assert_eq!(tool_step.response, "4");

    s.llm.push(ScriptedReply::text("2+2 is 4."));
    drain(s.engine.resume(&id).await.unwrap()).await;
    let info = s.engine.instance_info(&id).await.unwrap();
    assert_eq!(info.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn scenario_d_denied_tool_never_runs() {
    let s = setup().await;
    let (id, execution_id) = start_calculation(&s).await;
    let before = s.engine.history(&id).await.unwrap().len();

    let denial = s.engine.deny(&id, &execution_id).await.unwrap();
    assert_eq!(denial.tool_name, "calculator");
    assert!(s.engine.pending(&id).await.unwrap().is_empty());
    assert_eq!(s.engine.history(&id).await.unwrap().len(), before);
    assert!(s.engine.deny(&id, &execution_id).await.unwrap_err().is_not_found());

    s.llm.push(ScriptedReply::text("I can't calculate that without the tool."));
    drain(s.engine.resume(&id).await.unwrap()).await;
    let last_request = s.llm.requests().pop().unwrap();
    assert!(last_request.iter().any(|m| m.content.contains("denied")));
}

#[tokio::test]
async fn scenario_e_invalid_decision_is_coerced_to_caution() {
    let s = setup().await;
    s.llm.push(ScriptedReply::text(
        r#"{"decision": "MAYBE", "reasoning": "unsure", "guidance": "", "response": ""}"#,
    ));
    s.llm.push(ScriptedReply::text("Here you go."));
    let id = s.engine.create_instance("screened").await.unwrap().id;
    drain(s.engine.send(&id, "something odd").await.unwrap()).await;

    let history = s.engine.history(&id).await.unwrap();
    assert_eq!(history[1].decision, Some(Decision::Caution));
    assert_eq!(history[2].role, StepRole::Responder);

    let record = s.store.load_instance(&id).await.unwrap().unwrap();
    let guidance = record.history()[1].hidden_guidance.clone().unwrap();
    assert!(guidance.contains("invalid decision 'MAYBE'"), "{}", guidance);
}

#[tokio::test]
async fn reopened_store_resumes_without_replaying_steps() {
    let s = setup().await;
    let (id, execution_id) = start_calculation(&s).await;
    let calls_before = s.llm.call_count();

    let reopened = engine_on(s.store.clone(), s.llm.clone());
    let history = reopened.history(&id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(s.llm.call_count(), calls_before);

    reopened.confirm(&id, &execution_id).await.unwrap();
    s.llm.push(ScriptedReply::text("Four."));
    let events = drain(reopened.resume(&id).await.unwrap()).await;
    assert!(events
        .iter()
        .all(|e| !matches!(e, StreamEvent::Error(_))));

    let record = s.store.load_instance(&id).await.unwrap().unwrap();
    assert_eq!(record.history().len(), 5);
    assert_eq!(record.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn bundled_flow_definition_compiles() {
    let json = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/flows/guarded-chat.json"))
        .expect("read bundled flow");
    let def = FlowDefinition::from_json(&json).unwrap();

    let mut library = std::collections::HashMap::new();
    library.insert("safety".to_string(), "Be safe.".to_string());
    let caps = Capabilities::new(
        Arc::new(ScriptedLlm::default()),
        ModelConfig::new("test"),
        Arc::new(ToolRegistry::with_builtins()),
    )
    .with_library(Arc::new(library));
    let engine = FlowEngine::new(
        EngineConfig::default(),
        caps,
        Arc::new(SqliteInstanceStore::in_memory().unwrap()),
    );
    engine.validate(&def).unwrap();

    // Without the library text the constitution cannot be resolved.
    let bare = engine_on(Arc::new(SqliteInstanceStore::in_memory().unwrap()), ScriptedLlm::default());
    let err = bare.validate(&def).unwrap_err().to_string();
    assert!(err.contains("constitution 'safety' not found"), "{}", err);
}
