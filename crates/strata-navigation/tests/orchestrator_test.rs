//! End-to-end routine runs: the orchestrator on top of the tier-3 executor
//! with the built-in tools.

use std::sync::Arc;

use serde_json::{Value, json};
use strata_navigation::{
    BpmnModel, BpmnSubprocessHandler, NativeRoutine, NativeStep, NavigationConfig,
    TierTwoOrchestrator,
};
use strata_resources::{
    RecoveryConfig, ResourceManager, ResourceManagerConfig, SimpleRecoveryProvider,
    TierThreeExecutor,
};
use strata_tools::{IntegratedToolRegistry, RegistryConfig, register_builtins};
use strata_types::{
    AbstractLocation, AvailableResources, ExecutionContext, ExecutionStatus, InMemoryEventBus,
    LocationType, ResourceConstraints, RoutineFormat, SubprocessStatus, TierCommunication,
    TierExecutionRequest,
};

struct Stack {
    orchestrator: TierTwoOrchestrator,
    resources: Arc<ResourceManager>,
    bus: Arc<InMemoryEventBus>,
}

fn stack(config: NavigationConfig) -> Stack {
    let bus = InMemoryEventBus::shared();
    let registry = Arc::new(IntegratedToolRegistry::new(RegistryConfig::default()));
    register_builtins(&registry);
    let resources = Arc::new(ResourceManager::new(
        ResourceManagerConfig::default().with_global_credits(1000.0),
        bus.clone(),
    ));
    let recovery = Arc::new(SimpleRecoveryProvider::new(
        RecoveryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: 3,
            timeout_ms: 1000,
        },
        bus.clone(),
    ));
    let tier3 = Arc::new(TierThreeExecutor::new(registry, resources.clone(), recovery));
    Stack {
        orchestrator: TierTwoOrchestrator::new(tier3, bus.clone(), config),
        resources,
        bus,
    }
}

fn request(routine: &str, format: RoutineFormat, inputs: Value) -> TierExecutionRequest {
    let mut request = TierExecutionRequest::routine(routine, format)
        .with_available(AvailableResources::with_credits(100.0))
        .with_constraints(ResourceConstraints::default().with_max_cost(5.0));
    if let Value::Object(map) = inputs {
        request.inputs = map.into_iter().collect();
    }
    request
}

const EMBEDDED: &str = r#"{
    "id": "main",
    "elements": [
        { "id": "MainStart", "type": "start_event" },
        { "id": "EmbeddedSubprocess", "type": "sub_process" },
        { "id": "SubStart", "type": "start_event", "parent": "EmbeddedSubprocess" },
        { "id": "SubTask", "type": "service_task", "parent": "EmbeddedSubprocess",
          "tool": "echo", "parameters": { "greeting": "hello {{name}}" }, "result_variable": "sub_result" },
        { "id": "SubEnd", "type": "end_event", "parent": "EmbeddedSubprocess" },
        { "id": "MainEnd", "type": "end_event" }
    ],
    "flows": [
        { "id": "f1", "source": "MainStart", "target": "EmbeddedSubprocess" },
        { "id": "f2", "source": "EmbeddedSubprocess", "target": "MainEnd" },
        { "id": "s1", "source": "SubStart", "target": "SubTask" },
        { "id": "s2", "source": "SubTask", "target": "SubEnd" }
    ]
}"#;

#[test]
fn test_embedded_subprocess_entry_and_completion() {
    let model = BpmnModel::from_json(EMBEDDED).unwrap();
    let handler = BpmnSubprocessHandler::new();
    let mut ctx = ExecutionContext::new("main");

    let at = AbstractLocation::node("main", "EmbeddedSubprocess");
    let next = handler
        .process_subprocess(&model, "EmbeddedSubprocess", &at, &mut ctx)
        .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].node_id, "SubStart");
    assert_eq!(next[0].location_type, LocationType::SubprocessContext);

    let active = handler.active_subprocesses(&ctx, None);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, SubprocessStatus::Active);
    assert_eq!(active[0].parent_process_id, "main");

    let end = next[0].sibling("SubEnd");
    let after = handler
        .complete_subprocess(&model, &end, &mut ctx)
        .unwrap()
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].node_id, "MainEnd");
    assert!(handler.active_subprocesses(&ctx, None).is_empty());
    assert!(ctx.subprocesses.completed[0].completed_at.is_some());
}

#[test]
fn test_call_activity_without_mapping_copies_parent_variables() {
    let model = BpmnModel::from_json(
        r#"{
            "id": "main",
            "elements": [
                { "id": "Start", "type": "start_event" },
                { "id": "CallExternal", "type": "call_activity", "called_element": "ExternalProcess" },
                { "id": "End", "type": "end_event" }
            ],
            "flows": [
                { "id": "f1", "source": "Start", "target": "CallExternal" },
                { "id": "f2", "source": "CallExternal", "target": "End" }
            ]
        }"#,
    )
    .unwrap();
    let handler = BpmnSubprocessHandler::new();
    let mut ctx = ExecutionContext::new("main");
    ctx.variables.insert("order_id".into(), json!(42));
    ctx.variables.insert("customer".into(), json!({"name": "Ada"}));

    let next = handler
        .process_subprocess(
            &model,
            "CallExternal",
            &AbstractLocation::node("main", "CallExternal"),
            &mut ctx,
        )
        .unwrap();

    assert_eq!(next[0].location_type, LocationType::CallActivity);
    assert_eq!(ctx.subprocesses.active[0].variables, ctx.variables);
}

#[tokio::test]
async fn test_embedded_routine_runs_through_tier_three() {
    let stack = stack(NavigationConfig::default());
    stack
        .orchestrator
        .register_bpmn(BpmnModel::from_json(EMBEDDED).unwrap())
        .await;

    let result = stack
        .orchestrator
        .execute(request("main", RoutineFormat::Bpmn, json!({"name": "ada"})))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.error);
    let data = result.data.unwrap();
    assert_eq!(data["variables"]["sub_result"], json!({"greeting": "hello ada"}));
    assert_eq!(data["completed_subprocesses"], json!(1));
    assert_eq!(stack.resources.metrics().reservations_approved, 1);
    assert_eq!(stack.bus.count("resource.reserved"), 1);
}

const PARALLEL: &str = r#"{
    "id": "fanout",
    "elements": [
        { "id": "Start", "type": "start_event" },
        { "id": "Fork", "type": "parallel_gateway" },
        { "id": "Left", "type": "service_task", "tool": "echo",
          "parameters": { "side": "left", "cost": 1.5 }, "result_variable": "left" },
        { "id": "Right", "type": "service_task", "tool": "flaky",
          "parameters": { "failures": 1 }, "result_variable": "right" },
        { "id": "Join", "type": "parallel_gateway" },
        { "id": "End", "type": "end_event" }
    ],
    "flows": [
        { "id": "f1", "source": "Start", "target": "Fork" },
        { "id": "f2", "source": "Fork", "target": "Left" },
        { "id": "f3", "source": "Fork", "target": "Right" },
        { "id": "f4", "source": "Left", "target": "Join" },
        { "id": "f5", "source": "Right", "target": "Join" },
        { "id": "f6", "source": "Join", "target": "End" }
    ]
}"#;

#[tokio::test]
async fn test_parallel_branches_with_recovered_step() {
    let stack = stack(NavigationConfig::default());
    stack
        .orchestrator
        .register_bpmn(BpmnModel::from_json(PARALLEL).unwrap())
        .await;

    let result = stack
        .orchestrator
        .execute(request("fanout", RoutineFormat::Bpmn, json!({})))
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.error);
    let vars = &result.data.as_ref().unwrap()["variables"];
    assert_eq!(vars["left"]["side"], json!("left"));
    assert_eq!(vars["right"]["attempts"], json!(2));
    assert_eq!(result.usage.unwrap().cost, 1.5);

    assert_eq!(stack.bus.count("run.branch.started"), 2);
    assert_eq!(stack.bus.count("run.branch.completed"), 2);
    assert_eq!(stack.bus.count("recovery/strategy_selected"), 1);
}

#[tokio::test]
async fn test_event_subprocess_handles_transaction_error() {
    let stack = stack(NavigationConfig::default());
    let model = BpmnModel::from_json(
        r#"{
            "id": "payment",
            "elements": [
                { "id": "Start", "type": "start_event" },
                { "id": "Pay", "type": "transaction", "compensation_handler": "Refund" },
                { "id": "PayStart", "type": "start_event", "parent": "Pay" },
                { "id": "Charge", "type": "service_task", "parent": "Pay", "tool": "echo",
                  "parameters": { "amount": "{{amount}}" }, "result_variable": "charge" },
                { "id": "Declined", "type": "end_event", "parent": "Pay", "error_code": "DECLINED" },
                { "id": "End", "type": "end_event" },
                { "id": "OnDeclined", "type": "event_sub_process",
                  "trigger": { "kind": "error", "reference": "DECLINED" } },
                { "id": "HandlerStart", "type": "start_event", "parent": "OnDeclined" },
                { "id": "Notify", "type": "service_task", "parent": "OnDeclined", "tool": "echo",
                  "parameters": { "notified": true }, "result_variable": "notice" },
                { "id": "HandlerEnd", "type": "end_event", "parent": "OnDeclined" }
            ],
            "flows": [
                { "id": "f1", "source": "Start", "target": "Pay" },
                { "id": "f2", "source": "Pay", "target": "End" },
                { "id": "p1", "source": "PayStart", "target": "Charge" },
                { "id": "p2", "source": "Charge", "target": "Declined" },
                { "id": "h1", "source": "HandlerStart", "target": "Notify" },
                { "id": "h2", "source": "Notify", "target": "HandlerEnd" }
            ]
        }"#,
    )
    .unwrap();
    stack.orchestrator.register_bpmn(model).await;

    let result = stack
        .orchestrator
        .execute(request("payment", RoutineFormat::Bpmn, json!({"amount": 30})))
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.error);
    let data = result.data.unwrap();
    assert_eq!(data["variables"]["charge"], json!({"amount": 30}));
    assert_eq!(data["variables"]["notice"], json!({"notified": true}));
    assert_eq!(data["variables"]["errors"][0]["code"], json!("DECLINED"));
    assert_eq!(data["completed_subprocesses"], json!(2));
}

#[tokio::test]
async fn test_call_activity_runs_registered_routine() {
    let stack = stack(NavigationConfig::default());
    stack
        .orchestrator
        .register_native(NativeRoutine::new(
            "enrich",
            vec![NativeStep::new("lookup", "echo", json!({"id": "{{customer_id}}", "tier": "gold"}))
                .storing("profile")],
        ))
        .await;
    stack
        .orchestrator
        .register_bpmn(
            BpmnModel::from_json(
                r#"{
                    "id": "onboard",
                    "elements": [
                        { "id": "Start", "type": "start_event" },
                        { "id": "Enrich", "type": "call_activity", "called_element": "enrich",
                          "input_mapping": [ { "source": "user", "target": "customer_id" } ],
                          "output_mapping": [ { "source": "profile", "target": "customer_profile" } ] },
                        { "id": "End", "type": "end_event" }
                    ],
                    "flows": [
                        { "id": "f1", "source": "Start", "target": "Enrich" },
                        { "id": "f2", "source": "Enrich", "target": "End" }
                    ]
                }"#,
            )
            .unwrap(),
        )
        .await;

    let result = stack
        .orchestrator
        .execute(request("onboard", RoutineFormat::Bpmn, json!({"user": "u-1"})))
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.error);
    let vars = &result.data.as_ref().unwrap()["variables"];
    assert_eq!(vars["customer_profile"], json!({"id": "u-1", "tier": "gold"}));
    assert!(vars.get("customer_id").is_none());
    assert!(vars.get("profile").is_none());
}

#[tokio::test]
async fn test_failed_call_marks_activation_failed() {
    let stack = stack(NavigationConfig::default());
    stack
        .orchestrator
        .register_native(NativeRoutine::new(
            "charge",
            vec![NativeStep::new("debit", "fail", json!({"kind": "permission", "message": "card declined"}))],
        ))
        .await;
    stack
        .orchestrator
        .register_bpmn(
            BpmnModel::from_json(
                r#"{
                    "id": "checkout",
                    "elements": [
                        { "id": "Start", "type": "start_event" },
                        { "id": "Charge", "type": "call_activity", "called_element": "charge" },
                        { "id": "End", "type": "end_event" }
                    ],
                    "flows": [
                        { "id": "f1", "source": "Start", "target": "Charge" },
                        { "id": "f2", "source": "Charge", "target": "End" }
                    ]
                }"#,
            )
            .unwrap(),
        )
        .await;

    let result = stack
        .orchestrator
        .execute(request("checkout", RoutineFormat::Bpmn, json!({})))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("card declined"));
    assert_eq!(result.data.unwrap()["failed_subprocesses"], json!(["Charge"]));
}

#[tokio::test]
async fn test_recursive_calls_hit_nesting_limit() {
    let stack = stack(NavigationConfig {
        max_subprocess_depth: 3,
        ..Default::default()
    });
    stack
        .orchestrator
        .register_bpmn(
            BpmnModel::from_json(
                r#"{
                    "id": "again",
                    "elements": [
                        { "id": "Start", "type": "start_event" },
                        { "id": "Recurse", "type": "call_activity", "called_element": "again" },
                        { "id": "End", "type": "end_event" }
                    ],
                    "flows": [
                        { "id": "f1", "source": "Start", "target": "Recurse" },
                        { "id": "f2", "source": "Recurse", "target": "End" }
                    ]
                }"#,
            )
            .unwrap(),
        )
        .await;

    let result = stack
        .orchestrator
        .execute(request("again", RoutineFormat::Bpmn, json!({})))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert!(
        error.contains("nesting too deep: depth 4 reaches the limit of 3"),
        "{error}"
    );
}

#[tokio::test]
async fn test_runaway_loop_hits_step_limit() {
    let stack = stack(NavigationConfig {
        max_steps: 10,
        ..Default::default()
    });
    stack
        .orchestrator
        .register_bpmn(
            BpmnModel::from_json(
                r#"{
                    "id": "spin",
                    "elements": [
                        { "id": "Start", "type": "start_event" },
                        { "id": "Work", "type": "service_task", "tool": "echo" },
                        { "id": "Again", "type": "exclusive_gateway", "default_flow": "back" },
                        { "id": "End", "type": "end_event" }
                    ],
                    "flows": [
                        { "id": "f1", "source": "Start", "target": "Work" },
                        { "id": "f2", "source": "Work", "target": "Again" },
                        { "id": "done", "source": "Again", "target": "End",
                          "condition": { "variable": "stop" } },
                        { "id": "back", "source": "Again", "target": "Work" }
                    ]
                }"#,
            )
            .unwrap(),
        )
        .await;

    let result = stack
        .orchestrator
        .execute(request("spin", RoutineFormat::Bpmn, json!({})))
        .await
        .unwrap();

    assert_eq!(result.error.as_deref(), Some("Step limit of 10 exceeded"));
    assert_eq!(stack.bus.count("run.failure.detected"), 1);
}

#[tokio::test]
async fn test_security_failure_fails_routine_without_retry() {
    let stack = stack(NavigationConfig::default());
    stack
        .orchestrator
        .register_native(NativeRoutine::new(
            "guarded",
            vec![NativeStep::new("touch", "fail", json!({"kind": "permission", "message": "no access"}))],
        ))
        .await;

    let result = stack
        .orchestrator
        .execute(request("guarded", RoutineFormat::Native, json!({})))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.unwrap().starts_with("Step 'touch' failed"));
    assert_eq!(stack.resources.global_credits(), 1000.0);
    let metrics = stack.orchestrator.metrics();
    assert_eq!(metrics.total_executions, 1);
    assert_eq!(metrics.failed_executions, 1);
}
