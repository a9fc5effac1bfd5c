use super::common::*;
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use stepwise::config::OrchestratorConfig;
use stepwise::llm::Message;
use stepwise::orchestrator::propagation::embed_context;
use stepwise::orchestrator::{
    OrchestratorAgent, OrchestratorError, PlanEvent, StepAgent, WorkerRole, NO_STEPS_MESSAGE,
};

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        user_id: "tester".to_string(),
        ..OrchestratorConfig::default()
    }
}

fn diamond_plan() -> serde_json::Value {
    json!({
        "taskCategory": "investigation",
        "steps": [
            {"id": 1, "description": "find the config loader", "agent": "search", "dependencies": []},
            {"id": 2, "description": "run the config tests", "agent": "command", "dependencies": [1]},
            {"id": 3, "description": "read stored decisions", "agent": "memory", "dependencies": [1]},
            {"id": 4, "description": "check the findings", "agent": "verification", "dependencies": [2, 3]}
        ],
        "searchKeywords": ["Config::load"]
    })
}

#[tokio::test]
async fn test_create_plan_starts_with_every_step_pending() -> Result<()> {
    let (registry, _log) = recording_registry();
    let (mut agent, llm) = orchestrator_with_plan(diamond_plan(), registry, config());

    let plan = agent.create_plan("Where is config loaded?", None).await?;

    assert_eq!(plan.task_category, "investigation");
    assert_eq!(plan.steps.len(), 4);
    assert!(plan.steps.iter().all(|s| !s.completed && s.result.is_none()));
    assert_eq!(agent.context().total_steps(), 4);
    assert_eq!(agent.context().user_id(), "tester");
    assert_eq!(llm.call_count(), 1);

    let usage = &agent.context().token_usage()["orchestrator"];
    assert_eq!(usage.prompt_tokens, 100);
    assert_eq!(usage.completion_tokens, 25);
    assert_eq!(usage.model, "scripted-model");
    Ok(())
}

#[tokio::test]
async fn test_planner_sees_project_memory_and_full_context() -> Result<()> {
    let (registry, _log) = recording_registry();
    let (mut agent, llm) = orchestrator_with_plan(diamond_plan(), registry, config());

    agent
        .create_plan("Where is config loaded?", Some("look under src/"))
        .await?;

    let calls = llm.calls.lock().unwrap();
    let text: Vec<String> = calls[0].iter().map(Message::text).collect();
    assert!(text.iter().any(|t| t.contains("Project: demo")));
    assert!(text.iter().any(|t| t.contains("No project knowledge files")));
    assert!(text.iter().any(|t| t.contains("<<<STEPWISE_EXECUTION_CONTEXT>>>")));
    let request = text.last().unwrap();
    assert!(request.contains("Where is config loaded?"));
    assert!(request.contains("look under src/"));
    Ok(())
}

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() -> Result<()> {
    let (registry, log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(diamond_plan(), registry, config());

    let answer = agent.handle_request("Where is config loaded?", None).await?;

    assert_eq!(
        step_prompts(&log),
        vec![
            "find the config loader",
            "run the config tests",
            "read stored decisions",
            "check the findings",
        ]
    );
    assert!(answer.starts_with("verification done: Summarize"));

    let plan = agent.plan().unwrap();
    assert!(plan.all_completed());
    assert_eq!(
        plan.find_step(2).unwrap().result.as_ref().unwrap().to_string(),
        "command done: run the config tests"
    );
    Ok(())
}

#[tokio::test]
async fn test_dependency_results_reach_the_worker() -> Result<()> {
    let (registry, log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(diamond_plan(), registry, config());

    agent.handle_request("Where is config loaded?", None).await?;

    let calls = log.lock().unwrap();
    let (role, request) = calls
        .iter()
        .find(|(_, r)| r.prompt == "check the findings")
        .unwrap();
    assert_eq!(*role, WorkerRole::Verification);

    let additional = request.additional_context.as_deref().unwrap();
    assert!(additional.starts_with("Results from previous steps:"));
    assert!(additional.contains("Step 2 (command): run the config tests\nResult:\ncommand done"));
    assert!(additional.contains("Step 3 (memory): read stored decisions\nResult:\nmemory done"));
    assert!(!additional.contains("Step 1 (search)"));

    let summary = request.context.as_ref().unwrap();
    assert_eq!(summary.current_step, Some(4));
    assert_eq!(summary.completed_steps, 3);
    assert_eq!(
        summary.dependencies.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![2, 3]
    );
    assert!(summary.step.as_ref().unwrap().result.is_none());

    let (_, first) = &calls[0];
    assert!(first.additional_context.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unknown_agent_is_inferred_from_description() -> Result<()> {
    let plan = json!({
        "taskCategory": "question",
        "steps": [
            {"id": 1, "description": "search for the retry helper", "agent": "bogus"}
        ]
    });
    let (registry, log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    let created = agent.create_plan("where is retry?", None).await?;
    assert_eq!(created.steps[0].agent, StepAgent::Role(WorkerRole::Search));

    agent.execute_plan().await;
    assert_eq!(log.lock().unwrap()[0].0, WorkerRole::Search);
    Ok(())
}

#[tokio::test]
async fn test_dependency_cycle_still_terminates() -> Result<()> {
    let plan = json!({
        "taskCategory": "bugfix",
        "steps": [
            {"id": 1, "description": "first", "agent": "search", "dependencies": [2]},
            {"id": 2, "description": "second", "agent": "command", "dependencies": [1]}
        ]
    });
    let (registry, log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    let answer = agent.handle_request("fix it", None).await?;

    assert_eq!(step_prompts(&log), vec!["first", "second"]);
    assert!(!answer.is_empty());
    assert!(agent.plan().unwrap().all_completed());
    assert!(agent
        .context()
        .errors()
        .iter()
        .any(|e| e.error.contains("cycle")));
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_deadlock_reports_instead_of_failing() -> Result<()> {
    let plan = json!({
        "taskCategory": "bugfix",
        "steps": [
            {"id": 1, "description": "a", "agent": "search", "dependencies": [2]},
            {"id": 2, "description": "b", "agent": "search", "dependencies": [3]},
            {"id": 3, "description": "c", "agent": "search", "dependencies": [1]}
        ]
    });
    let (registry, log) = recording_registry();
    let config = OrchestratorConfig {
        deadlock_repair_attempts: 0,
        ..config()
    };
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config);

    let answer = agent.handle_request("fix it", None).await?;

    assert!(answer.starts_with("Unable to execute the plan"));
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_fires_once_after_its_step() -> Result<()> {
    let plan = json!({
        "taskCategory": "feature",
        "steps": [
            {"id": 1, "description": "find the handlers", "agent": "search"},
            {"id": 2, "description": "add the route", "agent": "command", "dependencies": [1]},
            {"id": 3, "description": "verify the route", "agent": "verification", "dependencies": [2]}
        ],
        "memoryUpdatePoints": [
            {"afterStep": 2, "filePath": "architecture.md", "description": "where routes live"}
        ]
    });
    let (registry, log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    agent = agent.with_events(tx);

    agent.handle_request("add a route", None).await?;

    let calls = log.lock().unwrap();
    let memory_calls: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, (role, _))| *role == WorkerRole::Memory)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(memory_calls, vec![2]);
    assert_eq!(calls[1].1.prompt, "add the route");
    assert_eq!(calls[3].1.prompt, "verify the route");

    let instruction = &calls[2].1.prompt;
    assert!(instruction.contains("architecture.md"));
    assert!(instruction.contains("where routes live"));
    assert!(instruction.contains("Step 1 (search): find the handlers -> search done: find the handlers"));
    assert!(instruction.contains("Step 2 (command): add the route -> command done: add the route"));
    drop(calls);

    let mut fired = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PlanEvent::CheckpointFired {
            step_id,
            file_path,
            success,
            ..
        } = event
        {
            fired.push((step_id, file_path, success));
        }
    }
    assert_eq!(fired, vec![(2, "architecture.md".to_string(), true)]);
    Ok(())
}

#[tokio::test]
async fn test_failed_checkpoint_does_not_block_the_plan() -> Result<()> {
    let plan = json!({
        "taskCategory": "feature",
        "steps": [
            {"id": 1, "description": "find", "agent": "search"},
            {"id": 2, "description": "verify", "agent": "verification", "dependencies": [1]}
        ],
        "memoryUpdatePoints": [
            {"afterStep": 1, "filePath": "notes.md", "description": "findings"}
        ]
    });
    let (mut registry, log) = recording_registry();
    registry.register(
        WorkerRole::Memory,
        Arc::new(FailingWorker {
            message: "disk full".to_string(),
        }),
    );
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    agent.handle_request("do it", None).await?;

    assert_eq!(step_prompts(&log), vec!["find", "verify"]);
    assert!(agent.plan().unwrap().all_completed());
    assert!(agent
        .context()
        .errors()
        .iter()
        .any(|e| e.step == Some(1) && e.error.starts_with("Memory update error:") && e.error.contains("disk full")));
    Ok(())
}

#[tokio::test]
async fn test_failing_worker_completes_step_with_error_result() -> Result<()> {
    let plan = json!({
        "taskCategory": "testing",
        "steps": [
            {"id": 1, "description": "find the tests", "agent": "search"},
            {"id": 2, "description": "verify the tests pass", "agent": "verification", "dependencies": [1]}
        ]
    });
    let (mut registry, _log) = recording_registry();
    registry.register(
        WorkerRole::Verification,
        Arc::new(FailingWorker {
            message: "model refused".to_string(),
        }),
    );
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    let answer = agent.handle_request("are the tests green?", None).await?;

    let step = agent.plan().unwrap().find_step(2).unwrap().clone();
    assert!(step.completed);
    let result = step.result.unwrap().to_string();
    assert!(result.starts_with("Error executing step 2:"));
    assert!(result.contains("model refused"));

    // Summarization fails too, so the basic summary is returned
    assert!(answer.starts_with("Completed 2 steps."));
    assert!(answer.contains("Error executing step 2"));
    assert!(answer.contains("model refused"));
    assert!(agent.context().errors().iter().any(|e| e.step == Some(2)));
    Ok(())
}

#[tokio::test]
async fn test_failure_in_middle_of_plan_is_reported() -> Result<()> {
    let plan = json!({
        "taskCategory": "testing",
        "steps": [
            {"id": 1, "description": "find the tests", "agent": "search"},
            {"id": 2, "description": "verify the tests exist", "agent": "verification", "dependencies": [1]},
            {"id": 3, "description": "run the tests", "agent": "command", "dependencies": [1]}
        ]
    });
    let (mut registry, log) = recording_registry();
    registry.register(
        WorkerRole::Verification,
        Arc::new(FailingWorker {
            message: "model refused".to_string(),
        }),
    );
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    let answer = agent.handle_request("are the tests green?", None).await?;

    // Step 3 still runs after step 2 fails
    assert_eq!(step_prompts(&log), vec!["find the tests", "run the tests"]);
    assert!(answer.starts_with("Completed 3 steps."));
    assert!(answer.contains("Failed steps:\n- Error executing step 2:"));
    assert!(answer.contains("model refused"));
    Ok(())
}

#[tokio::test]
async fn test_missing_worker_becomes_step_error() -> Result<()> {
    let plan = json!({
        "taskCategory": "question",
        "steps": [{"id": 1, "description": "run cargo build", "agent": "command"}]
    });
    let (mut registry, _log) = recording_registry();
    registry.clear();
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    let answer = agent.handle_request("does it build?", None).await?;

    let result = agent.plan().unwrap().steps[0].result.clone().unwrap().to_string();
    assert!(result.contains("No worker registered for role 'command'"));
    assert!(answer.contains("Error executing step 1"));
    Ok(())
}

#[tokio::test]
async fn test_empty_plan_reports_no_steps() -> Result<()> {
    let plan = json!({"taskCategory": "question", "steps": []});
    let (registry, log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    let answer = agent.handle_request("hello", None).await?;

    assert_eq!(answer, NO_STEPS_MESSAGE);
    assert!(log.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_execution_without_plan_reports_no_steps() {
    let (registry, _log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(json!({}), registry, config());
    assert_eq!(agent.execute_plan().await, NO_STEPS_MESSAGE);
}

#[tokio::test]
async fn test_step_limit_truncates_execution() -> Result<()> {
    let plan = json!({
        "taskCategory": "refactor",
        "steps": [
            {"id": 1, "description": "one", "agent": "search"},
            {"id": 2, "description": "two", "agent": "search"},
            {"id": 3, "description": "three", "agent": "search"}
        ]
    });
    let (registry, log) = recording_registry();
    let config = OrchestratorConfig {
        max_steps: 2,
        ..config()
    };
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config);

    let answer = agent.handle_request("rename things", None).await?;

    assert_eq!(step_prompts(&log), vec!["one", "two"]);
    assert!(answer.contains("truncated after 2 steps"));
    assert!(!agent.plan().unwrap().find_step(3).unwrap().completed);
    Ok(())
}

#[tokio::test]
async fn test_plan_generation_failure_is_typed() {
    let (registry, _log) = recording_registry();
    let mut agent = OrchestratorAgent::new(
        config(),
        Arc::new(FailingLlm),
        registry,
        Arc::new(StaticAmbient),
    );

    let err = agent.create_plan("anything", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OrchestratorError>(),
        Some(OrchestratorError::PlanGeneration(_))
    ));
    assert!(agent.plan().is_none());
    assert!(agent.handle_request("anything", None).await.is_err());
}

#[tokio::test]
async fn test_schema_mismatch_is_a_plan_generation_error() {
    let (registry, _log) = recording_registry();
    let (mut agent, llm) =
        orchestrator_with_plan(json!({"steps": "not a list"}), registry, config());

    let err = agent.create_plan("anything", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OrchestratorError>(),
        Some(OrchestratorError::PlanGeneration(_))
    ));
    // default schema_attempts
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_events_follow_execution() -> Result<()> {
    let (registry, _log) = recording_registry();
    let (agent, _llm) = orchestrator_with_plan(diamond_plan(), registry, config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut agent = agent.with_events(tx);

    agent.handle_request("Where is config loaded?", None).await?;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(PlanEvent::PlanCreated { total_steps: 4, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(PlanEvent::PlanCompleted {
            executed_steps: 4,
            truncated: false,
            ..
        })
    ));
    let started: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PlanEvent::StepStarted { step_id, .. } => Some(*step_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_token_usage_is_accumulated_per_agent() -> Result<()> {
    let plan = json!({
        "taskCategory": "question",
        "steps": [
            {"id": 1, "description": "a", "agent": "search"},
            {"id": 2, "description": "b", "agent": "search"}
        ]
    });
    let (registry, _log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(plan, registry, config());

    agent.handle_request("q", None).await?;

    let usage = agent.context().token_usage();
    assert_eq!(usage["search"].prompt_tokens, 20);
    assert_eq!(usage["search"].completion_tokens, 10);
    assert_eq!(usage["search"].model, "worker-model");
    assert_eq!(usage["verification"].prompt_tokens, 10);
    assert_eq!(agent.context().total_tokens(), 125 + 30 + 15);
    Ok(())
}

#[tokio::test]
async fn test_context_can_be_restored_from_messages() -> Result<()> {
    let (registry, _log) = recording_registry();
    let (mut agent, _llm) = orchestrator_with_plan(diamond_plan(), registry.clone(), config());
    agent.handle_request("Where is config loaded?", None).await?;

    let mut messages = vec![Message::user("continue")];
    embed_context(&mut messages, agent.context())?;

    let (mut resumed, _llm) = orchestrator_with_plan(diamond_plan(), registry, config());
    assert!(resumed.restore_context(&messages));
    assert_eq!(resumed.context().request_id(), agent.context().request_id());
    assert!(resumed.plan().unwrap().all_completed());

    assert!(!resumed.restore_context(&[Message::user("no context here")]));
    assert!(resumed.plan().is_none());
    Ok(())
}
