mod common;

use aigentic_server::state::AppStateInitOptions;
use aigentic_server::storage::SubTaskRecord;
use axum::http::StatusCode;
use common::{EchoBackend, TestApp};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn two_step_plan() -> Value {
    json!([
        { "agent": "research", "description": "gather facts" },
        { "agent": "analysis", "description": "analyze facts" }
    ])
}

async fn run_orchestrated(app: &TestApp, token: &str, query: &str) -> i64 {
    let (status, body) = app
        .post("/api/tasks/execute", token, json!({ "query": query }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["task_id"].as_i64().unwrap()
}

#[tokio::test]
async fn single_agent_task_completes_and_records_memory() {
    let app = TestApp::new();
    let token = app.signup("alice").await;

    let (status, body) = app
        .post(
            "/api/tasks/execute",
            &token,
            json!({ "query": "summarize rust async", "agent_name": "research" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["job_id"].is_string());
    let task_id = body["task_id"].as_i64().unwrap();

    let task = app.wait_for_task(task_id).await;
    assert_eq!(task.status, "completed");
    let result = task.result.expect("result");
    assert_eq!(result["agent"], "research");
    assert_eq!(result["content"], "echo: summarize rust async");
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    assert!(task.execution_time.is_some());
    assert_eq!(app.llm.calls.load(Ordering::SeqCst), 1);

    let (status, memories) = app.get("/api/agents/memory/research", &token).await;
    assert_eq!(status, StatusCode::OK);
    let memories = memories.as_array().unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0]["memory_type"], "success");
    assert_eq!(memories[0]["content"]["task_id"], task_id);

    let (_, performance) = app.get("/api/agents/performance", &token).await;
    assert_eq!(performance["agents"][0]["agent_name"], "research");
    assert_eq!(performance["agents"][0]["completed_tasks"], 1);
}

#[tokio::test]
async fn orchestrated_task_falls_back_to_single_research_step() {
    let app = TestApp::new();
    let token = app.signup("bob").await;

    let (_, created) = app
        .post(
            "/api/tasks",
            &token,
            json!({ "title": "Plan a launch", "query": "plan a product launch" }),
        )
        .await;
    let task_id = created["id"].as_i64().unwrap();
    let (status, _) = app
        .post(&format!("/api/tasks/{task_id}/execute"), &token, json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let task = app.wait_for_task(task_id).await;
    assert_eq!(task.status, "completed");
    let result = task.result.expect("result");
    assert_eq!(result["agent"], "orchestrator");
    let steps = result["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["agent"], "research");
    // planner, one step, compiler
    assert_eq!(app.llm.calls.load(Ordering::SeqCst), 3);

    let (status, subtasks) = app
        .get(&format!("/api/tasks/{task_id}/subtasks"), &token)
        .await;
    assert_eq!(status, StatusCode::OK);
    let subtasks = subtasks.as_array().unwrap();
    assert_eq!(subtasks.len(), 1);
    assert_eq!(subtasks[0]["status"], "completed");
    assert_eq!(subtasks[0]["execution_order"], 0);
}

#[tokio::test]
async fn finished_task_can_be_executed_again() {
    let app = TestApp::new();
    let token = app.signup("carol").await;
    let (_, body) = app
        .post(
            "/api/tasks/execute",
            &token,
            json!({ "query": "draft a tweet", "agent_name": "content" }),
        )
        .await;
    let task_id = body["task_id"].as_i64().unwrap();
    let first = app.wait_for_task(task_id).await;
    assert_eq!(first.status, "completed");

    let (status, body) = app
        .post(&format!("/api/tasks/{task_id}/execute"), &token, json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_ne!(body["job_id"], json!(first.job_id));
    let second = app.wait_for_task(task_id).await;
    assert_eq!(second.status, "completed");

    let (_, dashboard) = app.get("/api/dashboard", &token).await;
    assert_eq!(dashboard["usage"]["used"], 2);
}

#[tokio::test]
async fn llm_error_fails_the_task_and_records_an_error_memory() {
    let app = TestApp::with_backend(EchoBackend::failing_on(""), |_| {});
    let token = app.signup("dave").await;
    let (status, body) = app
        .post(
            "/api/tasks/execute",
            &token,
            json!({ "query": "summarize the quarter", "agent_name": "research" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_i64().unwrap();

    let task = app.wait_for_task(task_id).await;
    assert_eq!(task.status, "failed");
    assert_eq!(task.error.as_deref(), Some("upstream model unavailable"));
    assert!(task.result.is_none());
    assert!(task.completed_at.is_some());

    let (_, memories) = app
        .get("/api/agents/memory/research?memory_type=error", &token)
        .await;
    let memories = memories.as_array().unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0]["content"]["task_id"], task_id);
    assert_eq!(memories[0]["content"]["summary"], "upstream model unavailable");
    assert_eq!(memories[0]["relevance_score"], 0.5);
}

#[tokio::test]
async fn slow_task_times_out() {
    let app = TestApp::with_backend(
        EchoBackend::slow_on("", Duration::from_secs(3)),
        |config| config.worker.task_timeout_s = 1,
    );
    let token = app.signup("erin").await;
    let (_, body) = app
        .post(
            "/api/tasks/execute",
            &token,
            json!({ "query": "long report", "agent_name": "reporting" }),
        )
        .await;
    let task = app.wait_for_task(body["task_id"].as_i64().unwrap()).await;
    assert_eq!(task.status, "failed");
    assert_eq!(task.error.as_deref(), Some("Task timed out after 1 seconds"));
}

#[tokio::test]
async fn full_queue_answers_503() {
    let app = TestApp::without_workers(|config| config.worker.queue_capacity = 1);
    let token = app.signup("frank").await;
    let (status, _) = app
        .post("/api/tasks/execute", &token, json!({ "query": "first" }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = app
        .post("/api/tasks/execute", &token, json!({ "query": "second" }))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["message"], "Task queue is full, try again later");
}

#[tokio::test]
async fn planned_steps_run_in_order_and_see_previous_results() {
    let app = TestApp::with_backend(EchoBackend::default().with_plan(two_step_plan()), |_| {});
    let token = app.signup("grace").await;
    let task_id = run_orchestrated(&app, &token, "prepare a market brief").await;

    let task = app.wait_for_task(task_id).await;
    assert_eq!(task.status, "completed");
    let result = task.result.expect("result");
    let steps = result["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["agent"], "research");
    assert_eq!(steps[1]["agent"], "analysis");
    // planner, two steps, compiler
    assert_eq!(app.llm.calls.load(Ordering::SeqCst), 4);

    let prompts = app.llm.prompts();
    let second_step = prompts
        .iter()
        .find(|prompt| prompt.starts_with("Step: analyze facts"))
        .expect("second step prompt");
    assert!(second_step.contains("Previous results:\n- research: echo: Step: gather facts"));

    let (_, subtasks) = app
        .get(&format!("/api/tasks/{task_id}/subtasks"), &token)
        .await;
    let subtasks = subtasks.as_array().unwrap();
    let order: Vec<(&str, i64)> = subtasks
        .iter()
        .map(|item| {
            (
                item["agent_name"].as_str().unwrap(),
                item["execution_order"].as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(order, vec![("research", 0), ("analysis", 1)]);
    assert!(subtasks.iter().all(|item| item["status"] == "completed"));
}

#[tokio::test]
async fn failing_step_fails_the_orchestrated_task() {
    let backend = EchoBackend::failing_on("analyze facts").with_plan(two_step_plan());
    let app = TestApp::with_backend(backend, |_| {});
    let token = app.signup("heidi").await;
    let task_id = run_orchestrated(&app, &token, "prepare a market brief").await;

    let task = app.wait_for_task(task_id).await;
    assert_eq!(task.status, "failed");
    let error = task.error.expect("error");
    assert!(error.starts_with("subtask 2 (analysis) failed"), "{error}");
    // planner and both steps; the compiler never runs
    assert_eq!(app.llm.calls.load(Ordering::SeqCst), 3);

    let (_, subtasks) = app
        .get(&format!("/api/tasks/{task_id}/subtasks"), &token)
        .await;
    let statuses: Vec<&str> = subtasks
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["completed", "failed"]);
}

#[tokio::test]
async fn timeout_fails_the_running_subtask() {
    let backend = EchoBackend::slow_on("analyze facts", Duration::from_secs(3))
        .with_plan(two_step_plan());
    let app = TestApp::with_backend(backend, |config| config.worker.task_timeout_s = 1);
    let token = app.signup("ivan").await;
    let task_id = run_orchestrated(&app, &token, "prepare a market brief").await;

    let task = app.wait_for_task(task_id).await;
    assert_eq!(task.error.as_deref(), Some("Task timed out after 1 seconds"));
    let subtasks = app.state.storage.list_subtasks(task_id).unwrap();
    let statuses: Vec<&str> = subtasks.iter().map(|item| item.status.as_str()).collect();
    assert_eq!(statuses, vec!["completed", "failed"]);
    assert_eq!(
        subtasks[1].result.as_ref().unwrap()["error"],
        "Task timed out after 1 seconds"
    );
    assert!(subtasks[1].completed_at.is_some());
}

#[tokio::test]
async fn edits_made_while_running_survive_completion() {
    let app = TestApp::with_backend(
        EchoBackend::slow_on("", Duration::from_millis(800)),
        |_| {},
    );
    let token = app.signup("judy").await;
    let (_, body) = app
        .post(
            "/api/tasks/execute",
            &token,
            json!({ "title": "Draft", "query": "write an intro", "agent_name": "content" }),
        )
        .await;
    let task_id = body["task_id"].as_i64().unwrap();
    app.wait_for_status(task_id, "in_progress").await;

    let (status, _) = app
        .put(
            &format!("/api/tasks/{task_id}"),
            &token,
            json!({ "title": "Final intro", "priority": "urgent" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let task = app.wait_for_task(task_id).await;
    assert_eq!(task.status, "completed");
    assert_eq!(task.title, "Final intro");
    assert_eq!(task.priority, "urgent");
}

#[tokio::test]
async fn restart_fails_tasks_left_queued_or_running() {
    let app = TestApp::without_workers(|_| {});
    let token = app.signup("kim").await;

    let (_, queued) = app
        .post("/api/tasks/execute", &token, json!({ "query": "never picked up" }))
        .await;
    let queued_id = queued["task_id"].as_i64().unwrap();

    let (_, running) = app
        .post("/api/tasks", &token, json!({ "title": "Half done" }))
        .await;
    let running_id = running["id"].as_i64().unwrap();
    app.put(
        &format!("/api/tasks/{running_id}"),
        &token,
        json!({ "status": "in_progress" }),
    )
    .await;
    app.state
        .storage
        .insert_subtask(&SubTaskRecord {
            id: 0,
            task_id: running_id,
            agent_name: "research".to_string(),
            description: "look around".to_string(),
            status: "in_progress".to_string(),
            result: None,
            execution_order: 0,
            created_at: 0.0,
            completed_at: None,
        })
        .unwrap();

    let (_, idle) = app
        .post("/api/tasks", &token, json!({ "title": "Not started" }))
        .await;
    let idle_id = idle["id"].as_i64().unwrap();

    let dir = app.shut_down();
    let app = TestApp::open(
        dir,
        EchoBackend::default(),
        AppStateInitOptions::test_default(),
        |_| {},
    );

    for task_id in [queued_id, running_id] {
        let task = app.state.storage.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, "failed");
        assert_eq!(task.error.as_deref(), Some("Interrupted by server restart"));
        assert!(task.completed_at.is_some());
    }
    let subtasks = app.state.storage.list_subtasks(running_id).unwrap();
    assert_eq!(subtasks[0].status, "failed");
    let idle = app.state.storage.get_task(idle_id).unwrap().unwrap();
    assert_eq!(idle.status, "pending");

    let (status, _) = app
        .post(&format!("/api/tasks/{running_id}/execute"), &token, json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task = app.wait_for_task(running_id).await;
    assert_eq!(task.status, "completed");
}
