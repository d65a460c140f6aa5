mod common;

use axum::http::StatusCode;
use common::TestApp;
use serde_json::json;

#[tokio::test]
async fn create_get_and_list_tasks() {
    let app = TestApp::new();
    let token = app.signup("alice").await;

    let (status, created) = app
        .post(
            "/api/tasks",
            &token,
            json!({ "title": "Market scan", "query": "scan the market", "agent_name": "research" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["priority"], "medium");
    let task_id = created["id"].as_i64().unwrap();

    let (status, fetched) = app.get(&format!("/api/tasks/{task_id}"), &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["title"], "Market scan");
    assert_eq!(fetched["agent_name"], "research");

    let (status, listed) = app.get("/api/tasks?status=pending", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, listed) = app.get("/api/tasks?search=nothing-like-this", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn update_status_sets_timestamps_and_validates() {
    let app = TestApp::new();
    let token = app.signup("bob").await;
    let (_, created) = app
        .post("/api/tasks", &token, json!({ "title": "Write post" }))
        .await;
    let uri = format!("/api/tasks/{}", created["id"]);

    let (status, updated) = app
        .put(&uri, &token, json!({ "status": "completed", "result": { "ok": true } }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "completed");
    assert!(updated["completed_at"].is_string());
    assert_eq!(updated["result"]["ok"], true);

    let (status, _) = app.put(&uri, &token, json!({ "status": "archived" })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .put(&uri, &token, json!({ "agent_name": "no-such-agent" }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn tasks_are_isolated_between_users() {
    let app = TestApp::new();
    let owner = app.signup("carol").await;
    let other = app.signup("dave").await;
    let (_, created) = app
        .post("/api/tasks", &owner, json!({ "title": "Private" }))
        .await;
    let uri = format!("/api/tasks/{}", created["id"]);

    let (status, _) = app.get(&uri, &other).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.delete(&uri, &other).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, listed) = app.get("/api/tasks", &other).await;
    assert_eq!(status, StatusCode::OK);
    assert!(listed.as_array().unwrap().is_empty());

    let (status, _) = app.delete(&uri, &owner).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.get(&uri, &owner).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_path_and_body_return_422() {
    let app = TestApp::new();
    let token = app.signup("erin").await;
    let (status, body) = app.get("/api/tasks/not-a-number", &token).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = app.post("/api/tasks", &token, json!({ "description": "no title" })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn project_crud_and_task_linking() {
    let app = TestApp::new();
    let token = app.signup("frank").await;

    let (status, project) = app
        .post("/api/projects", &token, json!({ "name": "Launch" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(project["status"], "active");
    let project_id = project["id"].as_i64().unwrap();
    let uri = format!("/api/projects/{project_id}");

    let (status, task) = app
        .post(
            "/api/tasks",
            &token,
            json!({ "title": "Landing page", "project_id": project_id }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_uri = format!("/api/tasks/{}", task["id"]);

    let (_, fetched) = app.get(&uri, &token).await;
    assert_eq!(fetched["task_count"], 1);

    let (status, renamed) = app
        .put(&uri, &token, json!({ "name": "Launch v2", "status": "Archived" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["name"], "Launch v2");
    assert_eq!(renamed["status"], "archived");

    let (status, _) = app.put(&uri, &token, json!({ "status": "paused" })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app.delete(&uri, &token).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.get(&uri, &token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, task) = app.get(&task_uri, &token).await;
    assert_eq!(status, StatusCode::OK);
    assert!(task["project_id"].is_null());

    let (status, _) = app
        .post("/api/tasks", &token, json!({ "title": "x", "project_id": project_id }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn free_tier_quota_returns_402() {
    let app = TestApp::with_config(|config| config.subscription.free_monthly_tasks = 1);
    let token = app.signup("grace").await;

    let (status, body) = app
        .post(
            "/api/tasks/execute",
            &token,
            json!({ "query": "first run", "agent_name": "research" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    let (status, body) = app
        .post("/api/tasks/execute", &token, json!({ "query": "second run" }))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");

    let (_, dashboard) = app.get("/api/dashboard", &token).await;
    assert_eq!(dashboard["usage"]["used"], 1);
    assert_eq!(dashboard["usage"]["remaining"], 0);
}

#[tokio::test]
async fn task_priority_and_project_status_are_validated() {
    let app = TestApp::new();
    let token = app.signup("kate").await;

    let (status, body) = app
        .post("/api/tasks", &token, json!({ "title": "Someday", "priority": "someday" }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, task) = app
        .post("/api/tasks", &token, json!({ "title": "Hotfix", "priority": "High" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["priority"], "high");
    let uri = format!("/api/tasks/{}", task["id"]);

    let (status, _) = app.put(&uri, &token, json!({ "priority": "asap" })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let (status, task) = app.put(&uri, &token, json!({ "priority": "urgent" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["priority"], "urgent");

    let (status, _) = app
        .post("/api/projects", &token, json!({ "name": "Q4", "status": "paused" }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let (status, project) = app
        .post("/api/projects", &token, json!({ "name": "Q4", "status": "completed" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(project["status"], "completed");
}

#[tokio::test]
async fn quota_counts_every_execution_of_the_same_task() {
    let app = TestApp::with_config(|config| config.subscription.free_monthly_tasks = 2);
    let token = app.signup("liam").await;

    let (status, body) = app
        .post(
            "/api/tasks/execute",
            &token,
            json!({ "query": "daily digest", "agent_name": "reporting" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_i64().unwrap();
    app.wait_for_task(task_id).await;

    let execute_uri = format!("/api/tasks/{task_id}/execute");
    let (status, _) = app.post(&execute_uri, &token, json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    app.wait_for_task(task_id).await;

    let (status, body) = app.post(&execute_uri, &token, json!({})).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");

    let (status, _) = app.delete(&format!("/api/tasks/{task_id}"), &token).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app
        .post("/api/tasks/execute", &token, json!({ "query": "fresh task" }))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (_, dashboard) = app.get("/api/dashboard", &token).await;
    assert_eq!(dashboard["usage"]["used"], 2);
    assert_eq!(dashboard["usage"]["remaining"], 0);
}

#[tokio::test]
async fn feedback_becomes_agent_memory() {
    let app = TestApp::new();
    let token = app.signup("mia").await;
    let (_, task) = app
        .post(
            "/api/tasks",
            &token,
            json!({ "title": "Competitor scan", "agent_name": "research" }),
        )
        .await;
    let task_id = task["id"].as_i64().unwrap();

    let (status, _) = app
        .post(
            "/api/feedback",
            &token,
            json!({ "task_id": task_id, "rating": 2, "comment": "missed two rivals" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, feedback) = app
        .get("/api/agents/memory/research?memory_type=feedback", &token)
        .await;
    assert_eq!(status, StatusCode::OK);
    let feedback = feedback.as_array().unwrap();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0]["content"]["task_id"], task_id);
    assert_eq!(feedback[0]["content"]["rating"], 2);
    assert_eq!(feedback[0]["content"]["sentiment"], "negative");
    assert_eq!(feedback[0]["relevance_score"], 0.7);

    app.post(
        "/api/feedback",
        &token,
        json!({ "task_id": task_id, "rating": 4 }),
    )
    .await;
    let (_, learning) = app
        .get("/api/agents/memory/research?memory_type=learning", &token)
        .await;
    let learning = learning.as_array().unwrap();
    assert_eq!(learning.len(), 2);
    assert!(learning
        .iter()
        .any(|item| item["content"]["feedback_count"] == 2
            && item["content"]["average_rating"] == 3.0));
}

#[tokio::test]
async fn feedback_requires_owned_task_and_valid_rating() {
    let app = TestApp::new();
    let token = app.signup("heidi").await;
    let other = app.signup("ivan").await;
    let (_, task) = app
        .post("/api/tasks", &token, json!({ "title": "Rate me" }))
        .await;
    let task_id = task["id"].as_i64().unwrap();

    let (status, _) = app
        .post("/api/feedback", &token, json!({ "task_id": task_id, "rating": 9 }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .post("/api/feedback", &other, json!({ "task_id": task_id, "rating": 4 }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, feedback) = app
        .post(
            "/api/feedback",
            &token,
            json!({ "task_id": task_id, "rating": 5, "comment": "great" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(feedback["feedback_type"], "general");

    let (status, listed) = app
        .get(&format!("/api/feedback/task/{task_id}"), &token)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (_, mine) = app.get("/api/feedback", &token).await;
    assert_eq!(mine.as_array().unwrap().len(), 1);
}
