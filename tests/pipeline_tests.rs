//! End-to-end pipeline scenarios against a scripted backend.

mod common;

use common::{run_collect, test_pipeline, ScriptedBackend};

use makerflow::agent::AgentRole;
use makerflow::error::OrchestratorError;
use makerflow::store::{acquire_lease, load_task, save_task};
use makerflow::task::{Intent, TaskState, TaskStatus, Verdict};

const REJECTION: &str = r#"{"status": "failed", "feedback": "missing type hints"}"#;
const APPROVAL: &str = r#"{"status": "approved", "feedback": ""}"#;

#[tokio::test]
async fn test_question_answered_without_coding() {
    let backend = ScriptedBackend::new();
    backend
        .script(
            AgentRole::Preprocessor,
            r#"{"task": "What does a B-tree guarantee?", "intent": "question"}"#,
        )
        .await;
    backend
        .script(
            AgentRole::Planner,
            "A B-tree guarantees sorted order and logarithmic search, insert, and delete.",
        )
        .await;

    let (pipeline, _store) = test_pipeline(backend.clone());
    let task = TaskState::new("What does a B-tree guarantee?", 3);
    let (task, error, units) = run_collect(&pipeline, task).await;

    assert!(error.is_none());
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.iteration, 0);
    assert_eq!(task.intent, Some(Intent::Question));

    assert_eq!(backend.count(AgentRole::Preprocessor).await, 1);
    assert_eq!(backend.count(AgentRole::Planner).await, 1);
    assert_eq!(backend.count(AgentRole::Coder).await, 0);
    assert_eq!(backend.count(AgentRole::Voter).await, 0);
    assert_eq!(backend.count(AgentRole::Validator).await, 0);

    // The stream ends with the answer content.
    assert!(units.last().unwrap().contains("sorted order"));
}

#[tokio::test]
async fn test_simple_code_single_pass() {
    let backend = ScriptedBackend::new();
    backend
        .script(
            AgentRole::Preprocessor,
            r#"{"task": "Write a Python function add(a, b) returning their sum.", "intent": "simple_code"}"#,
        )
        .await;
    backend
        .script(AgentRole::Planner, "1. define add(a, b)\n2. return a + b")
        .await;
    for _ in 0..5 {
        backend
            .script(AgentRole::Coder, "def add(a, b):\n    return a + b")
            .await;
    }
    backend.script(AgentRole::Validator, APPROVAL).await;

    let (pipeline, store) = test_pipeline(backend.clone());
    let task = TaskState::new("Write a Python function add(a,b) returning their sum.", 3);
    let (task, error, units) = run_collect(&pipeline, task).await;

    assert!(error.is_none());
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.iteration, 1);
    assert!(task.code.as_deref().unwrap().contains("def add(a, b)"));
    assert_eq!(task.verdict, Some(Verdict { approved: true, feedback: String::new() }));

    assert_eq!(backend.count(AgentRole::Preprocessor).await, 1);
    assert_eq!(backend.count(AgentRole::Planner).await, 1);
    assert_eq!(backend.count(AgentRole::Coder).await, 5);
    assert!(backend.count(AgentRole::Voter).await >= 3);
    assert_eq!(backend.count(AgentRole::Validator).await, 1);

    // Stage tags appear in pipeline order on the stream.
    let joined = units.join("\n");
    let pre = joined.find("[PREPROCESSOR]").unwrap();
    let plan = joined.find("[PLANNER]").unwrap();
    let maker = joined.find("[MAKER]").unwrap();
    let review = joined.find("[REVIEWER]").unwrap();
    assert!(pre < plan && plan < maker && maker < review);

    // The terminal state round-trips through the store.
    let persisted = load_task(store.as_ref(), &task.task_id).await.unwrap().unwrap();
    assert_eq!(persisted, task);
}

#[tokio::test]
async fn test_revision_loop_feeds_feedback_to_next_round() {
    let backend = ScriptedBackend::new();
    backend.script(AgentRole::Validator, REJECTION).await;
    backend.script(AgentRole::Validator, APPROVAL).await;

    let (pipeline, _store) = test_pipeline(backend.clone());
    let task = TaskState::new("Write typed add", 3);
    let (task, error, _units) = run_collect(&pipeline, task).await;

    assert!(error.is_none());
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.iteration, 2);
    assert_eq!(backend.count(AgentRole::Validator).await, 2);
    assert_eq!(backend.count(AgentRole::Coder).await, 10);

    // The reviewer turn reaches the second round's coder prompts.
    let coder_prompts = backend.prompts_for(AgentRole::Coder).await;
    assert!(!coder_prompts[0].contains("missing type hints"));
    assert!(coder_prompts[9].contains("missing type hints"));
}

#[tokio::test]
async fn test_max_iterations_exceeded_keeps_last_candidate() {
    let backend = ScriptedBackend::new();
    for _ in 0..3 {
        backend.script(AgentRole::Validator, REJECTION).await;
    }

    let (pipeline, store) = test_pipeline(backend.clone());
    let task = TaskState::new("Never good enough", 3);
    let (task, error, units) = run_collect(&pipeline, task).await;

    assert!(error.is_none());
    assert_eq!(task.status, TaskStatus::MaxIterationsExceeded);
    assert_eq!(task.iteration, task.max_iterations);
    assert_eq!(backend.count(AgentRole::Validator).await, 3);
    // Last candidate is still persisted for inspection.
    assert!(task.code.is_some());
    let persisted = load_task(store.as_ref(), &task.task_id).await.unwrap().unwrap();
    assert_eq!(persisted.status, TaskStatus::MaxIterationsExceeded);
    assert!(persisted.code.is_some());

    assert!(units.last().unwrap().contains("max_iterations_exceeded"));
}

#[tokio::test]
async fn test_candidate_exhaustion_consumes_iterations() {
    let backend = ScriptedBackend::new();
    for _ in 0..15 {
        backend
            .script_err(AgentRole::Coder, OrchestratorError::AgentTimeout("coder".into()))
            .await;
    }

    let (pipeline, _store) = test_pipeline(backend.clone());
    let task = TaskState::new("Unbuildable", 3);
    let (task, error, _units) = run_collect(&pipeline, task).await;

    assert!(error.is_none());
    assert_eq!(task.status, TaskStatus::MaxIterationsExceeded);
    assert_eq!(task.iteration, 3);
    assert!(task.code.is_none());
    assert_eq!(backend.count(AgentRole::Validator).await, 0);
}

#[tokio::test]
async fn test_resume_from_reviewing_converges() {
    let backend = ScriptedBackend::new();
    backend.script(AgentRole::Validator, APPROVAL).await;

    let (pipeline, store) = test_pipeline(backend.clone());

    // A run that was killed mid-review: last durable stage is Reviewing,
    // with the round's winner already persisted.
    let mut task = TaskState::new("Write add", 3);
    task.preprocessed = Some("Write add(a, b)".into());
    task.intent = Some(Intent::SimpleCode);
    task.plan = Some("1. define add".into());
    task.code = Some("def add(a, b):\n    return a + b".into());
    task.iteration = 1;
    task.set_status(TaskStatus::Reviewing);
    save_task(store.as_ref(), &task, std::time::Duration::from_secs(60))
        .await
        .unwrap();

    let resumed = pipeline.resume(&task.task_id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Reviewing);

    let (finished, error, _units) = run_collect(&pipeline, resumed).await;
    assert!(error.is_none());
    assert_eq!(finished.status, TaskStatus::Complete);
    assert_eq!(finished.iteration, 1);
    assert_eq!(finished.code, task.code);

    // The reviewer stage re-ran from its last persisted input; earlier
    // stages did not.
    assert_eq!(backend.count(AgentRole::Validator).await, 1);
    assert_eq!(backend.count(AgentRole::Preprocessor).await, 0);
    assert_eq!(backend.count(AgentRole::Coder).await, 0);
}

#[tokio::test]
async fn test_resume_from_voting_does_not_recharge_iteration() {
    let backend = ScriptedBackend::new();
    backend.script(AgentRole::Validator, APPROVAL).await;

    let (pipeline, store) = test_pipeline(backend.clone());

    // A run that crashed between the voting transition and the verdict:
    // iteration 1 was already charged when the round began.
    let mut task = TaskState::new("Write add", 3);
    task.preprocessed = Some("Write add(a, b)".into());
    task.intent = Some(Intent::SimpleCode);
    task.plan = Some("1. define add".into());
    task.iteration = 1;
    task.set_status(TaskStatus::Voting);
    save_task(store.as_ref(), &task, std::time::Duration::from_secs(60))
        .await
        .unwrap();

    let resumed = pipeline.resume(&task.task_id).await.unwrap();
    let (finished, error, _units) = run_collect(&pipeline, resumed).await;

    assert!(error.is_none());
    assert_eq!(finished.status, TaskStatus::Complete);
    // The replayed round does not consume a second iteration.
    assert_eq!(finished.iteration, 1);
    // Candidates are regenerated (they are discarded after each round),
    // earlier stages are not.
    assert_eq!(backend.count(AgentRole::Coder).await, 5);
    assert_eq!(backend.count(AgentRole::Validator).await, 1);
    assert_eq!(backend.count(AgentRole::Preprocessor).await, 0);
    assert_eq!(backend.count(AgentRole::Planner).await, 0);
}

#[tokio::test]
async fn test_resume_from_voting_in_final_round_still_replays() {
    let backend = ScriptedBackend::new();
    backend.script(AgentRole::Validator, APPROVAL).await;

    let (pipeline, store) = test_pipeline(backend.clone());

    // Crashed mid-vote in the last allowed round. The round started
    // legitimately, so the resume replays it instead of declaring the
    // iteration budget exhausted.
    let mut task = TaskState::new("Write add", 3);
    task.preprocessed = Some("Write add(a, b)".into());
    task.intent = Some(Intent::SimpleCode);
    task.plan = Some("1. define add".into());
    task.iteration = 3;
    task.set_status(TaskStatus::Voting);
    save_task(store.as_ref(), &task, std::time::Duration::from_secs(60))
        .await
        .unwrap();

    let resumed = pipeline.resume(&task.task_id).await.unwrap();
    let (finished, error, _units) = run_collect(&pipeline, resumed).await;

    assert!(error.is_none());
    // Converges to the same outcome as an uninterrupted run: approval in
    // round 3, within the budget.
    assert_eq!(finished.status, TaskStatus::Complete);
    assert_eq!(finished.iteration, 3);
    assert_eq!(backend.count(AgentRole::Validator).await, 1);
}

#[tokio::test]
async fn test_resume_terminal_task_is_noop() {
    let backend = ScriptedBackend::new();
    let (pipeline, store) = test_pipeline(backend.clone());

    let mut task = TaskState::new("done already", 3);
    task.code = Some("def done(): pass  # final".into());
    task.set_status(TaskStatus::Complete);
    save_task(store.as_ref(), &task, std::time::Duration::from_secs(60))
        .await
        .unwrap();

    let resumed = pipeline.resume(&task.task_id).await.unwrap();
    assert!(resumed.status.is_terminal());
    assert_eq!(resumed.code, task.code);
    assert_eq!(backend.count(AgentRole::Validator).await, 0);

    let missing = pipeline.resume("no-such-task").await.unwrap_err();
    assert!(matches!(missing, OrchestratorError::TaskNotFound(_)));
}

#[tokio::test]
async fn test_validator_unavailable_falls_back_to_reflection() {
    let backend = ScriptedBackend::new();
    backend
        .script_err(
            AgentRole::Validator,
            OrchestratorError::AgentUnavailable("validator: connection refused".into()),
        )
        .await;
    // Planner is called once for the plan, then once for reflection.
    backend.script(AgentRole::Planner, "1. implement it").await;
    backend.script(AgentRole::Planner, APPROVAL).await;

    let (pipeline, _store) = test_pipeline(backend.clone());
    let task = TaskState::new("Write something", 3);
    let (task, error, _units) = run_collect(&pipeline, task).await;

    assert!(error.is_none());
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(backend.count(AgentRole::Validator).await, 1);
    assert_eq!(backend.count(AgentRole::Planner).await, 2);
}

#[tokio::test]
async fn test_client_disconnect_leaves_task_resumable() {
    let backend = ScriptedBackend::new();
    let (pipeline, store) = test_pipeline(backend.clone());

    let task = TaskState::new("long running", 3);
    let task_id = task.task_id.clone();
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    drop(rx); // Client went away before the first chunk.

    let (task, error) = pipeline.run(task, tx).await;
    assert!(error.is_none());
    assert!(!task.status.is_terminal());

    // The last durable state is replayable.
    let persisted = load_task(store.as_ref(), &task_id).await.unwrap().unwrap();
    assert!(!persisted.status.is_terminal());
}

#[tokio::test]
async fn test_locked_task_is_rejected() {
    let backend = ScriptedBackend::new();
    let (pipeline, store) = test_pipeline(backend.clone());

    let task = TaskState::new("contended", 3);
    acquire_lease(store.as_ref(), &task.task_id).await.unwrap();

    let (task, error, units) = run_collect(&pipeline, task).await;
    assert!(matches!(error, Some(OrchestratorError::TaskLocked(_))));
    assert_eq!(task.status, TaskStatus::Created);
    assert!(units.iter().any(|u| u.contains("task_locked")));
}

#[tokio::test]
async fn test_reasoning_chain_records_pipeline_order() {
    let backend = ScriptedBackend::new();
    backend.script(AgentRole::Validator, APPROVAL).await;

    let (pipeline, _store) = test_pipeline(backend.clone());
    let task = TaskState::new("Write add", 3);
    let (task, _error, _units) = run_collect(&pipeline, task).await;

    let nodes = pipeline.melodic().chain(&task.task_id).await.unwrap();
    let agents: Vec<AgentRole> = nodes.iter().map(|n| n.agent).collect();
    assert_eq!(
        agents,
        vec![
            AgentRole::Preprocessor,
            AgentRole::Planner,
            AgentRole::Coder,
            AgentRole::Voter,
            AgentRole::Validator,
        ]
    );
    // Linear chain: each node points at its predecessor.
    for pair in nodes.windows(2) {
        assert_eq!(pair[1].prev_id.as_ref(), Some(&pair[0].node_id));
    }
}
