//! End-to-end tests: submit through the service, execute through a
//! scheduler, and await the outcome, all against a temp storage root.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use offload::config::{StoreConfig, WorkerConfig};
use offload::error::{ExecutionError, JobError};
use offload::jobs::{JobQueue, JobState};
use offload::store::{ConversationStore, Layout, Message, Role};
use offload::tools::builtin::{EchoExecutor, ShellExecutor};
use offload::tools::{ExecutionContext, Executor, ExecutorRegistry};
use offload::worker::{Scheduler, WorkerDeps};
use offload::{JobRequest, JobService};

/// Maximum time any await is allowed before we consider the test hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(10);

/// Fails every call with a fixed code.
struct AlwaysFails {
    calls: AtomicU32,
}

#[async_trait]
impl Executor for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }
    async fn execute(
        &self,
        _params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<String, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ExecutionError::new(
            "UPSTREAM_DOWN",
            format!("attempt {} could not reach upstream", ctx.attempt),
        ))
    }
}

struct Env {
    service: JobService,
    scheduler: Arc<Scheduler>,
    failing: Arc<AlwaysFails>,
    _dir: TempDir,
}

async fn env(max_concurrent_jobs: usize) -> Env {
    let dir = TempDir::new().unwrap();
    let service = JobService::new(&StoreConfig::new(dir.path()));

    let failing = Arc::new(AlwaysFails {
        calls: AtomicU32::new(0),
    });
    let executors = Arc::new(ExecutorRegistry::new());
    executors.register(Arc::new(EchoExecutor::new())).await;
    executors.register(Arc::new(ShellExecutor::new())).await;
    executors
        .register(Arc::clone(&failing) as Arc<dyn Executor>)
        .await;

    let layout = Layout::new(dir.path());
    let scheduler = Scheduler::new(WorkerDeps {
        queue: JobQueue::new(layout.clone()),
        conversations: ConversationStore::new(layout),
        executors,
        config: WorkerConfig {
            poll_interval: POLL,
            max_concurrent_jobs,
            retry_backoff_base: Duration::ZERO,
            ..WorkerConfig::default()
        },
    });

    Env {
        service,
        scheduler,
        failing,
        _dir: dir,
    }
}

#[tokio::test]
async fn submitted_jobs_complete_and_reply() {
    let env = env(3).await;
    let mut ids = Vec::new();
    for text in ["alpha", "beta", "gamma"] {
        let id = env
            .service
            .submit(
                JobRequest::new("echo", serde_json::json!({ "text": text }))
                    .with_messages(vec![Message::system("be brief"), Message::user(text)]),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    env.scheduler.start().await.unwrap();
    let statuses = env
        .service
        .await_all(&ids, POLL, Some(TEST_TIMEOUT))
        .await
        .unwrap();
    env.scheduler.stop().await;
    env.scheduler.wait_idle().await;

    for (status, text) in statuses.iter().zip(["alpha", "beta", "gamma"]) {
        assert_eq!(status.state(), JobState::Completed);
        assert!(status.error_history.is_empty());

        let conversation = env
            .service
            .load_conversation(status.conversation_id.as_str())
            .await
            .unwrap();
        let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(conversation.last_message().unwrap().content, text);
        assert!(env.service.queue().get_job(&status.conversation_id).await.unwrap().is_none());
    }
    assert!(env.service.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_keep_full_error_history() {
    let env = env(1).await;
    let id = env
        .service
        .submit(JobRequest::new("always_fails", serde_json::json!({})).with_max_attempts(2))
        .await
        .unwrap();

    env.scheduler.start().await.unwrap();
    let statuses = env
        .service
        .await_all(std::slice::from_ref(&id), POLL, Some(TEST_TIMEOUT))
        .await
        .unwrap();
    env.scheduler.stop().await;
    env.scheduler.wait_idle().await;

    let status = &statuses[0];
    assert_eq!(status.state(), JobState::Failed);
    assert_eq!(status.attempts, 2);
    assert_eq!(status.error_history.len(), 3);
    assert!(status.error_history.iter().all(|e| e.code == "UPSTREAM_DOWN"));
    assert_eq!(
        status.error().unwrap().message,
        "attempt 2 could not reach upstream"
    );
    assert_eq!(env.failing.calls.load(Ordering::SeqCst), 3);
    assert!(env.service.queue().get_job(&id).await.unwrap().is_none());

    // Transcript untouched by failed attempts.
    let conversation = env.service.load_conversation(id.as_str()).await.unwrap();
    assert_eq!(conversation.message_count(), 0);
}

#[tokio::test]
async fn unregistered_tool_fails_immediately() {
    let env = env(1).await;
    let id = env
        .service
        .submit(JobRequest::new("translate", serde_json::json!({})).with_max_attempts(5))
        .await
        .unwrap();

    env.scheduler.start().await.unwrap();
    let statuses = env
        .service
        .await_all(std::slice::from_ref(&id), POLL, Some(TEST_TIMEOUT))
        .await
        .unwrap();
    env.scheduler.stop().await;

    assert_eq!(statuses[0].state(), JobState::Failed);
    assert_eq!(statuses[0].error().unwrap().code, "UNKNOWN_TOOL");
    assert_eq!(statuses[0].error_history.len(), 1);
}

#[tokio::test]
async fn higher_priority_is_dequeued_first() {
    let env = env(1).await;
    let low = env
        .service
        .submit(JobRequest::new("echo", serde_json::json!({"text": "a"})))
        .await
        .unwrap();
    let high = env
        .service
        .submit(JobRequest::new("echo", serde_json::json!({"text": "b"})).with_priority(5))
        .await
        .unwrap();

    let first = env.service.dequeue().await.unwrap().unwrap();
    assert_eq!(first.conversation_id, high);
    let second = env.service.dequeue().await.unwrap().unwrap();
    assert_eq!(second.conversation_id, low);
    assert!(env.service.dequeue().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_schedulers_run_each_job_once() {
    let dir = TempDir::new().unwrap();
    let service = JobService::new(&StoreConfig::new(dir.path()));
    let mut ids = Vec::new();
    for n in 0..6 {
        let id = service
            .submit(JobRequest::new(
                "echo",
                serde_json::json!({ "text": format!("job {n}") }),
            ))
            .await
            .unwrap();
        ids.push(id);
    }

    let mut schedulers = Vec::new();
    for _ in 0..3 {
        let executors = Arc::new(ExecutorRegistry::new());
        executors.register(Arc::new(EchoExecutor::new())).await;
        let layout = Layout::new(dir.path());
        let scheduler = Scheduler::new(WorkerDeps {
            queue: JobQueue::new(layout.clone()),
            conversations: ConversationStore::new(layout),
            executors,
            config: WorkerConfig {
                poll_interval: Duration::from_millis(5),
                ..WorkerConfig::default()
            },
        });
        scheduler.start().await.unwrap();
        schedulers.push(scheduler);
    }

    let statuses = service
        .await_all(&ids, POLL, Some(TEST_TIMEOUT))
        .await
        .unwrap();
    for scheduler in &schedulers {
        scheduler.stop().await;
        scheduler.wait_idle().await;
    }

    for status in statuses {
        assert_eq!(status.state(), JobState::Completed);
        let conversation = service
            .load_conversation(status.conversation_id.as_str())
            .await
            .unwrap();
        // Exactly one reply: no job ran twice.
        assert_eq!(conversation.message_count(), 1);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn shell_job_output_lands_in_transcript() {
    let env = env(1).await;
    let id = env
        .service
        .submit(JobRequest::new(
            "shell",
            serde_json::json!({"command": "printf 'built ok'"}),
        ))
        .await
        .unwrap();

    env.scheduler.start().await.unwrap();
    env.service
        .await_all(std::slice::from_ref(&id), POLL, Some(TEST_TIMEOUT))
        .await
        .unwrap();
    env.scheduler.stop().await;

    let conversation = env.service.load_conversation(id.as_str()).await.unwrap();
    assert!(conversation.last_message().unwrap().content.contains("built ok"));
}

#[tokio::test]
async fn cancelled_job_is_never_run() {
    let env = env(1).await;
    let id = env
        .service
        .submit(JobRequest::new("always_fails", serde_json::json!({})))
        .await
        .unwrap();
    env.service.cancel(id.as_str()).await.unwrap();

    env.scheduler.start().await.unwrap();
    let statuses = env
        .service
        .await_all(std::slice::from_ref(&id), POLL, Some(TEST_TIMEOUT))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.scheduler.stop().await;

    assert_eq!(statuses[0].state(), JobState::Cancelled);
    assert_eq!(env.failing.calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        env.service.cancel(id.as_str()).await.unwrap_err(),
        JobError::NotCancellable { .. }
    ));
}
