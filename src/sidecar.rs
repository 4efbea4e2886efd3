//! After-response side-effect queue.
//!
//! Sender categorization and attachment filing run after the primary event
//! outcome is decided, through an explicit bounded queue to a worker loop
//! rather than untracked spawns, so failures stay observable. Task failures
//! are best-effort: logged, never propagated, never retried here.

use crate::provider::AttachmentRef;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A deferred side effect of event processing.
#[derive(Debug, Clone)]
pub enum SidecarTask {
    CategorizeSender {
        account_id: String,
        sender: String,
    },
    FileAttachments {
        account_id: String,
        message_id: String,
        attachments: Vec<AttachmentRef>,
    },
}

impl SidecarTask {
    fn name(&self) -> &'static str {
        match self {
            Self::CategorizeSender { .. } => "categorize_sender",
            Self::FileAttachments { .. } => "file_attachments",
        }
    }
}

/// External services the sidecar worker hands tasks to.
#[async_trait]
pub trait SidecarHandler: Send + Sync {
    async fn categorize_sender(&self, account_id: &str, sender: &str) -> anyhow::Result<()>;

    async fn file_attachments(
        &self,
        account_id: &str,
        message_id: &str,
        attachments: &[AttachmentRef],
    ) -> anyhow::Result<()>;
}

/// Handle used by the router to enqueue deferred tasks.
#[derive(Clone)]
pub struct SidecarQueue {
    tx: mpsc::Sender<SidecarTask>,
}

impl SidecarQueue {
    /// Spawn the worker loop and return the queue handle plus the worker's
    /// join handle. The loop ends once every queue handle is dropped.
    pub fn spawn(handler: Arc<dyn SidecarHandler>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SidecarTask>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let task_name = task.name();
                let result = match &task {
                    SidecarTask::CategorizeSender { account_id, sender } => {
                        handler.categorize_sender(account_id, sender).await
                    }
                    SidecarTask::FileAttachments {
                        account_id,
                        message_id,
                        attachments,
                    } => {
                        handler
                            .file_attachments(account_id, message_id, attachments)
                            .await
                    }
                };

                if let Err(error) = result {
                    tracing::warn!(task = task_name, %error, "sidecar task failed");
                }
            }

            tracing::info!("sidecar worker stopped");
        });

        (Self { tx }, worker)
    }

    /// Enqueue a task. A full or closed queue is logged, never an error for
    /// the caller: sidecar work must not fail the primary event.
    pub async fn enqueue(&self, task: SidecarTask) {
        let task_name = task.name();
        if self.tx.send(task).await.is_err() {
            tracing::warn!(task = task_name, "sidecar queue closed, task dropped");
        }
    }
}

/// Handler that posts tasks to the external collaborator service.
pub struct HttpSidecarHandler {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSidecarHandler {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/{path}", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SidecarHandler for HttpSidecarHandler {
    async fn categorize_sender(&self, account_id: &str, sender: &str) -> anyhow::Result<()> {
        self.post(
            "categorize-sender",
            serde_json::json!({ "account_id": account_id, "sender": sender }),
        )
        .await
    }

    async fn file_attachments(
        &self,
        account_id: &str,
        message_id: &str,
        attachments: &[AttachmentRef],
    ) -> anyhow::Result<()> {
        self.post(
            "file-attachments",
            serde_json::json!({
                "account_id": account_id,
                "message_id": message_id,
                "attachments": attachments,
            }),
        )
        .await
    }
}

/// No-op handler for deployments without the collaborator service.
pub struct NoopSidecarHandler;

#[async_trait]
impl SidecarHandler for NoopSidecarHandler {
    async fn categorize_sender(&self, _account_id: &str, _sender: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn file_attachments(
        &self,
        _account_id: &str,
        _message_id: &str,
        _attachments: &[AttachmentRef],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl SidecarHandler for RecordingHandler {
        async fn categorize_sender(&self, _account_id: &str, sender: &str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("categorize:{sender}"));
            if self.fail {
                anyhow::bail!("categorization service down");
            }
            Ok(())
        }

        async fn file_attachments(
            &self,
            _account_id: &str,
            message_id: &str,
            _attachments: &[AttachmentRef],
        ) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("file:{message_id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn tasks_run_in_order_and_failures_do_not_stop_the_worker() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let (queue, worker) = SidecarQueue::spawn(handler.clone(), 8);

        queue
            .enqueue(SidecarTask::CategorizeSender {
                account_id: "acct".into(),
                sender: "promo@shop.com".into(),
            })
            .await;
        queue
            .enqueue(SidecarTask::FileAttachments {
                account_id: "acct".into(),
                message_id: "m1".into(),
                attachments: Vec::new(),
            })
            .await;

        drop(queue);
        worker.await.unwrap();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(*seen, vec!["categorize:promo@shop.com", "file:m1"]);
    }
}
