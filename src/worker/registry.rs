//! Type-erased worker registration. The erased call path decodes args,
//! applies the per-job timeout, and contains panics, so the processor and the
//! middleware chain only ever see a `Result<(), WorkError>`.

use crate::error::worker::RegistryError;
use crate::worker::{JobContext, WorkError, Worker};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Duration;

type Handler =
    Box<dyn Fn(JobContext, serde_json::Value) -> BoxFuture<'static, Result<(), WorkError>> + Send + Sync>;

pub(crate) struct ErasedWorker {
    kind: String,
    handler: Handler,
    timeout_hint: Box<dyn Fn(&serde_json::Value) -> Option<Duration> + Send + Sync>,
}

impl ErasedWorker {
    fn new<W: Worker>(worker: W) -> Self {
        let worker = Arc::new(worker);
        let kind = W::kind();

        let handler_worker = worker.clone();
        let handler: Handler = Box::new(move |job: JobContext, args: serde_json::Value| {
            let worker = handler_worker.clone();
            async move {
                let args: W::Args = match serde_json::from_value(args) {
                    Ok(args) => args,
                    // Malformed args can never succeed; terminal.
                    Err(err) => {
                        return Err(WorkError::cancel(anyhow::anyhow!(
                            "invalid args for kind `{}`: {err}",
                            job.kind
                        )));
                    }
                };

                let timeout = worker.timeout(&args);
                let work = std::panic::AssertUnwindSafe(worker.handle(&job, args)).catch_unwind();
                match tokio::time::timeout(timeout, work).await {
                    Err(_) => Err(WorkError::Timeout(timeout)),
                    Ok(Err(panic)) => Err(WorkError::Panic(panic_message(panic.as_ref()))),
                    Ok(Ok(result)) => result,
                }
            }
            .boxed()
        });

        let timeout_worker = worker.clone();
        let timeout_hint = Box::new(move |args: &serde_json::Value| {
            serde_json::from_value::<W::Args>(args.clone())
                .ok()
                .map(|args| timeout_worker.timeout(&args))
        });

        Self {
            kind,
            handler,
            timeout_hint,
        }
    }

    pub(crate) fn call(
        &self,
        job: JobContext,
        args: serde_json::Value,
    ) -> BoxFuture<'static, Result<(), WorkError>> {
        (self.handler)(job, args)
    }

    /// The worker's timeout for this payload; used to size the queue lease.
    pub(crate) fn timeout_hint(&self, args: &serde_json::Value) -> Option<Duration> {
        (self.timeout_hint)(args)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, Arc<ErasedWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Worker>(&mut self, worker: W) -> Result<(), RegistryError> {
        let erased = ErasedWorker::new(worker);
        match self.workers.entry(erased.kind.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(erased));
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, kind: &str) -> Option<&Arc<ErasedWorker>> {
        self.workers.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::EnqueueConfig;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct EchoArgs {
        mode: String,
    }

    struct EchoWorker;

    #[async_trait]
    impl Worker for EchoWorker {
        type Args = EchoArgs;

        fn kind() -> String {
            "test:echo".to_owned()
        }

        fn enqueue_config() -> EnqueueConfig {
            EnqueueConfig::builder().queue("test").build()
        }

        fn timeout(&self, _args: &Self::Args) -> Duration {
            Duration::from_millis(50)
        }

        async fn handle(&self, _job: &JobContext, args: Self::Args) -> Result<(), WorkError> {
            match args.mode.as_str() {
                "ok" => Ok(()),
                "panic" => panic!("boom"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                other => Err(WorkError::retryable(anyhow::anyhow!("bad mode {other}"))),
            }
        }
    }

    fn job_context() -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            kind: "test:echo".to_owned(),
            queue: "test".to_owned(),
            attempt: 1,
            max_attempts: 3,
            args_bytes: 16,
            cancellation: CancellationToken::new(),
        }
    }

    fn erased() -> ErasedWorker {
        ErasedWorker::new(EchoWorker)
    }

    #[tokio::test]
    async fn dispatches_success() {
        let result = erased()
            .call(job_context(), serde_json::json!({"mode": "ok"}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_args_cancel_the_job() {
        let result = erased()
            .call(job_context(), serde_json::json!({"unexpected": true}))
            .await;
        assert!(matches!(result, Err(WorkError::Cancel(_))));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let result = erased()
            .call(job_context(), serde_json::json!({"mode": "panic"}))
            .await;
        let Err(WorkError::Panic(message)) = result else {
            panic!("expected a contained panic");
        };
        assert!(message.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let result = erased()
            .call(job_context(), serde_json::json!({"mode": "slow"}))
            .await;
        assert!(matches!(result, Err(WorkError::Timeout(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = WorkerRegistry::new();
        registry.register(EchoWorker).unwrap();
        let err = registry.register(EchoWorker).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(kind) if kind == "test:echo"));
    }

    #[test]
    fn timeout_hint_decodes_args() {
        let worker = erased();
        assert_eq!(
            worker.timeout_hint(&serde_json::json!({"mode": "ok"})),
            Some(Duration::from_millis(50))
        );
        assert_eq!(worker.timeout_hint(&serde_json::json!(42)), None);
    }
}
