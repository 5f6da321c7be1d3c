//! Ordered per-job middleware. The first registered middleware is the
//! outermost wrapper around the worker call.

use crate::worker::JobContext;
use crate::worker::WorkError;
use crate::worker::registry::ErasedWorker;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait JobMiddleware: Send + Sync + 'static {
    async fn handle(
        &self,
        job: &JobContext,
        args: &serde_json::Value,
        next: Next<'_>,
    ) -> Result<(), WorkError>;
}

/// Continuation into the rest of the chain and, ultimately, the worker.
pub struct Next<'a> {
    chain: &'a [Arc<dyn JobMiddleware>],
    worker: &'a ErasedWorker,
}

impl<'a> Next<'a> {
    pub async fn run(self, job: &JobContext, args: &serde_json::Value) -> Result<(), WorkError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    job,
                    args,
                    Next {
                        chain: rest,
                        worker: self.worker,
                    },
                )
                .await
            }
            None => self.worker.call(job.clone(), args.clone()).await,
        }
    }
}

pub(crate) async fn run_chain(
    chain: &[Arc<dyn JobMiddleware>],
    worker: &ErasedWorker,
    job: &JobContext,
    args: &serde_json::Value,
) -> Result<(), WorkError> {
    Next { chain, worker }.run(job, args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::registry::WorkerRegistry;
    use crate::worker::{EnqueueConfig, Worker};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct NoArgs {}

    struct TraceWorker {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Worker for TraceWorker {
        type Args = NoArgs;

        fn kind() -> String {
            "test:trace".to_owned()
        }

        fn enqueue_config() -> EnqueueConfig {
            EnqueueConfig::builder().queue("test").build()
        }

        fn timeout(&self, _args: &Self::Args) -> Duration {
            Duration::from_secs(1)
        }

        async fn handle(&self, _job: &JobContext, _args: Self::Args) -> Result<(), WorkError> {
            self.log.lock().push("worker".to_owned());
            Ok(())
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobMiddleware for Recorder {
        async fn handle(
            &self,
            job: &JobContext,
            args: &serde_json::Value,
            next: Next<'_>,
        ) -> Result<(), WorkError> {
            self.log.lock().push(format!("{}:before", self.name));
            let result = next.run(job, args).await;
            self.log.lock().push(format!("{}:after", self.name));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl JobMiddleware for ShortCircuit {
        async fn handle(
            &self,
            _job: &JobContext,
            _args: &serde_json::Value,
            _next: Next<'_>,
        ) -> Result<(), WorkError> {
            Err(WorkError::snooze(Duration::from_secs(30)))
        }
    }

    fn job_context() -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            kind: "test:trace".to_owned(),
            queue: "test".to_owned(),
            attempt: 1,
            max_attempts: 3,
            args_bytes: 2,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn chain_runs_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = WorkerRegistry::new();
        registry.register(TraceWorker { log: log.clone() }).unwrap();
        let worker = registry.get("test:trace").unwrap();

        let chain: Vec<Arc<dyn JobMiddleware>> = vec![
            Arc::new(Recorder {
                name: "outer",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                name: "inner",
                log: log.clone(),
            }),
        ];

        run_chain(&chain, worker, &job_context(), &serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "outer:before",
                "inner:before",
                "worker",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[tokio::test]
    async fn middleware_can_short_circuit_without_reaching_the_worker() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = WorkerRegistry::new();
        registry.register(TraceWorker { log: log.clone() }).unwrap();
        let worker = registry.get("test:trace").unwrap();

        let chain: Vec<Arc<dyn JobMiddleware>> = vec![Arc::new(ShortCircuit)];
        let result = run_chain(&chain, worker, &job_context(), &serde_json::json!({})).await;

        assert!(matches!(result, Err(WorkError::Snooze(_))));
        assert!(log.lock().is_empty());
    }
}
