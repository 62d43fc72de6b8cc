use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

/// Named fan-out of tasks that all return `T`.
///
/// ## Usage
/// ```ignore
/// let mut supervisor = TaskSupervisor::new();
/// supervisor.spawn("coingecko", async move { run_source().await });
///
/// for (name, result) in supervisor.join_all().await {
///     // `result` is Err only if the task panicked or was aborted
/// }
/// ```
pub struct TaskSupervisor<T> {
    tasks: Vec<(String, JoinHandle<T>)>,
}

impl<T: Send + 'static> TaskSupervisor<T> {
    pub fn new() -> Self {
        TaskSupervisor { tasks: Vec::new() }
    }

    /// Spawn a task and register it under `name`
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> &mut Self
    where
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(future);

        info!(task = %name, "Spawned task");
        self.tasks.push((name, handle));
        self
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.iter().filter(|(_, handle)| !handle.is_finished()).count()
    }

    /// Waits for every task, in spawn order. A panicking task does not stop
    /// the others from being awaited.
    pub async fn join_all(&mut self) -> Vec<(String, Result<T, JoinError>)> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for (name, handle) in self.tasks.drain(..) {
            let result = handle.await;
            if let Err(e) = &result {
                error!(task = %name, error = %e, "Task terminated abnormally");
            }
            results.push((name, result));
        }
        results
    }

    pub fn shutdown_all(&mut self) {
        info!("Aborting {} tasks", self.tasks.len());

        for (name, handle) in self.tasks.drain(..) {
            handle.abort();
            info!(task = %name, "Aborted task");
        }
    }
}

impl<T: Send + 'static> Default for TaskSupervisor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort text of a panic payload carried by a `JoinError`.
pub fn join_error_reason(e: JoinError) -> String {
    if e.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicking_task_does_not_hide_the_others() {
        let mut supervisor = TaskSupervisor::new();
        supervisor.spawn("ok", async { 1 });
        supervisor.spawn("boom", async { panic!("exploded") });
        supervisor.spawn("also_ok", async { 3 });

        let results = supervisor.join_all().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].1.as_ref().ok(), Some(&1));
        assert_eq!(results[2].1.as_ref().ok(), Some(&3));

        let (name, result) = results.into_iter().nth(1).unwrap();
        assert_eq!(name, "boom");
        assert!(join_error_reason(result.unwrap_err()).contains("exploded"));
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_tasks() {
        let mut supervisor: TaskSupervisor<()> = TaskSupervisor::new();
        supervisor.spawn("sleeper", tokio::time::sleep(std::time::Duration::from_secs(60)));
        supervisor.shutdown_all();
        assert_eq!(supervisor.active_task_count(), 0);
        assert!(supervisor.join_all().await.is_empty());
    }
}
