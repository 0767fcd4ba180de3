use tokio::sync::oneshot;

#[derive(Debug)]
pub enum SchedulerMessage {
    /// Run a cycle now, then resume the regular schedule from there.
    RunNow,
    /// Stop firing cycles. Acknowledged once any in-flight cycle has finished.
    Shutdown(oneshot::Sender<()>),
}
