use std::time::Duration;

use tokio::{runtime::Handle, task::JoinHandle};

use homelink_common::{trigger_envelope, CountdownTimer, Mailbox, TimerError};

use crate::mailbox::TaskMailbox;

/// Countdown backed by a sleeping tokio task. Safe to drive from a blocking
/// thread because it only needs a runtime handle.
pub struct TokioCountdown {
    handle: Handle,
    mailbox: TaskMailbox,
    task: Option<JoinHandle<()>>,
}

impl TokioCountdown {
    pub fn new(handle: Handle, mailbox: TaskMailbox) -> Self {
        Self {
            handle,
            mailbox,
            task: None,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl CountdownTimer for TokioCountdown {
    fn start(&mut self, seconds: u32) -> Result<(), TimerError> {
        self.stop()?;
        let mailbox = self.mailbox.clone();
        self.task = Some(self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(seconds))).await;
            let _ = mailbox.try_deliver(trigger_envelope());
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TimerError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for TokioCountdown {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use homelink_common::{Operation, TaskId};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_posts_the_trigger() {
        let (mailbox, mut rx) = TaskMailbox::channel(1);
        let mut timer = TokioCountdown::new(Handle::current(), mailbox);

        timer.start(30).unwrap();
        assert!(timer.is_running());

        let trigger = rx.recv().await.unwrap();
        assert_eq!(trigger.from, TaskId::Alarm.raw());
        assert_eq!(trigger.op(), Operation::Response);
        assert_eq!(trigger.command_id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_running_countdown() {
        let (mailbox, mut rx) = TaskMailbox::channel(2);
        let mut timer = TokioCountdown::new(Handle::current(), mailbox);

        timer.start(10).unwrap();
        timer.start(100).unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(51)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels() {
        let (mailbox, mut rx) = TaskMailbox::channel(1);
        let mut timer = TokioCountdown::new(Handle::current(), mailbox);

        timer.start(5).unwrap();
        timer.stop().unwrap();
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
