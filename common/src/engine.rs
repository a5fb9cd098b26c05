//! Alarm engine: owns the alarm store and the countdown timer, and serves the
//! alarm command set from its mailbox.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset};
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    address::Mailbox,
    alarm::{AlarmError, AlarmRecord, AlarmStore},
    envelope::{Envelope, Header, Operation, BODY_SIZE},
    router::{RouteError, Router},
    store::BlobStore,
    sun::SunTimes,
    task::TaskId,
};

pub const CMD_TRIGGER: u8 = 0;
pub const CMD_INSERT: u8 = 1;
pub const CMD_REMOVE: u8 = 2;
pub const CMD_LIST: u8 = 3;
pub const CMD_INSPECT: u8 = 4;

const LIST_ENTRY_SIZE: usize = 5;
pub const LIST_MAX_ENTRIES: usize = (BODY_SIZE - 1) / LIST_ENTRY_SIZE;

/// How early a countdown may expire and still count as the selected alarm's firing.
const EARLY_EXPIRY_SECS: i64 = 5;

#[derive(Debug, Error)]
#[error("countdown timer failed: {0}")]
pub struct TimerError(pub String);

/// One-shot countdown that posts the trigger envelope when it expires.
///
/// The expiry path may only call `Mailbox::try_deliver`; no logging, no
/// blocking, and a failed delivery is dropped.
pub trait CountdownTimer {
    /// Resets and starts counting toward `seconds` from now, replacing any
    /// running countdown.
    fn start(&mut self, seconds: u32) -> Result<(), TimerError>;

    fn stop(&mut self) -> Result<(), TimerError>;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Alarm(#[from] AlarmError),
    #[error(transparent)]
    Timer(#[from] TimerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Disarmed,
    Armed {
        index: usize,
        deadline: DateTime<FixedOffset>,
    },
}

/// Synthetic envelope the timer posts to the engine's own mailbox.
pub fn trigger_envelope() -> Envelope {
    Envelope {
        from: TaskId::Alarm.raw(),
        dest: TaskId::Alarm.raw(),
        header: Header::from_raw(Operation::Response.bits() | CMD_TRIGGER),
        ..Envelope::default()
    }
}

pub struct AlarmEngine<M, S, T> {
    router: Router<M>,
    alarms: AlarmStore<S>,
    timer: T,
    sun: Arc<dyn SunTimes>,
    state: TimerState,
}

impl<M, S, T> AlarmEngine<M, S, T>
where
    M: Mailbox,
    S: BlobStore,
    T: CountdownTimer,
{
    pub fn new(router: Router<M>, alarms: AlarmStore<S>, timer: T, sun: Arc<dyn SunTimes>) -> Self {
        Self {
            router,
            alarms,
            timer,
            sun,
            state: TimerState::Disarmed,
        }
    }

    /// Arms the timer for whatever loaded alarm is due first.
    pub fn init(&mut self, now: DateTime<FixedOffset>) -> Result<(), EngineError> {
        info!("alarm engine starting with {} alarms", self.alarms.len());
        self.rearm(now)
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn alarms(&self) -> &AlarmStore<S> {
        &self.alarms
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Processes one mailbox message. An `Err` is fatal for the engine.
    pub fn handle(
        &mut self,
        command: &Envelope,
        now: DateTime<FixedOffset>,
    ) -> Result<(), EngineError> {
        match (command.op(), command.command_id()) {
            (Operation::Response, CMD_TRIGGER) if command.from == TaskId::Alarm.raw() => {
                self.fire(now)
            }
            (Operation::Set, CMD_INSERT) => {
                self.dispatch_overdue(now);
                self.insert(command)?;
                self.rearm(now)
            }
            (Operation::Set, CMD_REMOVE) => {
                self.dispatch_overdue(now);
                self.remove(command)?;
                self.rearm(now)
            }
            (Operation::Get, CMD_LIST) => {
                self.list(command);
                Ok(())
            }
            (Operation::Get, CMD_INSPECT) => {
                self.inspect(command);
                Ok(())
            }
            (op, id) => {
                debug!("alarm: unknown command {}/{id} from {}", op.as_str(), command.from);
                self.error(command, "invalid command");
                Ok(())
            }
        }
    }

    /// Recomputes the earliest alarm and reprograms the timer.
    pub fn rearm(&mut self, now: DateTime<FixedOffset>) -> Result<(), EngineError> {
        match self.alarms.find_earliest_due(&now, self.sun.as_ref()) {
            Some(due) => {
                self.timer.start(due.seconds)?;
                let deadline = now + Duration::seconds(i64::from(due.seconds));
                info!(
                    "alarm {} armed, fires in {}s at {}",
                    due.index,
                    due.seconds,
                    deadline.format("%a %H:%M:%S")
                );
                self.state = TimerState::Armed {
                    index: due.index,
                    deadline,
                };
            }
            None => {
                self.timer.stop()?;
                if self.state != TimerState::Disarmed {
                    info!("no alarms armed; timer stopped");
                }
                self.state = TimerState::Disarmed;
            }
        }
        Ok(())
    }

    fn fire(&mut self, now: DateTime<FixedOffset>) -> Result<(), EngineError> {
        let TimerState::Armed { index, deadline } = self.state else {
            debug!("alarm timer expiry with nothing selected; rearming");
            return self.rearm(now);
        };

        // An expiry queued behind a mutation belongs to a selection that no longer exists.
        if deadline - now > Duration::seconds(EARLY_EXPIRY_SECS) {
            debug!(
                "stale alarm timer expiry; alarm {index} is not due until {}",
                deadline.format("%a %H:%M:%S")
            );
            return self.rearm(now);
        }

        self.dispatch(index);
        // A timer that expires a little early must not select the same alarm again.
        self.rearm(now.max(deadline))
    }

    /// Dispatches the selected alarm if its deadline has passed but its expiry
    /// has not been processed yet. Runs before the store is mutated, while the
    /// selected index still names the same alarm.
    fn dispatch_overdue(&mut self, now: DateTime<FixedOffset>) {
        if let TimerState::Armed { index, deadline } = self.state {
            if deadline <= now {
                self.dispatch(index);
                self.state = TimerState::Disarmed;
            }
        }
    }

    fn dispatch(&self, index: usize) {
        match self.alarms.get(index) {
            Some(record) => {
                info!("alarm {index} due; dispatching to {}", record.trigger.dest);
                if let Err(err) = self.router.relay(record.trigger.clone(), 0) {
                    warn!("alarm {index} trigger not delivered: {err}");
                }
            }
            None => warn!("selected alarm {index} no longer exists; skipping"),
        }
    }

    fn insert(&mut self, command: &Envelope) -> Result<(), AlarmError> {
        let record = match AlarmRecord::from_insert_body(command) {
            Ok(record) => record,
            Err(AlarmError::InvalidTime(raw)) => {
                debug!("alarm: rejected time {raw:#x}");
                self.error(command, "invalid alarm time");
                return Ok(());
            }
            Err(err) => {
                debug!("alarm: malformed insert: {err}");
                self.error(command, "invalid trigger command");
                return Ok(());
            }
        };
        if let Err(err) = record.validate_trigger() {
            debug!("alarm: {err}");
            self.error(command, "invalid trigger command");
            return Ok(());
        }

        // Indices travel as one byte.
        let Ok(slot) = u8::try_from(self.alarms.len()) else {
            warn!("alarm insert refused: index {} does not fit a reply", self.alarms.len());
            self.error(command, "failed to insert");
            return Ok(());
        };
        match self.alarms.insert(record) {
            Ok(index) => {
                info!("alarm {index} inserted");
                let mut response = Envelope::default();
                response.body[0] = slot;
                self.send(command, response);
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!("alarm insert failed: {err}");
                self.error(command, "failed to insert");
                Ok(())
            }
        }
    }

    fn remove(&mut self, command: &Envelope) -> Result<(), AlarmError> {
        let index = usize::from(command.body[0]);
        match self.alarms.remove(index) {
            Ok(_) => {
                info!("alarm {index} removed");
                self.status(command, Operation::Response, "alarm removed");
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!("alarm remove failed: {err}");
                self.error(command, "failed to remove");
                Ok(())
            }
        }
    }

    fn list(&self, command: &Envelope) {
        let records = self.alarms.records();
        if records.len() > LIST_MAX_ENTRIES {
            warn!(
                "alarm list truncated to {LIST_MAX_ENTRIES} of {} alarms",
                records.len()
            );
        }

        let listed = records.iter().take(LIST_MAX_ENTRIES);
        let Ok(count) = u8::try_from(listed.len()) else {
            self.error(command, "invalid command");
            return;
        };
        let mut response = Envelope::default();
        response.body[0] = count;
        for (slot, record) in listed.enumerate() {
            let offset = 1 + slot * LIST_ENTRY_SIZE;
            response.body[offset..offset + 4].copy_from_slice(&record.time.raw().to_be_bytes());
            response.body[offset + 4] = record.days.bits();
        }
        self.send(command, response);
    }

    fn inspect(&self, command: &Envelope) {
        let index = usize::from(command.body[0]);
        let Some(record) = self.alarms.get(index) else {
            self.error(command, "invalid index");
            return;
        };

        let mut response = Envelope::default();
        response
            .body
            .copy_from_slice(&record.trigger.to_bytes()[..BODY_SIZE]);
        self.send(command, response);
    }

    fn send(&self, command: &Envelope, response: Envelope) {
        let result = self.router.reply(command, response);
        self.log_reply_failure(command, result.err());
    }

    fn status(&self, command: &Envelope, op: Operation, text: &str) {
        let result = self.router.status_reply(command, op, text);
        self.log_reply_failure(command, result.err());
    }

    fn error(&self, command: &Envelope, text: &str) {
        self.status(command, Operation::Error, text);
    }

    fn log_reply_failure(&self, command: &Envelope, err: Option<RouteError>) {
        if let Some(err) = err {
            warn!(
                "alarm reply to {} for command {} failed: {err}",
                command.from,
                command.command_id()
            );
        }
    }
}

/// Builds alarm requests for clients and decodes their replies.
pub mod request {
    use super::{CMD_INSPECT, CMD_LIST, CMD_REMOVE, LIST_ENTRY_SIZE};
    use crate::{
        alarm::{AlarmError, AlarmTime, DayMask},
        envelope::{Envelope, EnvelopeError, Operation},
        task::TaskId,
    };

    pub use crate::alarm::insert_request as insert;

    pub fn remove(index: u8) -> Result<Envelope, EnvelopeError> {
        let mut command = Envelope::request(TaskId::Alarm.raw(), Operation::Set, CMD_REMOVE)?;
        command.write_u8(0, index)?;
        Ok(command)
    }

    pub fn list() -> Result<Envelope, EnvelopeError> {
        Envelope::request(TaskId::Alarm.raw(), Operation::Get, CMD_LIST)
    }

    pub fn inspect(index: u8) -> Result<Envelope, EnvelopeError> {
        let mut command = Envelope::request(TaskId::Alarm.raw(), Operation::Get, CMD_INSPECT)?;
        command.write_u8(0, index)?;
        Ok(command)
    }

    /// Unpacks a LIST response into `(time, days)` pairs in index order.
    pub fn parse_list(reply: &Envelope) -> Result<Vec<(AlarmTime, DayMask)>, AlarmError> {
        let count = usize::from(reply.read_u8(0)?);
        (0..count)
            .map(|slot| {
                let offset = 1 + slot * LIST_ENTRY_SIZE;
                let time = AlarmTime::from_raw(reply.read_u32(offset)?)?;
                let days = DayMask::from_bits(reply.read_u8(offset + 4)?);
                Ok((time, days))
            })
            .collect()
    }
}
