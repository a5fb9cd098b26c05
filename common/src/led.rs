//! RGB LED subsystem. The usual target of alarm triggers.

use log::{info, warn};

use crate::{
    address::Mailbox,
    envelope::{Envelope, EnvelopeError, Operation},
    router::Router,
};

pub const CMD_COLOR: u8 = 1;
pub const CMD_OFF: u8 = 2;
pub const CMD_FADE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Self = Self::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Linear blend; `t` is clamped to `0.0..=1.0`.
    pub fn lerp(self, other: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (f32::from(a) + (f32::from(b) - f32::from(a)) * t).round() as u8;
        Self::new(mix(self.r, other.r), mix(self.g, other.g), mix(self.b, other.b))
    }

    fn read(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        let raw = envelope.read_bytes(0, 3)?;
        Ok(Self::new(raw[0], raw[1], raw[2]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Fade {
    from: Color,
    to: Color,
    started_ms: u64,
    duration_ms: u16,
}

impl Fade {
    fn color_at(&self, now_ms: u64) -> Color {
        if self.duration_ms == 0 {
            return self.to;
        }
        let elapsed = now_ms.saturating_sub(self.started_ms) as f32;
        self.from.lerp(self.to, elapsed / f32::from(self.duration_ms))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedState {
    color: Color,
    on: bool,
    fade: Option<Fade>,
}

impl LedState {
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Color currently shown, following any fade in progress.
    pub fn color_at(&self, now_ms: u64) -> Color {
        if !self.on {
            return Color::BLACK;
        }
        self.fade
            .map_or(self.color, |fade| fade.color_at(now_ms))
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
        self.on = true;
        self.fade = None;
    }

    pub fn off(&mut self) {
        self.on = false;
        self.fade = None;
    }

    pub fn fade_to(&mut self, target: Color, duration_ms: u16, now_ms: u64) {
        let from = self.color_at(now_ms);
        self.fade = Some(Fade {
            from,
            to: target,
            started_ms: now_ms,
            duration_ms,
        });
        self.color = target;
        self.on = true;
    }
}

pub struct LedService<M> {
    router: Router<M>,
    state: LedState,
}

impl<M: Mailbox> LedService<M> {
    pub fn new(router: Router<M>) -> Self {
        Self {
            router,
            state: LedState::default(),
        }
    }

    pub fn state(&self) -> &LedState {
        &self.state
    }

    /// `now_ms` is a monotonic millisecond clock used to track fades.
    pub fn handle(&mut self, command: &Envelope, now_ms: u64) {
        let result = match (command.op(), command.command_id()) {
            (Operation::Set, CMD_COLOR) => Color::read(command).map(|color| {
                info!("led color {},{},{}", color.r, color.g, color.b);
                self.state.set_color(color);
                Envelope::default()
            }),
            (Operation::Set, CMD_OFF) => {
                info!("led off");
                self.state.off();
                Ok(Envelope::default())
            }
            (Operation::Set, CMD_FADE) => Color::read(command)
                .and_then(|color| Ok((color, command.read_u16(3)?)))
                .map(|(color, duration_ms)| {
                    info!(
                        "led fade to {},{},{} over {duration_ms}ms",
                        color.r, color.g, color.b
                    );
                    self.state.fade_to(color, duration_ms, now_ms);
                    Envelope::default()
                }),
            (Operation::Get, CMD_COLOR) => {
                let color = self.state.color_at(now_ms);
                let mut response = Envelope::default();
                response.body[..4].copy_from_slice(&[
                    color.r,
                    color.g,
                    color.b,
                    u8::from(self.state.is_on()),
                ]);
                Ok(response)
            }
            _ => {
                self.reply_status(command, Operation::Error, "invalid command");
                return;
            }
        };

        match result {
            Ok(response) => {
                if let Err(err) = self.router.reply(command, response) {
                    warn!("led reply to {} failed: {err}", command.from);
                }
            }
            Err(err) => {
                warn!("led command rejected: {err}");
                self.reply_status(command, Operation::Error, "invalid command");
            }
        }
    }

    fn reply_status(&self, command: &Envelope, op: Operation, text: &str) {
        if let Err(err) = self.router.status_reply(command, op, text) {
            warn!("led reply to {} failed: {err}", command.from);
        }
    }
}

/// Builds LED requests for clients and alarm triggers.
pub mod request {
    use super::{Color, CMD_COLOR, CMD_FADE, CMD_OFF};
    use crate::{
        envelope::{Envelope, EnvelopeError, Operation},
        task::TaskId,
    };

    pub fn set_color(color: Color) -> Result<Envelope, EnvelopeError> {
        let mut command = Envelope::request(TaskId::Led.raw(), Operation::Set, CMD_COLOR)?;
        command.write_bytes(0, &[color.r, color.g, color.b])?;
        Ok(command)
    }

    pub fn off() -> Result<Envelope, EnvelopeError> {
        Envelope::request(TaskId::Led.raw(), Operation::Set, CMD_OFF)
    }

    pub fn fade(color: Color, duration_ms: u16) -> Result<Envelope, EnvelopeError> {
        let mut command = Envelope::request(TaskId::Led.raw(), Operation::Set, CMD_FADE)?;
        command.write_bytes(0, &[color.r, color.g, color.b])?;
        command.write_u16(3, duration_ms)?;
        Ok(command)
    }

    pub fn get_color() -> Result<Envelope, EnvelopeError> {
        Envelope::request(TaskId::Led.raw(), Operation::Get, CMD_COLOR)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{address::AddressTable, task::TaskId};

    fn service() -> (LedService<SyncSender<Envelope>>, Receiver<Envelope>, Receiver<Envelope>) {
        let mut table = AddressTable::with_capacity(3).unwrap();
        let (tcp_tx, tcp) = sync_channel(4);
        let (alarm_tx, alarm) = sync_channel(4);
        let (led_tx, _led) = sync_channel(4);
        table
            .insert(0, TaskId::Tcp.raw(), tcp_tx, TaskId::Tcp.route_flags())
            .unwrap();
        table
            .insert(1, TaskId::Alarm.raw(), alarm_tx, TaskId::Alarm.route_flags())
            .unwrap();
        table
            .insert(2, TaskId::Led.raw(), led_tx, TaskId::Led.route_flags())
            .unwrap();
        let router = Router::new(Arc::new(table), TaskId::Led);
        (LedService::new(router), tcp, alarm)
    }

    fn from(task: TaskId, mut command: Envelope) -> Envelope {
        command.from = task.raw();
        command
    }

    #[test]
    fn lerp_blends_and_clamps() {
        let a = Color::new(0, 100, 200);
        let b = Color::new(255, 0, 200);
        assert_eq!(a.lerp(b, 0.5), Color::new(128, 50, 200));
        assert_eq!(a.lerp(b, 2.0), b);
        assert_eq!(a.lerp(b, -1.0), a);
    }

    #[test]
    fn set_color_then_get_reports_it() {
        let (mut led, tcp, _alarm) = service();
        let set = request::set_color(Color::new(1, 2, 3)).unwrap();
        led.handle(&from(TaskId::Tcp, set), 0);
        assert_eq!(tcp.try_recv().unwrap().op(), Operation::Response);

        led.handle(&from(TaskId::Tcp, request::get_color().unwrap()), 0);
        let reply = tcp.try_recv().unwrap();
        assert_eq!(reply.command_id(), CMD_COLOR);
        assert_eq!(&reply.body[..4], &[1, 2, 3, 1]);
    }

    #[test]
    fn fade_progresses_with_time() {
        let mut state = LedState::default();
        state.set_color(Color::new(0, 0, 0));
        state.fade_to(Color::new(200, 100, 0), 1_000, 10_000);

        assert_eq!(state.color_at(10_000), Color::new(0, 0, 0));
        assert_eq!(state.color_at(10_500), Color::new(100, 50, 0));
        assert_eq!(state.color_at(20_000), Color::new(200, 100, 0));
    }

    #[test]
    fn fade_command_is_interpolated_until_done() {
        let (mut led, tcp, _alarm) = service();
        led.handle(&from(TaskId::Tcp, request::off().unwrap()), 0);
        led.handle(&from(TaskId::Tcp, request::fade(Color::new(200, 0, 100), 2_000).unwrap()), 1_000);
        tcp.try_iter().for_each(drop);

        led.handle(&from(TaskId::Tcp, request::get_color().unwrap()), 2_000);
        assert_eq!(&tcp.try_recv().unwrap().body[..4], &[100, 0, 50, 1]);

        led.handle(&from(TaskId::Tcp, request::get_color().unwrap()), 5_000);
        assert_eq!(&tcp.try_recv().unwrap().body[..4], &[200, 0, 100, 1]);
    }

    #[test]
    fn off_reports_black() {
        let (mut led, tcp, _alarm) = service();
        led.handle(&from(TaskId::Tcp, request::set_color(Color::new(9, 9, 9)).unwrap()), 0);
        led.handle(&from(TaskId::Tcp, request::off().unwrap()), 0);
        tcp.try_recv().unwrap();
        tcp.try_recv().unwrap();

        assert!(!led.state().is_on());
        assert_eq!(led.state().color_at(0), Color::BLACK);
    }

    #[test]
    fn alarm_triggers_get_no_reply() {
        let (mut led, _tcp, alarm) = service();
        let trigger = from(TaskId::Alarm, request::fade(Color::new(5, 5, 5), 0).unwrap());

        led.handle(&trigger, 0);

        assert!(led.state().is_on());
        assert!(alarm.try_recv().is_err());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let (mut led, tcp, _alarm) = service();
        let command = Envelope::request(TaskId::Led.raw(), Operation::Get, 7).unwrap();

        led.handle(&from(TaskId::Tcp, command), 0);

        let reply = tcp.try_recv().unwrap();
        assert_eq!(reply.op(), Operation::Error);
        assert_eq!(reply.body_str(), "invalid command");
    }
}
