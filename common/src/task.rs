use core::fmt;

/// Logical subsystem identifiers. The discriminant is the wire value carried in
/// `from`/`dest`; 0 is reserved and never maps to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskId {
    Tcp = 1,
    Alarm = 2,
    Cloud = 3,
    Led = 4,
    Http = 5,
}

impl TaskId {
    pub const ALL: [TaskId; 5] = [
        TaskId::Tcp,
        TaskId::Alarm,
        TaskId::Cloud,
        TaskId::Led,
        TaskId::Http,
    ];

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Tcp),
            2 => Some(Self::Alarm),
            3 => Some(Self::Cloud),
            4 => Some(Self::Led),
            5 => Some(Self::Http),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Alarm => "alarm",
            Self::Cloud => "cloud",
            Self::Led => "led",
            Self::Http => "http",
        }
    }

    /// Delivery flags each subsystem is registered with.
    pub fn route_flags(self) -> RouteFlags {
        match self {
            // Transports only ever receive replies to what they relayed.
            Self::Tcp | Self::Cloud | Self::Http => RouteFlags::ONLY_REPLY,
            // Trigger commands are fire-and-forget.
            Self::Alarm => RouteFlags::NO_REPLY,
            Self::Led => RouteFlags::NONE,
        }
    }

    /// Whether a stored alarm may dispatch its trigger command to this task.
    pub fn accepts_alarm_triggers(self) -> bool {
        match self {
            Self::Alarm | Self::Tcp | Self::Cloud | Self::Http => false,
            Self::Led => true,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.raw())
    }
}

impl From<TaskId> for u8 {
    fn from(id: TaskId) -> Self {
        id.raw()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RouteFlags(u8);

impl RouteFlags {
    pub const NONE: Self = Self(0);
    /// Replies addressed to this task are skipped silently.
    pub const NO_REPLY: Self = Self(0b01);
    /// The task never accepts relayed requests.
    pub const ONLY_REPLY: Self = Self(0b10);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for RouteFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
