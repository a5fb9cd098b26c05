pub mod address;
pub mod alarm;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod led;
pub mod router;
pub mod store;
pub mod sun;
pub mod task;
pub mod topics;
pub mod trigger;

pub use address::{AddressError, AddressTable, DeliveryError, Mailbox};
pub use alarm::{AlarmError, AlarmRecord, AlarmStore, AlarmTime, DayMask};
pub use config::{ControllerConfig, Location, NetworkConfig};
pub use engine::{trigger_envelope, AlarmEngine, CountdownTimer, EngineError, TimerError, TimerState};
pub use envelope::{Envelope, EnvelopeError, Header, Operation, BODY_SIZE, ENVELOPE_SIZE};
pub use led::{Color, LedService, LedState};
pub use router::{Delivery, RouteError, Router};
pub use store::{BlobStore, MemoryBlobStore, StoreError};
pub use sun::{SolarCalculator, SunTimes};
pub use task::{RouteFlags, TaskId};
pub use trigger::Due;
