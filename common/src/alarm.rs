//! Alarm records and the fixed-capacity, persisted alarm store.
//!
//! Indices are positions in the store. Removal swaps the last record into the
//! freed slot, so an index is only meaningful until the next mutation.

use core::fmt;

use chrono::{DateTime, FixedOffset, Weekday};
use log::{info, warn};
use thiserror::Error;

use crate::{
    envelope::{Envelope, EnvelopeError, Operation, BODY_SIZE, ENVELOPE_SIZE},
    store::{BlobStore, StoreError},
    sun::{SunTimes, SECONDS_PER_DAY},
    task::TaskId,
    trigger::{self, Due},
};

pub const SUNRISE: u32 = 0xFFFF_FFFF;
pub const SUNSET: u32 = 0xFFFF_FFFE;

pub const NAMESPACE: &str = "alarms";
pub const KEY_COUNT: &str = "count";
pub const KEY_RECORDS: &str = "records";

/// time-of-day (4) + days (1) + trigger envelope.
pub const RECORD_SIZE: usize = 5 + ENVELOPE_SIZE;

/// Bytes of the nested trigger envelope carried by an INSERT body.
pub const INSERT_TRIGGER_LEN: usize = BODY_SIZE - 5;

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("alarm store is full ({0} alarms)")]
    Full(usize),
    #[error("no alarm at index {0}")]
    InvalidIndex(usize),
    #[error("time of day {0} is neither a sentinel nor below 86400")]
    InvalidTime(u32),
    #[error("trigger command is not allowed: {0}")]
    InvalidTrigger(&'static str),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("failed to persist alarms: {0}")]
    Persist(#[from] StoreError),
}

impl AlarmError {
    /// Persistence failures leave memory and flash out of sync.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persist(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmTime {
    /// Seconds after local midnight.
    At(u32),
    Sunrise,
    Sunset,
}

impl AlarmTime {
    pub fn from_raw(raw: u32) -> Result<Self, AlarmError> {
        match raw {
            SUNRISE => Ok(Self::Sunrise),
            SUNSET => Ok(Self::Sunset),
            seconds if seconds < SECONDS_PER_DAY => Ok(Self::At(seconds)),
            other => Err(AlarmError::InvalidTime(other)),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::At(seconds) => seconds,
            Self::Sunrise => SUNRISE,
            Self::Sunset => SUNSET,
        }
    }

    /// Local time of day on the date of `now`, looking sunrise/sunset up when needed.
    pub fn resolve(self, now: &DateTime<FixedOffset>, sun: &dyn SunTimes) -> Option<u32> {
        trigger::resolve_time_of_day(self, now, sun)
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(seconds) => write!(
                f,
                "{:02}:{:02}:{:02}",
                seconds / 3600,
                seconds / 60 % 60,
                seconds % 60
            ),
            Self::Sunrise => f.write_str("sunrise"),
            Self::Sunset => f.write_str("sunset"),
        }
    }
}

/// Seven-bit weekday mask. Bit 0 is Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DayMask(u8);

impl DayMask {
    pub const ALL: Self = Self(0x7F);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7F)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn from_weekdays(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self(
            days.into_iter()
                .fold(0, |bits, day| bits | 1 << day.num_days_from_sunday()),
        )
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.contains_index(day.num_days_from_sunday())
    }

    /// `index` counts days from Sunday and wraps every week.
    pub fn contains_index(self, index: u32) -> bool {
        self.0 & (1 << (index % 7)) != 0
    }
}

impl fmt::Display for DayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [char; 7] = ['S', 'M', 'T', 'W', 'T', 'F', 'S'];
        for (index, letter) in LETTERS.iter().enumerate() {
            let shown = if self.contains_index(index as u32) {
                *letter
            } else {
                '-'
            };
            write!(f, "{shown}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRecord {
    pub time: AlarmTime,
    pub days: DayMask,
    pub trigger: Envelope,
}

impl AlarmRecord {
    /// Parses an INSERT body: time u32, days u8, then the trigger envelope prefix.
    pub fn from_insert_body(command: &Envelope) -> Result<Self, AlarmError> {
        let time = AlarmTime::from_raw(command.read_u32(0)?)?;
        let days = DayMask::from_bits(command.read_u8(4)?);
        let trigger = Envelope::from_prefix(command.read_bytes(5, INSERT_TRIGGER_LEN)?)?;
        Ok(Self {
            time,
            days,
            trigger,
        })
    }

    /// Rejects triggers that would loop back into the alarm engine or a transport.
    pub fn validate_trigger(&self) -> Result<(), AlarmError> {
        if self.trigger.op() != Operation::Set {
            return Err(AlarmError::InvalidTrigger("trigger must be a SET command"));
        }
        match TaskId::from_raw(self.trigger.dest) {
            Some(task) if task.accepts_alarm_triggers() => Ok(()),
            Some(_) => Err(AlarmError::InvalidTrigger(
                "trigger cannot target the alarm engine or a transport",
            )),
            None => Err(AlarmError::InvalidTrigger("unknown trigger destination")),
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut raw = [0_u8; RECORD_SIZE];
        raw[..4].copy_from_slice(&self.time.raw().to_be_bytes());
        raw[4] = self.days.bits();
        raw[5..].copy_from_slice(&self.trigger.to_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self, AlarmError> {
        if raw.len() != RECORD_SIZE {
            return Err(EnvelopeError::WrongLength(raw.len()).into());
        }
        let time = AlarmTime::from_raw(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))?;
        Ok(Self {
            time,
            days: DayMask::from_bits(raw[4]),
            trigger: Envelope::from_bytes(&raw[5..])?,
        })
    }
}

/// Builds the INSERT request a client sends to the alarm engine.
pub fn insert_request(
    time: AlarmTime,
    days: DayMask,
    trigger: &Envelope,
) -> Result<Envelope, EnvelopeError> {
    let mut command = Envelope::request(TaskId::Alarm.raw(), Operation::Set, 1)?;
    command.write_u32(0, time.raw())?;
    command.write_u8(4, days.bits())?;
    command.write_bytes(5, &trigger.to_bytes()[..INSERT_TRIGGER_LEN])?;
    Ok(command)
}

pub struct AlarmStore<S> {
    records: Vec<AlarmRecord>,
    capacity: usize,
    store: S,
}

impl<S: BlobStore> AlarmStore<S> {
    /// Loads persisted alarms. Data whose shape does not match this build is
    /// erased and the store starts empty.
    pub fn load(store: S, capacity: usize) -> Result<Self, AlarmError> {
        let mut alarms = Self {
            records: Vec::with_capacity(capacity),
            capacity,
            store,
        };

        let count = alarms.store.load_u32(NAMESPACE, KEY_COUNT)?;
        let blob = alarms.store.load_blob(NAMESPACE, KEY_RECORDS)?;
        let (count, blob) = match (count, blob) {
            (None, None) => return Ok(alarms),
            (Some(0), None) => return Ok(alarms),
            (Some(count), Some(blob)) => (count as usize, blob),
            _ => {
                warn!("alarm storage is incomplete; erasing");
                alarms.erase()?;
                return Ok(alarms);
            }
        };

        if count > capacity || blob.len() != count * RECORD_SIZE {
            warn!(
                "stored alarms do not match this build ({count} alarms in {} bytes, {RECORD_SIZE} bytes each, capacity {capacity}); erasing",
                blob.len()
            );
            alarms.erase()?;
            return Ok(alarms);
        }

        let decoded: Result<Vec<_>, _> = blob.chunks_exact(RECORD_SIZE).map(AlarmRecord::decode).collect();
        match decoded {
            Ok(records) => {
                info!("loaded {} alarms", records.len());
                alarms.records = records;
            }
            Err(err) => {
                warn!("stored alarms are corrupt ({err}); erasing");
                alarms.erase()?;
            }
        }
        Ok(alarms)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AlarmRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[AlarmRecord] {
        &self.records
    }

    /// Appends and persists. Returns the index of the new alarm.
    pub fn insert(&mut self, record: AlarmRecord) -> Result<usize, AlarmError> {
        if self.records.len() >= self.capacity {
            return Err(AlarmError::Full(self.capacity));
        }
        self.records.push(record);
        self.persist()?;
        Ok(self.records.len() - 1)
    }

    /// Swap-removes `index` and persists.
    pub fn remove(&mut self, index: usize) -> Result<AlarmRecord, AlarmError> {
        if index >= self.records.len() {
            return Err(AlarmError::InvalidIndex(index));
        }
        let removed = self.records.swap_remove(index);
        self.persist()?;
        Ok(removed)
    }

    pub fn find_earliest_due(
        &self,
        now: &DateTime<FixedOffset>,
        sun: &dyn SunTimes,
    ) -> Option<Due> {
        trigger::find_earliest_due(&self.records, now, sun)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut blob = Vec::with_capacity(self.records.len() * RECORD_SIZE);
        for record in &self.records {
            blob.extend_from_slice(&record.encode());
        }
        self.store.save_blob(NAMESPACE, KEY_RECORDS, &blob)?;
        self.store
            .save_u32(NAMESPACE, KEY_COUNT, self.records.len() as u32)
    }

    fn erase(&mut self) -> Result<(), StoreError> {
        self.records.clear();
        self.store.erase(NAMESPACE, KEY_RECORDS)?;
        self.store.erase(NAMESPACE, KEY_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryBlobStore;

    fn led_trigger(red: u8) -> Envelope {
        let mut trigger = Envelope::request(TaskId::Led.raw(), Operation::Set, 1).unwrap();
        trigger.write_bytes(0, &[red, 0, 0]).unwrap();
        trigger
    }

    fn record(seconds: u32, red: u8) -> AlarmRecord {
        AlarmRecord {
            time: AlarmTime::At(seconds),
            days: DayMask::ALL,
            trigger: led_trigger(red),
        }
    }

    #[test]
    fn time_sentinels_and_range() {
        assert_eq!(AlarmTime::from_raw(SUNRISE).unwrap(), AlarmTime::Sunrise);
        assert_eq!(AlarmTime::from_raw(SUNSET).unwrap(), AlarmTime::Sunset);
        assert_eq!(AlarmTime::from_raw(86_399).unwrap(), AlarmTime::At(86_399));
        assert!(matches!(
            AlarmTime::from_raw(86_400),
            Err(AlarmError::InvalidTime(86_400))
        ));
        assert_eq!(AlarmTime::At(3_725).to_string(), "01:02:05");
    }

    #[test]
    fn day_mask_counts_from_sunday() {
        let mask = DayMask::from_weekdays([Weekday::Sun, Weekday::Wed]);
        assert_eq!(mask.bits(), 0b000_1001);
        assert!(mask.contains(Weekday::Wed));
        assert!(!mask.contains(Weekday::Thu));
        assert!(mask.contains_index(7));
        assert_eq!(mask.to_string(), "S--W---");
        assert_eq!(DayMask::from_bits(0xFF), DayMask::ALL);
    }

    #[test]
    fn insert_body_round_trips_the_trigger() {
        let trigger = led_trigger(200);
        let command = insert_request(AlarmTime::Sunset, DayMask::from_bits(0b10), &trigger).unwrap();

        let parsed = AlarmRecord::from_insert_body(&command).unwrap();
        assert_eq!(parsed.time, AlarmTime::Sunset);
        assert_eq!(parsed.days.bits(), 0b10);
        assert_eq!(parsed.trigger, trigger);
        parsed.validate_trigger().unwrap();
    }

    #[test]
    fn triggers_must_be_set_commands_to_led() {
        let mut rec = record(10, 1);
        rec.trigger = Envelope::request(TaskId::Led.raw(), Operation::Get, 1).unwrap();
        assert!(rec.validate_trigger().is_err());

        for dest in [TaskId::Alarm, TaskId::Tcp, TaskId::Cloud, TaskId::Http] {
            rec.trigger = Envelope::request(dest.raw(), Operation::Set, 1).unwrap();
            assert!(rec.validate_trigger().is_err(), "{dest} accepted");
        }

        rec.trigger = Envelope::request(0, Operation::Set, 1).unwrap();
        assert!(rec.validate_trigger().is_err());
    }

    #[test]
    fn insert_at_capacity_fails_without_touching_storage() {
        let blobs = MemoryBlobStore::new();
        let mut store = AlarmStore::load(&blobs, 3).unwrap();
        for i in 0..3 {
            assert_eq!(store.insert(record(100 * i, i as u8)).unwrap(), i as usize);
        }
        let persisted = blobs.load_blob(NAMESPACE, KEY_RECORDS).unwrap();

        assert!(matches!(store.insert(record(5, 9)), Err(AlarmError::Full(3))));
        assert_eq!(store.len(), 3);
        assert_eq!(blobs.load_blob(NAMESPACE, KEY_RECORDS).unwrap(), persisted);
        assert_eq!(blobs.load_u32(NAMESPACE, KEY_COUNT).unwrap(), Some(3));
    }

    #[test]
    fn remove_swaps_last_record_into_place() {
        let blobs = MemoryBlobStore::new();
        let mut store = AlarmStore::load(&blobs, 4).unwrap();
        for i in 0..4 {
            store.insert(record(1_000 + i, i as u8)).unwrap();
        }

        let removed = store.remove(1).unwrap();
        assert_eq!(removed.time, AlarmTime::At(1_001));
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(1).unwrap().time, AlarmTime::At(1_003));

        store.remove(2).unwrap();
        assert_eq!(store.len(), 2);
        assert!(matches!(store.remove(2), Err(AlarmError::InvalidIndex(2))));
    }

    #[test]
    fn persisted_alarms_reload() {
        let blobs = MemoryBlobStore::new();
        {
            let mut store = AlarmStore::load(&blobs, 4).unwrap();
            store.insert(record(60, 1)).unwrap();
            store.insert(record(120, 2)).unwrap();
            store.remove(0).unwrap();
        }

        let reloaded = AlarmStore::load(&blobs, 4).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(0).unwrap(), &record(120, 2));
    }

    #[test]
    fn mismatched_layout_is_erased() {
        let blobs = MemoryBlobStore::new();
        blobs.save_u32(NAMESPACE, KEY_COUNT, 2).unwrap();
        blobs.save_blob(NAMESPACE, KEY_RECORDS, &[0; 2 * 100]).unwrap();

        let store = AlarmStore::load(&blobs, 4).unwrap();
        assert!(store.is_empty());
        assert!(!blobs.contains(NAMESPACE, KEY_RECORDS));
        assert!(!blobs.contains(NAMESPACE, KEY_COUNT));
    }

    #[test]
    fn more_alarms_than_capacity_is_a_mismatch() {
        let blobs = MemoryBlobStore::new();
        {
            let mut store = AlarmStore::load(&blobs, 4).unwrap();
            for i in 0..3 {
                store.insert(record(i, 0)).unwrap();
            }
        }

        assert!(AlarmStore::load(&blobs, 2).unwrap().is_empty());
    }

    #[test]
    fn persistence_failure_is_fatal() {
        let blobs = MemoryBlobStore::new();
        let mut store = AlarmStore::load(&blobs, 2).unwrap();
        blobs.set_fail_saves(true);

        let err = store.insert(record(1, 1)).unwrap_err();
        assert!(err.is_fatal());
    }
}
