//! Pulse-timing encoders for delivery schedules
//!
//! The pump hardware does not accept rates directly; it accepts tables
//! describing how many pulses to deliver per half-hour slot, run-length
//! compressed, plus rate entries giving a pulse count and inter-pulse delay.
//! These encoders are pure functions from schedules to tables. Decoding a
//! basal table must reproduce the exact per-slot pulse counts that were
//! encoded.

use log::debug;
use std::time::Duration;

/// Volume of insulin delivered by one motor pulse, in units
pub const PULSE_SIZE: f64 = 0.05;

/// Pulses required to deliver one unit
pub const PULSES_PER_UNIT: f64 = 1.0 / PULSE_SIZE;

/// Half-hour slots in one day of basal schedule
pub const SLOTS_PER_DAY: usize = 48;

/// Hardware cap on consecutive slots described by one table entry
const MAX_SEGMENTS_PER_ENTRY: usize = 16;

/// Max pulses one rate entry can encode (a two-byte count of tenths)
const MAX_PULSES_PER_RATE_ENTRY: f64 = 0xffff as f64 / 10.0;

/// Sentinel rate used in place of zero on hardware without true-zero support
pub const NEAR_ZERO_RATE: f64 = 0.01;

/// Delay encoding flag marking a near-zero sentinel entry
const NEAR_ZERO_DELAY_FLAG: u32 = 0x8000_0000;

/// Max delay between pulses; the delay used by zero and near-zero entries
const SENTINEL_DELAY: Duration = Duration::from_secs(5 * 3600);

/// Rates this close below a pulse-size boundary round up to it
const RATE_ROUNDING_DELTA: f64 = 0.01;

/// Highest supported rate, in pulses per hour
const MAX_RATE_PULSES: u32 = 600;

/// Extended bolus duration cap, in hours
pub const MAX_EXTENDED_BOLUS_HOURS: u32 = 8;

const SLOT_DURATION_SECS: f64 = 1800.0;

/// How a zero rate is encoded, per hardware generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroRateHandling {
    /// Hardware accepts zero-pulse entries (one fixed 30-minute entry each)
    TrueZero,
    /// Hardware needs the near-zero sentinel rate with flagged delay timing
    NearZeroSentinel,
}

/// One half-hourly basal schedule segment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalScheduleEntry {
    /// Units per hour
    pub rate: f64,
    /// First half-hour slot this rate applies to (0..48)
    pub start_slot: usize,
}

/// A day-long basal schedule, queried per half-hour slot
#[derive(Debug, Clone, PartialEq)]
pub struct BasalSchedule {
    entries: Vec<BasalScheduleEntry>,
}

impl BasalSchedule {
    /// Entries are sorted by starting slot; the first must cover slot zero
    pub fn new(mut entries: Vec<BasalScheduleEntry>) -> Self {
        entries.sort_by_key(|entry| entry.start_slot);
        Self { entries }
    }

    pub fn flat(rate: f64) -> Self {
        Self::new(vec![BasalScheduleEntry {
            rate,
            start_slot: 0,
        }])
    }

    /// The scheduled rate during a half-hour slot
    pub fn rate_at(&self, slot: usize) -> f64 {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.start_slot <= slot)
            .map(|entry| entry.rate)
            .unwrap_or(0.0)
    }
}

/// Run-length-compressed description of pulse delivery over consecutive
/// half-hour slots
///
/// Produced only by the encoders; never hand-constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasalTableEntry {
    /// Consecutive half-hour slots covered (1..=16)
    pub segments: u8,
    /// Pulses delivered in each slot
    pub pulses: u16,
    /// Whether odd slots within the entry receive one extra pulse
    pub alternate: bool,
}

impl BasalTableEntry {
    /// The per-slot pulse counts this entry expands to
    pub fn slot_pulses(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.segments as usize).map(move |i| {
            self.pulses
                + if self.alternate && i % 2 == 1 {
                    1
                } else {
                    0
                }
        })
    }

    /// Wire form: segment count, alternation flag, and pulse count packed
    /// into one big-endian word
    pub fn encode(&self) -> [u8; 2] {
        let word = ((self.segments as u16 - 1) << 12)
            | if self.alternate { 0x0800 } else { 0 }
            | (self.pulses & 0x03ff);
        word.to_be_bytes()
    }
}

/// Encode a basal schedule into delivery table entries
///
/// Each slot delivers half its hourly pulse count; when the hourly count is
/// odd, a carried remainder bit grants the extra pulse to every second such
/// slot so fractional delivery averages out without long-run drift.
pub fn basal_table(schedule: &BasalSchedule) -> Vec<BasalTableEntry> {
    let mut half_pulse_remainder = false;

    let slot_pulses: Vec<u16> = (0..SLOTS_PER_DAY)
        .map(|slot| {
            let rate = schedule.rate_at(slot);
            let pulses_per_hour = (rate / PULSE_SIZE).round() as u32;
            let per_slot = pulses_per_hour >> 1;
            let half_pulse = pulses_per_hour & 1 != 0;

            let pulses = per_slot + u32::from(half_pulse_remainder && half_pulse);
            half_pulse_remainder ^= half_pulse;
            pulses as u16
        })
        .collect();

    let entries = merge_slots(&slot_pulses);
    debug!(
        "Encoded basal schedule into {} table entries",
        entries.len()
    );
    entries
}

/// Expand a table back into per-slot pulse counts
pub fn decode_basal_table(entries: &[BasalTableEntry]) -> Vec<u16> {
    entries
        .iter()
        .flat_map(|entry| entry.slot_pulses().collect::<Vec<_>>())
        .collect()
}

/// Merge consecutive slots while the pulse delta matches the entry's
/// established pattern (constant, or strict +0/+1 alternation) and the
/// segment cap is not reached
fn merge_slots(slot_pulses: &[u16]) -> Vec<BasalTableEntry> {
    let mut entries = Vec::new();
    let mut alternate = false;
    let mut group: Vec<u16> = Vec::new();

    for &pulses in slot_pulses {
        if let Some(&first) = group.first() {
            let delta = pulses as i32 - first as i32;

            if group.len() == 1 {
                alternate = delta == 1;
            }

            let expected = if alternate {
                (group.len() % 2) as i32
            } else {
                0
            };

            if expected != delta || group.len() == MAX_SEGMENTS_PER_ENTRY {
                entries.push(close_group(&group, alternate));
                group.clear();
            }
        }
        group.push(pulses);
    }
    entries.push(close_group(&group, alternate));

    entries
}

fn close_group(group: &[u16], alternate: bool) -> BasalTableEntry {
    BasalTableEntry {
        segments: group.len() as u8,
        pulses: group[0],
        alternate,
    }
}

/// Round a requested rate down to the nearest supported pulse boundary;
/// rates just below a boundary round up to it
pub fn round_to_supported_rate(rate: f64) -> f64 {
    (0..=MAX_RATE_PULSES)
        .map(|pulses| pulses as f64 / PULSES_PER_UNIT)
        .filter(|supported| *supported <= rate + RATE_ROUNDING_DELTA)
        .last()
        .unwrap_or(0.0)
}

/// Rounded rate used for pulse timing; zero maps per the hardware mode
fn round_to_timing_rate(rate: f64, zero_mode: ZeroRateHandling) -> f64 {
    let rounded = round_to_supported_rate(rate);
    if rounded == 0.0 {
        match zero_mode {
            ZeroRateHandling::TrueZero => 0.0,
            ZeroRateHandling::NearZeroSentinel => NEAR_ZERO_RATE,
        }
    } else {
        rounded
    }
}

/// A pulse count and inter-pulse delay for temp-basal and extended-bolus
/// delivery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEntry {
    /// Pulses to deliver; tenths of a pulse are representable
    pub total_pulses: f64,
    pub delay_between_pulses: Duration,
}

impl RateEntry {
    /// Units per hour this entry delivers
    pub fn rate(&self) -> f64 {
        if self.total_pulses == 0.0 {
            return 0.0;
        }
        let per_hour = 3600.0 / self.delay_between_pulses.as_secs_f64();
        (per_hour / PULSES_PER_UNIT * 100.0).round() / 100.0
    }

    /// How long this entry runs; zero-pulse entries are fixed 30-minute
    /// placeholders
    pub fn duration(&self) -> Duration {
        if self.total_pulses == 0.0 {
            return Duration::from_secs(30 * 60);
        }
        Duration::from_secs_f64(
            (self.delay_between_pulses.as_secs_f64() * self.total_pulses).round(),
        )
    }

    /// Wire form: big-endian tenths-of-a-pulse count, then the delay in
    /// hundredths of a millisecond, flag bit set for near-zero sentinel
    /// entries
    pub fn encode(&self) -> [u8; 6] {
        let tenths = (self.total_pulses * 10.0).round() as u16;
        let mut delay = (self.delay_between_pulses.as_secs_f64() * 100_000.0) as u32;

        if self.delay_between_pulses == SENTINEL_DELAY && self.total_pulses != 0.0 {
            delay |= NEAR_ZERO_DELAY_FLAG;
        }

        let mut data = [0u8; 6];
        data[..2].copy_from_slice(&tenths.to_be_bytes());
        data[2..].copy_from_slice(&delay.to_be_bytes());
        data
    }

    /// Split a rate over a duration into entries bounded by the per-entry
    /// pulse cap
    pub fn make_entries(rate: f64, duration: Duration, zero_mode: ZeroRateHandling) -> Vec<Self> {
        let timing_rate = round_to_timing_rate(rate, zero_mode);
        // Shortest encodable duration is one half-hour slot
        let num_half_hours = ((duration.as_secs_f64() / 60.0 / 30.0).round() as i64).max(1);

        let pulses_per_segment = (timing_rate / PULSE_SIZE).round() / 2.0;
        let max_segments_per_entry = if pulses_per_segment > 0.0 {
            (MAX_PULSES_PER_RATE_ENTRY / pulses_per_segment) as i64
        } else {
            1
        };

        let mut remaining_segments = num_half_hours;
        let mut remaining_pulses = timing_rate * num_half_hours as f64 / 2.0 / PULSE_SIZE;
        let mut entries = Vec::new();

        while remaining_segments > 0 {
            if timing_rate == 0.0 {
                // One zero-pulse placeholder per half hour
                entries.push(RateEntry {
                    total_pulses: 0.0,
                    delay_between_pulses: SENTINEL_DELAY,
                });
                remaining_segments -= 1;
            } else if timing_rate == NEAR_ZERO_RATE {
                // A single sentinel entry covers the whole duration at one
                // tenth of a pulse per half hour
                entries.push(RateEntry {
                    total_pulses: remaining_segments as f64 / 10.0,
                    delay_between_pulses: SENTINEL_DELAY,
                });
                remaining_segments = 0;
            } else {
                let num_segments = max_segments_per_entry
                    .min((remaining_pulses / pulses_per_segment).round() as i64);
                remaining_segments -= num_segments;
                let pulse_count = pulses_per_segment * num_segments as f64;
                let delay = Duration::from_secs_f64(3600.0 / timing_rate * PULSE_SIZE);
                entries.push(RateEntry {
                    total_pulses: pulse_count,
                    delay_between_pulses: delay,
                });
                remaining_pulses -= pulse_count;
            }
        }

        entries
    }
}

/// Encode a combination bolus into delivery table entries
///
/// The immediate portion always forms the first entry. When the extended
/// portion's first half-hour pulse count is exactly one more than the
/// immediate count, the first entry absorbs it with alternation; when it is
/// equal, the first entry absorbs it (and any matching run) directly;
/// otherwise the first entry describes only the immediate portion. The
/// remaining extended segments merge by run length and alternation. The
/// extended duration is capped at one pulse per hour and eight hours.
pub fn bolus_table(
    immediate_units: f64,
    extended_units: f64,
    extended_duration: Duration,
) -> Vec<BasalTableEntry> {
    let immediate_pulses = (immediate_units / PULSE_SIZE).round() as u32;
    let extended_pulses = (extended_units / PULSE_SIZE).round() as u32;

    let max_duration_secs =
        3600.0 * extended_pulses.min(MAX_EXTENDED_BOLUS_HOURS) as f64;
    let duration_secs = extended_duration.as_secs_f64().min(max_duration_secs);

    generate_bolus_table(immediate_pulses, extended_pulses, duration_secs)
}

fn generate_bolus_table(
    immediate_pulses: u32,
    extended_pulses: u32,
    duration_secs: f64,
) -> Vec<BasalTableEntry> {
    let mut entries = Vec::new();

    if extended_pulses == 0 || duration_secs == 0.0 {
        entries.push(BasalTableEntry {
            segments: 1,
            pulses: immediate_pulses as u16,
            alternate: false,
        });
        return entries;
    }

    let per_seg = extended_pulses_per_segment(extended_pulses, duration_secs);
    let nseg = per_seg.len();

    // The first entry always carries the immediate pulse count, but may also
    // describe the opening of the extended portion.
    let pulses = immediate_pulses as i64;
    let mut segs: i64 = 1;
    let mut alternate = false;
    if per_seg[0] as i64 - 1 == pulses {
        segs += 1;
        alternate = true;
    } else if per_seg[0] as i64 == pulses {
        segs += 1;
        if immediate_pulses != 0 {
            segs += num_match(&per_seg, 0, immediate_pulses) as i64;
        }
    }
    entries.push(BasalTableEntry {
        segments: segs as u8,
        pulses: pulses as u16,
        alternate,
    });

    let mut remaining = (immediate_pulses + extended_pulses) as i64 - segs * pulses;
    if alternate {
        remaining -= segs / 2;
    }

    let mut idx = if alternate { 1 } else { (segs - 1) as usize };
    let base_pulses = (extended_pulses as usize / nseg) as i64;

    while idx < nseg && remaining > 0 {
        segs = 1;
        alternate = false;
        let mut pulses = base_pulses;

        if idx < nseg - 1 && per_seg[idx] as i64 == pulses && per_seg[idx + 1] as i64 == pulses + 1
        {
            let pairs = num_alt_pair_match(&per_seg, idx, pulses as u32) as i64;
            alternate = true;
            segs += pairs * 2 - 1;
            idx += (pairs * 2 - 1) as usize;
            remaining -= segs / 2;
        } else {
            pulses = per_seg[idx] as i64;
            let matched = num_match(&per_seg, idx, per_seg[idx]) as i64;
            if matched > 0 {
                segs += matched;
                idx += matched as usize;
            }
        }

        entries.push(BasalTableEntry {
            segments: segs as u8,
            pulses: pulses as u16,
            alternate,
        });

        idx += 1;
        remaining -= segs * pulses;
    }

    entries
}

/// Pulses delivered in each half-hour segment when `extended_pulses` are
/// spaced evenly over `duration_secs`; leftovers land in the last segment
fn extended_pulses_per_segment(extended_pulses: u32, duration_secs: f64) -> Vec<u32> {
    let nseg = (duration_secs / SLOT_DURATION_SECS).ceil() as usize;
    let pulse_interval = duration_secs / extended_pulses as f64;

    let mut per_seg = vec![0u32; nseg];
    let mut t = pulse_interval;
    let mut counted = 0;

    for (seg, count) in per_seg.iter_mut().enumerate() {
        let seg_start = seg as f64 * SLOT_DURATION_SECS;
        let seg_end = (seg_start + SLOT_DURATION_SECS).min(duration_secs);
        while t <= seg_end {
            if t > seg_start && t <= seg_end {
                *count += 1;
                counted += 1;
            }
            t += pulse_interval;
        }
        if t > duration_secs {
            break;
        }
    }

    if extended_pulses > counted {
        per_seg[nseg - 1] += extended_pulses - counted;
    }

    per_seg
}

/// Consecutive elements equal to `val` following `idx`
fn num_match(per_seg: &[u32], idx: usize, val: u32) -> usize {
    let mut count = 0;
    for i in idx..per_seg.len().saturating_sub(1) {
        if per_seg[i + 1] != val {
            break;
        }
        count += 1;
    }
    count
}

/// Consecutive `[val, val + 1]` pairs starting at `idx`
fn num_alt_pair_match(per_seg: &[u32], idx: usize, val: u32) -> usize {
    let mut count = 0;
    let mut i = idx;
    while i + 1 < per_seg.len() {
        if per_seg[i] != val || per_seg[i + 1] != val + 1 {
            break;
        }
        count += 1;
        i += 2;
    }
    count
}
