//! Ordered tables mapping physical quantities onto discrete device modes.
//!
//! Some instruments only accept a handful of settings for a quantity (number
//! of readings to average, integration interval, ...). A [`ModeTable`] lists
//! the supported values in ascending order, the index of each entry being the
//! mode id sent to the device. Requests are resolved to the nearest supported
//! value; a request exactly half way between two entries resolves to the
//! lower one.

use fugit::MicrosDurationU32;
use log::warn;

/// A quantity that can be looked up in a [`ModeTable`].
pub trait ModeKey: Copy + PartialOrd + core::fmt::Debug {
    /// Absolute distance between two values.
    fn distance(self, other: Self) -> u64;
}

impl ModeKey for u32 {
    fn distance(self, other: Self) -> u64 {
        u64::from(self.abs_diff(other))
    }
}

impl ModeKey for MicrosDurationU32 {
    fn distance(self, other: Self) -> u64 {
        u64::from(self.ticks().abs_diff(other.ticks()))
    }
}

/// Supported values of one device setting, in ascending order.
#[derive(Debug)]
pub struct ModeTable<K: 'static> {
    name: &'static str,
    quantity: &'static str,
    values: &'static [K],
}

impl<K: ModeKey> ModeTable<K> {
    /// `values` must be sorted ascending and non-empty.
    pub const fn new(name: &'static str, quantity: &'static str, values: &'static [K]) -> Self {
        Self {
            name,
            quantity,
            values,
        }
    }

    /// Mode id of the supported value nearest to `requested`.
    pub fn nearest(&self, requested: K) -> u8 {
        let mut best = 0usize;
        let mut best_distance = u64::MAX;
        for (mode, value) in self.values.iter().enumerate() {
            let distance = value.distance(requested);
            if distance < best_distance {
                best = mode;
                best_distance = distance;
            }
        }
        if best_distance != 0 {
            warn!(
                "{}: {:?} {} is not supported, using the nearest supported value {:?}.",
                self.name, requested, self.quantity, self.values[best]
            );
        }
        best as u8
    }

    /// Supported value for a mode id.
    pub fn value(&self, mode: u8) -> Option<K> {
        self.values.get(usize::from(mode)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static AVERAGING: ModeTable<u32> = ModeTable::new("Filter", "readings to average", &[1, 2, 4, 8, 16, 32]);
    static INTERVALS: ModeTable<MicrosDurationU32> = ModeTable::new(
        "Integration Time",
        "interval",
        &[
            MicrosDurationU32::from_ticks(416),
            MicrosDurationU32::from_ticks(4_000),
            MicrosDurationU32::from_ticks(16_670),
            MicrosDurationU32::from_ticks(20_000),
        ],
    );

    #[test]
    fn exact_values_map_to_their_index() {
        for (mode, value) in (0u8..).map_while(|mode| AVERAGING.value(mode).map(|value| (mode, value))) {
            assert_eq!(AVERAGING.nearest(value), mode);
        }
    }

    #[test]
    fn out_of_table_requests_clamp_to_the_ends() {
        assert_eq!(AVERAGING.nearest(0), 0);
        assert_eq!(AVERAGING.nearest(1_000), 5);
        assert_eq!(INTERVALS.nearest(MicrosDurationU32::from_ticks(1)), 0);
        assert_eq!(INTERVALS.nearest(MicrosDurationU32::from_ticks(1_000_000)), 3);
    }

    #[test]
    fn ties_resolve_to_the_lower_mode() {
        // 3 is equally far from 2 and 4.
        assert_eq!(AVERAGING.nearest(3), 1);
        // 24 is equally far from 16 and 32.
        assert_eq!(AVERAGING.nearest(24), 4);
        assert_eq!(AVERAGING.nearest(25), 5);
    }

    #[test]
    fn nearest_interval() {
        assert_eq!(INTERVALS.nearest(MicrosDurationU32::from_ticks(10_000)), 1);
        assert_eq!(INTERVALS.nearest(MicrosDurationU32::from_ticks(10_336)), 2);
        assert_eq!(INTERVALS.nearest(MicrosDurationU32::from_ticks(18_335)), 2);
        assert_eq!(INTERVALS.nearest(MicrosDurationU32::from_ticks(18_336)), 3);
    }

    #[test]
    fn tables_are_sorted() {
        assert!(AVERAGING.values.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(INTERVALS.values.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(AVERAGING.value(6), None);
    }
}
