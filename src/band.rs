//! Default-flow bands and a fixed-size per-band table.
//!
//! Traffic that is not mapped to a guaranteed flow lands in the default flow, which fans out into
//! four strict-priority FIFO bands: one predicted-service band and three best-effort bands.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Strict-priority bands of the default flow, ordered from most to least preferred.
///
/// The ordering is stable so the scheduler can scan bands with integer indexes. Band 0
/// ([`Band::Predicted`]) is always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    Predicted,
    BestEffortHigh,
    BestEffortNormal,
    BestEffortLow,
}

impl Band {
    /// Ordered list of all bands (highest priority first).
    pub const ALL: [Band; 4] = [
        Band::Predicted,
        Band::BestEffortHigh,
        Band::BestEffortNormal,
        Band::BestEffortLow,
    ];

    /// Position of the band in [`Band::ALL`], 0 being served first.
    pub const fn index(self) -> usize {
        match self {
            Band::Predicted => 0,
            Band::BestEffortHigh => 1,
            Band::BestEffortNormal => 2,
            Band::BestEffortLow => 3,
        }
    }

    /// Inverse of [`Band::index`].
    ///
    /// # Returns
    /// `None` when `index` is outside `0..4`
    pub const fn from_index(index: usize) -> Option<Band> {
        match index {
            0 => Some(Band::Predicted),
            1 => Some(Band::BestEffortHigh),
            2 => Some(Band::BestEffortNormal),
            3 => Some(Band::BestEffortLow),
            _ => None,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Band::Predicted => "predicted",
            Band::BestEffortHigh => "best_effort_high",
            Band::BestEffortNormal => "best_effort_normal",
            Band::BestEffortLow => "best_effort_low",
        };
        write!(f, "{label}")
    }
}

/// One value per [`Band`], indexable by band.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandTable<T> {
    values: [T; 4],
}

impl<T> BandTable<T> {
    /// One value per band, computed from the band itself.
    ///
    /// # Example
    /// ```
    /// use csz_qdisc::band::{Band, BandTable};
    ///
    /// let weights = BandTable::from_fn(|band| band.index() * 10);
    /// assert_eq!(weights[Band::BestEffortLow], 30);
    /// ```
    pub fn from_fn(mut f: impl FnMut(Band) -> T) -> Self {
        BandTable {
            values: Band::ALL.map(&mut f),
        }
    }

    pub fn get(&self, band: Band) -> &T {
        &self.values[band.index()]
    }

    pub fn get_mut(&mut self, band: Band) -> &mut T {
        &mut self.values[band.index()]
    }

    /// Iterate `(band, value)` pairs from the highest priority band down.
    pub fn iter(&self) -> impl Iterator<Item = (Band, &T)> {
        Band::ALL.into_iter().zip(self.values.iter())
    }
}

impl<T> Index<Band> for BandTable<T> {
    type Output = T;

    fn index(&self, index: Band) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<Band> for BandTable<T> {
    fn index_mut(&mut self, index: Band) -> &mut Self::Output {
        self.get_mut(index)
    }
}
