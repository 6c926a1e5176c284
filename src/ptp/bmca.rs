/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Best-Master-Clock dataset comparison, IEEE 1588-2008 §9.3.4. This node is
//! a slave-only ordinary clock, so only the "which announce wins" half of
//! the algorithm is needed; the local clock never competes.

use super::{
    messages::{AnnounceMessage, PtpMessageHeader},
    types::{ClockIdentity, ClockQuality, PortIdentity},
};
use std::cmp::Ordering;

/// Everything the BMCA needs to rank a foreign master, captured from one
/// Announce message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignMasterDataset {
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub steps_removed: u16,
    pub source_port_identity: PortIdentity,
    pub current_utc_offset: i16,
    pub time_source: u8,
}

impl ForeignMasterDataset {
    pub fn from_announce(header: &PtpMessageHeader, announce: &AnnounceMessage) -> Self {
        Self {
            grandmaster_identity: announce.grandmaster_identity,
            grandmaster_priority1: announce.grandmaster_priority1,
            grandmaster_clock_quality: announce.grandmaster_clock_quality,
            grandmaster_priority2: announce.grandmaster_priority2,
            steps_removed: announce.steps_removed,
            source_port_identity: header.source_port_identity,
            current_utc_offset: announce.current_utc_offset,
            time_source: announce.time_source,
        }
    }
}

/// Ranks two datasets; `Ordering::Less` means `a` is the better master.
///
/// Comparison order: grandmaster identity equality short-circuits into the
/// topology comparison (steps removed, then the source port tiebreaker);
/// otherwise priority1, clock class, accuracy, variance, priority2 and the
/// grandmaster identity itself decide.
pub fn compare_datasets(a: &ForeignMasterDataset, b: &ForeignMasterDataset) -> Ordering {
    if a.grandmaster_identity == b.grandmaster_identity {
        return a
            .steps_removed
            .cmp(&b.steps_removed)
            .then_with(|| a.source_port_identity.cmp(&b.source_port_identity));
    }

    a.grandmaster_priority1
        .cmp(&b.grandmaster_priority1)
        .then_with(|| {
            a.grandmaster_clock_quality
                .clock_class
                .cmp(&b.grandmaster_clock_quality.clock_class)
        })
        .then_with(|| {
            a.grandmaster_clock_quality
                .clock_accuracy
                .cmp(&b.grandmaster_clock_quality.clock_accuracy)
        })
        .then_with(|| {
            a.grandmaster_clock_quality
                .offset_scaled_log_variance
                .cmp(&b.grandmaster_clock_quality.offset_scaled_log_variance)
        })
        .then_with(|| a.grandmaster_priority2.cmp(&b.grandmaster_priority2))
        .then_with(|| a.grandmaster_identity.cmp(&b.grandmaster_identity))
        .then_with(|| a.steps_removed.cmp(&b.steps_removed))
        .then_with(|| a.source_port_identity.cmp(&b.source_port_identity))
}

/// True if `candidate` is a better master than the `current` one.
pub fn is_better(candidate: &ForeignMasterDataset, current: &ForeignMasterDataset) -> bool {
    compare_datasets(candidate, current) == Ordering::Less
}

#[cfg(test)]
mod test {
    use super::*;

    fn dataset(gm: [u8; 8], priority1: u8) -> ForeignMasterDataset {
        ForeignMasterDataset {
            grandmaster_identity: ClockIdentity(gm),
            grandmaster_priority1: priority1,
            grandmaster_clock_quality: ClockQuality {
                clock_class: 248,
                clock_accuracy: 0xFE,
                offset_scaled_log_variance: 0xFFFF,
            },
            grandmaster_priority2: 128,
            steps_removed: 0,
            source_port_identity: PortIdentity {
                clock_identity: ClockIdentity(gm),
                port_number: 1,
            },
            current_utc_offset: 37,
            time_source: 0xA0,
        }
    }

    #[test]
    fn lower_priority1_wins() {
        let a = dataset([1; 8], 10);
        let b = dataset([2; 8], 20);
        assert!(is_better(&a, &b));
        assert!(!is_better(&b, &a));
    }

    #[test]
    fn clock_class_breaks_priority_tie() {
        let mut a = dataset([1; 8], 128);
        let b = dataset([2; 8], 128);
        a.grandmaster_clock_quality.clock_class = 6;
        assert!(is_better(&a, &b));
    }

    #[test]
    fn grandmaster_identity_is_the_final_quality_tiebreaker() {
        let a = dataset([1; 8], 128);
        let b = dataset([2; 8], 128);
        assert!(is_better(&a, &b));
    }

    #[test]
    fn same_grandmaster_prefers_fewer_steps() {
        let a = dataset([1; 8], 128);
        let mut b = dataset([1; 8], 128);
        b.steps_removed = 2;
        assert!(is_better(&a, &b));
    }

    #[test]
    fn same_grandmaster_same_steps_falls_back_to_port_identity() {
        let a = dataset([1; 8], 128);
        let mut b = dataset([1; 8], 128);
        b.source_port_identity.port_number = 2;
        assert!(is_better(&a, &b));
        assert_eq!(Ordering::Equal, compare_datasets(&a, &a));
    }
}
