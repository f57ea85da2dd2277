//! Tank level bookkeeping: the water reservoir and the three mixers.
//!
//! Levels are abstract percentages. Water refills by hysteresis: once a
//! drain leaves it at or below [`REFILL_AT`] it snaps back to full.

use serde::Serialize;

use crate::task::Reservoir;

pub const LEVEL_MAX: u8 = 100;

/// Water at or below this level triggers an instant refill.
pub const REFILL_AT: u8 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelLedger {
    water: u8,
    mixers: [u8; 3],
}

/// What goes out on the `level` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelSnapshot {
    pub water: u8,
    pub mixer1: u8,
    pub mixer2: u8,
    pub mixer3: u8,
}

impl Default for LevelLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_level(value: i32) -> u8 {
    value.clamp(0, LEVEL_MAX as i32) as u8
}

impl LevelLedger {
    /// Full water tank, empty mixers.
    pub fn new() -> Self {
        Self {
            water: LEVEL_MAX,
            mixers: [0; 3],
        }
    }

    pub fn water(&self) -> u8 {
        self.water
    }

    pub fn level(&self, reservoir: Reservoir) -> u8 {
        self.mixers[reservoir.index()]
    }

    pub fn charge(&mut self, reservoir: Reservoir, amount: i32) {
        let slot = &mut self.mixers[reservoir.index()];
        *slot = clamp_level((*slot as i32).saturating_add(amount));
    }

    pub fn drain_water(&mut self, amount: i32) {
        self.water = clamp_level((self.water as i32).saturating_sub(amount));
        if self.water <= REFILL_AT {
            self.water = LEVEL_MAX;
        }
    }

    pub fn reset_mixers(&mut self) {
        self.mixers = [0; 3];
    }

    pub fn snapshot(&self) -> LevelSnapshot {
        LevelSnapshot {
            water: self.water,
            mixer1: self.level(Reservoir::Mixer1),
            mixer2: self.level(Reservoir::Mixer2),
            mixer3: self.level(Reservoir::Mixer3),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_water(water: u8) -> Self {
        Self {
            water,
            mixers: [0; 3],
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
