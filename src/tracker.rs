//! Head orientation shared between a tracker and the renderers.
//!
//! A single writer updates the values whenever the tracker reports, any
//! number of readers take a snapshot once per block. Values are independent
//! atomics, so a snapshot may mix components of consecutive updates.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataIndex {
    Azimuth = 0,
    Elevation = 1,
    Tilt = 2,
}

/// Orientation in degrees
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Orientation {
    pub azimuth: f32,
    pub elevation: f32,
    pub tilt: f32,
}

#[derive(Debug, Default)]
pub struct SharedOrientation {
    data: [AtomicU32; 3],
}

impl SharedOrientation {
    pub fn new(orientation: Orientation) -> Self {
        let shared = Self::default();
        shared.store(orientation);
        shared
    }

    pub fn get(&self, index: DataIndex) -> f32 {
        f32::from_bits(self.data[index as usize].load(Ordering::Relaxed))
    }

    pub fn set(&self, index: DataIndex, value: f32) {
        self.data[index as usize].store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> Orientation {
        Orientation {
            azimuth: self.get(DataIndex::Azimuth),
            elevation: self.get(DataIndex::Elevation),
            tilt: self.get(DataIndex::Tilt),
        }
    }

    pub fn store(&self, orientation: Orientation) {
        self.set(DataIndex::Azimuth, orientation.azimuth);
        self.set(DataIndex::Elevation, orientation.elevation);
        self.set(DataIndex::Tilt, orientation.tilt);
    }
}
