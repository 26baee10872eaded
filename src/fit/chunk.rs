//! Work-unit planning.
//!
//! Pixels are numbered in row-major order over the independent axes (the cube
//! shape with the fitting axis removed). A work unit is a half-open range of
//! consecutive pixel numbers, so a plan is a partition of `0..n_pixels` into
//! ranges. The driver relies on that partition for lock-free assembly: every
//! unit writes a disjoint set of output slots.

use std::ops::Range;

use crate::domain::{DriverConfig, Scheduler};
use crate::error::FitError;

/// A group of pixels dispatched together to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    pub id: usize,
    pub start: usize,
    pub end: usize,
}

impl WorkUnit {
    pub fn pixels(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Row-major multi-index of `pixel` within `shape`.
pub fn unravel_index(shape: &[usize], mut pixel: usize) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for (slot, &n) in index.iter_mut().zip(shape).rev() {
        *slot = pixel % n;
        pixel /= n;
    }
    index
}

/// Row-major position of `index` within `shape`, or `None` when out of bounds.
pub fn ravel_index(shape: &[usize], index: &[usize]) -> Option<usize> {
    if index.len() != shape.len() {
        return None;
    }
    let mut pixel = 0;
    for (&i, &n) in index.iter().zip(shape) {
        if i >= n {
            return None;
        }
        pixel = pixel * n + i;
    }
    Some(pixel)
}

/// The output of planning: pixel geometry plus the work units.
///
/// `units` is public so callers can reorder dispatch; the driver re-checks the
/// partition before running a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub pixel_shape: Vec<usize>,
    pub units: Vec<WorkUnit>,
}

impl ChunkPlan {
    pub fn n_pixels(&self) -> usize {
        self.pixel_shape.iter().product()
    }

    /// Multi-index over the pixel axes of the row-major pixel number `pixel`.
    pub fn unravel(&self, pixel: usize) -> Vec<usize> {
        unravel_index(&self.pixel_shape, pixel)
    }

    /// Row-major pixel number of a multi-index. `None` if it is out of bounds.
    pub fn ravel(&self, index: &[usize]) -> Option<usize> {
        ravel_index(&self.pixel_shape, index)
    }

    /// Verify that the units cover `0..n_pixels` exactly once.
    pub fn check_partition(&self) -> Result<(), FitError> {
        let mut ranges: Vec<WorkUnit> = self.units.clone();
        ranges.sort_by_key(|u| (u.start, u.end));

        let mut ids: Vec<usize> = self.units.iter().map(|u| u.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.units.len() {
            return Err(FitError::config("work unit ids are not unique"));
        }

        let mut next = 0;
        for unit in &ranges {
            if unit.is_empty() {
                return Err(FitError::config(format!("work unit {} is empty", unit.id)));
            }
            if unit.start != next {
                return Err(FitError::config(format!(
                    "work units leave a gap or overlap at pixel {next} (unit {} starts at {})",
                    unit.id, unit.start
                )));
            }
            next = unit.end;
        }
        if next != self.n_pixels() {
            return Err(FitError::config(format!(
                "work units cover {next} of {} pixels",
                self.n_pixels()
            )));
        }
        Ok(())
    }
}

/// Splits the independent axes of a cube into work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    pub fitting_axis: usize,
    pub scheduler: Scheduler,
    pub chunk_size: Option<usize>,
}

impl ChunkPlanner {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            fitting_axis: config.fitting_axis,
            scheduler: config.scheduler,
            chunk_size: config.chunk_size,
        }
    }

    pub fn plan(&self, cube_shape: &[usize]) -> Result<ChunkPlan, FitError> {
        if self.fitting_axis >= cube_shape.len() {
            return Err(FitError::config(format!(
                "fitting axis {} out of range for a {}-D cube",
                self.fitting_axis,
                cube_shape.len()
            )));
        }
        if self.chunk_size == Some(0) {
            return Err(FitError::config("chunk size must be >= 1"));
        }

        let pixel_shape: Vec<usize> = cube_shape
            .iter()
            .enumerate()
            .filter(|(axis, _)| *axis != self.fitting_axis)
            .map(|(_, &n)| n)
            .collect();
        let n_pixels: usize = pixel_shape.iter().product();

        let block = match self.scheduler {
            Scheduler::Synchronous => n_pixels,
            Scheduler::Parallel => match self.chunk_size {
                Some(size) => size,
                // One block per index of the leading independent axis.
                None => pixel_shape.iter().skip(1).product::<usize>(),
            },
        }
        .max(1);

        let units = (0..n_pixels)
            .step_by(block)
            .enumerate()
            .map(|(id, start)| WorkUnit {
                id,
                start,
                end: (start + block).min(n_pixels),
            })
            .collect();

        Ok(ChunkPlan { pixel_shape, units })
    }
}
