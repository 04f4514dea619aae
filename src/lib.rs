//! Slice-to-volume reconstruction training on periodic CT sequences.
//!
//! A sequence is `PERIOD` volumes of one breathing cycle. Each training
//! sample pairs the 2D slices of one width plane with the full volumes of
//! the first and mid-cycle frames.

pub mod batch;
pub mod config;
pub mod dataset;
pub mod losses;
pub mod model;
pub mod optim;
pub mod preview;
pub mod sample;
pub mod slice;
pub mod train;
pub mod transforms;
