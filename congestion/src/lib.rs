//! Congestion-window observation for active throughput tests.
//!
//! [`peaks::CwndPeakTracker`] turns a stream of congestion-window samples into
//! oscillation statistics (smallest trough, largest peak, number of peaks).
//! [`sampler::Sampler`] drives a [`sampler::Probe`] on a fixed interval while a transfer is
//! active and feeds every sample to the tracker and to an optional [`sampler::SampleLog`].

pub mod peaks;
pub mod sampler;

pub use peaks::{CwndPeakTracker, CwndPeaks, Phase};
pub use sampler::{Latch, Probe, SampleLog, Sampler, SamplerReport};
