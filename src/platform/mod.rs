//! Platform abstraction: process table access and job-control signals.

pub mod pal;
