//! # thing-jobs
//!
//! Job execution agent for IoT things. Talks to a jobs service over MQTT
//! request/response topics, runs at most one job at a time, never loses a
//! "work available" signal, and shuts down exactly once.
//!
//! Pieces: a correlation layer over the jobs topics ([`registry`]), the
//! single-flight [`coordinator`], a work [`slot`] that runs one job, and the
//! [`shutdown`] latch. [`agent`] wires them together; [`service`] is an
//! in-process jobs service for simulated runs and tests.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod slot;
pub mod state;
pub mod telemetry;
pub mod topics;
pub mod transport;
