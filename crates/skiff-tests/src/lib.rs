//! Integration tests for the Skiff control plane.
//!
//! The tests live under `tests/` and exercise the panel, the agent client,
//! and the forwarder manager together against an in-process panel instance.
