//! Behaviour tests for the process host.

mod support;
