//! Scenario tests against in-memory gateways

mod support;
