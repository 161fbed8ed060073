//! Scenario tests driving whole matches through the public API
