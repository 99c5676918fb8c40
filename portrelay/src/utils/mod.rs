// Utilities module
//
// This module contains common utility functions:
// - path: Config file path helpers
// - validation: Common validation helpers

pub mod path;
pub mod validation;
